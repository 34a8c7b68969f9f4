//! Natural-key conflict-merge upserts.
//!
//! The field policy is the same everywhere: audit fields (`updated_at`,
//! `is_active`, refreshed payloads) are always overwritten, optional facts
//! use `COALESCE(excluded.col, col)` so a later partial record never erases
//! a previously-learned value, while a non-null value does overwrite. Every
//! helper returns the numeric identity of the affected row, fetched by its
//! natural key immediately after the write; a lookup miss is a fatal
//! internal-consistency error.

use sqlx::SqliteConnection;

use crate::{Result, StoreError};

async fn id_by_key(
    conn: &mut SqliteConnection,
    table: &'static str,
    key: &str,
) -> Result<i64> {
    let sql = format!("SELECT id FROM {table} WHERE key = ?");
    let id: Option<i64> = sqlx::query_scalar(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    id.ok_or_else(|| StoreError::InternalConsistency {
        table,
        key: key.to_string(),
    })
}

async fn upsert_named_dimension(
    conn: &mut SqliteConnection,
    table: &'static str,
    key: &str,
    name: &str,
) -> Result<i64> {
    let sql = format!(
        "INSERT INTO {table} (key, name) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET name = excluded.name"
    );
    sqlx::query(&sql)
        .bind(key)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    id_by_key(conn, table, key).await
}

pub async fn upsert_admin_level(
    conn: &mut SqliteConnection,
    key: &str,
    name: &str,
) -> Result<i64> {
    upsert_named_dimension(conn, "admin_levels", key, name).await
}

pub async fn upsert_role(conn: &mut SqliteConnection, key: &str, name: &str) -> Result<i64> {
    upsert_named_dimension(conn, "roles", key, name).await
}

pub async fn upsert_gender(conn: &mut SqliteConnection, key: &str, name: &str) -> Result<i64> {
    upsert_named_dimension(conn, "genders", key, name).await
}

pub async fn upsert_party(conn: &mut SqliteConnection, key: &str, name: &str) -> Result<i64> {
    upsert_named_dimension(conn, "parties", key, name).await
}

pub async fn upsert_institution(
    conn: &mut SqliteConnection,
    key: &str,
    name: &str,
) -> Result<i64> {
    upsert_named_dimension(conn, "institutions", key, name).await
}

/// Territories keep both the canonical key and, when known, the raw code and
/// display name. Codes and names learned earlier are never erased by a later
/// record that lacks them.
pub async fn upsert_territory(
    conn: &mut SqliteConnection,
    key: &str,
    code: Option<&str>,
    name: Option<&str>,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO territories (key, code, name) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            code = COALESCE(excluded.code, code),
            name = COALESCE(excluded.name, name)
        "#,
    )
    .bind(key)
    .bind(code)
    .bind(name)
    .execute(&mut *conn)
    .await?;
    id_by_key(conn, "territories", key).await
}

#[derive(Debug, Clone)]
pub struct PersonUpsert<'a> {
    pub person_key: &'a str,
    pub full_name: &'a str,
    pub birth_date: Option<&'a str>,
    pub territory_code: Option<&'a str>,
    pub gender_id: Option<i64>,
}

pub async fn upsert_person(
    conn: &mut SqliteConnection,
    person: &PersonUpsert<'_>,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO persons (person_key, full_name, birth_date, territory_code, gender_id)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(person_key) DO UPDATE SET
            full_name = excluded.full_name,
            birth_date = COALESCE(excluded.birth_date, birth_date),
            territory_code = COALESCE(excluded.territory_code, territory_code),
            gender_id = COALESCE(excluded.gender_id, gender_id),
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(person.person_key)
    .bind(person.full_name)
    .bind(person.birth_date)
    .bind(person.territory_code)
    .bind(person.gender_id)
    .execute(&mut *conn)
    .await?;

    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM persons WHERE person_key = ?")
        .bind(person.person_key)
        .fetch_optional(&mut *conn)
        .await?;
    id.ok_or_else(|| StoreError::InternalConsistency {
        table: "persons",
        key: person.person_key.to_string(),
    })
}

/// Record the `(source, source_record)` → person link. Re-linking the same
/// natural key moves the pointer (the record's resolved identity can be
/// corrected by a later run).
pub async fn link_person_identifier(
    conn: &mut SqliteConnection,
    source_id: i64,
    source_record_id: &str,
    person_id: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO person_identifiers (source_id, source_record_id, person_id)
        VALUES (?, ?, ?)
        ON CONFLICT(source_id, source_record_id) DO UPDATE SET
            person_id = excluded.person_id
        "#,
    )
    .bind(source_id)
    .bind(source_record_id)
    .bind(person_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MandateUpsert<'a> {
    pub source_id: i64,
    pub source_record_id: &'a str,
    pub person_id: i64,
    pub institution_id: i64,
    pub role_id: Option<i64>,
    pub territory_id: Option<i64>,
    pub admin_level_id: Option<i64>,
    pub party_id: Option<i64>,
    pub start_date: Option<&'a str>,
    pub end_date: Option<&'a str>,
    pub source_record_pk: i64,
}

pub async fn upsert_mandate(
    conn: &mut SqliteConnection,
    mandate: &MandateUpsert<'_>,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO mandates (
            source_id, source_record_id, person_id, institution_id, role_id,
            territory_id, admin_level_id, party_id, start_date, end_date,
            is_active, source_record_pk
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
        ON CONFLICT(source_id, source_record_id) DO UPDATE SET
            person_id = excluded.person_id,
            institution_id = excluded.institution_id,
            role_id = COALESCE(excluded.role_id, role_id),
            territory_id = COALESCE(excluded.territory_id, territory_id),
            admin_level_id = COALESCE(excluded.admin_level_id, admin_level_id),
            party_id = COALESCE(excluded.party_id, party_id),
            start_date = COALESCE(excluded.start_date, start_date),
            end_date = COALESCE(excluded.end_date, end_date),
            is_active = 1,
            source_record_pk = excluded.source_record_pk,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(mandate.source_id)
    .bind(mandate.source_record_id)
    .bind(mandate.person_id)
    .bind(mandate.institution_id)
    .bind(mandate.role_id)
    .bind(mandate.territory_id)
    .bind(mandate.admin_level_id)
    .bind(mandate.party_id)
    .bind(mandate.start_date)
    .bind(mandate.end_date)
    .bind(mandate.source_record_pk)
    .execute(&mut *conn)
    .await?;

    let id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM mandates WHERE source_id = ? AND source_record_id = ?",
    )
    .bind(mandate.source_id)
    .bind(mandate.source_record_id)
    .fetch_optional(&mut *conn)
    .await?;
    id.ok_or_else(|| StoreError::InternalConsistency {
        table: "mandates",
        key: format!("{}:{}", mandate.source_id, mandate.source_record_id),
    })
}

/// Deactivate mandates for this source whose natural key was not seen in the
/// current run. An empty seen set deactivates every active mandate for the
/// source (a legislature that ended). Returns the number of closed mandates.
pub async fn close_missing_mandates(
    conn: &mut SqliteConnection,
    source_id: i64,
    seen_record_ids: &[String],
    snapshot_date: &str,
) -> Result<u64> {
    if seen_record_ids.is_empty() {
        let result = sqlx::query(
            r#"
            UPDATE mandates
            SET is_active = 0,
                end_date = COALESCE(end_date, ?),
                updated_at = CURRENT_TIMESTAMP
            WHERE source_id = ? AND is_active = 1
            "#,
        )
        .bind(snapshot_date)
        .bind(source_id)
        .execute(&mut *conn)
        .await?;
        return Ok(result.rows_affected());
    }

    let active: Vec<String> = sqlx::query_scalar(
        "SELECT source_record_id FROM mandates WHERE source_id = ? AND is_active = 1 \
         ORDER BY source_record_id",
    )
    .bind(source_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut closed = 0u64;
    for record_id in active {
        if seen_record_ids.iter().any(|seen| seen == &record_id) {
            continue;
        }
        let result = sqlx::query(
            r#"
            UPDATE mandates
            SET is_active = 0,
                end_date = COALESCE(end_date, ?),
                updated_at = CURRENT_TIMESTAMP
            WHERE source_id = ? AND source_record_id = ?
            "#,
        )
        .bind(snapshot_date)
        .bind(source_id)
        .bind(&record_id)
        .execute(&mut *conn)
        .await?;
        closed += result.rows_affected();
    }
    Ok(closed)
}

#[derive(Debug, Clone)]
pub struct PolicyEventUpsert<'a> {
    pub event_id: &'a str,
    pub family: &'a str,
    pub title: &'a str,
    pub event_date: Option<&'a str>,
    pub published_date: Option<&'a str>,
    pub source_url: &'a str,
    pub source_record_pk: i64,
    pub source_snapshot_date: Option<&'a str>,
    pub raw_payload: &'a str,
}

pub async fn upsert_policy_event(
    conn: &mut SqliteConnection,
    event: &PolicyEventUpsert<'_>,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO policy_events (
            event_id, family, title, event_date, published_date,
            source_url, source_record_pk, source_snapshot_date, raw_payload
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(event_id) DO UPDATE SET
            family = excluded.family,
            title = excluded.title,
            event_date = COALESCE(excluded.event_date, event_date),
            published_date = COALESCE(excluded.published_date, published_date),
            source_url = excluded.source_url,
            source_record_pk = excluded.source_record_pk,
            source_snapshot_date = COALESCE(excluded.source_snapshot_date, source_snapshot_date),
            raw_payload = excluded.raw_payload,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(event.event_id)
    .bind(event.family)
    .bind(event.title)
    .bind(event.event_date)
    .bind(event.published_date)
    .bind(event.source_url)
    .bind(event.source_record_pk)
    .bind(event.source_snapshot_date)
    .bind(event.raw_payload)
    .execute(&mut *conn)
    .await?;

    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM policy_events WHERE event_id = ?")
        .bind(event.event_id)
        .fetch_optional(&mut *conn)
        .await?;
    id.ok_or_else(|| StoreError::InternalConsistency {
        table: "policy_events",
        key: event.event_id.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct MoneyRecordUpsert<'a> {
    pub event_id: &'a str,
    pub family: &'a str,
    pub title: &'a str,
    pub amount: Option<f64>,
    pub currency: Option<&'a str>,
    pub event_date: Option<&'a str>,
    pub published_date: Option<&'a str>,
    pub source_url: &'a str,
    pub source_record_pk: i64,
    pub source_snapshot_date: Option<&'a str>,
    pub raw_payload: &'a str,
}

pub async fn upsert_money_record(
    conn: &mut SqliteConnection,
    record: &MoneyRecordUpsert<'_>,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO money_records (
            event_id, family, title, amount, currency, event_date, published_date,
            source_url, source_record_pk, source_snapshot_date, raw_payload
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(event_id) DO UPDATE SET
            family = excluded.family,
            title = excluded.title,
            amount = COALESCE(excluded.amount, amount),
            currency = COALESCE(excluded.currency, currency),
            event_date = COALESCE(excluded.event_date, event_date),
            published_date = COALESCE(excluded.published_date, published_date),
            source_url = excluded.source_url,
            source_record_pk = excluded.source_record_pk,
            source_snapshot_date = COALESCE(excluded.source_snapshot_date, source_snapshot_date),
            raw_payload = excluded.raw_payload,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(record.event_id)
    .bind(record.family)
    .bind(record.title)
    .bind(record.amount)
    .bind(record.currency)
    .bind(record.event_date)
    .bind(record.published_date)
    .bind(record.source_url)
    .bind(record.source_record_pk)
    .bind(record.source_snapshot_date)
    .bind(record.raw_payload)
    .execute(&mut *conn)
    .await?;

    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM money_records WHERE event_id = ?")
        .bind(record.event_id)
        .fetch_optional(&mut *conn)
        .await?;
    id.ok_or_else(|| StoreError::InternalConsistency {
        table: "money_records",
        key: record.event_id.to_string(),
    })
}

pub async fn upsert_indicator_series(
    conn: &mut SqliteConnection,
    series_key: &str,
    title: &str,
    unit: Option<&str>,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO indicator_series (series_key, title, unit) VALUES (?, ?, ?)
        ON CONFLICT(series_key) DO UPDATE SET
            title = excluded.title,
            unit = COALESCE(excluded.unit, unit)
        "#,
    )
    .bind(series_key)
    .bind(title)
    .bind(unit)
    .execute(&mut *conn)
    .await?;

    let id: Option<i64> =
        sqlx::query_scalar("SELECT id FROM indicator_series WHERE series_key = ?")
            .bind(series_key)
            .fetch_optional(&mut *conn)
            .await?;
    id.ok_or_else(|| StoreError::InternalConsistency {
        table: "indicator_series",
        key: series_key.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct IndicatorPointUpsert<'a> {
    pub series_id: i64,
    pub period: &'a str,
    pub value: f64,
    pub source_url: &'a str,
    pub source_record_pk: i64,
}

pub async fn upsert_indicator_point(
    conn: &mut SqliteConnection,
    point: &IndicatorPointUpsert<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO indicator_points (series_id, period, value, source_url, source_record_pk)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(series_id, period) DO UPDATE SET
            value = excluded.value,
            source_url = excluded.source_url,
            source_record_pk = excluded.source_record_pk
        "#,
    )
    .bind(point.series_id)
    .bind(point.period)
    .bind(point.value)
    .bind(point.source_url)
    .bind(point.source_record_pk)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::upsert_source_record;
    use crate::sources::{upsert_source, SourceSeed};
    use codh_core::IngestMode;

    async fn seed_source(conn: &mut SqliteConnection, code: &str) -> i64 {
        upsert_source(
            conn,
            &SourceSeed {
                code,
                name: "Test feed",
                scope: None,
                default_url: None,
                format: None,
                mode: IngestMode::Mandates,
                min_records: None,
                active: true,
            },
        )
        .await
        .expect("seed source")
    }

    #[tokio::test]
    async fn dimension_upsert_is_idempotent_and_returns_stable_id() {
        let mut conn = crate::open_in_memory().await.expect("db");
        let first = upsert_role(&mut conn, "diputado a", "Diputado/a").await.unwrap();
        let second = upsert_role(&mut conn, "diputado a", "Diputado/a").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(crate::count_rows(&mut conn, "roles").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn null_optional_field_does_not_erase_learned_value() {
        let mut conn = crate::open_in_memory().await.expect("db");

        let full = PersonUpsert {
            person_key: "maria lopez|1970-05-01|28",
            full_name: "María López",
            birth_date: Some("1970-05-01"),
            territory_code: Some("28"),
            gender_id: None,
        };
        let id = upsert_person(&mut conn, &full).await.unwrap();

        // Later partial record: same identity, no birth date.
        let partial = PersonUpsert {
            birth_date: None,
            territory_code: None,
            ..full.clone()
        };
        let id_again = upsert_person(&mut conn, &partial).await.unwrap();
        assert_eq!(id, id_again);

        let birth: Option<String> =
            sqlx::query_scalar("SELECT birth_date FROM persons WHERE id = ?")
                .bind(id)
                .fetch_one(&mut conn)
                .await
                .unwrap();
        assert_eq!(birth.as_deref(), Some("1970-05-01"));
    }

    #[tokio::test]
    async fn non_null_optional_field_overwrites() {
        let mut conn = crate::open_in_memory().await.expect("db");
        let sid = seed_source(&mut conn, "congress").await;
        let pk = upsert_source_record(&mut conn, sid, "m-1", "{}", None, Some("2024-01-01"))
            .await
            .unwrap();
        let person = upsert_person(
            &mut conn,
            &PersonUpsert {
                person_key: "ana ruiz||",
                full_name: "Ana Ruiz",
                birth_date: None,
                territory_code: None,
                gender_id: None,
            },
        )
        .await
        .unwrap();
        let institution = upsert_institution(&mut conn, "congreso", "Congreso").await.unwrap();

        let bare = MandateUpsert {
            source_id: sid,
            source_record_id: "m-1",
            person_id: person,
            institution_id: institution,
            role_id: None,
            territory_id: None,
            admin_level_id: None,
            party_id: None,
            start_date: None,
            end_date: None,
            source_record_pk: pk,
        };
        upsert_mandate(&mut conn, &bare).await.unwrap();

        let role = upsert_role(&mut conn, "diputada", "Diputada").await.unwrap();
        upsert_mandate(
            &mut conn,
            &MandateUpsert {
                role_id: Some(role),
                start_date: Some("2023-07-01"),
                ..bare.clone()
            },
        )
        .await
        .unwrap();

        // Re-upsert without the role: the learned role must survive.
        upsert_mandate(&mut conn, &bare).await.unwrap();

        let (role_id, start_date): (Option<i64>, Option<String>) = sqlx::query_as(
            "SELECT role_id, start_date FROM mandates WHERE source_id = ? AND source_record_id = ?",
        )
        .bind(sid)
        .bind("m-1")
        .fetch_one(&mut conn)
        .await
        .unwrap();
        assert_eq!(role_id, Some(role));
        assert_eq!(start_date.as_deref(), Some("2023-07-01"));
        assert_eq!(crate::count_rows(&mut conn, "mandates").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn close_missing_deactivates_complement_and_sets_end_date() {
        let mut conn = crate::open_in_memory().await.expect("db");
        let sid = seed_source(&mut conn, "assembly").await;
        let institution = upsert_institution(&mut conn, "asamblea", "Asamblea").await.unwrap();

        for record_id in ["a-1", "a-2"] {
            let pk = upsert_source_record(&mut conn, sid, record_id, "{}", None, None)
                .await
                .unwrap();
            let person = upsert_person(
                &mut conn,
                &PersonUpsert {
                    person_key: record_id,
                    full_name: record_id,
                    birth_date: None,
                    territory_code: None,
                    gender_id: None,
                },
            )
            .await
            .unwrap();
            upsert_mandate(
                &mut conn,
                &MandateUpsert {
                    source_id: sid,
                    source_record_id: record_id,
                    person_id: person,
                    institution_id: institution,
                    role_id: None,
                    territory_id: None,
                    admin_level_id: None,
                    party_id: None,
                    start_date: None,
                    end_date: None,
                    source_record_pk: pk,
                },
            )
            .await
            .unwrap();
        }

        let closed =
            close_missing_mandates(&mut conn, sid, &["a-1".to_string()], "2024-06-30")
                .await
                .unwrap();
        assert_eq!(closed, 1);

        let (active, end_date): (i64, Option<String>) = sqlx::query_as(
            "SELECT is_active, end_date FROM mandates WHERE source_id = ? AND source_record_id = ?",
        )
        .bind(sid)
        .bind("a-2")
        .fetch_one(&mut conn)
        .await
        .unwrap();
        assert_eq!(active, 0);
        assert_eq!(end_date.as_deref(), Some("2024-06-30"));

        // Empty seen set closes everything still active.
        let closed_all = close_missing_mandates(&mut conn, sid, &[], "2024-07-01")
            .await
            .unwrap();
        assert_eq!(closed_all, 1);
    }
}
