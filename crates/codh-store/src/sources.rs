//! Source (feed identity) seeding and lookup.

use codh_core::IngestMode;
use sqlx::{Row, SqliteConnection};

use crate::{Result, StoreError};

/// Registry entry written into the `sources` table. Seeded once, updated in
/// place on later seeds.
#[derive(Debug, Clone)]
pub struct SourceSeed<'a> {
    pub code: &'a str,
    pub name: &'a str,
    pub scope: Option<&'a str>,
    pub default_url: Option<&'a str>,
    pub format: Option<&'a str>,
    pub mode: IngestMode,
    pub min_records: Option<i64>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct SourceRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub default_url: Option<String>,
    pub mode: IngestMode,
    pub min_records: Option<i64>,
    pub active: bool,
}

fn mode_as_str(mode: IngestMode) -> &'static str {
    match mode {
        IngestMode::Mandates => "mandates",
        IngestMode::SourceRecordsOnly => "source-records-only",
    }
}

fn mode_from_str(raw: &str) -> IngestMode {
    match raw {
        "source-records-only" => IngestMode::SourceRecordsOnly,
        _ => IngestMode::Mandates,
    }
}

/// Upsert one source by its code and return its id.
pub async fn upsert_source(conn: &mut SqliteConnection, seed: &SourceSeed<'_>) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO sources (code, name, scope, default_url, format, mode, min_records, active)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(code) DO UPDATE SET
            name = excluded.name,
            scope = COALESCE(excluded.scope, scope),
            default_url = COALESCE(excluded.default_url, default_url),
            format = COALESCE(excluded.format, format),
            mode = excluded.mode,
            min_records = COALESCE(excluded.min_records, min_records),
            active = excluded.active,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(seed.code)
    .bind(seed.name)
    .bind(seed.scope)
    .bind(seed.default_url)
    .bind(seed.format)
    .bind(mode_as_str(seed.mode))
    .bind(seed.min_records)
    .bind(seed.active)
    .execute(&mut *conn)
    .await?;

    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM sources WHERE code = ?")
        .bind(seed.code)
        .fetch_optional(&mut *conn)
        .await?;
    id.ok_or_else(|| StoreError::InternalConsistency {
        table: "sources",
        key: seed.code.to_string(),
    })
}

pub async fn get_source_by_code(
    conn: &mut SqliteConnection,
    code: &str,
) -> Result<Option<SourceRow>> {
    let row = sqlx::query(
        "SELECT id, code, name, default_url, mode, min_records, active \
         FROM sources WHERE code = ?",
    )
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| SourceRow {
        id: row.get("id"),
        code: row.get("code"),
        name: row.get("name"),
        default_url: row.get("default_url"),
        mode: mode_from_str(row.get::<String, _>("mode").as_str()),
        min_records: row.get("min_records"),
        active: row.get::<i64, _>("active") != 0,
    }))
}

/// Like [`get_source_by_code`], but a missing source is an error: ingestion
/// never runs against an unseeded feed.
pub async fn require_source(conn: &mut SqliteConnection, code: &str) -> Result<SourceRow> {
    get_source_by_code(conn, code)
        .await?
        .ok_or_else(|| StoreError::UnknownSource(code.to_string()))
}
