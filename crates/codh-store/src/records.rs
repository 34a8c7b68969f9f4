//! Raw source-record persistence and retrieval for the mapping engine.

use sqlx::{Row, SqliteConnection};

use crate::{Result, StoreError};

/// Stored raw record, as the backfill engine reads it back.
#[derive(Debug, Clone)]
pub struct StoredSourceRecord {
    pub id: i64,
    pub source_id: i64,
    pub source_code: String,
    pub source_record_id: String,
    pub payload: String,
    pub snapshot_date: Option<String>,
}

/// Upsert one raw record by its `(source, source_record)` natural key and
/// return its numeric identity. Payload and hash refresh on re-ingestion;
/// the identity and `created_at` never change.
pub async fn upsert_source_record(
    conn: &mut SqliteConnection,
    source_id: i64,
    source_record_id: &str,
    payload: &str,
    content_hash: Option<&str>,
    snapshot_date: Option<&str>,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO source_records (source_id, source_record_id, payload, content_hash, snapshot_date)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(source_id, source_record_id) DO UPDATE SET
            payload = excluded.payload,
            content_hash = COALESCE(excluded.content_hash, content_hash),
            snapshot_date = COALESCE(excluded.snapshot_date, snapshot_date),
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(source_id)
    .bind(source_record_id)
    .bind(payload)
    .bind(content_hash)
    .bind(snapshot_date)
    .execute(&mut *conn)
    .await?;

    let id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM source_records WHERE source_id = ? AND source_record_id = ?",
    )
    .bind(source_id)
    .bind(source_record_id)
    .fetch_optional(&mut *conn)
    .await?;
    id.ok_or_else(|| StoreError::InternalConsistency {
        table: "source_records",
        key: format!("{source_id}:{source_record_id}"),
    })
}

/// All raw records for the given source ids, in the fixed deterministic
/// order the mapping engine processes them: `(source_id, source_record_id)`.
pub async fn list_source_records(
    conn: &mut SqliteConnection,
    source_ids: &[i64],
) -> Result<Vec<StoredSourceRecord>> {
    if source_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; source_ids.len()].join(", ");
    let sql = format!(
        "SELECT r.id, r.source_id, s.code AS source_code, r.source_record_id, \
                r.payload, r.snapshot_date \
         FROM source_records r JOIN sources s ON s.id = r.source_id \
         WHERE r.source_id IN ({placeholders}) \
         ORDER BY r.source_id, r.source_record_id"
    );
    let mut query = sqlx::query(&sql);
    for id in source_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(&mut *conn).await?;

    Ok(rows
        .into_iter()
        .map(|row| StoredSourceRecord {
            id: row.get("id"),
            source_id: row.get("source_id"),
            source_code: row.get("source_code"),
            source_record_id: row.get("source_record_id"),
            payload: row.get("payload"),
            snapshot_date: row.get("snapshot_date"),
        })
        .collect())
}
