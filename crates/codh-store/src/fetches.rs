//! Fetch provenance: the per-run row (1:1 with the run, overwritable) and
//! the cross-run fetch log deduplicated by exact content hash.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::Result;

#[derive(Debug, Clone)]
pub struct FetchProvenance<'a> {
    pub url: &'a str,
    pub content_hash: &'a str,
    pub content_type: &'a str,
    pub bytes: u64,
    pub fetched_at: DateTime<Utc>,
    pub raw_path: Option<&'a str>,
}

/// Record the physical fetch for one run. Keyed by run id; recording twice
/// for the same run overwrites.
pub async fn record_run_fetch(
    conn: &mut SqliteConnection,
    run_id: i64,
    fetch: &FetchProvenance<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO raw_fetches (run_id, url, content_hash, content_type, bytes, fetched_at, raw_path)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(run_id) DO UPDATE SET
            url = excluded.url,
            content_hash = excluded.content_hash,
            content_type = excluded.content_type,
            bytes = excluded.bytes,
            fetched_at = excluded.fetched_at,
            raw_path = excluded.raw_path
        "#,
    )
    .bind(run_id)
    .bind(fetch.url)
    .bind(fetch.content_hash)
    .bind(fetch.content_type)
    .bind(fetch.bytes as i64)
    .bind(fetch.fetched_at.to_rfc3339())
    .bind(fetch.raw_path)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Append to the content-deduplicated fetch log. Re-insertion of identical
/// content for the same source is ignored, so the log never grows on
/// unchanged feeds.
pub async fn record_fetch_log(
    conn: &mut SqliteConnection,
    source_id: i64,
    fetch: &FetchProvenance<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO fetch_log (source_id, content_hash, url, content_type, bytes)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(source_id, content_hash) DO NOTHING
        "#,
    )
    .bind(source_id)
    .bind(fetch.content_hash)
    .bind(fetch.url)
    .bind(fetch.content_type)
    .bind(fetch.bytes as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_log_count(conn: &mut SqliteConnection, source_id: i64) -> Result<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM fetch_log WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&mut *conn)
            .await?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::start_run;
    use crate::sources::{upsert_source, SourceSeed};
    use codh_core::IngestMode;

    #[tokio::test]
    async fn fetch_log_ignores_repeats_of_identical_content() {
        let mut conn = crate::open_in_memory().await.expect("db");
        let sid = upsert_source(
            &mut conn,
            &SourceSeed {
                code: "subsidies",
                name: "Subsidies",
                scope: None,
                default_url: None,
                format: None,
                mode: IngestMode::SourceRecordsOnly,
                min_records: None,
                active: true,
            },
        )
        .await
        .unwrap();
        let run_id = start_run(&mut conn, sid, "https://example.org/s.csv").await.unwrap();

        let fetch = FetchProvenance {
            url: "https://example.org/s.csv",
            content_hash: "same-hash",
            content_type: "text/csv",
            bytes: 1024,
            fetched_at: Utc::now(),
            raw_path: None,
        };

        record_run_fetch(&mut conn, run_id, &fetch).await.unwrap();
        record_run_fetch(&mut conn, run_id, &fetch).await.unwrap();
        record_fetch_log(&mut conn, sid, &fetch).await.unwrap();
        record_fetch_log(&mut conn, sid, &fetch).await.unwrap();

        assert_eq!(crate::count_rows(&mut conn, "raw_fetches").await.unwrap(), 1);
        assert_eq!(fetch_log_count(&mut conn, sid).await.unwrap(), 1);

        let changed = FetchProvenance {
            content_hash: "new-hash",
            ..fetch
        };
        record_fetch_log(&mut conn, sid, &changed).await.unwrap();
        assert_eq!(fetch_log_count(&mut conn, sid).await.unwrap(), 2);
    }
}
