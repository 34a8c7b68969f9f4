//! Ingestion-run lifecycle tracking.
//!
//! `start_run` is a single auto-commit statement executed before the run's
//! write transaction opens, so a crash mid-ingest leaves a discoverable
//! `running` row. `finish_run` is the only mutator of a finished run and is
//! called exactly once per run, success or failure.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use tracing::info;

use crate::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Ok,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub source_id: i64,
    pub status: String,
    pub url: Option<String>,
    pub message: Option<String>,
    pub records_seen: i64,
    pub records_loaded: i64,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunFinish<'a> {
    pub status: RunStatus,
    pub message: &'a str,
    pub records_seen: u64,
    pub records_loaded: u64,
    pub fetched_at: Option<DateTime<Utc>>,
    pub raw_path: Option<&'a str>,
}

/// Insert a `running` row and return its id immediately.
pub async fn start_run(conn: &mut SqliteConnection, source_id: i64, url: &str) -> Result<i64> {
    let result = sqlx::query("INSERT INTO ingestion_runs (source_id, status, url) VALUES (?, ?, ?)")
        .bind(source_id)
        .bind(RunStatus::Running.as_str())
        .bind(url)
        .execute(&mut *conn)
        .await?;
    let run_id = result.last_insert_rowid();
    info!(run_id, source_id, url, "ingestion run started");
    Ok(run_id)
}

/// Finalize a run. Refuses to touch a row that is no longer `running`.
pub async fn finish_run(
    conn: &mut SqliteConnection,
    run_id: i64,
    finish: &RunFinish<'_>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE ingestion_runs
        SET status = ?,
            message = ?,
            records_seen = ?,
            records_loaded = ?,
            fetched_at = ?,
            raw_path = ?,
            finished_at = CURRENT_TIMESTAMP
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(finish.status.as_str())
    .bind(finish.message)
    .bind(finish.records_seen as i64)
    .bind(finish.records_loaded as i64)
    .bind(finish.fetched_at.map(|t| t.to_rfc3339()))
    .bind(finish.raw_path)
    .bind(run_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::RunAlreadyFinalized { run_id });
    }
    info!(
        run_id,
        status = finish.status.as_str(),
        seen = finish.records_seen,
        loaded = finish.records_loaded,
        "ingestion run finished"
    );
    Ok(())
}

pub async fn get_run(conn: &mut SqliteConnection, run_id: i64) -> Result<Option<RunRow>> {
    let row = sqlx::query(
        "SELECT id, source_id, status, url, message, records_seen, records_loaded, finished_at \
         FROM ingestion_runs WHERE id = ?",
    )
    .bind(run_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| RunRow {
        id: row.get("id"),
        source_id: row.get("source_id"),
        status: row.get("status"),
        url: row.get("url"),
        message: row.get("message"),
        records_seen: row.get("records_seen"),
        records_loaded: row.get("records_loaded"),
        finished_at: row.get("finished_at"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{upsert_source, SourceSeed};
    use codh_core::IngestMode;

    #[tokio::test]
    async fn run_lifecycle_finalizes_exactly_once() {
        let mut conn = crate::open_in_memory().await.expect("db");
        let sid = upsert_source(
            &mut conn,
            &SourceSeed {
                code: "votes",
                name: "Votes",
                scope: None,
                default_url: None,
                format: None,
                mode: IngestMode::Mandates,
                min_records: None,
                active: true,
            },
        )
        .await
        .unwrap();

        let run_id = start_run(&mut conn, sid, "https://example.org/feed").await.unwrap();
        let run = get_run(&mut conn, run_id).await.unwrap().unwrap();
        assert_eq!(run.status, "running");
        assert!(run.finished_at.is_none());

        let finish = RunFinish {
            status: RunStatus::Ok,
            message: "loaded 12 of 12",
            records_seen: 12,
            records_loaded: 12,
            fetched_at: Some(Utc::now()),
            raw_path: Some("votes/20240630/abc.json"),
        };
        finish_run(&mut conn, run_id, &finish).await.unwrap();

        let run = get_run(&mut conn, run_id).await.unwrap().unwrap();
        assert_eq!(run.status, "ok");
        assert_eq!(run.records_loaded, 12);
        assert!(run.finished_at.is_some());

        // A second finalization is a defect and is refused.
        let err = finish_run(&mut conn, run_id, &finish).await.unwrap_err();
        assert!(matches!(err, StoreError::RunAlreadyFinalized { .. }));
    }
}
