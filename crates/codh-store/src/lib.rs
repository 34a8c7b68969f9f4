//! Canonical SQLite store: schema, natural-key conflict-merge upserts, run
//! lifecycle tracking, fetch provenance, and the full foreign-key scan.
//!
//! All write helpers take `&mut SqliteConnection`, so they work equally on a
//! plain connection and inside the single write transaction the ingestion
//! orchestrator (or a backfill pass) owns. Foreign-key enforcement is turned
//! on for the lifetime of every connection opened here.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::Connection;
pub use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::debug;

pub mod fetches;
pub mod integrity;
pub mod records;
pub mod runs;
pub mod schema;
pub mod sources;
pub mod upsert;

pub const CRATE_NAME: &str = "codh-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    /// An upsert's post-write natural-key lookup found no row. This is a
    /// logic defect, not a user-facing "not found".
    #[error("internal consistency: no {table} row for natural key {key:?} after upsert")]
    InternalConsistency { table: &'static str, key: String },
    #[error("ingestion run {run_id} was already finalized")]
    RunAlreadyFinalized { run_id: i64 },
    #[error("unknown source code {0:?}")]
    UnknownSource(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Open (creating if missing) the canonical database file.
pub async fn open(path: &Path) -> Result<SqliteConnection> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let mut conn = SqliteConnection::connect_with(&options).await?;
    schema::ensure_schema(&mut conn).await?;
    debug!(path = %path.display(), "opened canonical store");
    Ok(conn)
}

/// In-memory database with the full schema, for tests.
pub async fn open_in_memory() -> Result<SqliteConnection> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);
    let mut conn = SqliteConnection::connect_with(&options).await?;
    schema::ensure_schema(&mut conn).await?;
    Ok(conn)
}

/// Row count of one canonical table, used by idempotence checks and stats.
pub async fn count_rows(conn: &mut SqliteConnection, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    Ok(sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?)
}
