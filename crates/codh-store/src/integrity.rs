//! Full foreign-key verification.
//!
//! `PRAGMA foreign_key_check` enumerates every violation in the database
//! without stopping at the first, which is exactly the post-write contract:
//! a run commits only when this scan comes back empty.

use sqlx::{Row, SqliteConnection};

use crate::Result;

/// One dangling reference, as reported by SQLite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FkViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub referenced_table: String,
    pub fk_index: i64,
}

impl std::fmt::Display for FkViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} row {:?} references missing {} (fk #{})",
            self.table, self.rowid, self.referenced_table, self.fk_index
        )
    }
}

/// Scan the whole database for foreign-key violations.
pub async fn check_foreign_keys(conn: &mut SqliteConnection) -> Result<Vec<FkViolation>> {
    let rows = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| FkViolation {
            table: row.get(0),
            rowid: row.get(1),
            referenced_table: row.get(2),
            fk_index: row.get(3),
        })
        .collect())
}

/// Human-readable summary bounded to the first 10 violations.
pub fn format_violations(violations: &[FkViolation]) -> String {
    let shown: Vec<String> = violations.iter().take(10).map(|v| v.to_string()).collect();
    if violations.len() > 10 {
        format!(
            "{} foreign-key violations (first 10): {}",
            violations.len(),
            shown.join("; ")
        )
    } else {
        format!(
            "{} foreign-key violations: {}",
            violations.len(),
            shown.join("; ")
        )
    }
}
