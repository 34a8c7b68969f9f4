//! One complete ingest for one source, inside a single write transaction.
//!
//! The orchestrator is the only component that opens a top-level write
//! transaction against the canonical store. The run row is opened with a
//! single auto-commit statement before the transaction starts and finalized
//! after it ends, so the run outcome survives a rollback.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use codh_core::{IngestMode, MandateRow, NormalizedRow};
use codh_store::fetches::FetchProvenance;
use codh_store::integrity::{self, FkViolation};
use codh_store::runs::{self, RunFinish, RunStatus};
use codh_store::upsert::{self, MandateUpsert};
use codh_store::{sources, SqliteConnection, StoreError};
use sqlx::Connection;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::RunContext;
use crate::connector::{Connector, ConnectorError, ExtractRequest};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown source {0:?}; seed the source registry first")]
    UnknownSource(String),
    #[error(transparent)]
    Extraction(#[from] ConnectorError),
    #[error("source produced {seen} records but none loaded; treating the mapping as broken")]
    ZeroYield { seen: u64 },
    #[error("strict network: loaded {loaded} below declared minimum {min} on live fetch ({note})")]
    BelowThreshold { loaded: u64, min: u64, note: String },
    #[error("referential integrity check failed: {}", integrity::format_violations(violations))]
    Integrity { violations: Vec<FkViolation> },
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Caller-provided parameters for one ingest.
#[derive(Debug, Clone)]
pub struct IngestRequest<'a> {
    pub raw_dir: &'a Path,
    pub timeout: Duration,
    pub from_file: Option<&'a Path>,
    pub url_override: Option<&'a str>,
    pub snapshot_date: NaiveDate,
    pub strict_network: bool,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub run_id: i64,
    pub records_seen: u64,
    pub records_loaded: u64,
    pub note: String,
}

#[derive(Debug, Default)]
struct RunCounters {
    seen: u64,
    loaded: u64,
    skipped: u64,
}

struct TxSummary {
    note: String,
    fetched_at: Option<DateTime<Utc>>,
    raw_path: Option<String>,
}

/// Run one full ingest for the connector's source. All canonical writes
/// happen inside one transaction; on any fatal condition everything is
/// rolled back, the run is finalized as `error`, and the error propagates.
pub async fn ingest(
    conn: &mut SqliteConnection,
    connector: &dyn Connector,
    request: &IngestRequest<'_>,
) -> Result<IngestOutcome, IngestError> {
    let source = sources::get_source_by_code(conn, connector.source_code())
        .await?
        .ok_or_else(|| IngestError::UnknownSource(connector.source_code().to_string()))?;

    let url = match request.from_file {
        Some(path) => format!("file://{}", path.display()),
        None => connector.resolve_url(request.url_override, request.timeout).await?,
    };

    let run_id = runs::start_run(conn, source.id, &url).await?;
    let mut counters = RunCounters::default();

    match run_transaction(conn, connector, &source, request, run_id, &mut counters).await {
        Ok(summary) => {
            let message = format!(
                "loaded {} of {} ({} skipped) via {}",
                counters.loaded, counters.seen, counters.skipped, summary.note
            );
            runs::finish_run(
                conn,
                run_id,
                &RunFinish {
                    status: RunStatus::Ok,
                    message: &message,
                    records_seen: counters.seen,
                    records_loaded: counters.loaded,
                    fetched_at: summary.fetched_at,
                    raw_path: summary.raw_path.as_deref(),
                },
            )
            .await?;
            Ok(IngestOutcome {
                run_id,
                records_seen: counters.seen,
                records_loaded: counters.loaded,
                note: summary.note,
            })
        }
        Err(err) => {
            let message = err.to_string();
            let finish = RunFinish {
                status: RunStatus::Error,
                message: &message,
                records_seen: counters.seen,
                records_loaded: counters.loaded,
                fetched_at: None,
                raw_path: None,
            };
            if let Err(finish_err) = runs::finish_run(conn, run_id, &finish).await {
                warn!(run_id, %finish_err, "could not finalize failed run");
            }
            Err(err)
        }
    }
}

async fn run_transaction(
    conn: &mut SqliteConnection,
    connector: &dyn Connector,
    source: &sources::SourceRow,
    request: &IngestRequest<'_>,
    run_id: i64,
    counters: &mut RunCounters,
) -> Result<TxSummary, IngestError> {
    // Extraction happens before the transaction opens: a failed or cancelled
    // fetch must leave no writes behind.
    let extracted = connector
        .extract(&ExtractRequest {
            raw_dir: request.raw_dir,
            timeout: request.timeout,
            from_file: request.from_file,
            url_override: request.url_override,
            strict_network: request.strict_network,
        })
        .await?;
    let note = extracted.note.to_string();
    let snapshot = request.snapshot_date.to_string();

    let mut tx = conn.begin().await.map_err(StoreError::from)?;

    let provenance = FetchProvenance {
        url: &extracted.source_url,
        content_hash: &extracted.content_hash,
        content_type: &extracted.content_type,
        bytes: extracted.bytes,
        fetched_at: extracted.fetched_at,
        raw_path: extracted.raw_path.as_deref(),
    };
    codh_store::fetches::record_run_fetch(&mut tx, run_id, &provenance).await?;
    codh_store::fetches::record_fetch_log(&mut tx, source.id, &provenance).await?;

    // Fixed processing order by natural key, so re-runs are reproducible.
    let mut records = extracted.records.clone();
    records.sort_by(|a, b| a.source_record_id.cmp(&b.source_record_id));

    let mut ctx = RunContext::new();
    let mut seen_mandate_ids: Vec<String> = Vec::new();

    for record in &records {
        counters.seen += 1;
        let Some(row) = connector.normalize(record, request.snapshot_date) else {
            counters.skipped += 1;
            debug!(
                source = %source.code,
                record = %record.source_record_id,
                "normalization skipped record"
            );
            continue;
        };

        match (source.mode, row) {
            (IngestMode::Mandates, NormalizedRow::Mandate(mandate)) => {
                if load_mandate(&mut tx, &mut ctx, source, &mandate, &extracted.content_hash, &snapshot)
                    .await?
                {
                    seen_mandate_ids.push(mandate.source_record_id.clone());
                    counters.loaded += 1;
                } else {
                    counters.skipped += 1;
                }
            }
            (_, row) => {
                // Raw-only persistence: either the source is declared
                // source-records-only, or the connector produced a raw row.
                let payload = serde_json::to_string(match &row {
                    NormalizedRow::Mandate(m) => &m.payload,
                    NormalizedRow::SourceRecordOnly(r) => &r.payload,
                })?;
                ctx.resolve_source_record(
                    &mut tx,
                    source.id,
                    row.source_record_id(),
                    &payload,
                    Some(&extracted.content_hash),
                    Some(&snapshot),
                )
                .await?;
                counters.loaded += 1;
            }
        }
    }

    if counters.seen > 0 && counters.loaded == 0 {
        return Err(IngestError::ZeroYield { seen: counters.seen });
    }

    if request.strict_network && extracted.note.is_live_network() {
        if let Some(min) = source.min_records {
            if counters.loaded < min as u64 {
                return Err(IngestError::BelowThreshold {
                    loaded: counters.loaded,
                    min: min as u64,
                    note: note.clone(),
                });
            }
        }
    }

    if source.mode == IngestMode::Mandates {
        let closed =
            upsert::close_missing_mandates(&mut tx, source.id, &seen_mandate_ids, &snapshot)
                .await?;
        if closed > 0 {
            info!(source = %source.code, closed, "deactivated mandates missing from this run");
        }
    }

    let violations = integrity::check_foreign_keys(&mut tx).await?;
    if !violations.is_empty() {
        return Err(IngestError::Integrity { violations });
    }

    tx.commit().await.map_err(StoreError::from)?;

    Ok(TxSummary {
        note,
        fetched_at: Some(extracted.fetched_at),
        raw_path: extracted.raw_path.clone(),
    })
}

/// Resolve every dimension for one mandate row and write the canonical
/// person/identifier/mandate set. Returns false when the row is not
/// resolvable (no usable person or institution), which counts as a skip.
async fn load_mandate(
    conn: &mut SqliteConnection,
    ctx: &mut RunContext,
    source: &sources::SourceRow,
    row: &MandateRow,
    content_hash: &str,
    snapshot: &str,
) -> Result<bool, IngestError> {
    let Some(institution_id) = ctx.resolve_institution(conn, &row.institution).await? else {
        debug!(record = %row.source_record_id, "no resolvable institution, skipping");
        return Ok(false);
    };
    let gender_id = ctx.resolve_gender(conn, row.gender.as_deref()).await?;
    let Some(person_id) = ctx.resolve_person(conn, row, gender_id).await? else {
        debug!(record = %row.source_record_id, "no resolvable person, skipping");
        return Ok(false);
    };

    let payload = serde_json::to_string(&row.payload)?;
    let source_record_pk = ctx
        .resolve_source_record(
            conn,
            source.id,
            &row.source_record_id,
            &payload,
            Some(content_hash),
            Some(snapshot),
        )
        .await?;

    let admin_level_id = ctx.resolve_admin_level(conn, row.admin_level.as_deref()).await?;
    let role_id = ctx.resolve_role(conn, row.role.as_deref()).await?;
    let party_id = ctx.resolve_party(conn, row.party.as_deref()).await?;
    let territory_id = ctx
        .resolve_territory(conn, row.territory_code.as_deref(), row.territory_name.as_deref())
        .await?;

    upsert::link_person_identifier(conn, source.id, &row.source_record_id, person_id).await?;

    let start_date = row.start_date.map(|d| d.to_string());
    let end_date = row.end_date.map(|d| d.to_string());
    upsert::upsert_mandate(
        conn,
        &MandateUpsert {
            source_id: source.id,
            source_record_id: &row.source_record_id,
            person_id,
            institution_id,
            role_id,
            territory_id,
            admin_level_id,
            party_id,
            start_date: start_date.as_deref(),
            end_date: end_date.as_deref(),
            source_record_pk,
        },
    )
    .await?;

    Ok(true)
}
