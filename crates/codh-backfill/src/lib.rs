//! Backfill/mapping engine: a second, independent pass that projects
//! already-stored raw source records into canonical domain events.
//!
//! One family is processed per invocation, inside one write transaction.
//! Individual bad records never abort the pass: every rejection is counted
//! under a named skip reason. Event ids are deterministic, so re-running a
//! pass over unchanged records upserts in place instead of growing tables.

use std::collections::BTreeMap;

use codh_store::records::{self, StoredSourceRecord};
use codh_store::upsert::{self, IndicatorPointUpsert, MoneyRecordUpsert, PolicyEventUpsert};
use codh_store::{sources, SqliteConnection, StoreError};
use serde_json::{Map, Value as JsonValue};
use sqlx::Connection;
use thiserror::Error;
use tracing::{debug, info};

pub mod families;

pub use families::{ExecutiveActionsMapper, GazetteMapper, IndicatorsMapper, MoneyMapper};

pub const CRATE_NAME: &str = "codh-backfill";

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("family {family:?}: only {traceable} of {total} events are fully traceable")]
    Traceability {
        family: String,
        total: i64,
        traceable: i64,
    },
}

/// Outcome of mapping one raw record.
#[derive(Debug, Clone)]
pub enum Mapped {
    Policy(PolicyEventDraft),
    Money(MoneyRecordDraft),
    IndicatorPoint(IndicatorPointDraft),
    /// Named rejection; counted, never fatal.
    Skip(&'static str),
}

#[derive(Debug, Clone)]
pub struct PolicyEventDraft {
    pub event_id: String,
    pub title: String,
    pub event_date: Option<String>,
    pub published_date: Option<String>,
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct MoneyRecordDraft {
    pub event_id: String,
    pub title: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub event_date: Option<String>,
    pub published_date: Option<String>,
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct IndicatorPointDraft {
    pub series_key: String,
    pub series_title: String,
    pub unit: Option<String>,
    pub period: String,
    pub value: f64,
    pub source_url: String,
}

/// One family's mapping rules: a pure projection from a parsed raw payload
/// to a canonical event draft or a named skip.
pub trait FamilyMapper: Send + Sync {
    fn family(&self) -> &'static str;

    fn map(&self, record: &StoredSourceRecord, payload: &Map<String, JsonValue>) -> Mapped;
}

#[derive(Debug, Clone, Default)]
pub struct MappingStats {
    pub family: String,
    pub seen: u64,
    pub mapped: u64,
    pub skipped: u64,
    pub skip_reasons: BTreeMap<String, u64>,
    pub events_upserted: u64,
    /// Family-wide event count after the pass, as validated for traceability.
    pub events_total: i64,
    /// Events that resolve back to a stored raw record with a source URL.
    pub events_traceable: i64,
}

impl MappingStats {
    fn skip(&mut self, reason: &str) {
        self.skipped += 1;
        *self.skip_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
}

/// Run one mapping pass for one family over the given source codes. All
/// writes happen in a single transaction; the traceability check runs inside
/// it, so a broken pass leaves nothing behind.
pub async fn run_mapping(
    conn: &mut SqliteConnection,
    mapper: &dyn FamilyMapper,
    source_codes: &[&str],
) -> Result<MappingStats, BackfillError> {
    let mut stats = MappingStats {
        family: mapper.family().to_string(),
        ..MappingStats::default()
    };

    let mut tx = conn.begin().await.map_err(StoreError::from)?;

    let mut source_ids = Vec::with_capacity(source_codes.len());
    for code in source_codes {
        source_ids.push(sources::require_source(&mut tx, code).await?.id);
    }

    let stored = records::list_source_records(&mut tx, &source_ids).await?;
    let mut wrote_indicators = false;

    for record in &stored {
        stats.seen += 1;
        let payload: JsonValue = match serde_json::from_str(&record.payload) {
            Ok(value) => value,
            Err(_) => {
                stats.skip("unparseable-payload");
                continue;
            }
        };
        let Some(object) = payload.as_object() else {
            stats.skip("payload-not-an-object");
            continue;
        };

        match mapper.map(record, object) {
            Mapped::Skip(reason) => {
                debug!(
                    family = mapper.family(),
                    record = %record.source_record_id,
                    reason,
                    "record skipped"
                );
                stats.skip(reason);
            }
            Mapped::Policy(draft) => {
                upsert::upsert_policy_event(
                    &mut tx,
                    &PolicyEventUpsert {
                        event_id: &draft.event_id,
                        family: mapper.family(),
                        title: &draft.title,
                        event_date: draft.event_date.as_deref(),
                        published_date: draft.published_date.as_deref(),
                        source_url: &draft.source_url,
                        source_record_pk: record.id,
                        source_snapshot_date: record.snapshot_date.as_deref(),
                        raw_payload: &record.payload,
                    },
                )
                .await?;
                stats.mapped += 1;
                stats.events_upserted += 1;
            }
            Mapped::Money(draft) => {
                upsert::upsert_money_record(
                    &mut tx,
                    &MoneyRecordUpsert {
                        event_id: &draft.event_id,
                        family: mapper.family(),
                        title: &draft.title,
                        amount: draft.amount,
                        currency: draft.currency.as_deref(),
                        event_date: draft.event_date.as_deref(),
                        published_date: draft.published_date.as_deref(),
                        source_url: &draft.source_url,
                        source_record_pk: record.id,
                        source_snapshot_date: record.snapshot_date.as_deref(),
                        raw_payload: &record.payload,
                    },
                )
                .await?;
                stats.mapped += 1;
                stats.events_upserted += 1;
            }
            Mapped::IndicatorPoint(draft) => {
                let series_id = upsert::upsert_indicator_series(
                    &mut tx,
                    &draft.series_key,
                    &draft.series_title,
                    draft.unit.as_deref(),
                )
                .await?;
                upsert::upsert_indicator_point(
                    &mut tx,
                    &IndicatorPointUpsert {
                        series_id,
                        period: &draft.period,
                        value: draft.value,
                        source_url: &draft.source_url,
                        source_record_pk: record.id,
                    },
                )
                .await?;
                wrote_indicators = true;
                stats.mapped += 1;
                stats.events_upserted += 1;
            }
        }
    }

    let (total, traceable) = verify_traceability(&mut tx, mapper.family(), wrote_indicators).await?;
    stats.events_total = total;
    stats.events_traceable = traceable;

    tx.commit().await.map_err(StoreError::from)?;

    info!(
        family = mapper.family(),
        seen = stats.seen,
        mapped = stats.mapped,
        skipped = stats.skipped,
        "mapping pass finished"
    );
    Ok(stats)
}

/// Every produced event must carry a non-empty source URL and resolve back
/// to a stored raw record. The schema enforces most of this; the query
/// re-validates it end to end before the pass commits. Returns the
/// `(total, traceable)` counts for the caller's stats.
async fn verify_traceability(
    conn: &mut SqliteConnection,
    family: &str,
    include_indicators: bool,
) -> Result<(i64, i64), BackfillError> {
    let mut total = 0i64;
    let mut traceable = 0i64;

    for table in ["policy_events", "money_records"] {
        let all: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE family = ?"
        ))
        .bind(family)
        .fetch_one(&mut *conn)
        .await
        .map_err(StoreError::from)?;
        let ok: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} e \
             JOIN source_records r ON r.id = e.source_record_pk \
             WHERE e.family = ? AND length(e.source_url) > 0"
        ))
        .bind(family)
        .fetch_one(&mut *conn)
        .await
        .map_err(StoreError::from)?;
        total += all;
        traceable += ok;
    }

    if include_indicators {
        let all: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM indicator_points")
            .fetch_one(&mut *conn)
            .await
            .map_err(StoreError::from)?;
        let ok: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM indicator_points p \
             JOIN source_records r ON r.id = p.source_record_pk \
             WHERE length(p.source_url) > 0",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(StoreError::from)?;
        total += all;
        traceable += ok;
    }

    if total != traceable {
        return Err(BackfillError::Traceability {
            family: family.to_string(),
            total,
            traceable,
        });
    }
    Ok((total, traceable))
}
