//! Core domain model and normalization primitives for the harmonizer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod amount;
pub mod normalize;

pub const CRATE_NAME: &str = "codh-core";

/// How a source's records are loaded during ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestMode {
    /// Resolve every dimension and upsert person/institution/mandate rows.
    Mandates,
    /// Persist the raw source record for later mapping, no entity resolution.
    SourceRecordsOnly,
}

/// Provenance note attached to an extraction, telling the orchestrator how
/// the payload was obtained. The recognized states are fixed; strict-network
/// policy applies only to the two live variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchNote {
    Network,
    NetworkPartial(String),
    FromFile,
    SampleFallback(String),
}

impl FetchNote {
    /// True for fetches that actually touched the network, including
    /// partially failed ones. These are the only notes the strict-network
    /// threshold applies to.
    pub fn is_live_network(&self) -> bool {
        matches!(self, FetchNote::Network | FetchNote::NetworkPartial(_))
    }
}

impl std::fmt::Display for FetchNote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchNote::Network => write!(f, "network"),
            FetchNote::NetworkPartial(detail) => {
                write!(f, "network-with-partial-errors ({detail})")
            }
            FetchNote::FromFile => write!(f, "from-file"),
            FetchNote::SampleFallback(detail) => write!(f, "sample-fallback ({detail})"),
        }
    }
}

/// One raw unit pulled out of a feed, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Stable per-source record identifier, half of the natural key.
    pub source_record_id: String,
    pub payload: JsonValue,
}

/// Everything a connector's `extract` hands to the orchestrator: the parsed
/// records plus the physical fetch provenance.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_path: Option<String>,
    pub content_hash: String,
    pub content_type: String,
    pub bytes: u64,
    pub note: FetchNote,
    pub records: Vec<RawRecord>,
}

/// Typed normalization result. `None` from a connector means "skip, not an
/// error"; a present row is one of these two shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NormalizedRow {
    Mandate(MandateRow),
    SourceRecordOnly(SourceRecordRow),
}

impl NormalizedRow {
    pub fn source_record_id(&self) -> &str {
        match self {
            NormalizedRow::Mandate(row) => &row.source_record_id,
            NormalizedRow::SourceRecordOnly(row) => &row.source_record_id,
        }
    }
}

/// Fully normalized mandate row: free-text dimension labels still attached,
/// resolved to numeric identities by the run's dimension cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MandateRow {
    pub source_record_id: String,
    pub payload: JsonValue,
    pub full_name: String,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub party: Option<String>,
    pub institution: String,
    pub admin_level: Option<String>,
    pub role: Option<String>,
    pub territory_code: Option<String>,
    pub territory_name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Raw-only row: the record is persisted verbatim for a later mapping pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecordRow {
    pub source_record_id: String,
    pub payload: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_note_labels_match_recognized_forms() {
        assert_eq!(FetchNote::Network.to_string(), "network");
        assert_eq!(
            FetchNote::NetworkPartial("2 of 5 pages failed".into()).to_string(),
            "network-with-partial-errors (2 of 5 pages failed)"
        );
        assert_eq!(FetchNote::FromFile.to_string(), "from-file");
        assert_eq!(
            FetchNote::SampleFallback("timeout".into()).to_string(),
            "sample-fallback (timeout)"
        );
    }

    #[test]
    fn only_live_variants_trigger_strict_policy() {
        assert!(FetchNote::Network.is_live_network());
        assert!(FetchNote::NetworkPartial("x".into()).is_live_network());
        assert!(!FetchNote::FromFile.is_live_network());
        assert!(!FetchNote::SampleFallback("x".into()).is_live_network());
    }
}
