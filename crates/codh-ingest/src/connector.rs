//! The connector contract implemented by per-feed extraction adapters, plus
//! the built-in file-replay connector.
//!
//! Scraping and parsing logic lives in out-of-scope adapter crates; the
//! orchestrator only depends on this trait. [`FileConnector`] replays a
//! previously recorded extraction bundle from disk, which is how ingestion
//! stays reproducible in tests and during incident replay.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use codh_core::normalize::parse_feed_date;
use codh_core::{Extracted, FetchNote, MandateRow, NormalizedRow, RawRecord, SourceRecordRow};
use codh_fetch::{FetchPolicy, HttpFetcher, RawStore};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("could not resolve feed url: {0}")]
    ResolveUrl(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("reading feed payload: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing feed payload: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parameters the orchestrator hands to `extract`.
#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub raw_dir: &'a Path,
    pub timeout: Duration,
    pub from_file: Option<&'a Path>,
    pub url_override: Option<&'a str>,
    pub strict_network: bool,
}

/// Extraction contract for one feed. Implementations are per-source
/// adapters; the orchestrator calls the three operations in order and never
/// looks behind them.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Code of the seeded source this connector feeds.
    fn source_code(&self) -> &str;

    /// Effective feed URL, honoring a caller override.
    async fn resolve_url(
        &self,
        override_url: Option<&str>,
        timeout: Duration,
    ) -> Result<String, ConnectorError>;

    /// Fetch (or replay) the feed and return records plus fetch provenance.
    /// A connector that falls back to a local sample reports it in the
    /// extraction note; the orchestrator treats an `Err` here as fatal.
    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<Extracted, ConnectorError>;

    /// Turn one raw record into a typed row. `None` means "skip, not an
    /// error" — unparseable or irrelevant records never abort the batch.
    fn normalize(&self, record: &RawRecord, snapshot_date: NaiveDate) -> Option<NormalizedRow>;
}

/// On-disk replay bundle: one recorded extraction, records included.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayBundle {
    pub source_code: String,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub records: Vec<RawRecord>,
}

/// Field-name convention for mandate rows inside a conventional feed
/// payload. Unknown fields are carried along in the raw payload untouched.
#[derive(Debug, Clone, Deserialize)]
struct MandateFields {
    full_name: Option<String>,
    birth_date: Option<String>,
    gender: Option<String>,
    party: Option<String>,
    institution: Option<String>,
    admin_level: Option<String>,
    role: Option<String>,
    territory_code: Option<String>,
    territory_name: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

/// Shared normalization for feeds following the conventional field names:
/// a usable name plus institution makes a mandate row, an empty object is a
/// skip, anything else stays raw for a later mapping pass.
fn conventional_row(record: &RawRecord) -> Option<NormalizedRow> {
    let payload = record.payload.as_object()?;
    let fields: MandateFields =
        serde_json::from_value(record.payload.clone()).unwrap_or(MandateFields {
            full_name: None,
            birth_date: None,
            gender: None,
            party: None,
            institution: None,
            admin_level: None,
            role: None,
            territory_code: None,
            territory_name: None,
            start_date: None,
            end_date: None,
        });

    match (fields.full_name, fields.institution) {
        (Some(full_name), Some(institution))
            if !full_name.trim().is_empty() && !institution.trim().is_empty() =>
        {
            Some(NormalizedRow::Mandate(MandateRow {
                source_record_id: record.source_record_id.clone(),
                payload: record.payload.clone(),
                full_name,
                birth_date: fields.birth_date.as_deref().and_then(parse_feed_date),
                gender: fields.gender,
                party: fields.party,
                institution,
                admin_level: fields.admin_level,
                role: fields.role,
                territory_code: fields.territory_code,
                territory_name: fields.territory_name,
                start_date: fields.start_date.as_deref().and_then(parse_feed_date),
                end_date: fields.end_date.as_deref().and_then(parse_feed_date),
            }))
        }
        _ if payload.is_empty() => None,
        _ => Some(NormalizedRow::SourceRecordOnly(SourceRecordRow {
            source_record_id: record.source_record_id.clone(),
            payload: record.payload.clone(),
        })),
    }
}

/// Connector replaying a recorded bundle from a local path.
#[derive(Debug, Clone)]
pub struct FileConnector {
    path: PathBuf,
    bundle: ReplayBundle,
}

impl FileConnector {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConnectorError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)?;
        let bundle: ReplayBundle = serde_json::from_str(&text)?;
        Ok(Self { path, bundle })
    }

    pub fn bundle(&self) -> &ReplayBundle {
        &self.bundle
    }
}

#[async_trait]
impl Connector for FileConnector {
    fn source_code(&self) -> &str {
        &self.bundle.source_code
    }

    async fn resolve_url(
        &self,
        _override_url: Option<&str>,
        _timeout: Duration,
    ) -> Result<String, ConnectorError> {
        Ok(format!("file://{}", self.path.display()))
    }

    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<Extracted, ConnectorError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let stored = RawStore::new(request.raw_dir)
            .store_bytes(self.bundle.fetched_at, &self.bundle.source_code, "json", &bytes)
            .await
            .map_err(|err| ConnectorError::Extraction(format!("archiving raw payload: {err}")))?;
        Ok(Extracted {
            source_url: self.bundle.source_url.clone(),
            fetched_at: self.bundle.fetched_at,
            raw_path: Some(stored.relative_path.display().to_string()),
            content_hash: stored.content_hash,
            content_type: self
                .bundle
                .content_type
                .clone()
                .unwrap_or_else(|| "application/json".to_string()),
            bytes: bytes.len() as u64,
            note: FetchNote::FromFile,
            records: self.bundle.records.clone(),
        })
    }

    fn normalize(&self, record: &RawRecord, _snapshot_date: NaiveDate) -> Option<NormalizedRow> {
        conventional_row(record)
    }
}

/// Live-feed connector for sources exporting the conventional JSON record
/// array. A failed fetch falls back to a recorded sample file when one is
/// configured, unless the run demands strict network behavior.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    source_code: String,
    url: String,
    sample_path: Option<PathBuf>,
    policy: FetchPolicy,
    user_agent: Option<String>,
}

impl HttpConnector {
    pub fn new(source_code: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            url: url.into(),
            sample_path: None,
            policy: FetchPolicy::default(),
            user_agent: None,
        }
    }

    /// Local sample served when the live fetch fails in non-strict runs.
    pub fn with_sample(mut self, path: impl Into<PathBuf>) -> Self {
        self.sample_path = Some(path.into());
        self
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn source_code(&self) -> &str {
        &self.source_code
    }

    async fn resolve_url(
        &self,
        override_url: Option<&str>,
        _timeout: Duration,
    ) -> Result<String, ConnectorError> {
        Ok(override_url.unwrap_or(&self.url).to_string())
    }

    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<Extracted, ConnectorError> {
        let url = request.url_override.unwrap_or(&self.url).to_string();
        let fetcher = HttpFetcher::new(self.policy, request.timeout, self.user_agent.as_deref())
            .map_err(|err| ConnectorError::Extraction(format!("building http client: {err}")))?;

        let (body, source_url, content_type, note) =
            match fetcher.fetch_bytes(&self.source_code, &url).await {
                Ok(payload) => (
                    payload.body,
                    payload.final_url,
                    payload.content_type,
                    FetchNote::Network,
                ),
                Err(err) => match &self.sample_path {
                    Some(sample) if !request.strict_network => {
                        warn!(
                            source = %self.source_code,
                            error = %err,
                            sample = %sample.display(),
                            "live fetch failed, replaying local sample"
                        );
                        let bytes = tokio::fs::read(sample).await?;
                        (
                            bytes,
                            url.clone(),
                            "application/json".to_string(),
                            FetchNote::SampleFallback(err.to_string()),
                        )
                    }
                    _ => return Err(ConnectorError::Extraction(err.to_string())),
                },
            };

        let records: Vec<RawRecord> = serde_json::from_slice(&body)?;
        let fetched_at = Utc::now();
        let stored = RawStore::new(request.raw_dir)
            .store_bytes(fetched_at, &self.source_code, "json", &body)
            .await
            .map_err(|err| ConnectorError::Extraction(format!("archiving raw payload: {err}")))?;

        Ok(Extracted {
            source_url,
            fetched_at,
            raw_path: Some(stored.relative_path.display().to_string()),
            content_hash: stored.content_hash,
            content_type,
            bytes: body.len() as u64,
            note,
            records,
        })
    }

    fn normalize(&self, record: &RawRecord, _snapshot_date: NaiveDate) -> Option<NormalizedRow> {
        conventional_row(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(id: &str, payload: serde_json::Value) -> RawRecord {
        RawRecord {
            source_record_id: id.to_string(),
            payload,
        }
    }

    fn connector_with(records: Vec<RawRecord>) -> FileConnector {
        FileConnector {
            path: PathBuf::from("bundle.json"),
            bundle: ReplayBundle {
                source_code: "congress".into(),
                source_url: "https://example.org/congress.csv".into(),
                fetched_at: Utc::now(),
                content_type: None,
                records,
            },
        }
    }

    #[test]
    fn mandate_fields_normalize_to_a_mandate_row() {
        let connector = connector_with(vec![]);
        let snapshot = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let record = raw(
            "m-1",
            json!({
                "full_name": "María López",
                "institution": "Congreso de los Diputados",
                "role": "Diputada",
                "birth_date": "1970-05-01",
                "territory_code": "28"
            }),
        );

        let row = connector.normalize(&record, snapshot).expect("row");
        match row {
            NormalizedRow::Mandate(m) => {
                assert_eq!(m.full_name, "María López");
                assert_eq!(m.birth_date, NaiveDate::from_ymd_opt(1970, 5, 1));
                assert_eq!(m.territory_code.as_deref(), Some("28"));
            }
            other => panic!("expected mandate row, got {other:?}"),
        }
    }

    #[test]
    fn non_object_and_empty_payloads_are_skips() {
        let connector = connector_with(vec![]);
        let snapshot = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        assert!(connector.normalize(&raw("x", json!("plain text")), snapshot).is_none());
        assert!(connector.normalize(&raw("y", json!(null)), snapshot).is_none());
        assert!(connector.normalize(&raw("z", json!({})), snapshot).is_none());
    }

    #[test]
    fn payload_without_mandate_fields_falls_back_to_raw_row() {
        let connector = connector_with(vec![]);
        let snapshot = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let record = raw("g-1", json!({"title": "Resolución 123", "url": "https://boe.example"}));
        match connector.normalize(&record, snapshot) {
            Some(NormalizedRow::SourceRecordOnly(row)) => {
                assert_eq!(row.source_record_id, "g-1");
            }
            other => panic!("expected raw-only row, got {other:?}"),
        }
    }
}
