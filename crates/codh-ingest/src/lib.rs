//! Per-source ingestion: the connector contract, the per-run identity
//! resolver, the source registry, and the orchestrator that ties one full
//! ingest together inside a single write transaction.

pub mod cache;
pub mod connector;
pub mod orchestrator;
pub mod registry;

pub use cache::RunContext;
pub use connector::{
    Connector, ConnectorError, ExtractRequest, FileConnector, HttpConnector, ReplayBundle,
};
pub use orchestrator::{ingest, IngestError, IngestOutcome, IngestRequest};
pub use registry::{load_registry, seed_sources, SourceConfig, SourceRegistry};

pub const CRATE_NAME: &str = "codh-ingest";
