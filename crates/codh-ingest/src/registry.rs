//! Declarative source registry, loaded from `sources.yaml` and seeded into
//! the canonical store before any ingest runs.

use std::path::Path;

use codh_core::IngestMode;
use codh_store::sources::{upsert_source, SourceSeed};
use codh_store::{SqliteConnection, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading registry {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing registry {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub default_url: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: IngestMode,
    #[serde(default)]
    pub min_records: Option<i64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_mode() -> IngestMode {
    IngestMode::Mandates
}

fn default_active() -> bool {
    true
}

/// Parse a `sources.yaml` registry file.
pub fn load_registry(path: &Path) -> Result<SourceRegistry, RegistryError> {
    let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| RegistryError::Yaml {
        path: path.display().to_string(),
        source,
    })
}

/// Seed (or refresh) every registry entry into the `sources` table. Returns
/// the number of entries written. Seeding is an upsert: existing sources are
/// updated in place, never duplicated.
pub async fn seed_sources(
    conn: &mut SqliteConnection,
    registry: &SourceRegistry,
) -> Result<usize, RegistryError> {
    for source in &registry.sources {
        let id = upsert_source(
            conn,
            &SourceSeed {
                code: &source.code,
                name: &source.name,
                scope: source.scope.as_deref(),
                default_url: source.default_url.as_deref(),
                format: source.format.as_deref(),
                mode: source.mode,
                min_records: source.min_records,
                active: source.active,
            },
        )
        .await?;
        info!(code = %source.code, id, "seeded source");
    }
    Ok(registry.sources.len())
}
