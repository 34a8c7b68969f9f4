use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use codh_backfill::{
    ExecutiveActionsMapper, FamilyMapper, GazetteMapper, IndicatorsMapper, MoneyMapper,
};
use codh_ingest::{Connector, FileConnector, HttpConnector, IngestRequest};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "codh")]
#[command(about = "Civic open data harmonizer")]
struct Cli {
    /// Path to the canonical database file.
    #[arg(long, default_value = "codh.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Seed (or refresh) the source registry from a YAML file.
    Seed {
        #[arg(long, default_value = "sources.yaml")]
        registry: PathBuf,
    },
    /// Ingest one source, either live over HTTP or from a recorded bundle.
    Ingest {
        /// Recorded extraction bundle to replay instead of fetching.
        #[arg(long, conflicts_with = "source")]
        from_file: Option<PathBuf>,
        /// Seeded source code to fetch live.
        #[arg(long)]
        source: Option<String>,
        /// Feed URL override; defaults to the source's registered URL.
        #[arg(long, requires = "source")]
        url: Option<String>,
        /// Local sample replayed when the live fetch fails (non-strict only).
        #[arg(long, requires = "source")]
        sample: Option<PathBuf>,
        /// Directory raw payloads are archived under.
        #[arg(long, default_value = "raw")]
        raw_dir: PathBuf,
        /// Abort when a live fetch loads fewer records than the source's
        /// declared minimum.
        #[arg(long)]
        strict_network: bool,
        /// Extraction timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Run one backfill family over its stored raw records.
    Backfill {
        /// Family to run: executive-actions, gazette, money, or indicators.
        #[arg(long)]
        family: String,
        /// Source codes the family reads from.
        #[arg(long, required = true, num_args = 1..)]
        source: Vec<String>,
    },
    /// Run the full referential-integrity scan.
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut conn = codh_store::open(&cli.db)
        .await
        .with_context(|| format!("opening database {}", cli.db.display()))?;

    match cli.command {
        Commands::Seed { registry } => {
            let parsed = codh_ingest::load_registry(&registry)
                .with_context(|| format!("loading registry {}", registry.display()))?;
            let seeded = codh_ingest::seed_sources(&mut conn, &parsed).await?;
            println!("seeded {seeded} sources from {}", registry.display());
        }
        Commands::Ingest {
            from_file,
            source,
            url,
            sample,
            raw_dir,
            strict_network,
            timeout,
        } => {
            let connector: Box<dyn codh_ingest::Connector> = match (&from_file, source) {
                (Some(path), _) => {
                    let loaded = FileConnector::load(path)
                        .with_context(|| format!("loading bundle {}", path.display()))?;
                    info!(source = loaded.source_code(), "replaying recorded bundle");
                    Box::new(loaded)
                }
                (None, Some(code)) => {
                    let row = codh_store::sources::require_source(&mut conn, &code).await?;
                    let feed_url = match url.or(row.default_url) {
                        Some(feed_url) => feed_url,
                        None => bail!("source {code:?} has no registered url; pass --url"),
                    };
                    let mut live = HttpConnector::new(code, feed_url);
                    if let Some(sample) = sample {
                        live = live.with_sample(sample);
                    }
                    Box::new(live)
                }
                (None, None) => bail!("pass either --from-file or --source"),
            };
            let outcome = codh_ingest::ingest(
                &mut conn,
                connector.as_ref(),
                &IngestRequest {
                    raw_dir: &raw_dir,
                    timeout: Duration::from_secs(timeout),
                    from_file: from_file.as_deref(),
                    url_override: None,
                    snapshot_date: Utc::now().date_naive(),
                    strict_network,
                },
            )
            .await?;
            println!(
                "run {} loaded {} of {} records ({})",
                outcome.run_id, outcome.records_loaded, outcome.records_seen, outcome.note
            );
        }
        Commands::Backfill { family, source } => {
            let mapper: Box<dyn FamilyMapper> = match family.as_str() {
                "executive-actions" => Box::new(ExecutiveActionsMapper),
                "gazette" => Box::new(GazetteMapper),
                "money" => Box::new(MoneyMapper),
                "indicators" => Box::new(IndicatorsMapper),
                other => bail!("unknown backfill family {other:?}"),
            };
            let codes: Vec<&str> = source.iter().map(String::as_str).collect();
            let stats = codh_backfill::run_mapping(&mut conn, mapper.as_ref(), &codes).await?;
            println!(
                "family {}: seen {} mapped {} skipped {} upserted {} (traceable {}/{})",
                stats.family,
                stats.seen,
                stats.mapped,
                stats.skipped,
                stats.events_upserted,
                stats.events_traceable,
                stats.events_total
            );
            for (reason, count) in &stats.skip_reasons {
                println!("  skip {reason}: {count}");
            }
        }
        Commands::Verify => {
            let violations = codh_store::integrity::check_foreign_keys(&mut conn).await?;
            if violations.is_empty() {
                println!("integrity ok");
            } else {
                eprintln!(
                    "integrity broken: {}",
                    codh_store::integrity::format_violations(&violations)
                );
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
