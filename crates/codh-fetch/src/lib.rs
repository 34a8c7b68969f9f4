//! Raw payload storage + HTTP fetch utilities for feed connectors.
//!
//! Connectors implementing the extraction contract use [`RawStore`] to keep
//! the exact bytes they fetched (hash-addressed, so identical content is
//! stored once) and [`HttpFetcher`] for retried network access. The
//! orchestrator records the resulting `raw_path` and content hash as run
//! provenance.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "codh-fetch";

/// Where a fetched payload landed on disk.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// True when a payload with identical content already existed.
    pub deduplicated: bool,
}

/// Hash-addressed raw payload store rooted at the ingest run's `raw_dir`.
#[derive(Debug, Clone)]
pub struct RawStore {
    root: PathBuf,
}

impl RawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_code: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source_code)
            .join(stamp)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store a fetched payload immutably, with an atomic temp-file rename.
    /// Re-storing identical bytes is a no-op that reports `deduplicated`.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_code: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.payload_relative_path(fetched_at, source_code, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating payload directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking payload path {}", absolute_path.display()))?
        {
            return Ok(StoredPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("payload path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredPayload {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp payload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Retry schedule for transient feed-fetch failures. `max_attempts` counts
/// the first try, so `1` disables retrying entirely.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl FetchPolicy {
    /// Delay before the retry following failed attempt `attempt` (0-based):
    /// doubles from the base, saturating at the cap.
    pub fn delay(&self, attempt: usize) -> Duration {
        let mut delay = self.base_delay;
        for _ in 0..attempt {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(self.max_delay)
    }
}

fn transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn transient_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Body plus the response metadata a connector records as provenance.
#[derive(Debug, Clone)]
pub struct FeedPayload {
    pub final_url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} fetching {url}")]
    Status { status: u16, url: String },
}

impl FetchError {
    /// Whether retrying could plausibly succeed: server-side errors,
    /// throttling, timeouts and connection failures. Client errors
    /// (4xx other than 429) never are.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => transient_transport(source),
            FetchError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(transient_status)
                .unwrap_or(false),
        }
    }
}

/// Sequential HTTP fetcher, retrying transient failures on the configured
/// schedule. Feeds are fetched one at a time, so there is no concurrency
/// limiting here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl HttpFetcher {
    pub fn new(
        policy: FetchPolicy,
        timeout: Duration,
        user_agent: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent);
        }
        let client = builder.build().context("building http client")?;
        Ok(Self { client, policy })
    }

    pub async fn fetch_bytes(
        &self,
        source_code: &str,
        url: &str,
    ) -> Result<FeedPayload, FetchError> {
        let span = info_span!("feed_fetch", source_code, url);
        async {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.request_once(url).await {
                    Ok(payload) => return Ok(payload),
                    Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                        debug!(attempt, error = %err, "transient fetch failure, retrying");
                        tokio::time::sleep(self.policy.delay(attempt - 1)).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn request_once(&self, url: &str) -> Result<FeedPayload, FetchError> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|source| FetchError::Transport {
                    url: url.to_string(),
                    source,
                })?;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                url: final_url.clone(),
                source,
            })?
            .to_vec();

        Ok(FeedPayload {
            final_url,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[test]
    fn payload_hashing_is_stable() {
        let hash = RawStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = RawStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-07-01T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(fetched_at, "parliament-votes", "csv", b"name;party;vote")
            .await
            .expect("first store");
        let second = store
            .store_bytes(fetched_at, "parliament-votes", "csv", b"name;party;vote")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn retry_delays_double_up_to_the_cap() {
        let policy = FetchPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(5), Duration::from_millis(350));
    }

    #[test]
    fn only_server_side_statuses_are_transient() {
        assert!(transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(transient_status(StatusCode::BAD_GATEWAY));
        assert!(transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!transient_status(StatusCode::NOT_FOUND));
        assert!(!transient_status(StatusCode::FORBIDDEN));
    }

    /// One canned HTTP/1.1 response per accepted connection.
    async fn serve_once_each(responses: Vec<String>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            for response in responses {
                let (mut stream, _) = listener.accept().await.expect("accept");
                let mut scratch = [0u8; 2048];
                let _ = stream.read(&mut scratch).await;
                stream.write_all(response.as_bytes()).await.expect("write");
                let _ = stream.shutdown().await;
            }
        });
        addr
    }

    fn response_with(status_line: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn transient_server_error_is_retried_until_success() {
        let addr = serve_once_each(vec![
            response_with("500 Internal Server Error", "text/plain", "later"),
            response_with("200 OK", "application/json", r#"[{"ok":true}]"#),
        ])
        .await;

        let fetcher = HttpFetcher::new(
            FetchPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            Duration::from_secs(5),
            None,
        )
        .expect("fetcher");

        let payload = fetcher
            .fetch_bytes("stats", &format!("http://{addr}/feed"))
            .await
            .expect("fetch");
        assert_eq!(payload.body, br#"[{"ok":true}]"#);
        assert_eq!(payload.content_type, "application/json");
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let addr = serve_once_each(vec![response_with("404 Not Found", "text/plain", "gone")])
            .await;

        let fetcher = HttpFetcher::new(
            FetchPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            Duration::from_secs(5),
            None,
        )
        .expect("fetcher");

        let err = fetcher
            .fetch_bytes("stats", &format!("http://{addr}/feed"))
            .await
            .expect_err("404");
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert!(!err.is_transient());
    }
}
