//! Storage-side plumbing for Match Lake: resilient HTTP fetching, atomic file writes,
//! the raw payload archive, the table schema adapter and the target table abstraction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod schema;
pub mod table;

pub use schema::{LogicalType, SchemaAdapter, SchemaError, SchemaField, TableSchema};
pub use table::{
    AppendReceipt, LocalParquetTable, ScanTask, SharedTable, TableError, TableScan, TargetTable,
};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

async fn write_temp_sibling(path: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    Ok(temp_path)
}

/// Publishes a file that must never change once visible. The content is staged in a
/// temp sibling and hard-linked into place, so exactly one of several concurrent
/// writers of the same path wins. Returns `false` when the path already existed and
/// nothing was written.
pub async fn write_new_file_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    if fs::try_exists(path)
        .await
        .with_context(|| format!("checking path {}", path.display()))?
    {
        return Ok(false);
    }

    let temp_path = write_temp_sibling(path, bytes).await?;
    let linked = fs::hard_link(&temp_path, path).await;
    let _ = fs::remove_file(&temp_path).await;
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| {
            format!(
                "atomically publishing {} -> {}",
                temp_path.display(),
                path.display()
            )
        }),
    }
}

#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw API payloads, laid out as
/// `<root>/<date>/<player>/<sha256>.json`.
#[derive(Debug, Clone)]
pub struct RawPayloadArchive {
    root: PathBuf,
}

impl RawPayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_relative_path(
        &self,
        event_date: NaiveDate,
        player: &str,
        content_hash: &str,
    ) -> PathBuf {
        let player_dir: String = player
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        PathBuf::from(event_date.format("%Y-%m-%d").to_string())
            .join(player_dir)
            .join(format!("{content_hash}.json"))
    }

    pub async fn store(
        &self,
        event_date: NaiveDate,
        player: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPayload> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.payload_relative_path(event_date, player, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let written = write_new_file_atomically(&absolute_path, bytes).await?;
        Ok(StoredPayload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: !written,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Seconds-valued `Retry-After` hint, if the server sent one.
pub fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Stateless retry policy handed to every fetch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Wait before the next attempt; a server hint is honoured even above `max_delay`.
    pub fn wait_before_retry(&self, attempt_index: usize, hint: Option<Duration>) -> Duration {
        let backoff = self.delay_for_attempt(attempt_index);
        hint.map_or(backoff, |hint| hint.max(backoff))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            token_bucket: None,
        }
    }
}

/// Request budget: a burst of `capacity`, then one request per `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// At most `per_second` requests in any one-second window; `None` for zero.
    pub fn per_second(per_second: u32) -> Option<Self> {
        (per_second > 0).then(|| Self {
            capacity: per_second,
            refill_every: Duration::from_secs(1) / per_second,
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    config: TokenBucketConfig,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available and consumes it.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let interval = self.config.refill_every;
            if interval.is_zero() {
                return;
            }

            let earned = now.duration_since(state.last_refill).as_nanos() / interval.as_nanos();
            if earned > 0 {
                let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(earned).min(self.config.capacity);
                // Partial intervals carry over to the next refill.
                state.last_refill += interval.saturating_mul(earned);
                if state.tokens == self.config.capacity {
                    state.last_refill = now;
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = (state.last_refill + interval).saturating_duration_since(now);
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http status {status} for {url} after {attempts} attempts")]
    RetriesExhausted {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("http client is shutting down")]
    Closed,
}

/// Shared HTTP client: global concurrency cap, optional token bucket, and a retry
/// loop driven by the caller's [`BackoffPolicy`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
        })
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        headers: &HeaderMap,
        policy: &BackoffPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url, headers, policy)
            .instrument(span)
            .await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        headers: &HeaderMap,
        policy: &BackoffPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let wait = match self.client.get(url).headers(headers.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    if attempt >= policy.max_retries {
                        return Err(FetchError::RetriesExhausted {
                            status: status.as_u16(),
                            url: final_url,
                            attempts: attempt + 1,
                        });
                    }
                    policy.wait_before_retry(attempt, retry_after_hint(resp.headers()))
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= policy.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    policy.delay_for_attempt(attempt)
                }
            };

            warn!(
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                "transient fetch failure; retrying"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
