//! Durable seen-ledger + rate-limited HTTP fetch utilities.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod ledger;
pub mod stub;

pub use ledger::{
    EmailMark, LedgerError, LedgerStats, MemoryLedger, OverlayLedger, SeenLedger, SqliteLedger,
};
pub use stub::StubFetcher;

pub const CRATE_NAME: &str = "scout-storage";

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub max_redirects: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 8,
            per_host_concurrency: 2,
            max_redirects: 10,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Per-host request pacing on top of the in-flight caps.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
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
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.as_millis() > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub requested_url: String,
    /// URL after following redirects.
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn redirected(&self) -> bool {
        self.requested_url != self.final_url
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("connection failed for {url}: {message}")]
    Connect { url: String, message: String },
    #[error("unresolvable redirect for {url}: {message}")]
    Redirect { url: String, message: String },
    #[error("request failed for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("invalid url {url}")]
    InvalidUrl { url: String },
}

impl FetchError {
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            FetchError::Timeout { url }
        } else if err.is_redirect() {
            FetchError::Redirect {
                url,
                message: err.to_string(),
            }
        } else if err.is_connect() {
            FetchError::Connect {
                url,
                message: err.to_string(),
            }
        } else {
            FetchError::Transport {
                url,
                message: err.to_string(),
            }
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Timeout { .. } | FetchError::Connect { .. } => RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Redirect { .. }
            | FetchError::Transport { .. }
            | FetchError::InvalidUrl { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// GET-and-inspect capability used by the validation pipeline and platform probes.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<TokenBucketConfig>,
    buckets: Mutex<HashMap<String, Arc<SimpleTokenBucket>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket,
            buckets: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    async fn per_host_bucket(&self, host: &str) -> Option<Arc<SimpleTokenBucket>> {
        let config = self.token_bucket?;
        let mut map = self.buckets.lock().await;
        Some(
            map.entry(host.to_string())
                .or_insert_with(|| Arc::new(SimpleTokenBucket::new(config)))
                .clone(),
        )
    }

    async fn attempt(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(url, &err))?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|err| FetchError::from_reqwest(url, &err))?
            .to_vec();
        Ok(FetchedResponse {
            status,
            requested_url: url.to_string(),
            final_url,
            body,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .ok_or_else(|| FetchError::InvalidUrl { url: url.to_string() })?;

        let shut_down = || FetchError::Transport {
            url: url.to_string(),
            message: "fetcher is shutting down".to_string(),
        };
        let _global = self.global_limit.acquire().await.map_err(|_| shut_down())?;
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire().await.map_err(|_| shut_down())?;

        let span = info_span!("http_fetch", %run_id, host = %host, url);
        async {
            let mut attempt = 0usize;
            loop {
                if let Some(bucket) = self.per_host_bucket(&host).await {
                    bucket.take().await;
                }

                match self.attempt(url).await {
                    Ok(resp) => return Ok(resp),
                    Err(err) if err.is_transient() && attempt < self.backoff.max_retries => {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(%err, attempt, ?delay, "transient fetch failure, backing off");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }
}
