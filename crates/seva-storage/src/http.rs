//! Rate-limited, retrying HTTP client shared by scrape sources and the
//! e-mail channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};

/// Whether sending a request twice can repeat its side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// Reads: any transient failure may be retried.
    Safe,
    /// Deliveries: retry only when the server provably did not act.
    Unsafe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl From<bool> for RetryDisposition {
    fn from(retry: bool) -> Self {
        if retry {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

/// 429 and 503 are refusals before any work, so they are retried for every
/// request. Other 5xx may follow a partial send.
pub fn status_disposition(status: StatusCode, replay: Replay) -> RetryDisposition {
    let refused = status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE;
    let retry = match replay {
        Replay::Safe => refused || status.is_server_error(),
        Replay::Unsafe => refused,
    };
    retry.into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// No connection was made, so nothing was sent.
    Connect,
    Timeout,
    Request,
    Other,
}

impl TransportFailure {
    pub fn of(err: &reqwest::Error) -> Self {
        if err.is_connect() {
            TransportFailure::Connect
        } else if err.is_timeout() {
            TransportFailure::Timeout
        } else if err.is_request() {
            TransportFailure::Request
        } else {
            TransportFailure::Other
        }
    }

    pub fn disposition(self, replay: Replay) -> RetryDisposition {
        let retry = matches!(
            (self, replay),
            (TransportFailure::Connect, _)
                | (TransportFailure::Timeout | TransportFailure::Request, Replay::Safe)
        );
        retry.into()
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Doubles from `base_delay` per retry, never above `max_delay`.
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|n| 2u32.checked_pow(n))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Concurrent requests allowed per scrape source or channel.
    pub per_key_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_key_concurrency: 4,
            backoff: BackoffPolicy::default(),
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
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_key_limit: usize,
    per_key: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
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

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_key_limit: config.per_key_concurrency.max(1),
            per_key: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn key_semaphore(&self, key: &str) -> Arc<Semaphore> {
        let mut map = self.per_key.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_key_limit)))
            .clone()
    }

    /// GET `url`, retrying server errors, 429s and transport failures.
    pub async fn fetch_bytes(&self, key: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", key, url);
        self.execute(key, Replay::Safe, || self.client.get(url))
            .instrument(span)
            .await
    }

    /// POST a JSON body with a bearer token.
    pub async fn post_json(
        &self,
        key: &str,
        url: &str,
        bearer: &str,
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", key, url);
        self.execute(key, Replay::Unsafe, || {
            self.client.post(url).bearer_auth(bearer).json(body)
        })
        .instrument(span)
        .await
    }

    async fn execute<F>(
        &self,
        key: &str,
        replay: Replay,
        request: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_key = self.key_semaphore(key).await;
        let _key = per_key.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            match request().send().await {
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

                    if status_disposition(status, replay) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(%status, attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: body.chars().take(512).collect(),
                    });
                }
                Err(err) => {
                    if TransportFailure::of(&err).disposition(replay) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
