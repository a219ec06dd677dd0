//! HTTP fetch utilities used by live source adapters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use jobwatch_core::BackoffPolicy;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Throttled,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Throttled
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Spacing between consecutive requests of one worker.
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string(),
            ),
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_secs(2),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new((config.capacity.max(1), Instant::now())),
        }
    }

    /// Waits until a token is available and consumes it.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let (tokens, last_refill) = &mut *state;
            let refill_ms = self.refill_every.as_millis();
            if refill_ms > 0 {
                let refills = (last_refill.elapsed().as_millis() / refill_ms) as u32;
                if refills > 0 {
                    *tokens = tokens.saturating_add(refills).min(self.capacity);
                    *last_refill = Instant::now();
                }
            } else {
                *tokens = self.capacity;
            }

            if *tokens > 0 {
                *tokens -= 1;
                return;
            }

            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("throttled by {url} (HTTP 429)")]
    Throttled {
        url: String,
        retry_after: Option<Duration>,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
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
            token_bucket: config.token_bucket.map(|c| Arc::new(SimpleTokenBucket::new(c))),
            backoff: config.backoff,
        })
    }

    /// GETs `url` and returns the body as text.
    ///
    /// Server errors and transient transport errors are retried with
    /// exponential backoff. HTTP 429 is never retried here: it is reported as
    /// [`FetchError::Throttled`] so the caller can apply its own cooldown.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let mut attempt = 0usize;
            loop {
                if let Some(bucket) = &self.token_bucket {
                    bucket.take().await;
                }

                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return resp.text().await.map_err(|source| FetchError::Request {
                                url: url.to_string(),
                                source,
                            });
                        }
                        match classify_status(status) {
                            RetryDisposition::Throttled => {
                                let retry_after = resp
                                    .headers()
                                    .get(RETRY_AFTER)
                                    .and_then(|v| v.to_str().ok())
                                    .and_then(|v| v.trim().parse::<u64>().ok())
                                    .map(Duration::from_secs);
                                return Err(FetchError::Throttled {
                                    url: url.to_string(),
                                    retry_after,
                                });
                            }
                            RetryDisposition::Retryable if attempt < self.backoff.max_retries => {}
                            _ => {
                                return Err(FetchError::HttpStatus {
                                    status: status.as_u16(),
                                    url: url.to_string(),
                                })
                            }
                        }
                    }
                    Err(source) => {
                        if classify_reqwest_error(&source) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %source, "transport error");
                        } else {
                            return Err(FetchError::Request {
                                url: url.to_string(),
                                source,
                            });
                        }
                    }
                }

                let delay = self.backoff.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }
}
