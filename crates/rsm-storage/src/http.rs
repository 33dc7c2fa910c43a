//! Shared reqwest client with bounded concurrency and retry classification.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

use crate::pacing::BackoffPolicy;

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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
        body: String,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Request(err) => classify_reqwest_error(err),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// One attempt; any non-success status becomes [`FetchError::HttpStatus`].
    /// Callers that own their retry policy (the scoring stage) use this.
    pub async fn send_once(&self, request: RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.bytes().await?.to_vec();

        if status.is_success() {
            return Ok(FetchedResponse {
                status,
                final_url,
                body,
            });
        }

        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
            retry_after,
            body: String::from_utf8_lossy(&body).chars().take(512).collect(),
        })
    }

    /// Send a request built by `build`, retrying retryable failures with backoff.
    pub async fn send_with_retry<F>(
        &self,
        source_id: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let span = info_span!("http_fetch", source_id);
        async {
            let mut attempt = 0usize;
            loop {
                match self.send_once(build(&self.client)).await {
                    Ok(resp) => return Ok(resp),
                    Err(err)
                        if err.disposition() == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries =>
                    {
                        let delay = match &err {
                            FetchError::HttpStatus {
                                retry_after: Some(after),
                                ..
                            } => (*after).min(self.backoff.max_delay),
                            _ => self.backoff.delay_for_attempt(attempt),
                        };
                        debug!(attempt, ?delay, error = %err, "retrying request");
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

/// `Retry-After` in delta-seconds form; HTTP-date values and values that do
/// not fit a `Duration` are ignored.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()?;
    Duration::try_from_secs_f64(secs).ok()
}
