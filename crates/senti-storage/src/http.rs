//! Outbound HTTP with bounded retries, shared by the oracle client and the blob backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

/// Statuses worth another attempt: throttling, overload, and gateway failures.
pub const RETRYABLE_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if RETRYABLE_STATUSES.contains(&status) {
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Capped exponential delay before retry number `attempt_index + 1`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Delay actually slept: the server hint when present, otherwise the exponential
    /// delay with "equal jitter" (half fixed, half random). Never longer than `max_delay`.
    pub fn next_delay(&self, attempt_index: usize, server_hint: Option<Duration>) -> Duration {
        if let Some(hint) = server_hint {
            return hint.min(self.max_delay);
        }
        let delay = self.delay_for_attempt(attempt_index);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Refill granularity floor; refills are counted in whole milliseconds.
const MIN_REFILL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket that admits `per_minute` requests per minute with a burst of the same size.
    pub fn per_minute(per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        Self {
            capacity: per_minute,
            refill_every: (Duration::from_secs(60) / per_minute).max(MIN_REFILL),
        }
    }
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
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every: refill_every.max(MIN_REFILL),
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Response of a request that was not retried away.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.body)
            .with_context(|| format!("decoding JSON body from {}", self.url))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Retries used up on transient failures.
    #[error("transient network failure on {url} after {attempts} attempts: {reason}")]
    Exhausted {
        url: String,
        attempts: usize,
        status: Option<u16>,
        reason: String,
    },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http client is shut down")]
    Closed,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// reqwest client applying [`BackoffPolicy`] to every request it sends.
#[derive(Debug)]
pub struct RetryingHttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl RetryingHttpClient {
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
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Send the request produced by `build`, rebuilding it for every attempt.
    ///
    /// Only transient statuses and connection failures are retried; every other status
    /// comes back as an [`HttpResponse`] for the caller to interpret.
    pub async fn send<F>(
        &self,
        label: &str,
        url: &str,
        build: F,
    ) -> Result<HttpResponse, TransportError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;

        let span = info_span!("http_send", label, url);
        self.send_with_retries(url, build).instrument(span).await
    }

    async fn send_with_retries<F>(
        &self,
        url: &str,
        build: F,
    ) -> Result<HttpResponse, TransportError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut last_failure = (None, String::new());

        for attempt in 0..max_attempts {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let is_last = attempt + 1 == max_attempts;
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if classify_status(status) == RetryDisposition::NonRetryable {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|source| TransportError::Request {
                                url: final_url.clone(),
                                source,
                            })?
                            .to_vec();
                        return Ok(HttpResponse {
                            status,
                            url: final_url,
                            body,
                            attempts: attempt + 1,
                        });
                    }

                    last_failure = (Some(status.as_u16()), format!("http status {status}"));
                    if !is_last {
                        let hint = retry_after_hint(resp.headers());
                        let delay = self.backoff.next_delay(attempt, hint);
                        warn!(
                            attempt = attempt + 1,
                            %status,
                            delay_ms = delay.as_millis() as u64,
                            "transient status; backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(TransportError::Request {
                            url: url.to_string(),
                            source: err,
                        });
                    }
                    last_failure = (None, err.to_string());
                    if !is_last {
                        let delay = self.backoff.next_delay(attempt, None);
                        debug!(
                            attempt = attempt + 1,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "request failed; backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let (status, reason) = last_failure;
        Err(TransportError::Exhausted {
            url: url.to_string(),
            attempts: max_attempts,
            status,
            reason,
        })
    }
}
