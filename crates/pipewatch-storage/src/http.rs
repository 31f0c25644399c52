use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {attempts} attempts fetching {url}")]
    Timeout { url: String, attempts: u32 },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    /// Retries ran out on a timing-out upstream. Callers treat this as a warning.
    pub fn is_upstream_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// Exponential retry schedule, capped. A `Retry-After` header overrides the
/// computed delay when it is shorter than `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, failed_attempts: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(failed_attempts.saturating_sub(1)));
        retry_after.unwrap_or(computed).min(self.max_delay)
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    /// Minimum spacing between request starts.
    pub min_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 2,
            min_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

/// Spaces request starts at least `interval` apart across all callers.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

enum Attempt {
    Done(FetchedResponse),
    Retry {
        status: Option<StatusCode>,
        retry_after: Option<Duration>,
        reason: String,
    },
    Failed(FetchError),
}

/// Paced, bounded GET client for registry APIs.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    pacer: RequestPacer,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            pacer: RequestPacer::new(config.min_interval),
            retry: config.retry,
        })
    }

    /// GET `base` with url-encoded query parameters.
    pub async fn fetch_query(
        &self,
        base: &str,
        params: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let url = Url::parse_with_params(base, params.iter().map(|(k, v)| (*k, v.as_str())))
            .map_err(|e| FetchError::InvalidUrl {
                url: base.to_string(),
                reason: e.to_string(),
            })?;
        self.fetch(url).await
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let url = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        self.fetch(url).await
    }

    async fn fetch(&self, url: Url) -> Result<FetchedResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let host = url.host_str().unwrap_or_default().to_string();
        let span = info_span!("http_fetch", host = %host, path = url.path());

        async {
            let mut failed = 0u32;
            loop {
                self.pacer.wait().await;
                let outcome = match self.client.get(url.clone()).send().await {
                    Ok(response) => self.classify(response).await,
                    Err(err) if is_transient(&err) => Attempt::Retry {
                        status: None,
                        retry_after: None,
                        reason: err.to_string(),
                    },
                    Err(err) => Attempt::Failed(err.into()),
                };

                match outcome {
                    Attempt::Done(response) => {
                        debug!(bytes = response.body.len(), attempts = failed + 1, "fetched");
                        return Ok(response);
                    }
                    Attempt::Failed(err) => return Err(err),
                    Attempt::Retry {
                        status,
                        retry_after,
                        reason,
                    } => {
                        failed += 1;
                        if failed > self.retry.max_retries {
                            return Err(exhausted(&url, failed, status));
                        }
                        let delay = self.retry.delay_after(failed, retry_after);
                        warn!(attempt = failed, ?delay, %reason, "retrying request");
                        sleep(delay).await;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn classify(&self, response: Response) -> Attempt {
        let status = response.status();
        let final_url = response.url().to_string();
        if status.is_success() {
            return match response.bytes().await {
                Ok(body) => Attempt::Done(FetchedResponse {
                    status,
                    final_url,
                    body: body.to_vec(),
                }),
                Err(err) if is_transient(&err) => Attempt::Retry {
                    status: None,
                    retry_after: None,
                    reason: err.to_string(),
                },
                Err(err) => Attempt::Failed(err.into()),
            };
        }
        if is_retryable_status(status) {
            return Attempt::Retry {
                status: Some(status),
                retry_after: retry_after_header(&response),
                reason: format!("http {status}"),
            };
        }
        Attempt::Failed(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        })
    }
}

/// Final error once retries run out: the last status if there was one, else a timeout.
fn exhausted(url: &Url, attempts: u32, status: Option<StatusCode>) -> FetchError {
    match status {
        Some(status) => FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        },
        None => FetchError::Timeout {
            url: url.to_string(),
            attempts,
        },
    }
}

fn retry_after_header(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_double_and_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_after(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3, None), Duration::from_millis(350));
        assert_eq!(policy.delay_after(9, None), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_header_wins_but_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_after(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(policy.delay_after(1, Some(Duration::from_secs(600))), policy.max_delay);
    }

    #[test]
    fn throttling_and_server_errors_are_retried() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(40));
        let start = Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn invalid_urls_fail_before_any_request() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher.fetch_bytes("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
        assert!(!err.is_upstream_timeout());
    }
}
