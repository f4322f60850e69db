/*!
 * # Request Executor
 *
 * Issues one logical operation against the inventory API:
 *
 * 1. consult the [`RateLimiter`] before every attempt,
 * 2. bound each attempt by the configured timeout,
 * 3. retry 5xx, 429 and no-response failures with exponential backoff
 *    (`base_delay * 2^n` after failed attempt `n`),
 * 4. return any other failure immediately.
 *
 * After `max_retries + 1` failed attempts the last error is wrapped in
 * `ServiceError::RetryExhausted`. Version conflicts (409) are terminal: a
 * blind replay of a ledger write could apply a receipt twice.
 */

pub mod transport;

use metrics::counter;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::errors::ServiceError;
use crate::rate_limiter::RateLimiter;

pub use transport::{ApiRequest, HttpTransport, RawResponse, ReqwestTransport};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on a single attempt.
    pub request_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay after the first failed attempt; doubles on each further failure.
    pub base_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// A decoded list read with the server-reported total, when requested.
#[derive(Debug, Clone)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub total: Option<u64>,
}

/// Delay before the attempt following failed attempt `attempt` (0-indexed).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            transport,
            limiter,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replaces the clock used for backoff sleeps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs `request` to a successful response or a classified error.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, request: &ApiRequest) -> Result<RawResponse, ServiceError> {
        let attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            let error = match self.send_once(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                counter!("inventory_tools.http.failures", 1, "kind" => error.kind());
                warn!(attempt = attempt + 1, error = %error, "Terminal request failure");
                return Err(error);
            }

            if attempt + 1 >= attempts {
                counter!("inventory_tools.http.failures", 1, "kind" => "retry_exhausted_error");
                warn!(attempts, error = %error, "Request failed after exhausting retries");
                if self.config.max_retries == 0 {
                    return Err(error);
                }
                return Err(ServiceError::RetryExhausted {
                    attempts,
                    last: Box::new(error),
                });
            }

            let delay = backoff_delay(self.config.base_delay, attempt);
            counter!("inventory_tools.http.retries", 1);
            warn!(
                attempt = attempt + 1,
                max_attempts = attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable request failure, backing off"
            );
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<RawResponse, ServiceError> {
        self.limiter.acquire().await;
        counter!("inventory_tools.http.attempts", 1);

        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result?.error_for_status(&request.method),
            Err(_) => Err(ServiceError::Timeout(timeout)),
        }
    }

    /// Executes and decodes a JSON body.
    pub async fn execute_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ServiceError> {
        let response = self.execute(request).await?;
        Ok(serde_json::from_str(&response.body)?)
    }

    /// Executes a list read, asking for an exact total count.
    pub async fn list<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<ListPage<T>, ServiceError> {
        let request = request.exact_count();
        let response = self.execute(&request).await?;
        let total = response.total_count();
        let items = serde_json::from_str(&response.body)?;
        Ok(ListPage { items, total })
    }
}
