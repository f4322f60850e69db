/*!
 * # Rate Limiting Module
 *
 * Token-bucket admission control for outbound calls to the inventory API.
 *
 * - Tokens accumulate continuously at `requests_per_minute / 60_000` per
 *   millisecond, capped at `requests_per_minute` (the burst capacity).
 * - [`RateLimiter::acquire`] refills from elapsed time, waits for the
 *   shortfall if fewer than one token is available, refills again and
 *   consumes one token.
 * - The token count and the last refill instant are a single unit of state
 *   behind an async mutex. The guard is held across the wait, so concurrent
 *   acquisitions queue up and each one is applied atomically.
 *
 * ## Usage
 *
 * ```ignore
 * let limiter = RateLimiter::new(RateLimitConfig { requests_per_minute: 60 });
 * limiter.acquire().await;
 * // issue the request
 * ```
 */
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::{Clock, SystemClock};

const MS_PER_MINUTE: f64 = 60_000.0;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    max_tokens: f64,
    refill_per_ms: f64,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds a limiter that starts with a full bucket.
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let rate = f64::from(config.requests_per_minute.max(1));
        let bucket = Bucket {
            tokens: rate,
            last_refill: clock.now(),
        };

        Self {
            config,
            max_tokens: rate,
            refill_per_ms: rate / MS_PER_MINUTE,
            bucket: Mutex::new(bucket),
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Suspends until a token is available, then consumes it.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        if bucket.tokens < 1.0 {
            let wait = self.wait_for(bucket.tokens);
            debug!(
                wait_ms = wait.as_millis() as u64,
                tokens = bucket.tokens,
                "Rate limit reached, waiting for token"
            );
            counter!("inventory_tools.rate_limiter.waits", 1);
            self.clock.sleep(wait).await;
            self.refill(&mut bucket);
        }

        bucket.tokens -= 1.0;
    }

    /// Tokens currently available, after refilling.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.now();
        let elapsed_ms = now.saturating_duration_since(bucket.last_refill).as_secs_f64() * 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_ms * self.refill_per_ms).min(self.max_tokens);
        bucket.last_refill = now;
    }

    fn wait_for(&self, tokens: f64) -> Duration {
        let millis = ((1.0 - tokens) / self.refill_per_ms).ceil();
        Duration::from_millis(millis.max(0.0) as u64)
    }
}
