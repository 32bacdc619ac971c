//! Token-bucket rate limiter.
//!
//! Tokens refill lazily on each check at `tokens_per_second`, capped at
//! the burst capacity. [`TokenBucket::acquire`] computes the wait for a
//! missing token analytically from the deficit instead of polling at a
//! fixed interval.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::cancellation::CancelToken;
use crate::errors::CancelledError;

/// Configuration for the token-bucket rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained refill rate in tokens per second.
    pub tokens_per_second: f64,
    /// Burst capacity; the bucket never holds more than this.
    pub burst: f64,
    /// Tokens consumed per operation.
    pub tokens_per_operation: f64,
}

impl RateLimitConfig {
    /// Creates a config with the given rate and burst, one token per operation.
    #[must_use]
    pub fn new(tokens_per_second: f64, burst: f64) -> Self {
        Self {
            tokens_per_second,
            burst,
            tokens_per_operation: 1.0,
        }
    }

    /// Sets the tokens consumed per operation.
    #[must_use]
    pub fn with_tokens_per_operation(mut self, tokens: f64) -> Self {
        self.tokens_per_operation = tokens;
        self
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket shared by all workers of one pipeline invocation.
///
/// Refill and consumption are atomic with respect to each other: both
/// happen under a single internal lock.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    per_operation: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a bucket that starts full.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            rate: config.tokens_per_second,
            capacity: config.burst,
            per_operation: config.tokens_per_operation,
            state: Mutex::new(BucketState {
                tokens: config.burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// Attempts to take tokens for one operation without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= self.per_operation {
            state.tokens -= self.per_operation;
            true
        } else {
            false
        }
    }

    /// Waits until tokens for one operation are available, then takes them.
    ///
    /// The wait is derived from the token deficit and re-checked after each
    /// sleep; cancellation interrupts the wait immediately.
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<(), CancelledError> {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= self.per_operation {
                    state.tokens -= self.per_operation;
                    return Ok(());
                }
                let deficit = self.per_operation - state.tokens;
                if self.rate > 0.0 {
                    Duration::from_secs_f64(deficit / self.rate)
                } else {
                    // A non-positive rate never refills; re-check at a
                    // coarse interval so the wait stays cancellable
                    // instead of computing an infinite delay.
                    Duration::from_millis(50)
                }
            };

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return Err(cancel.as_error()),
            }
        }
    }

    /// Returns the tokens currently available, after a lazy refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(&RateLimitConfig::new(10.0, 5.0));
        assert!((bucket.available() - 5.0).abs() < 0.1);
    }

    #[test]
    fn test_try_acquire_drains_burst() {
        let bucket = TokenBucket::new(&RateLimitConfig::new(0.001, 3.0));

        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let bucket = TokenBucket::new(&RateLimitConfig::new(1000.0, 2.0));
        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.available() <= 2.0);
    }

    #[test]
    fn test_multi_token_operations() {
        let config = RateLimitConfig::new(0.001, 4.0).with_tokens_per_operation(2.0);
        let bucket = TokenBucket::new(&config);

        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        // rate 100/s: after draining the burst, the next token needs ~10ms.
        let bucket = TokenBucket::new(&RateLimitConfig::new(100.0, 2.0));
        let cancel = CancelToken::new();

        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());

        let started = Instant::now();
        bucket.acquire(&cancel).await.expect("not cancelled");
        let elapsed = started.elapsed();

        assert!(
            elapsed >= Duration::from_millis(8),
            "expected >= ~10ms wait, got {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_acquire_immediate_when_tokens_available() {
        let bucket = TokenBucket::new(&RateLimitConfig::new(1.0, 1.0));
        let cancel = CancelToken::new();

        let started = Instant::now();
        bucket.acquire(&cancel).await.expect("not cancelled");

        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_zero_rate_wait_is_cancellable() {
        // Constructed directly, so no validation rejects the zero rate.
        let bucket = TokenBucket::new(&RateLimitConfig::new(0.0, 1.0));
        let cancel = CancelToken::new();

        assert!(bucket.try_acquire());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel("never refills");
        });

        let err = tokio::time::timeout(Duration::from_secs(2), bucket.acquire(&cancel))
            .await
            .expect("acquire should return promptly")
            .expect_err("should be cancelled");
        assert_eq!(err.reason, "never refills");
    }

    #[tokio::test]
    async fn test_acquire_interrupted_by_cancellation() {
        // Refill is far too slow to ever satisfy the wait.
        let bucket = TokenBucket::new(&RateLimitConfig::new(0.001, 1.0));
        let cancel = CancelToken::new();

        assert!(bucket.try_acquire());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel("test cancel");
        });

        let err = tokio::time::timeout(Duration::from_secs(2), bucket.acquire(&cancel))
            .await
            .expect("acquire should return promptly")
            .expect_err("should be cancelled");
        assert_eq!(err.reason, "test cancel");
    }
}
