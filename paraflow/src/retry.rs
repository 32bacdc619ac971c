//! Retry policy with configurable backoff strategies.
//!
//! The backoff calculator is a pure function of `(strategy, base, cap,
//! attempt, previous)`; the policy composes it with the per-item timeout,
//! the transient-error predicate, and the circuit breaker, and honors
//! cancellation during backoff waits.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::cancellation::CancelToken;
use crate::errors::{CancelledError, ItemError};

/// Classifies an operation error as transient (retry-eligible) or permanent.
pub type TransientPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Backoff strategy for retry delays. Attempt numbers are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// `base * 2^(n-1)`
    #[default]
    Exponential,
    /// Exponential scaled by a uniform random factor in `(0, 1]`.
    ExponentialJitter,
    /// `min(cap, random(base, previous * 3))`, carrying the previous delay.
    DecorrelatedJitter,
    /// `base * n`
    Linear,
    /// Linear scaled by a uniform random factor in `(0, 1]`.
    LinearJitter,
}

/// Uniform random factor in `(0, 1]`, so a jittered delay is never zero.
fn unit_jitter() -> f64 {
    1.0 - rand::thread_rng().gen::<f64>()
}

/// Computes the delay before retry `attempt` (1-based) and the value to
/// carry forward as `previous` for the next call.
#[must_use]
pub fn backoff_delay(
    strategy: BackoffStrategy,
    base: Duration,
    cap: Duration,
    attempt: u32,
    previous: Duration,
) -> (Duration, Duration) {
    let n = attempt.max(1);
    let base_secs = base.as_secs_f64();
    let cap_secs = cap.as_secs_f64();

    let raw = match strategy {
        BackoffStrategy::Exponential => base_secs * 2f64.powi(i32::try_from(n - 1).unwrap_or(i32::MAX)),
        BackoffStrategy::ExponentialJitter => {
            base_secs * 2f64.powi(i32::try_from(n - 1).unwrap_or(i32::MAX)) * unit_jitter()
        }
        BackoffStrategy::Linear => base_secs * f64::from(n),
        BackoffStrategy::LinearJitter => base_secs * f64::from(n) * unit_jitter(),
        BackoffStrategy::DecorrelatedJitter => {
            let upper = (previous.as_secs_f64() * 3.0).max(base_secs);
            if upper <= base_secs {
                base_secs
            } else {
                rand::thread_rng().gen_range(base_secs..=upper)
            }
        }
    };

    let delay = Duration::from_secs_f64(raw.min(cap_secs).max(0.0));
    (delay, delay)
}

/// Per-invocation retry settings, composed with the breaker and timeout.
pub(crate) struct RetryPolicy<E> {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub item_timeout: Option<Duration>,
    pub is_transient: Option<TransientPredicate<E>>,
}

/// Why a retried execution stopped.
pub(crate) enum RetryError<E> {
    /// Retries exhausted or the error was permanent.
    Item(ItemError<E>),
    /// Cancellation fired during a backoff wait.
    Cancelled(CancelledError),
}

impl<E> RetryPolicy<E> {
    fn classify(&self, error: &ItemError<E>) -> bool {
        match error {
            ItemError::Operation(e) => self.is_transient.as_ref().map_or(true, |p| p(e)),
            // Timed-out attempts are retry-eligible; a rejected (open-circuit)
            // attempt is routed straight to the error mode.
            ItemError::Timeout(_) => true,
            ItemError::CircuitOpen => false,
        }
    }

    async fn attempt_once<R, F, Fut>(&self, op: &F) -> Result<R, ItemError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        match self.item_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(ItemError::Operation(e)),
                Err(_) => Err(ItemError::Timeout(limit)),
            },
            None => op().await.map_err(ItemError::Operation),
        }
    }

    async fn attempt<R, F, Fut>(
        &self,
        breaker: Option<&CircuitBreaker>,
        op: &F,
    ) -> Result<R, ItemError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        match breaker {
            Some(b) => match b.execute(|| self.attempt_once(op)).await {
                Ok(value) => Ok(value),
                Err(BreakerError::Open) => Err(ItemError::CircuitOpen),
                Err(BreakerError::Operation(e)) => Err(e),
            },
            None => self.attempt_once(op).await,
        }
    }

    /// Executes `op`, retrying transient failures with backoff until either
    /// success, exhaustion, a permanent failure, or cancellation.
    pub(crate) async fn run<R, F, Fut>(
        &self,
        breaker: Option<&CircuitBreaker>,
        cancel: &CancelToken,
        mut on_retry: impl FnMut(u32, &ItemError<E>),
        op: F,
    ) -> Result<R, RetryError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: std::fmt::Display,
    {
        let mut retries = 0u32;
        let mut previous = Duration::ZERO;

        loop {
            let error = match self.attempt(breaker, &op).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled(cancel.as_error()));
            }
            if retries >= self.max_retries || !self.classify(&error) {
                return Err(RetryError::Item(error));
            }

            retries += 1;
            on_retry(retries, &error);

            let (delay, next_previous) = backoff_delay(
                self.strategy,
                self.base_delay,
                self.max_delay,
                retries,
                previous,
            );
            previous = next_previous;

            tracing::debug!(
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after error"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(RetryError::Cancelled(cancel.as_error())),
            }
        }
    }
}
