//! The caller-supplied options record and lifecycle callbacks.
//!
//! All knobs are optional and default to the values documented on
//! [`ParallelOptions::new`]. Validation happens synchronously when an
//! operator is called, before any work starts.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::adaptive::{AdaptiveConfig, ConcurrencyChangeCallback};
use crate::breaker::{CircuitBreakerConfig, StateChangeCallback};
use crate::cancellation::CancelToken;
use crate::errors::{ItemError, ParallelError};
use crate::limiter::RateLimitConfig;
use crate::progress::ProgressConfig;
use crate::retry::{BackoffStrategy, TransientPredicate};

/// How unrecoverable item failures propagate to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ErrorMode {
    /// First unrecoverable failure cancels all in-flight work and propagates.
    #[default]
    FailFast,
    /// Failures are accumulated; one aggregate error is raised at the end.
    CollectAndContinue,
    /// Failures are recorded but never raised; failing indices are absent
    /// from the result set.
    BestEffort,
}

/// Called when an item starts executing, with its index.
pub type OnStart = Arc<dyn Fn(usize) + Send + Sync>;
/// Called when an item completes successfully, with its index.
pub type OnComplete = Arc<dyn Fn(usize) + Send + Sync>;
/// Called when an item fails unrecoverably. Returning `false` requests
/// cancellation of all remaining work, in every error mode.
pub type OnError<E> = Arc<dyn Fn(usize, &ItemError<E>) -> bool + Send + Sync>;
/// Called before each retry with `(index, attempt, error)`; attempts are 1-based.
pub type OnRetry<E> = Arc<dyn Fn(usize, u32, &ItemError<E>) + Send + Sync>;
/// Called when the producer observes the bounded queue full, with the
/// running count of throttle events.
pub type OnThrottle = Arc<dyn Fn(u64) + Send + Sync>;

/// Observability hooks invoked around each item.
///
/// Every callback is invoked on a best-effort basis: panics are caught and
/// discarded so a broken callback cannot corrupt the pipeline. This is an
/// explicit contract, not an accident.
pub struct LifecycleCallbacks<E> {
    /// Item started.
    pub on_start: Option<OnStart>,
    /// Item completed successfully.
    pub on_complete: Option<OnComplete>,
    /// Item failed unrecoverably.
    pub on_error: Option<OnError<E>>,
    /// Item is about to be retried.
    pub on_retry: Option<OnRetry<E>>,
    /// Producer observed the queue full.
    pub on_throttle: Option<OnThrottle>,
    /// Circuit breaker changed state.
    pub on_breaker_state_change: Option<StateChangeCallback>,
    /// Adaptive controller adjusted concurrency.
    pub on_concurrency_change: Option<ConcurrencyChangeCallback>,
}

impl<E> Default for LifecycleCallbacks<E> {
    fn default() -> Self {
        Self {
            on_start: None,
            on_complete: None,
            on_error: None,
            on_retry: None,
            on_throttle: None,
            on_breaker_state_change: None,
            on_concurrency_change: None,
        }
    }
}

impl<E> Clone for LifecycleCallbacks<E> {
    fn clone(&self) -> Self {
        Self {
            on_start: self.on_start.clone(),
            on_complete: self.on_complete.clone(),
            on_error: self.on_error.clone(),
            on_retry: self.on_retry.clone(),
            on_throttle: self.on_throttle.clone(),
            on_breaker_state_change: self.on_breaker_state_change.clone(),
            on_concurrency_change: self.on_concurrency_change.clone(),
        }
    }
}

impl<E> std::fmt::Debug for LifecycleCallbacks<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCallbacks")
            .field("on_start", &self.on_start.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("on_throttle", &self.on_throttle.is_some())
            .finish()
    }
}

/// Invokes a callback, discarding any panic.
pub(crate) fn guarded<F: FnOnce()>(f: F) {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).ok();
}

/// Invokes a bool-returning callback; `None` if it panicked.
pub(crate) fn guarded_bool<F: FnOnce() -> bool>(f: F) -> Option<bool> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).ok()
}

/// Immutable options for one parallel operator call.
pub struct ParallelOptions<E> {
    /// Concurrency ceiling; must be at least 1.
    pub max_concurrency: usize,
    /// Error propagation policy.
    pub error_mode: ErrorMode,
    /// Retries per item; 0 disables retrying.
    pub max_retries: u32,
    /// Backoff strategy for retry delays.
    pub backoff: BackoffStrategy,
    /// Base retry delay.
    pub base_delay: Duration,
    /// Cap on any single retry delay.
    pub max_delay: Duration,
    /// Per-attempt timeout; `None` disables it.
    pub item_timeout: Option<Duration>,
    /// Bounded work/output queue capacity.
    pub queue_capacity: usize,
    /// Emit results in input index order.
    pub ordered: bool,
    /// Token-bucket rate limiting; `None` disables it.
    pub rate_limit: Option<RateLimitConfig>,
    /// Circuit breaking; `None` disables it.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Adaptive concurrency control; `None` means the static ceiling applies.
    pub adaptive: Option<AdaptiveConfig>,
    /// Classifies operation errors as transient; `None` treats all as transient.
    pub is_transient: Option<TransientPredicate<E>>,
    /// Observability hooks.
    pub callbacks: LifecycleCallbacks<E>,
    /// Periodic progress reporting; `None` disables it.
    pub progress: Option<ProgressConfig>,
    /// Caller cancellation token; the invocation links a child to it.
    pub cancel_token: Option<CancelToken>,
}

impl<E> Default for ParallelOptions<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for ParallelOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_concurrency: self.max_concurrency,
            error_mode: self.error_mode,
            max_retries: self.max_retries,
            backoff: self.backoff,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            item_timeout: self.item_timeout,
            queue_capacity: self.queue_capacity,
            ordered: self.ordered,
            rate_limit: self.rate_limit.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            adaptive: self.adaptive.clone(),
            is_transient: self.is_transient.clone(),
            callbacks: self.callbacks.clone(),
            progress: self.progress.clone(),
            cancel_token: self.cancel_token.clone(),
        }
    }
}

impl<E> ParallelOptions<E> {
    /// Creates options with the documented defaults: concurrency = CPU
    /// count, `FailFast`, no retries, exponential backoff from 100 ms,
    /// no timeout, queue capacity 1024, unordered output, and no rate
    /// limiting / circuit breaking / adaptive concurrency.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_concurrency: num_cpus::get().max(1),
            error_mode: ErrorMode::default(),
            max_retries: 0,
            backoff: BackoffStrategy::default(),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            item_timeout: None,
            queue_capacity: 1024,
            ordered: false,
            rate_limit: None,
            circuit_breaker: None,
            adaptive: None,
            is_transient: None,
            callbacks: LifecycleCallbacks::default(),
            progress: None,
            cancel_token: None,
        }
    }

    /// Sets the concurrency ceiling.
    #[must_use]
    pub fn with_max_concurrency(mut self, ceiling: usize) -> Self {
        self.max_concurrency = ceiling;
        self
    }

    /// Sets the error mode.
    #[must_use]
    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the base retry delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the retry delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    /// Sets the bounded queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Requests ordered output.
    #[must_use]
    pub fn with_ordered_output(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Enables token-bucket rate limiting.
    #[must_use]
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Enables circuit breaking.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Enables adaptive concurrency control.
    #[must_use]
    pub fn with_adaptive_concurrency(mut self, config: AdaptiveConfig) -> Self {
        self.adaptive = Some(config);
        self
    }

    /// Sets the transient-error predicate.
    #[must_use]
    pub fn with_transient_predicate(
        mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_transient = Some(Arc::new(predicate));
        self
    }

    /// Sets the lifecycle callbacks.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: LifecycleCallbacks<E>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Sets the on-start callback.
    #[must_use]
    pub fn on_start(mut self, callback: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.callbacks.on_start = Some(Arc::new(callback));
        self
    }

    /// Sets the on-complete callback.
    #[must_use]
    pub fn on_complete(mut self, callback: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.callbacks.on_complete = Some(Arc::new(callback));
        self
    }

    /// Sets the on-error callback. Returning `false` cancels remaining work.
    #[must_use]
    pub fn on_error(
        mut self,
        callback: impl Fn(usize, &ItemError<E>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_error = Some(Arc::new(callback));
        self
    }

    /// Sets the on-retry callback.
    #[must_use]
    pub fn on_retry(
        mut self,
        callback: impl Fn(usize, u32, &ItemError<E>) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_retry = Some(Arc::new(callback));
        self
    }

    /// Sets the on-throttle callback.
    #[must_use]
    pub fn on_throttle(mut self, callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.callbacks.on_throttle = Some(Arc::new(callback));
        self
    }

    /// Enables periodic progress reporting.
    #[must_use]
    pub fn with_progress(mut self, config: ProgressConfig) -> Self {
        self.progress = Some(config);
        self
    }

    /// Links the invocation to a caller cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Validates the record; called by every operator before work starts.
    pub fn validate(&self) -> Result<(), ParallelError<E>> {
        if self.max_concurrency == 0 {
            return Err(ParallelError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ParallelError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if let Some(rate) = &self.rate_limit {
            if rate.tokens_per_second <= 0.0 || rate.burst <= 0.0 || rate.tokens_per_operation <= 0.0
            {
                return Err(ParallelError::Config(
                    "rate limit values must be positive".to_string(),
                ));
            }
        }
        if let Some(breaker) = &self.circuit_breaker {
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                return Err(ParallelError::Config(
                    "circuit breaker thresholds must be at least 1".to_string(),
                ));
            }
        }
        if let Some(adaptive) = &self.adaptive {
            if adaptive.min_concurrency == 0 {
                return Err(ParallelError::Config(
                    "adaptive min_concurrency must be at least 1".to_string(),
                ));
            }
            if !(adaptive.min_concurrency <= adaptive.initial_concurrency
                && adaptive.initial_concurrency <= adaptive.max_concurrency)
            {
                return Err(ParallelError::Config(
                    "adaptive concurrency requires min <= initial <= max".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(&adaptive.min_success_rate) {
                return Err(ParallelError::Config(
                    "adaptive min_success_rate must be within [0, 1]".to_string(),
                ));
            }
        }
        Ok(())
    }
}
