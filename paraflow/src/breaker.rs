//! Circuit breaker for shedding load off a failing downstream.
//!
//! State machine: `Closed → Open` once the failure threshold is reached,
//! `Open → HalfOpen` after the open duration elapses, `HalfOpen → Closed`
//! after enough consecutive successes, `HalfOpen → Open` on any failure.
//! All mutation is serialized by a single internal lock; the state-change
//! callback runs outside the lock with panics suppressed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Callback invoked with `(old, new)` on every breaker state change.
pub type StateChangeCallback = Arc<dyn Fn(BreakerState, BreakerState) + Send + Sync>;

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures needed to trip the breaker open.
    pub failure_threshold: usize,
    /// Consecutive successes needed to close a half-open breaker.
    pub success_threshold: usize,
    /// How long the breaker stays open before allowing a probe.
    pub open_duration: Duration,
    /// When set, failures are counted inside this sliding window rather
    /// than as a consecutive run.
    pub sampling_window: Option<Duration>,
}

impl CircuitBreakerConfig {
    /// Creates a config with the given thresholds and open duration.
    #[must_use]
    pub fn new(failure_threshold: usize, success_threshold: usize, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            open_duration,
            sampling_window: None,
        }
    }

    /// Counts failures within a sliding window instead of consecutively.
    #[must_use]
    pub fn with_sampling_window(mut self, window: Duration) -> Self {
        self.sampling_window = Some(window);
        self
    }
}

/// The breaker's current position in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Operations flow through normally.
    Closed,
    /// Operations fail immediately without being invoked.
    Open,
    /// Probe operations are allowed through to test recovery.
    HalfOpen,
}

/// Result of asking the breaker to run an operation.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker was open; the operation was not invoked.
    Open,
    /// The operation ran and failed.
    Operation(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    failure_window: VecDeque<Instant>,
    opened_at: Option<Instant>,
}

/// A failure-trip state machine shared by all workers of one invocation.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    on_state_change: Option<StateChangeCallback>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a breaker in the `Closed` state.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                failure_window: VecDeque::new(),
                opened_at: None,
            }),
            on_state_change: None,
        }
    }

    /// Registers a callback invoked on every state change.
    #[must_use]
    pub fn with_state_change(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    /// Returns the current state, transitioning `Open → HalfOpen` if the
    /// open duration has elapsed.
    pub fn state(&self) -> BreakerState {
        let transition = {
            let mut inner = self.inner.lock();
            self.maybe_half_open(&mut inner)
        };
        self.notify(transition);
        self.inner.lock().state
    }

    /// Runs `op` through the breaker.
    ///
    /// While open (and not yet due for a probe) this fails with
    /// [`BreakerError::Open`] without invoking the operation.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admit_transition = {
            let mut inner = self.inner.lock();
            let transition = self.maybe_half_open(&mut inner);
            if inner.state == BreakerState::Open {
                drop(inner);
                self.notify(transition);
                return Err(BreakerError::Open);
            }
            transition
        };
        self.notify(admit_transition);

        match op().await {
            Ok(value) => {
                let transition = {
                    let mut inner = self.inner.lock();
                    self.record_success(&mut inner)
                };
                self.notify(transition);
                Ok(value)
            }
            Err(err) => {
                let transition = {
                    let mut inner = self.inner.lock();
                    self.record_failure(&mut inner)
                };
                if let Some((_, BreakerState::Open)) = transition {
                    warn!(
                        failure_threshold = self.config.failure_threshold,
                        "circuit breaker opened"
                    );
                }
                self.notify(transition);
                Err(BreakerError::Operation(err))
            }
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) -> Option<(BreakerState, BreakerState)> {
        if inner.state == BreakerState::Open {
            let due = inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.open_duration);
            if due {
                inner.state = BreakerState::HalfOpen;
                inner.consecutive_successes = 0;
                return Some((BreakerState::Open, BreakerState::HalfOpen));
            }
        }
        None
    }

    fn record_success(&self, inner: &mut BreakerInner) -> Option<(BreakerState, BreakerState)> {
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_successes = 0;
                    inner.failure_window.clear();
                    inner.opened_at = None;
                    return Some((BreakerState::HalfOpen, BreakerState::Closed));
                }
                None
            }
            BreakerState::Closed | BreakerState::Open => None,
        }
    }

    fn record_failure(&self, inner: &mut BreakerInner) -> Option<(BreakerState, BreakerState)> {
        inner.consecutive_successes = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                Some((BreakerState::HalfOpen, BreakerState::Open))
            }
            BreakerState::Closed => {
                let tripped = if let Some(window) = self.config.sampling_window {
                    let now = Instant::now();
                    inner.failure_window.push_back(now);
                    while inner
                        .failure_window
                        .front()
                        .is_some_and(|t| now.duration_since(*t) > window)
                    {
                        inner.failure_window.pop_front();
                    }
                    inner.failure_window.len() >= self.config.failure_threshold
                } else {
                    inner.consecutive_failures += 1;
                    inner.consecutive_failures >= self.config.failure_threshold
                };

                if tripped {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.consecutive_failures = 0;
                    inner.failure_window.clear();
                    Some((BreakerState::Closed, BreakerState::Open))
                } else {
                    None
                }
            }
            BreakerState::Open => None,
        }
    }

    fn notify(&self, transition: Option<(BreakerState, BreakerState)>) {
        if let (Some((old, new)), Some(callback)) = (transition, self.on_state_change.as_ref()) {
            // Callback runs outside the lock; panics never affect breaker state.
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(old, new))).ok();
        }
    }
}
