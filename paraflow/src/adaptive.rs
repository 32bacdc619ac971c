//! Self-tuning admission gate for adaptive concurrency control.
//!
//! Workers acquire an admission slot before running an operation and
//! release it with the observed latency and success flag. Once per sample
//! interval the controller evaluates the window and adjusts the admitted
//! concurrency between the configured bounds: multiplicative decrease on
//! low success rate or high latency, additive (or percentage) increase
//! otherwise.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::cancellation::CancelToken;
use crate::errors::CancelledError;

/// Callback invoked with `(old, new)` on every concurrency adjustment.
pub type ConcurrencyChangeCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Adjustment law applied when the sampling window is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdjustmentStrategy {
    /// Additive increase (+1), multiplicative decrease (×0.5).
    #[default]
    Aimd,
    /// Additive increase (+1), gentler decrease (×0.75).
    Gradual,
    /// Percentage increase (+10 %, rounded, never less than +1 so small
    /// limits still grow), decrease ×0.5.
    Aggressive,
}

/// Configuration for the adaptive concurrency controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Lower bound on admitted concurrency.
    pub min_concurrency: usize,
    /// Upper bound on admitted concurrency.
    pub max_concurrency: usize,
    /// Concurrency level the controller starts at.
    pub initial_concurrency: usize,
    /// How often the sampling window is evaluated.
    pub sample_interval: Duration,
    /// Average latency above which concurrency is decreased.
    pub target_latency: Duration,
    /// Success rate below which concurrency is decreased.
    pub min_success_rate: f64,
    /// Adjustment law.
    pub strategy: AdjustmentStrategy,
}

impl AdaptiveConfig {
    /// Creates a config starting at `min` concurrency.
    #[must_use]
    pub fn new(min_concurrency: usize, max_concurrency: usize) -> Self {
        Self {
            min_concurrency,
            max_concurrency,
            initial_concurrency: min_concurrency,
            sample_interval: Duration::from_secs(1),
            target_latency: Duration::from_secs(1),
            min_success_rate: 0.9,
            strategy: AdjustmentStrategy::default(),
        }
    }

    /// Sets the initial concurrency level.
    #[must_use]
    pub fn with_initial(mut self, initial: usize) -> Self {
        self.initial_concurrency = initial;
        self
    }

    /// Sets the sampling interval.
    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Sets the target latency.
    #[must_use]
    pub fn with_target_latency(mut self, latency: Duration) -> Self {
        self.target_latency = latency;
        self
    }

    /// Sets the minimum success rate.
    #[must_use]
    pub fn with_min_success_rate(mut self, rate: f64) -> Self {
        self.min_success_rate = rate;
        self
    }

    /// Sets the adjustment strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: AdjustmentStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[derive(Debug)]
struct ControllerInner {
    limit: usize,
    in_flight: usize,
    samples: Vec<(Duration, bool)>,
    window_started: Instant,
}

/// Admission gate created once per pipeline invocation.
pub struct AdaptiveController {
    config: AdaptiveConfig,
    inner: Mutex<ControllerInner>,
    notify: Notify,
    on_change: Option<ConcurrencyChangeCallback>,
}

impl std::fmt::Debug for AdaptiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveController")
            .field("config", &self.config)
            .field("limit", &self.current_limit())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl AdaptiveController {
    /// Creates a controller at the configured initial concurrency.
    #[must_use]
    pub fn new(config: AdaptiveConfig, on_change: Option<ConcurrencyChangeCallback>) -> Self {
        let initial = config
            .initial_concurrency
            .clamp(config.min_concurrency, config.max_concurrency);
        Self {
            inner: Mutex::new(ControllerInner {
                limit: initial,
                in_flight: 0,
                samples: Vec::new(),
                window_started: Instant::now(),
            }),
            notify: Notify::new(),
            on_change,
            config,
        }
    }

    /// Returns the configured upper bound.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    /// Returns the currently admitted concurrency level.
    pub fn current_limit(&self) -> usize {
        self.inner.lock().limit
    }

    /// Returns the number of outstanding admission slots.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Waits until an admission slot is free, then takes it.
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<(), CancelledError> {
        loop {
            // Create the waiter before checking the limit so a permit
            // handed out between the check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if inner.in_flight < inner.limit {
                    inner.in_flight += 1;
                    return Ok(());
                }
            }

            tokio::select! {
                () = notified => {}
                () = cancel.cancelled() => return Err(cancel.as_error()),
            }
        }
    }

    /// Returns a slot and records the item's outcome into the current window.
    pub fn release(&self, elapsed: Duration, success: bool) {
        let change = {
            let mut inner = self.inner.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            inner.samples.push((elapsed, success));

            if inner.window_started.elapsed() >= self.config.sample_interval {
                let change = self.evaluate(&mut inner);
                inner.samples.clear();
                inner.window_started = Instant::now();
                change
            } else {
                None
            }
        };

        // One permit for the freed slot, plus one per newly admitted slot.
        self.notify.notify_one();
        if let Some((old, new)) = change {
            for _ in old..new {
                self.notify.notify_one();
            }
            tracing::debug!(old, new, "adaptive concurrency adjusted");
            if let Some(callback) = &self.on_change {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(old, new))).ok();
            }
        }
    }

    fn evaluate(&self, inner: &mut ControllerInner) -> Option<(usize, usize)> {
        if inner.samples.is_empty() {
            return None;
        }

        let total = inner.samples.len();
        let successes = inner.samples.iter().filter(|(_, ok)| *ok).count();
        #[allow(clippy::cast_precision_loss)]
        let success_rate = successes as f64 / total as f64;
        let avg_latency: Duration =
            inner.samples.iter().map(|(d, _)| *d).sum::<Duration>() / u32::try_from(total).unwrap_or(u32::MAX);

        let old = inner.limit;
        let unhealthy = success_rate < self.config.min_success_rate
            || avg_latency > self.config.target_latency;

        let new = if unhealthy {
            let factor = match self.config.strategy {
                AdjustmentStrategy::Aimd | AdjustmentStrategy::Aggressive => 0.5,
                AdjustmentStrategy::Gradual => 0.75,
            };
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let scaled = (old as f64 * factor).floor() as usize;
            scaled.max(self.config.min_concurrency)
        } else {
            let grown = match self.config.strategy {
                AdjustmentStrategy::Aimd | AdjustmentStrategy::Gradual => old + 1,
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                AdjustmentStrategy::Aggressive => ((old as f64 * 1.1).round() as usize).max(old + 1),
            };
            grown.min(self.config.max_concurrency)
        };

        if new == old {
            None
        } else {
            inner.limit = new;
            Some((old, new))
        }
    }
}
