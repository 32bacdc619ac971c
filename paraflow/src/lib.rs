//! # Paraflow
//!
//! A bounded-concurrency parallel execution engine for async workloads.
//!
//! Paraflow applies a fallible async operation to every item of a source
//! with a hard concurrency ceiling, and layers resilience policies around
//! each item:
//!
//! - **Bounded execution**: a fixed worker pool fed by a bounded queue;
//!   a slow pool backpressures the producer instead of buffering unboundedly
//! - **Ordered or unordered results**: collected vectors or incremental
//!   streams, with input order restored on demand
//! - **Retry with backoff**: five backoff strategies with a pluggable
//!   transient-error predicate
//! - **Circuit breaking**: shared breaker that rejects work while a
//!   downstream dependency is failing
//! - **Rate limiting**: token-bucket admission ahead of each item
//! - **Adaptive concurrency**: AIMD-style adjustment between a floor and
//!   a ceiling based on observed latency and success rate
//! - **Structured cancellation**: linked tokens propagate caller
//!   cancellation into every wait point
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use paraflow::prelude::*;
//!
//! let options = ParallelOptions::new()
//!     .with_max_concurrency(8)
//!     .with_max_retries(3)
//!     .with_ordered_output();
//!
//! let results = map_parallel(1..=5, |x| async move { Ok::<_, MyError>(x * 10) }, options).await?;
//! assert_eq!(results, vec![10, 20, 30, 40, 50]);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod adaptive;
pub mod breaker;
pub mod cancellation;
pub mod errors;
pub mod limiter;
pub mod options;
pub mod pipeline;
pub mod progress;
pub mod retry;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adaptive::{AdaptiveConfig, AdjustmentStrategy};
    pub use crate::breaker::{BreakerState, CircuitBreakerConfig};
    pub use crate::cancellation::CancelToken;
    pub use crate::errors::{CancelledError, ItemError, ItemFailure, ParallelError};
    pub use crate::limiter::RateLimitConfig;
    pub use crate::options::{ErrorMode, LifecycleCallbacks, ParallelOptions};
    pub use crate::pipeline::{
        batch_parallel, batch_parallel_stream, for_each_parallel, for_each_parallel_stream,
        map_parallel, map_parallel_stream, ResultStream,
    };
    pub use crate::progress::{
        CollectingProgressSink, LoggingProgressSink, NoOpProgressSink, ProgressConfig,
        ProgressSink, ProgressSnapshot, ProgressTracker,
    };
    pub use crate::retry::{backoff_delay, BackoffStrategy};
}
