//! Error types for the paraflow execution engine.
//!
//! The taxonomy distinguishes per-item failures (which the active
//! [`ErrorMode`](crate::options::ErrorMode) decides how to surface),
//! cancellation (which always wins), and configuration errors (raised
//! before any work starts).

use std::time::Duration;
use thiserror::Error;

/// A failure of a single item's operation, after retries are exhausted.
#[derive(Debug, Error)]
pub enum ItemError<E> {
    /// The caller-supplied operation returned an error.
    #[error("operation failed: {0}")]
    Operation(E),

    /// A single attempt exceeded the configured per-item timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit breaker was open, so the operation was never invoked.
    #[error("circuit breaker is open")]
    CircuitOpen,
}

impl<E> ItemError<E> {
    /// Returns the inner operation error, if this is an operation failure.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true if this failure was produced by the circuit breaker.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }
}

/// A per-item failure paired with the item's sequence index.
#[derive(Debug, Error)]
#[error("item {index}: {error}")]
pub struct ItemFailure<E> {
    /// Zero-based index assigned by the producer.
    pub index: usize,
    /// What went wrong.
    pub error: ItemError<E>,
}

/// Cancellation observed at a suspension point.
#[derive(Debug, Clone, Error)]
#[error("operation cancelled: {reason}")]
pub struct CancelledError {
    /// Why the linked cancellation signal fired.
    pub reason: String,
}

impl CancelledError {
    /// Creates a cancellation error with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The main error type returned by the parallel operators.
#[derive(Debug, Error)]
pub enum ParallelError<E> {
    /// The options record was invalid; raised before any work started.
    #[error("invalid options: {0}")]
    Config(String),

    /// The first unrecoverable failure under `FailFast`.
    #[error("item {index} failed: {error}")]
    Item {
        /// Index of the failing item.
        index: usize,
        /// The failure itself.
        error: ItemError<E>,
    },

    /// All unrecoverable failures under `CollectAndContinue`.
    #[error("{} item(s) failed", .failures.len())]
    Aggregate {
        /// Every failure, in completion order.
        failures: Vec<ItemFailure<E>>,
    },

    /// The linked cancellation signal fired before normal completion.
    #[error("operation cancelled: {reason}")]
    Cancelled {
        /// Why cancellation was requested.
        reason: String,
    },

    /// A pipeline task failed in a way that is not an item error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl<E> ParallelError<E> {
    /// Returns true if this is a cancellation outcome.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns the collected failures, if this is an aggregate error.
    pub fn failures(&self) -> Option<&[ItemFailure<E>]> {
        match self {
            Self::Aggregate { failures } => Some(failures),
            _ => None,
        }
    }
}

impl<E> From<CancelledError> for ParallelError<E> {
    fn from(err: CancelledError) -> Self {
        Self::Cancelled { reason: err.reason }
    }
}
