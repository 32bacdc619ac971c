//! Progress and metrics reporting.
//!
//! The pipeline keeps atomic counters for items started, completed, and
//! failed, retries, and throttle events. Snapshots are pushed to a
//! caller-supplied [`ProgressSink`] on a fixed interval, plus once at
//! completion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Level};
use uuid::Uuid;

/// Atomic per-invocation counters, shared by every worker.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    throttle_events: AtomicU64,
}

impl ProgressTracker {
    /// Records an item starting execution.
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an item completing successfully.
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an item failing after retries were exhausted.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one retry attempt.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the producer observing a full queue.
    pub fn record_throttle(&self) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of items started.
    #[must_use]
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Returns the number of items completed successfully.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Returns the number of items that failed.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Returns the number of retries performed.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Returns the number of throttle events.
    #[must_use]
    pub fn throttle_events(&self) -> u64 {
        self.throttle_events.load(Ordering::Relaxed)
    }

    /// Takes a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self, run_id: Uuid) -> ProgressSnapshot {
        ProgressSnapshot {
            run_id,
            timestamp: Utc::now(),
            started: self.started(),
            completed: self.completed(),
            failed: self.failed(),
            retries: self.retries(),
            throttle_events: self.throttle_events(),
        }
    }
}

/// A point-in-time view of one invocation's counters.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    /// Identity of the pipeline invocation.
    pub run_id: Uuid,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Items started.
    pub started: u64,
    /// Items completed successfully.
    pub completed: u64,
    /// Items failed.
    pub failed: u64,
    /// Retries performed.
    pub retries: u64,
    /// Throttle (full-queue) events observed by the producer.
    pub throttle_events: u64,
}

impl ProgressSnapshot {
    /// Converts the snapshot to a JSON dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id.to_string(),
            "timestamp": self.timestamp.to_rfc3339(),
            "started": self.started,
            "completed": self.completed,
            "failed": self.failed,
            "retries": self.retries,
            "throttle_events": self.throttle_events,
        })
    }
}

/// Trait for sinks that receive progress snapshots.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Receives one snapshot. Implementations must not panic the pipeline;
    /// the engine calls this on a best-effort basis.
    async fn report(&self, snapshot: ProgressSnapshot);
}

/// A no-op sink that discards all snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressSink;

#[async_trait]
impl ProgressSink for NoOpProgressSink {
    async fn report(&self, _snapshot: ProgressSnapshot) {
        // Intentionally empty - discards all snapshots
    }
}

/// A sink that logs snapshots through the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingProgressSink {
    level: Level,
}

impl Default for LoggingProgressSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingProgressSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

#[async_trait]
impl ProgressSink for LoggingProgressSink {
    async fn report(&self, snapshot: ProgressSnapshot) {
        match self.level {
            Level::DEBUG => debug!(
                run_id = %snapshot.run_id,
                started = snapshot.started,
                completed = snapshot.completed,
                failed = snapshot.failed,
                retries = snapshot.retries,
                throttle_events = snapshot.throttle_events,
                "pipeline progress"
            ),
            _ => info!(
                run_id = %snapshot.run_id,
                started = snapshot.started,
                completed = snapshot.completed,
                failed = snapshot.failed,
                retries = snapshot.retries,
                throttle_events = snapshot.throttle_events,
                "pipeline progress"
            ),
        }
    }
}

/// A collecting sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    snapshots: parking_lot::RwLock<Vec<ProgressSnapshot>>,
}

impl CollectingProgressSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected snapshots.
    #[must_use]
    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.snapshots.read().clone()
    }

    /// Returns the number of collected snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Returns true if no snapshots have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

#[async_trait]
impl ProgressSink for CollectingProgressSink {
    async fn report(&self, snapshot: ProgressSnapshot) {
        self.snapshots.write().push(snapshot);
    }
}

/// Where and how often progress snapshots are reported.
#[derive(Clone)]
pub struct ProgressConfig {
    /// Destination for snapshots.
    pub sink: Arc<dyn ProgressSink>,
    /// Reporting interval.
    pub interval: Duration,
}

impl ProgressConfig {
    /// Creates a config reporting to `sink` every `interval`.
    #[must_use]
    pub fn new(sink: Arc<dyn ProgressSink>, interval: Duration) -> Self {
        Self { sink, interval }
    }
}

impl std::fmt::Debug for ProgressConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressConfig")
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counters() {
        let tracker = ProgressTracker::default();

        tracker.record_started();
        tracker.record_started();
        tracker.record_completed();
        tracker.record_failed();
        tracker.record_retry();
        tracker.record_throttle();

        assert_eq!(tracker.started(), 2);
        assert_eq!(tracker.completed(), 1);
        assert_eq!(tracker.failed(), 1);
        assert_eq!(tracker.retries(), 1);
        assert_eq!(tracker.throttle_events(), 1);
    }

    #[test]
    fn test_snapshot_captures_counters() {
        let tracker = ProgressTracker::default();
        tracker.record_started();
        tracker.record_completed();

        let run_id = Uuid::new_v4();
        let snapshot = tracker.snapshot(run_id);

        assert_eq!(snapshot.run_id, run_id);
        assert_eq!(snapshot.started, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 0);
    }

    #[test]
    fn test_snapshot_to_dict() {
        let tracker = ProgressTracker::default();
        tracker.record_started();

        let dict = tracker.snapshot(Uuid::new_v4()).to_dict();
        assert_eq!(dict["started"], 1);
        assert_eq!(dict["completed"], 0);
        assert!(dict["run_id"].is_string());
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let tracker = ProgressTracker::default();
        let sink = CollectingProgressSink::new();

        assert!(sink.is_empty());
        sink.report(tracker.snapshot(Uuid::new_v4())).await;
        sink.report(tracker.snapshot(Uuid::new_v4())).await;

        assert_eq!(sink.len(), 2);
    }
}
