//! Per-invocation execution engine.
//!
//! One producer enumerates the source, assigning dense zero-based indices,
//! and feeds a bounded queue; a pool of workers drains it. Each worker
//! iteration threads through rate limiter → adaptive admission → retry /
//! circuit-breaker composition, then stores the result. All per-invocation
//! state is created here and discarded when the run completes.

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adaptive::AdaptiveController;
use crate::breaker::CircuitBreaker;
use crate::cancellation::CancelToken;
use crate::errors::{ItemError, ItemFailure, ParallelError};
use crate::limiter::TokenBucket;
use crate::options::{guarded, guarded_bool, ErrorMode, LifecycleCallbacks, ParallelOptions};
use crate::progress::ProgressTracker;
use crate::retry::{RetryError, RetryPolicy};

pub(crate) const FAIL_FAST_REASON: &str = "fail-fast: item failed";
pub(crate) const CALLBACK_CANCEL_REASON: &str = "cancelled by on_error callback";
pub(crate) const STREAM_DROP_REASON: &str = "result stream dropped";

/// One unit of work: the producer-assigned index and the source element.
struct WorkItem<I> {
    index: usize,
    item: I,
}

/// Where workers put finished results.
pub(crate) enum ResultSink<R> {
    /// Index-keyed slot map; assembled in index order at completion.
    Ordered(Arc<DashMap<usize, R>>),
    /// Shared unordered bag; lowest latency, no ordering guarantee.
    Unordered(Arc<Mutex<Vec<R>>>),
    /// Output queue consumed by the streaming reconciler.
    Stream(mpsc::Sender<(usize, R)>),
    /// For-each: results are discarded.
    Discard,
}

impl<R> Clone for ResultSink<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Ordered(map) => Self::Ordered(map.clone()),
            Self::Unordered(bag) => Self::Unordered(bag.clone()),
            Self::Stream(tx) => Self::Stream(tx.clone()),
            Self::Discard => Self::Discard,
        }
    }
}

impl<R> ResultSink<R> {
    async fn store(&self, index: usize, value: R) {
        match self {
            Self::Ordered(map) => {
                map.insert(index, value);
            }
            Self::Unordered(bag) => bag.lock().push(value),
            Self::Stream(tx) => {
                // A closed channel means the consumer went away; the
                // cancellation token is already tripping in that case.
                let _ = tx.send((index, value)).await;
            }
            Self::Discard => {}
        }
    }
}

/// Per-invocation state shared by the producer and every worker.
pub(crate) struct Shared<E> {
    pub run_id: Uuid,
    pub cancel: CancelToken,
    pub tracker: Arc<ProgressTracker>,
    pub bucket: Option<TokenBucket>,
    pub breaker: Option<CircuitBreaker>,
    pub adaptive: Option<AdaptiveController>,
    pub callbacks: LifecycleCallbacks<E>,
    pub retry: RetryPolicy<E>,
    pub error_mode: ErrorMode,
    pub failures: Mutex<Vec<ItemFailure<E>>>,
    pub first_error: Mutex<Option<ItemFailure<E>>>,
}

/// What a finished run hands back for outcome resolution.
pub(crate) struct RunReport<E> {
    pub produced: usize,
    pub shared: Arc<Shared<E>>,
    pub caller_token: Option<CancelToken>,
}

impl<E> RunReport<E> {
    /// Maps the run's bookkeeping to the final caller-visible outcome.
    ///
    /// Caller cancellation wins over everything; a fail-fast trip surfaces
    /// the first failure; other cancellations (callback request, dropped
    /// stream) surface as cancellation; collected failures aggregate.
    pub(crate) fn resolve(&self) -> Result<(), ParallelError<E>> {
        if let Some(token) = &self.caller_token {
            if token.is_cancelled() {
                return Err(ParallelError::Cancelled {
                    reason: token
                        .reason()
                        .unwrap_or_else(|| "cancelled by caller".to_string()),
                });
            }
        }
        if let Some(failure) = self.shared.first_error.lock().take() {
            return Err(ParallelError::Item {
                index: failure.index,
                error: failure.error,
            });
        }
        if self.shared.cancel.is_cancelled() {
            let reason = self.shared.cancel.reason().unwrap_or_default();
            if reason != FAIL_FAST_REASON {
                return Err(ParallelError::Cancelled { reason });
            }
        }
        let failures = std::mem::take(&mut *self.shared.failures.lock());
        if !failures.is_empty() {
            return Err(ParallelError::Aggregate { failures });
        }
        Ok(())
    }
}

enum ItemOutcome<R, E> {
    Done(R),
    Failed(ItemError<E>),
    Cancelled,
}

/// Runs one pipeline invocation to completion.
pub(crate) async fn run_core<S, I, R, E, F, Fut>(
    source: S,
    op: Arc<F>,
    options: ParallelOptions<E>,
    sink: ResultSink<R>,
) -> Result<RunReport<E>, ParallelError<E>>
where
    S: Stream<Item = I> + Send + 'static,
    I: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    options.validate()?;

    let run_id = Uuid::new_v4();
    let caller_token = options.cancel_token.clone();
    let cancel = caller_token
        .as_ref()
        .map_or_else(CancelToken::new, CancelToken::child);

    let breaker = options.circuit_breaker.clone().map(|config| {
        let breaker = CircuitBreaker::new(config);
        match options.callbacks.on_breaker_state_change.clone() {
            Some(callback) => breaker.with_state_change(callback),
            None => breaker,
        }
    });
    let adaptive = options.adaptive.clone().map(|config| {
        AdaptiveController::new(config, options.callbacks.on_concurrency_change.clone())
    });

    let shared = Arc::new(Shared {
        run_id,
        cancel,
        tracker: Arc::new(ProgressTracker::default()),
        bucket: options.rate_limit.as_ref().map(TokenBucket::new),
        breaker,
        adaptive,
        callbacks: options.callbacks.clone(),
        retry: RetryPolicy {
            max_retries: options.max_retries,
            strategy: options.backoff,
            base_delay: options.base_delay,
            max_delay: options.max_delay,
            item_timeout: options.item_timeout,
            is_transient: options.is_transient.clone(),
        },
        error_mode: options.error_mode,
        failures: Mutex::new(Vec::new()),
        first_error: Mutex::new(None),
    });

    // With adaptive concurrency the pool is sized at the upper bound and
    // the admission gate enforces the current level; otherwise the pool
    // size is itself the ceiling.
    let worker_count = shared
        .adaptive
        .as_ref()
        .map_or(options.max_concurrency, AdaptiveController::max_concurrency);

    debug!(run_id = %run_id, workers = worker_count, "pipeline started");

    let reporter = options.progress.clone().map(|config| {
        let tracker = shared.tracker.clone();
        let report_sink = config.sink.clone();
        let cancel = shared.cancel.clone();
        let interval = config.interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        report_sink.report(tracker.snapshot(run_id)).await;
                    }
                    () = cancel.cancelled() => break,
                }
            }
        });
        (handle, config.sink)
    });

    let (work_tx, work_rx) = mpsc::channel::<WorkItem<I>>(options.queue_capacity);
    let producer = tokio::spawn(produce(source, work_tx, shared.clone()));

    let work_rx = Arc::new(AsyncMutex::new(work_rx));
    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        workers.push(tokio::spawn(worker_loop(
            shared.clone(),
            work_rx.clone(),
            op.clone(),
            sink.clone(),
        )));
    }
    drop(sink);

    let produced = producer
        .await
        .map_err(|err| ParallelError::Internal(format!("producer task failed: {err}")))?;
    for worker in workers {
        worker
            .await
            .map_err(|err| ParallelError::Internal(format!("worker task failed: {err}")))?;
    }

    if let Some((handle, report_sink)) = reporter {
        handle.abort();
        report_sink.report(shared.tracker.snapshot(run_id)).await;
    }

    debug!(
        run_id = %run_id,
        produced,
        completed = shared.tracker.completed(),
        failed = shared.tracker.failed(),
        "pipeline finished"
    );

    Ok(RunReport {
        produced,
        shared,
        caller_token,
    })
}

/// Enumerates the source into the bounded queue, assigning dense indices.
///
/// A full queue blocks the producer; that block is the backpressure
/// mechanism, and observing it fires the throttle callback.
async fn produce<S, I, E>(source: S, tx: mpsc::Sender<WorkItem<I>>, shared: Arc<Shared<E>>) -> usize
where
    S: Stream<Item = I> + Send,
    I: Send,
{
    let mut source = Box::pin(source);
    let mut index = 0usize;

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let item = tokio::select! {
            item = source.next() => item,
            () = shared.cancel.cancelled() => None,
        };
        let Some(item) = item else { break };

        match tx.try_send(WorkItem { index, item }) {
            Ok(()) => {}
            Err(TrySendError::Full(work)) => {
                shared.tracker.record_throttle();
                let count = shared.tracker.throttle_events();
                if let Some(callback) = &shared.callbacks.on_throttle {
                    guarded(|| callback(count));
                }
                debug!(
                    run_id = %shared.run_id,
                    throttle_events = count,
                    "work queue full; producer blocked"
                );
                tokio::select! {
                    sent = tx.send(work) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    () = shared.cancel.cancelled() => break,
                }
            }
            Err(TrySendError::Closed(_)) => break,
        }
        index += 1;
    }

    index
}

async fn worker_loop<I, R, E, F, Fut>(
    shared: Arc<Shared<E>>,
    work_rx: Arc<AsyncMutex<mpsc::Receiver<WorkItem<I>>>>,
    op: Arc<F>,
    sink: ResultSink<R>,
) where
    I: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send,
{
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let next = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                item = rx.recv() => item,
                () = shared.cancel.cancelled() => None,
            }
        };
        let Some(WorkItem { index, item }) = next else {
            break;
        };

        match process_item(&shared, op.as_ref(), index, item).await {
            ItemOutcome::Done(value) => sink.store(index, value).await,
            ItemOutcome::Failed(error) => handle_failure(&shared, index, error),
            ItemOutcome::Cancelled => break,
        }
    }
}

/// One item, end to end: rate limit → on-start → admission slot → retried
/// execution → slot release with (elapsed, success) → bookkeeping.
async fn process_item<I, R, E, F, Fut>(
    shared: &Shared<E>,
    op: &F,
    index: usize,
    item: I,
) -> ItemOutcome<R, E>
where
    I: Clone,
    E: Display + Send + Sync + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    if let Some(bucket) = &shared.bucket {
        if bucket.acquire(&shared.cancel).await.is_err() {
            return ItemOutcome::Cancelled;
        }
    }

    let started = Instant::now();
    shared.tracker.record_started();
    if let Some(callback) = &shared.callbacks.on_start {
        guarded(|| callback(index));
    }

    if let Some(gate) = &shared.adaptive {
        if gate.acquire(&shared.cancel).await.is_err() {
            return ItemOutcome::Cancelled;
        }
    }

    let result = shared
        .retry
        .run(
            shared.breaker.as_ref(),
            &shared.cancel,
            |attempt, error| {
                shared.tracker.record_retry();
                if let Some(callback) = &shared.callbacks.on_retry {
                    guarded(|| callback(index, attempt, error));
                }
            },
            || op(item.clone()),
        )
        .await;

    let elapsed = started.elapsed();
    if let Some(gate) = &shared.adaptive {
        gate.release(elapsed, result.is_ok());
    }

    match result {
        Ok(value) => {
            shared.tracker.record_completed();
            if let Some(callback) = &shared.callbacks.on_complete {
                guarded(|| callback(index));
            }
            ItemOutcome::Done(value)
        }
        Err(RetryError::Cancelled(_)) => ItemOutcome::Cancelled,
        Err(RetryError::Item(error)) => ItemOutcome::Failed(error),
    }
}

/// Routes an unrecoverable item failure through the active error mode.
fn handle_failure<E>(shared: &Shared<E>, index: usize, error: ItemError<E>)
where
    E: Display,
{
    shared.tracker.record_failed();
    warn!(run_id = %shared.run_id, index, error = %error, "item failed");

    let keep_going = match &shared.callbacks.on_error {
        Some(callback) => guarded_bool(|| callback(index, &error)).unwrap_or(true),
        None => true,
    };

    match shared.error_mode {
        ErrorMode::FailFast => {
            {
                let mut slot = shared.first_error.lock();
                if slot.is_none() {
                    *slot = Some(ItemFailure { index, error });
                }
            }
            shared.cancel.cancel(FAIL_FAST_REASON);
        }
        ErrorMode::CollectAndContinue => {
            shared.failures.lock().push(ItemFailure { index, error });
        }
        ErrorMode::BestEffort => {
            // Recorded in metrics and surfaced to on_error only; the index
            // is simply absent from the result set.
        }
    }

    if !keep_going {
        shared.cancel.cancel(CALLBACK_CANCEL_REASON);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct OpError(&'static str);

    fn options() -> ParallelOptions<OpError> {
        ParallelOptions::new().with_max_concurrency(4)
    }

    #[tokio::test]
    async fn test_producer_assigns_dense_indices() {
        let slots: Arc<DashMap<usize, i32>> = Arc::new(DashMap::new());
        let report = run_core(
            stream::iter(vec![10, 20, 30, 40, 50]),
            Arc::new(|x: i32| async move { Ok::<_, OpError>(x) }),
            options(),
            ResultSink::Ordered(slots.clone()),
        )
        .await
        .expect("config is valid");

        assert_eq!(report.produced, 5);
        report.resolve().expect("no failures");

        let mut indices: Vec<usize> = slots.iter().map(|entry| *entry.key()).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(slots.get(&2).map(|v| *v.value()), Some(30));
    }

    #[tokio::test]
    async fn test_resolve_prefers_caller_cancellation() {
        let caller = CancelToken::new();
        caller.cancel("caller stopped");

        let report = run_core(
            stream::iter(vec![1, 2, 3]),
            Arc::new(|x: i32| async move { Ok::<_, OpError>(x) }),
            options().with_cancel_token(caller),
            ResultSink::<i32>::Discard,
        )
        .await
        .expect("config is valid");

        let err = report.resolve().expect_err("cancelled run must not resolve clean");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_tracker_counts_completions() {
        let bag = Arc::new(Mutex::new(Vec::new()));
        let report = run_core(
            stream::iter(0..10),
            Arc::new(|x: i32| async move { Ok::<_, OpError>(x * 2) }),
            options(),
            ResultSink::Unordered(bag.clone()),
        )
        .await
        .expect("config is valid");

        report.resolve().expect("no failures");
        assert_eq!(report.shared.tracker.started(), 10);
        assert_eq!(report.shared.tracker.completed(), 10);
        assert_eq!(report.shared.tracker.failed(), 0);
        assert_eq!(bag.lock().len(), 10);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_work() {
        let invoked = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = invoked.clone();

        let result = run_core(
            stream::iter(vec![1]),
            Arc::new(move |x: i32| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Ok::<_, OpError>(x) }
            }),
            options().with_max_concurrency(0),
            ResultSink::<i32>::Discard,
        )
        .await;

        assert!(matches!(result, Err(ParallelError::Config(_))));
        assert_eq!(invoked.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
