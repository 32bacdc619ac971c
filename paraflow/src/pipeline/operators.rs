//! Public parallel operators.
//!
//! - [`map_parallel`] / [`map_parallel_stream`]: transform each item.
//! - [`for_each_parallel`] / [`for_each_parallel_stream`]: side effects only.
//! - [`batch_parallel`] / [`batch_parallel_stream`]: chunk the source and
//!   apply the operation per batch.
//!
//! Every operator must be called from within a tokio runtime. Items must be
//! `Clone` so retried attempts can re-invoke the operation with the same
//! input.

use dashmap::DashMap;
use futures::{stream, Stream};
use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cancellation::CancelToken;
use crate::errors::ParallelError;
use crate::options::ParallelOptions;
use crate::pipeline::batch::{chunk_items, chunk_stream};
use crate::pipeline::engine::{run_core, ResultSink};
use crate::pipeline::reconcile::reconcile;
use crate::pipeline::stream::ResultStream;

/// Applies `op` to every item with bounded concurrency and collects the
/// results into a `Vec`.
///
/// With `ordered` output the result vector follows input order; otherwise
/// it follows completion order. Under `BestEffort` (and under
/// `CollectAndContinue` when the aggregate would be empty) failed items
/// are simply absent.
pub async fn map_parallel<S, I, R, E, F, Fut>(
    source: S,
    op: F,
    options: ParallelOptions<E>,
) -> Result<Vec<R>, ParallelError<E>>
where
    S: IntoIterator<Item = I>,
    S::IntoIter: Send + 'static,
    I: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    if options.ordered {
        let slots: Arc<DashMap<usize, R>> = Arc::new(DashMap::new());
        let report = run_core(
            stream::iter(source),
            Arc::new(op),
            options,
            ResultSink::Ordered(slots.clone()),
        )
        .await?;
        report.resolve()?;

        let mut results = Vec::with_capacity(slots.len());
        for index in 0..report.produced {
            // Suppressed failures leave gaps; skip them.
            if let Some((_, value)) = slots.remove(&index) {
                results.push(value);
            }
        }
        Ok(results)
    } else {
        let bag = Arc::new(Mutex::new(Vec::new()));
        let report = run_core(
            stream::iter(source),
            Arc::new(op),
            options,
            ResultSink::Unordered(bag.clone()),
        )
        .await?;
        report.resolve()?;
        let results = std::mem::take(&mut *bag.lock());
        Ok(results)
    }
}

/// Applies `op` to every item of an async source and yields results
/// incrementally as a [`ResultStream`].
///
/// The pipeline is lazy: the source is not consumed and no operation runs
/// until the stream is first polled. A run-level error (first failure under
/// `FailFast`, the aggregate under `CollectAndContinue`, cancellation)
/// arrives as the final stream element. Dropping the stream cancels the
/// run.
pub fn map_parallel_stream<S, I, R, E, F, Fut>(
    source: S,
    op: F,
    options: ParallelOptions<E>,
) -> ResultStream<R, E>
where
    S: Stream<Item = I> + Send + 'static,
    I: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let mut options = options;
    if let Err(error) = options.validate() {
        return ResultStream::failed(error);
    }

    // The stream handle owns a token linked under the caller's (if any);
    // dropping the stream cancels the run without touching the caller's.
    let handle_token = options
        .cancel_token
        .as_ref()
        .map_or_else(CancelToken::new, CancelToken::child);
    options.cancel_token = Some(handle_token.clone());

    let ordered = options.ordered;
    let capacity = options.queue_capacity;
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (slot_tx, slot_rx) = mpsc::channel(capacity);
    let op = Arc::new(op);

    // Spawning is deferred to the first poll of the returned stream.
    let start = Box::new(move || {
        let reconciler = tokio::spawn(reconcile(slot_rx, out_tx.clone(), ordered));
        tokio::spawn(async move {
            let outcome = run_core(source, op, options, ResultSink::Stream(slot_tx)).await;
            let _ = reconciler.await;
            let epilogue = match outcome {
                Ok(report) => report.resolve(),
                Err(config_error) => Err(config_error),
            };
            if let Err(error) = epilogue {
                let _ = out_tx.send(Err(error)).await;
            }
        });
    });

    ResultStream::new(out_rx, handle_token, Some(start))
}

/// Runs `action` for every item with bounded concurrency, discarding
/// outputs. Resolves to `Ok(())` once all items are done, or to the
/// run-level error dictated by the error mode.
pub async fn for_each_parallel<S, I, E, F, Fut>(
    source: S,
    action: F,
    options: ParallelOptions<E>,
) -> Result<(), ParallelError<E>>
where
    S: IntoIterator<Item = I>,
    S::IntoIter: Send + 'static,
    I: Clone + Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    let report = run_core(
        stream::iter(source),
        Arc::new(action),
        options,
        ResultSink::<()>::Discard,
    )
    .await?;
    report.resolve()
}

/// [`for_each_parallel`] over an async source.
pub async fn for_each_parallel_stream<S, I, E, F, Fut>(
    source: S,
    action: F,
    options: ParallelOptions<E>,
) -> Result<(), ParallelError<E>>
where
    S: Stream<Item = I> + Send + 'static,
    I: Clone + Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    let report = run_core(source, Arc::new(action), options, ResultSink::<()>::Discard).await?;
    report.resolve()
}

/// Chunks the source into batches of `batch_size` and applies `op` per
/// batch with bounded concurrency. Indices, callbacks, retries, and error
/// modes all operate at batch granularity; the final batch may be short.
pub async fn batch_parallel<S, I, R, E, F, Fut>(
    source: S,
    batch_size: usize,
    op: F,
    options: ParallelOptions<E>,
) -> Result<Vec<R>, ParallelError<E>>
where
    S: IntoIterator<Item = I>,
    I: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
    F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    if batch_size == 0 {
        return Err(ParallelError::Config(
            "batch_size must be at least 1".to_string(),
        ));
    }
    map_parallel(chunk_items(source, batch_size), op, options).await
}

/// [`batch_parallel`] over an async source, yielding per-batch results
/// incrementally. With a `flush_timeout`, a partial batch is released when
/// the source stays idle for that long.
pub fn batch_parallel_stream<S, I, R, E, F, Fut>(
    source: S,
    batch_size: usize,
    flush_timeout: Option<Duration>,
    op: F,
    options: ParallelOptions<E>,
) -> ResultStream<R, E>
where
    S: Stream<Item = I> + Send + 'static,
    I: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
    F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    if batch_size == 0 {
        return ResultStream::failed(ParallelError::Config(
            "batch_size must be at least 1".to_string(),
        ));
    }
    let batches = chunk_stream(source, batch_size, flush_timeout, options.queue_capacity);
    map_parallel_stream(batches, op, options)
}
