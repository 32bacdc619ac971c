//! Consumer-facing result stream.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::cancellation::CancelToken;
use crate::errors::ParallelError;
use crate::pipeline::engine::STREAM_DROP_REASON;

/// Deferred pipeline startup, run on the first poll.
pub(crate) type StartFn = Box<dyn FnOnce() + Send>;

/// Incremental results of a streaming operator.
///
/// The underlying pipeline starts on the first poll; an unpolled stream
/// consumes no input and runs no operations. Yields `Ok(value)` per
/// completed item; if the run ends with an error under the active error
/// mode, that error arrives as the final `Err` element. Dropping the
/// stream cancels the underlying run.
pub struct ResultStream<R, E> {
    rx: mpsc::Receiver<Result<R, ParallelError<E>>>,
    cancel: CancelToken,
    start: Option<StartFn>,
}

impl<R, E> ResultStream<R, E> {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<R, ParallelError<E>>>,
        cancel: CancelToken,
        start: Option<StartFn>,
    ) -> Self {
        Self { rx, cancel, start }
    }

    /// A stream that yields one error and ends; used when options fail
    /// validation before any work starts.
    pub(crate) fn failed(error: ParallelError<E>) -> Self
    where
        R: Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 guarantees this send succeeds.
        tx.try_send(Err(error)).ok();
        Self {
            rx,
            cancel: CancelToken::new(),
            start: None,
        }
    }

    /// Requests cancellation of the underlying run without dropping the
    /// stream; already-buffered results remain consumable.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }
}

impl<R, E> Stream for ResultStream<R, E> {
    type Item = Result<R, ParallelError<E>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(start) = self.start.take() {
            start();
        }
        self.rx.poll_recv(cx)
    }
}

impl<R, E> Drop for ResultStream<R, E> {
    fn drop(&mut self) {
        self.cancel.cancel(STREAM_DROP_REASON);
    }
}

/// A stream adapter over a channel receiver; used to feed batched input
/// into the streaming operators. Carries the same deferred-start hook so
/// its producing task does not run before the first poll.
pub(crate) struct ChannelStream<T> {
    rx: mpsc::Receiver<T>,
    start: Option<StartFn>,
}

impl<T> ChannelStream<T> {
    pub(crate) fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx, start: None }
    }

    pub(crate) fn deferred(rx: mpsc::Receiver<T>, start: StartFn) -> Self {
        Self {
            rx,
            start: Some(start),
        }
    }
}

impl<T> Stream for ChannelStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(start) = self.start.take() {
            start();
        }
        self.rx.poll_recv(cx)
    }
}
