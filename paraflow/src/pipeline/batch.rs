//! Batching helpers for the `batch_parallel` operators.

use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::pipeline::stream::ChannelStream;

/// Splits a finite source into chunks of `size`; the final chunk may be
/// short. `size` must be positive (operators validate before calling).
pub(crate) fn chunk_items<I>(items: impl IntoIterator<Item = I>, size: usize) -> Vec<Vec<I>> {
    let mut chunks = Vec::new();
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() >= size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Re-chunks an async source into batches of `size`.
///
/// With a flush timeout, a partial batch is emitted when no new element
/// arrives within the window, so slow producers do not stall consumers
/// indefinitely. Source exhaustion always flushes the remainder. The
/// re-chunking task starts on the first poll of the returned stream, so
/// the source is not consumed before then.
pub(crate) fn chunk_stream<S, I>(
    source: S,
    size: usize,
    flush_timeout: Option<Duration>,
    capacity: usize,
) -> ChannelStream<Vec<I>>
where
    S: Stream<Item = I> + Send + 'static,
    I: Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);

    let start = Box::new(move || {
        tokio::spawn(async move {
            let mut source = Box::pin(source);
            let mut buffer: Vec<I> = Vec::with_capacity(size);

            loop {
                let item = match flush_timeout {
                    Some(window) => match tokio::time::timeout(window, source.next()).await {
                        Ok(item) => item,
                        Err(_) => {
                            if !buffer.is_empty() {
                                let chunk =
                                    std::mem::replace(&mut buffer, Vec::with_capacity(size));
                                if tx.send(chunk).await.is_err() {
                                    return;
                                }
                            }
                            continue;
                        }
                    },
                    None => source.next().await,
                };

                match item {
                    Some(item) => {
                        buffer.push(item);
                        if buffer.len() >= size {
                            let chunk =
                                std::mem::replace(&mut buffer, Vec::with_capacity(size));
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                    }
                    None => break,
                }
            }

            if !buffer.is_empty() {
                let _ = tx.send(buffer).await;
            }
        });
    });

    ChannelStream::deferred(rx, start)
}
