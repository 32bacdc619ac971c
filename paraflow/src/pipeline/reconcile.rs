//! Ordered-result reconciliation for streaming operators.
//!
//! Workers finish out of order; the reconciler restores input order by
//! tracking the next expected index and buffering anything that arrives
//! early. In unordered mode it is a plain forwarder.

use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::errors::ParallelError;

/// Drains `(index, value)` slots into the consumer-facing channel.
///
/// In ordered mode, a value is released only when every lower index has
/// been released. Suppressed failures leave permanent gaps; once the slot
/// channel closes, whatever is still buffered past a gap is flushed in
/// ascending index order.
pub(crate) async fn reconcile<R, E>(
    mut slots: mpsc::Receiver<(usize, R)>,
    out: mpsc::Sender<Result<R, ParallelError<E>>>,
    ordered: bool,
) {
    if !ordered {
        while let Some((_, value)) = slots.recv().await {
            if out.send(Ok(value)).await.is_err() {
                return;
            }
        }
        return;
    }

    let mut next_expected = 0usize;
    let mut buffered: HashMap<usize, R> = HashMap::new();

    while let Some((index, value)) = slots.recv().await {
        if index == next_expected {
            if out.send(Ok(value)).await.is_err() {
                return;
            }
            next_expected += 1;
            while let Some(ready) = buffered.remove(&next_expected) {
                if out.send(Ok(ready)).await.is_err() {
                    return;
                }
                next_expected += 1;
            }
        } else {
            buffered.insert(index, value);
        }
    }

    // Gaps from failed items never fill; release the residue in order.
    let mut residual: Vec<(usize, R)> = buffered.into_iter().collect();
    residual.sort_unstable_by_key(|(index, _)| *index);
    for (_, value) in residual {
        if out.send(Ok(value)).await.is_err() {
            return;
        }
    }
}
