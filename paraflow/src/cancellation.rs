//! Cooperative cancellation for pipeline invocations.
//!
//! Every invocation creates one [`CancelToken`] (linked as a child of the
//! caller-supplied token, when there is one). All suspension points in the
//! pipeline (queue waits, rate-limit waits, admission waits, backoff
//! sleeps) derive their wait condition from this single token, so
//! cancelling the parent cancels every descendant wait.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

use crate::errors::CancelledError;

struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    callbacks: Mutex<Vec<Box<dyn FnOnce(&str) + Send>>>,
    notify: Notify,
}

/// Token for coordinating cancellation across tasks.
///
/// Cloning is cheap; clones share the same cancellation state. Child
/// tokens created with [`CancelToken::child`] are cancelled when the
/// parent is, but cancelling a child never affects its parent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Creates a child token that is cancelled when `self` is.
    ///
    /// If `self` is already cancelled, the child starts out cancelled.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        let weak: Weak<Inner> = Arc::downgrade(&child.inner);
        self.on_cancel(move |reason| {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.cancel(reason);
            }
        });
        child
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Requests cancellation with a reason.
    ///
    /// Idempotent: only the first reason is stored. Registered callbacks
    /// run once, with panics suppressed, and every pending
    /// [`cancelled`](Self::cancelled) wait is woken.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();

        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            *self.inner.reason.lock() = Some(reason.clone());
            self.inner.notify.notify_waiters();

            let callbacks: Vec<_> = {
                let mut lock = self.inner.callbacks.lock();
                std::mem::take(&mut *lock)
            };

            for callback in callbacks {
                // Suppress panics in callbacks
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&reason);
                }))
                .ok();
            }
        }
    }

    /// Registers a callback to run when cancellation is requested.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        if self.is_cancelled() {
            let reason = self.reason().unwrap_or_default();
            callback(&reason);
        } else {
            self.inner.callbacks.lock().push(Box::new(callback));
        }
    }

    /// Waits until cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering so a cancel between the check and
            // the registration is not missed.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Returns the cancellation outcome as an error, for propagation.
    #[must_use]
    pub fn as_error(&self) -> CancelledError {
        CancelledError::new(self.reason().unwrap_or_else(|| "cancelled".to_string()))
    }
}
