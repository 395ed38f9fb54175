//! Cancellable change-feed streams over the store's listen primitive.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::server::metrics;
use crate::store::{
    DocumentChange, DocumentStore, ListenerRegistration, StoreError, StoreResult, WatchTarget,
};

/// Item of a [`ChangeFeed`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// One non-empty batch, in store commit order.
    Changes(Vec<DocumentChange>),
    /// Terminal listener error; the stream ends after it.
    Failed(StoreError),
}

struct CancelState {
    /// Set by an explicit cancel.
    cancelled: AtomicBool,
    /// Set by cancel or by a terminal error; later callbacks are dropped.
    closed: AtomicBool,
    registration: Mutex<Option<Box<dyn ListenerRegistration>>>,
}

/// Cloneable cancel handle of a feed. Cancelling more than once is a no-op.
#[derive(Clone)]
pub struct FeedCancel {
    state: Arc<CancelState>,
}

impl FeedCancel {
    fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                registration: Mutex::new(None),
            }),
        }
    }

    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.closed.store(true, Ordering::SeqCst);
        self.release();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn release(&self) {
        let registration = match self.state.registration.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(registration) = registration {
            registration.remove();
        }
    }

    /// Stores the registration, or removes it right away if the feed already closed
    /// while the listener was being attached.
    fn attach(&self, registration: Box<dyn ListenerRegistration>) {
        let mut slot = match self.state.registration.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_cancelled() {
            drop(slot);
            registration.remove();
        } else {
            *slot = Some(registration);
        }
    }
}

/// Lazy, non-restartable stream of change batches for one [`WatchTarget`].
///
/// Dropping the feed cancels it.
pub struct ChangeFeed {
    target: WatchTarget,
    rx: mpsc::UnboundedReceiver<FeedEvent>,
    cancel: FeedCancel,
    finished: bool,
}

impl ChangeFeed {
    /// Attaches a store listener and wraps it into a stream.
    pub fn open(store: &dyn DocumentStore, target: WatchTarget) -> StoreResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = FeedCancel::new();

        let callback_cancel = cancel.clone();
        let registration = store.listen(
            &target,
            Box::new(move |batch| {
                if callback_cancel.is_closed() {
                    return;
                }
                match batch {
                    Ok(changes) if changes.is_empty() => {}
                    Ok(changes) => {
                        let _ = tx.send(FeedEvent::Changes(changes));
                    }
                    Err(error) => {
                        // The store detaches a failed listener itself.
                        callback_cancel.state.closed.store(true, Ordering::SeqCst);
                        let _ = tx.send(FeedEvent::Failed(error));
                    }
                }
            }),
        )?;
        cancel.attach(registration);

        Ok(Self {
            target,
            rx,
            cancel,
            finished: false,
        })
    }

    /// Re-opens a feed on `target` after `backoff`, retrying transient failures.
    ///
    /// Returns `None` when `token` is cancelled or the store fails permanently.
    pub async fn reopen(
        store: &dyn DocumentStore,
        target: &WatchTarget,
        backoff: Duration,
        token: &CancellationToken,
    ) -> Option<Self> {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            match Self::open(store, target.clone()) {
                Ok(feed) => {
                    debug!("Re-opened change feed on {}", target);
                    return Some(feed);
                }
                Err(e) if e.is_transient() => {
                    metrics::record_store_error(e.kind());
                    warn!("Re-opening change feed on {} failed, retrying: {}", target, e);
                }
                Err(e) => {
                    metrics::record_store_error(e.kind());
                    error!("Giving up on change feed on {}: {}", target, e);
                    return None;
                }
            }
        }
    }

    /// Takes an already delivered event without waiting, such as the initial snapshot.
    pub fn try_next(&mut self) -> Option<FeedEvent> {
        if self.finished || self.cancel.is_cancelled() {
            return None;
        }
        match self.rx.try_recv().ok()? {
            FeedEvent::Failed(error) => {
                self.finished = true;
                Some(FeedEvent::Failed(error))
            }
            changes => Some(changes),
        }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> FeedCancel {
        self.cancel.clone()
    }
}

impl Stream for ChangeFeed {
    type Item = FeedEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FeedEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.cancel.is_cancelled() {
            this.finished = true;
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(FeedEvent::Failed(error))) => {
                this.finished = true;
                Poll::Ready(Some(FeedEvent::Failed(error)))
            }
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
