//! Push notifications for shopping cart changes.
//!
//! Every change to a document of the `cart` collection is pushed to the user who created
//! it (`createdBy`). Carts already present when the watch attaches are not announced.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::change_feed::{ChangeFeed, FeedEvent};
use super::notifier::DeviceNotifier;
use super::subscriptions::WatchHandle;
use super::RelayResult;
use crate::devices::paths;
use crate::push::PushMessage;
use crate::server::metrics;
use crate::store::{ChangeKind, DocumentChange, DocumentStore, Query, WatchTarget};

const CART_TOPIC: &str = "cart";

/// Push message announcing one cart change.
pub fn cart_message(kind: ChangeKind, item_name: Option<&str>) -> PushMessage {
    let name = item_name.unwrap_or("unknown");
    match kind {
        ChangeKind::Added => PushMessage::new(
            "New Item Added!",
            format!("Item \"{}\" was added to your cart.", name),
        ),
        ChangeKind::Modified => PushMessage::new(
            "Cart Updated",
            format!("Item \"{}\" in your cart was changed.", name),
        ),
        ChangeKind::Removed => {
            PushMessage::new("Item Removed", "An item was removed from your cart.")
        }
    }
}

fn metric_label(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Added => "cart_added",
        ChangeKind::Modified => "cart_modified",
        ChangeKind::Removed => "cart_removed",
    }
}

pub struct CartNotifier {
    store: Arc<dyn DocumentStore>,
    notifier: Arc<DeviceNotifier>,
    resubscribe_backoff: Duration,
    watch: Mutex<Option<WatchHandle>>,
}

impl CartNotifier {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifier: Arc<DeviceNotifier>,
        resubscribe_backoff: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            resubscribe_backoff,
            watch: Mutex::new(None),
        }
    }

    /// Starts watching carts. Returns `false` if the watch is already running.
    pub async fn start(&self) -> RelayResult<bool> {
        let mut watch = self.watch.lock().await;
        if watch.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(false);
        }

        let target = WatchTarget::Query(Query::collection(paths::CARTS));
        let feed = ChangeFeed::open(self.store.as_ref(), target.clone())?;
        let token = CancellationToken::new();
        let task = tokio::spawn(watch_carts(
            self.store.clone(),
            self.notifier.clone(),
            self.resubscribe_backoff,
            target,
            feed,
            token.clone(),
        ));
        *watch = Some(WatchHandle::new(paths::CARTS, token, task).counted(CART_TOPIC));
        info!("Watching {} for cart notifications", paths::CARTS);
        Ok(true)
    }

    pub async fn is_running(&self) -> bool {
        self.watch
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn stop(&self) {
        let handle = self.watch.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
            debug!("Cart watch stopped");
        }
    }
}

/// Drops the snapshot a fresh feed starts with; anything else is handed back.
fn skip_snapshot(feed: &mut ChangeFeed) -> Option<FeedEvent> {
    match feed.try_next() {
        Some(FeedEvent::Changes(existing)) => {
            debug!("Ignoring {} existing carts", existing.len());
            None
        }
        other => other,
    }
}

async fn watch_carts(
    store: Arc<dyn DocumentStore>,
    notifier: Arc<DeviceNotifier>,
    backoff: Duration,
    target: WatchTarget,
    mut feed: ChangeFeed,
    token: CancellationToken,
) {
    let mut pending = skip_snapshot(&mut feed);
    loop {
        let event = match pending.take() {
            Some(event) => Some(event),
            None => tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = feed.next() => event,
            },
        };

        match event {
            Some(FeedEvent::Changes(changes)) => {
                for change in &changes {
                    if token.is_cancelled() {
                        return;
                    }
                    notify_change(&notifier, change).await;
                }
            }
            Some(FeedEvent::Failed(e)) => {
                metrics::record_store_error(e.kind());
                if !e.is_transient() {
                    error!("Cart watch failed: {}", e);
                    break;
                }
                warn!("Cart watch interrupted, re-listening: {}", e);
                match ChangeFeed::reopen(store.as_ref(), &target, backoff, &token).await {
                    Some(reopened) => {
                        feed = reopened;
                        pending = skip_snapshot(&mut feed);
                    }
                    None => break,
                }
            }
            None => break,
        }
    }
    feed.cancel();
}

async fn notify_change(notifier: &DeviceNotifier, change: &DocumentChange) {
    let cart = &change.document;
    let Some(user_id) = cart
        .get("createdBy")
        .and_then(Value::as_str)
        .filter(|user| !user.is_empty())
    else {
        debug!("Skipping cart {}: no createdBy", cart.id);
        return;
    };

    let message = cart_message(change.kind, cart.get("name").and_then(Value::as_str));
    metrics::record_notification(metric_label(change.kind));
    let outcome = notifier.notify_user(user_id, &message).await;
    debug!(
        "Cart {} ({:?}) pushed to {} of {} tokens of user {}",
        cart.id, change.kind, outcome.delivered, outcome.recipients, user_id
    );
}
