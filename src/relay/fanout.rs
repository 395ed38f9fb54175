//! Routes store changes of a device to one connection.
//!
//! Two watches exist per subscription: the newest history entry of the device and the
//! device document itself, from which feeding schedule changes are extracted.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::change_feed::{ChangeFeed, FeedEvent};
use super::subscriptions::WatchHandle;
use super::{RelayError, RelayResult};
use crate::devices::{history_payload, paths};
use crate::server::metrics;
use crate::server::websocket::messages::events;
use crate::server::websocket::{ConnectionId, ConnectionManager, ServerMessage};
use crate::store::{ChangeKind, Direction, DocumentChange, DocumentStore, OrderField, Query, WatchTarget};

#[derive(Debug, Clone)]
pub struct FanoutOptions {
    /// Also send every device document change as a `device` event.
    pub forward_device_documents: bool,
    /// Wait before re-listening after a transient feed failure.
    pub resubscribe_backoff: Duration,
}

impl Default for FanoutOptions {
    fn default() -> Self {
        Self {
            forward_device_documents: false,
            resubscribe_backoff: Duration::from_secs(2),
        }
    }
}

/// Turns one change into the messages it produces for the client.
trait ChangeRelay: Send + 'static {
    fn relay(&mut self, change: &DocumentChange) -> Vec<ServerMessage>;
}

/// Emits each new newest history entry once.
#[derive(Debug, Default)]
struct HistoryRelay {
    last_delivered: Option<String>,
}

impl ChangeRelay for HistoryRelay {
    fn relay(&mut self, change: &DocumentChange) -> Vec<ServerMessage> {
        if change.kind != ChangeKind::Added {
            return Vec::new();
        }
        let id = &change.document.id;
        if self.last_delivered.as_ref() == Some(id) {
            return Vec::new();
        }
        self.last_delivered = Some(id.clone());
        vec![ServerMessage::new(
            events::NEW_HISTORY,
            history_payload(&change.document),
        )]
    }
}

/// Emits the feeding schedule when it differs from the last one sent.
///
/// A missing or `null` schedule is never sent; it clears the last one, so the next
/// schedule that appears is sent even if it equals the earlier one.
#[derive(Debug, Default)]
struct ScheduleRelay {
    last_delivered: Option<Value>,
    forward_device_documents: bool,
}

impl ChangeRelay for ScheduleRelay {
    fn relay(&mut self, change: &DocumentChange) -> Vec<ServerMessage> {
        if change.kind == ChangeKind::Removed {
            return Vec::new();
        }
        let document = &change.document;
        let mut messages = Vec::new();

        if self.forward_device_documents {
            let mut data = document.data.clone();
            data.insert("id".to_string(), Value::String(document.id.clone()));
            messages.push(ServerMessage::new(events::DEVICE, Value::Object(data)));
        }

        match document.get("schedule") {
            None | Some(Value::Null) => self.last_delivered = None,
            Some(schedule) if self.last_delivered.as_ref() != Some(schedule) => {
                messages.push(ServerMessage::new(events::FEEDING_SCHEDULE, schedule.clone()));
                self.last_delivered = Some(schedule.clone());
            }
            Some(_) => {}
        }
        messages
    }
}

/// Everything a watch task needs besides its feed.
struct WatchContext {
    store: Arc<dyn DocumentStore>,
    connections: Arc<ConnectionManager>,
    connection: ConnectionId,
    device_id: String,
    target: WatchTarget,
    backoff: Duration,
}

pub struct FanoutRouter {
    store: Arc<dyn DocumentStore>,
    connections: Arc<ConnectionManager>,
    options: FanoutOptions,
}

impl FanoutRouter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        connections: Arc<ConnectionManager>,
        options: FanoutOptions,
    ) -> Self {
        Self {
            store,
            connections,
            options,
        }
    }

    /// Newest history entry of a device.
    pub fn histories_target(device_id: &str) -> WatchTarget {
        WatchTarget::Query(
            Query::collection(paths::histories(device_id))
                .order_by(OrderField::CreateTime, Direction::Descending)
                .limit(1),
        )
    }

    pub fn schedule_target(device_id: &str) -> WatchTarget {
        WatchTarget::Document(paths::device(device_id))
    }

    /// Starts relaying new history entries of `device_id` to `connection` as `newHistory`.
    pub fn watch_histories(
        &self,
        connection: ConnectionId,
        device_id: &str,
    ) -> RelayResult<WatchHandle> {
        self.start(
            connection,
            device_id,
            Self::histories_target(device_id),
            HistoryRelay::default(),
        )
    }

    /// Starts relaying schedule changes of `device_id` to `connection` as `feedingSchedule`.
    pub fn watch_schedule(
        &self,
        connection: ConnectionId,
        device_id: &str,
    ) -> RelayResult<WatchHandle> {
        self.start(
            connection,
            device_id,
            Self::schedule_target(device_id),
            ScheduleRelay {
                last_delivered: None,
                forward_device_documents: self.options.forward_device_documents,
            },
        )
    }

    fn start<R: ChangeRelay>(
        &self,
        connection: ConnectionId,
        device_id: &str,
        target: WatchTarget,
        relay: R,
    ) -> RelayResult<WatchHandle> {
        if !paths::is_valid_device_id(device_id) {
            return Err(RelayError::InvalidDeviceId(device_id.to_string()));
        }
        let feed = ChangeFeed::open(self.store.as_ref(), target.clone())?;

        let token = CancellationToken::new();
        let context = WatchContext {
            store: self.store.clone(),
            connections: self.connections.clone(),
            connection,
            device_id: device_id.to_string(),
            target,
            backoff: self.options.resubscribe_backoff,
        };
        let task = tokio::spawn(run_watch(context, feed, token.clone(), relay));
        Ok(WatchHandle::new(device_id, token, task))
    }
}

async fn run_watch<R: ChangeRelay>(
    context: WatchContext,
    mut feed: ChangeFeed,
    token: CancellationToken,
    mut relay: R,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = feed.next() => event,
        };

        match event {
            Some(FeedEvent::Changes(changes)) => {
                for change in &changes {
                    for message in relay.relay(change) {
                        if token.is_cancelled() {
                            return;
                        }
                        if let Err(e) = context
                            .connections
                            .send_to_connection(context.connection, message)
                            .await
                        {
                            debug!(
                                "Stopping watch {} for {}: {:?}",
                                feed.target(),
                                context.connection,
                                e
                            );
                            return;
                        }
                    }
                }
            }
            Some(FeedEvent::Failed(e)) => {
                metrics::record_store_error(e.kind());
                if !e.is_transient() {
                    error!(
                        "Watch {} of device {} failed permanently: {}",
                        context.target, context.device_id, e
                    );
                    break;
                }
                warn!(
                    "Watch {} of device {} interrupted, re-listening: {}",
                    context.target, context.device_id, e
                );
                match ChangeFeed::reopen(
                    context.store.as_ref(),
                    &context.target,
                    context.backoff,
                    &token,
                )
                .await
                {
                    Some(reopened) => feed = reopened,
                    None => break,
                }
            }
            None => break,
        }
    }
    feed.cancel();
}
