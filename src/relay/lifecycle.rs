//! Connection lifecycle: open, inbound messages, close.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::carts::CartNotifier;
use super::fanout::{FanoutOptions, FanoutRouter};
use super::notifier::DeviceNotifier;
use super::subscriptions::{SubscriptionRegistry, Topic};
use super::threshold::ThresholdMonitor;
use super::{CallTimeouts, RelayError, RelayResult};
use crate::config::RelaySettings;
use crate::devices::paths;
use crate::push::NotificationDispatcher;
use crate::server::websocket::messages::events;
use crate::server::websocket::{ClientMessage, ConnectionId, ConnectionManager, ServerMessage};
use crate::store::DocumentStore;

/// Owns every connection, subscription and device watch of the relay.
pub struct RelayHub {
    connections: Arc<ConnectionManager>,
    registry: SubscriptionRegistry,
    router: FanoutRouter,
    monitor: Arc<ThresholdMonitor>,
    carts: CartNotifier,
    auto_monitor: bool,
    /// Devices monitored regardless of subscribers.
    pinned_devices: HashSet<String>,
    /// Serializes auto-monitor start and release.
    monitor_gate: Mutex<()>,
}

impl RelayHub {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        settings: &RelaySettings,
        dispatch_timeout: Duration,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new(settings.outgoing_queue_capacity));
        let timeouts = CallTimeouts {
            store: settings.store_timeout(),
            dispatch: dispatch_timeout,
        };
        let notifier = Arc::new(DeviceNotifier::new(store.clone(), dispatcher, timeouts));
        let monitor = Arc::new(ThresholdMonitor::new(
            store.clone(),
            notifier.clone(),
            settings.resubscribe_backoff(),
        ));
        let carts = CartNotifier::new(store.clone(), notifier, settings.resubscribe_backoff());
        let router = FanoutRouter::new(
            store,
            connections.clone(),
            FanoutOptions {
                forward_device_documents: settings.forward_device_documents,
                resubscribe_backoff: settings.resubscribe_backoff(),
            },
        );

        Self {
            connections,
            registry: SubscriptionRegistry::new(),
            router,
            monitor,
            carts,
            auto_monitor: settings.auto_monitor_subscribed_devices,
            pinned_devices: settings.monitored_devices.iter().cloned().collect(),
            monitor_gate: Mutex::new(()),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<ThresholdMonitor> {
        &self.monitor
    }

    pub fn carts(&self) -> &CartNotifier {
        &self.carts
    }

    /// Registers a new connection with an empty subscription set.
    ///
    /// The returned receiver is the connection's outgoing queue.
    pub async fn open_connection(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (connection, rx) = self.connections.register().await;
        self.registry.open(connection).await;
        info!("Connection {} opened", connection);
        (connection, rx)
    }

    /// Handles one inbound message. Errors are reported to the sender as `error` events.
    pub async fn handle_message(&self, connection: ConnectionId, message: ClientMessage) {
        debug!("{} sent {}", connection, message.event);
        let reply = match message.event.as_str() {
            events::SUBSCRIBE_HISTORIES => match message.data.as_str() {
                Some(device_id) => match self.subscribe_device(connection, device_id).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("{} failed to subscribe to {:?}: {}", connection, device_id, e);
                        Some(ServerMessage::error(format!(
                            "Failed to subscribe to device {}: {}",
                            device_id, e
                        )))
                    }
                },
                None => Some(ServerMessage::error(
                    "subscribeHistories expects a device id string",
                )),
            },
            events::PING => Some(ServerMessage::empty(events::PONG)),
            other => Some(ServerMessage::error(format!("Unknown event: {}", other))),
        };

        if let Some(reply) = reply {
            self.send(connection, reply).await;
        }
    }

    /// Subscribes `connection` to the histories and schedule of `device_id`, replacing
    /// what it watched before on each topic.
    pub async fn subscribe_device(
        &self,
        connection: ConnectionId,
        device_id: &str,
    ) -> RelayResult<()> {
        if !paths::is_valid_device_id(device_id) {
            return Err(RelayError::InvalidDeviceId(device_id.to_string()));
        }
        let previous = self
            .registry
            .watched_device(connection, Topic::Histories)
            .await;

        self.registry
            .subscribe(connection, Topic::Histories, || {
                self.router.watch_histories(connection, device_id)
            })
            .await?;
        self.registry
            .subscribe(connection, Topic::Schedule, || {
                self.router.watch_schedule(connection, device_id)
            })
            .await?;
        info!("{} subscribed to device {}", connection, device_id);

        if self.auto_monitor {
            let _gate = self.monitor_gate.lock().await;
            if let Err(e) = self.monitor.watch_device(device_id).await {
                warn!("Could not monitor feed level of device {}: {}", device_id, e);
            }
        }
        if let Some(previous) = previous.filter(|previous| previous != device_id) {
            self.release_monitor(&previous).await;
        }
        Ok(())
    }

    /// Stops the auto-started monitor of `device_id` once no connection watches it.
    async fn release_monitor(&self, device_id: &str) {
        if !self.auto_monitor || self.pinned_devices.contains(device_id) {
            return;
        }
        let _gate = self.monitor_gate.lock().await;
        if self.registry.watchers_of(Topic::Histories, device_id).await == 0
            && self.monitor.unwatch_device(device_id).await
        {
            debug!("Device {} has no subscribers left", device_id);
        }
    }

    /// Releases every watch of `connection` and forgets it. An auto-started monitor left
    /// without subscribers is stopped too.
    ///
    /// Returns `false` if the connection was already closed.
    pub async fn close_connection(&self, connection: ConnectionId) -> bool {
        let device = self
            .registry
            .watched_device(connection, Topic::Histories)
            .await;
        let released = self.registry.unsubscribe_all(connection).await;
        self.connections.unregister(connection).await;
        if let Some(device) = device {
            self.release_monitor(&device).await;
        }
        match released {
            Some(count) => {
                info!("Connection {} closed ({} watches released)", connection, count);
                true
            }
            None => {
                debug!("Connection {} was already closed", connection);
                false
            }
        }
    }

    /// Stops every device and cart watch. Connections are closed by their own handlers.
    pub async fn shutdown(&self) {
        self.carts.stop().await;
        self.monitor.shutdown().await;
    }

    async fn send(&self, connection: ConnectionId, message: ServerMessage) {
        if let Err(e) = self
            .connections
            .send_to_connection(connection, message)
            .await
        {
            debug!("Reply to {} dropped: {:?}", connection, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::NotificationRecord;
    use crate::push::RecordingDispatcher;
    use crate::relay::testing::LateDeliveryStore;
    use crate::store::{Fields, InMemoryDocumentStore, Query};
    use serde_json::{json, Value};

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn hub_for(store: Arc<dyn DocumentStore>, dispatcher: Arc<RecordingDispatcher>) -> RelayHub {
        let settings = RelaySettings {
            resubscribe_backoff_ms: 10,
            ..RelaySettings::default()
        };
        RelayHub::new(store, dispatcher, &settings, Duration::from_secs(1))
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no message")
            .expect("queue closed")
    }

    async fn assert_quiet(rx: &mut mpsc::Receiver<ServerMessage>) {
        let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(
            !matches!(result, Ok(Some(_))),
            "unexpected message: {:?}",
            result
        );
    }

    fn subscribe(device_id: &str) -> ClientMessage {
        ClientMessage {
            event: events::SUBSCRIBE_HISTORIES.to_string(),
            data: json!(device_id),
        }
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let hub = hub_for(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(RecordingDispatcher::new()),
        );
        let (conn, mut rx) = hub.open_connection().await;
        hub.handle_message(
            conn,
            ClientMessage {
                event: events::PING.to_string(),
                data: Value::Null,
            },
        )
        .await;
        assert_eq!(recv(&mut rx).await.event, events::PONG);
    }

    #[tokio::test]
    async fn bad_messages_get_error_events() {
        let hub = hub_for(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(RecordingDispatcher::new()),
        );
        let (conn, mut rx) = hub.open_connection().await;

        hub.handle_message(
            conn,
            ClientMessage {
                event: events::SUBSCRIBE_HISTORIES.to_string(),
                data: json!(42),
            },
        )
        .await;
        let msg = recv(&mut rx).await;
        assert_eq!(msg.event, events::ERROR);
        assert!(msg.data.is_string());

        hub.handle_message(conn, subscribe("")).await;
        assert_eq!(recv(&mut rx).await.event, events::ERROR);

        hub.handle_message(
            conn,
            ClientMessage {
                event: "dance".to_string(),
                data: Value::Null,
            },
        )
        .await;
        assert_eq!(recv(&mut rx).await.event, events::ERROR);
        assert_eq!(hub.registry().watch_count().await, 0);
    }

    #[tokio::test]
    async fn subscribe_relays_histories_and_schedule() {
        let store = InMemoryDocumentStore::new();
        let hub = hub_for(Arc::new(store.clone()), Arc::new(RecordingDispatcher::new()));
        let (conn, mut rx) = hub.open_connection().await;

        hub.handle_message(conn, subscribe("d1")).await;
        assert_eq!(
            hub.registry().active_watches(conn).await,
            vec![
                (Topic::Histories, "d1".to_string()),
                (Topic::Schedule, "d1".to_string())
            ]
        );

        store
            .add("devices/d1/histories", fields(json!({"feedLevel": 70})))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await.event, events::NEW_HISTORY);

        let schedule = json!({"times": ["07:30"], "portion": 20});
        store
            .set("devices/d1", fields(json!({"schedule": schedule.clone()})))
            .await
            .unwrap();
        store
            .set("devices/d1", fields(json!({"schedule": schedule.clone()})))
            .await
            .unwrap();
        let msg = recv(&mut rx).await;
        assert_eq!(msg.event, events::FEEDING_SCHEDULE);
        assert_eq!(msg.data, schedule);
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn switching_devices_replaces_watches() {
        let store = InMemoryDocumentStore::new();
        let hub = hub_for(Arc::new(store.clone()), Arc::new(RecordingDispatcher::new()));
        let (conn, mut rx) = hub.open_connection().await;

        hub.handle_message(conn, subscribe("a")).await;
        hub.handle_message(conn, subscribe("b")).await;
        assert_eq!(hub.registry().watch_count().await, 2);
        assert_eq!(
            hub.registry().active_watches(conn).await,
            vec![
                (Topic::Histories, "b".to_string()),
                (Topic::Schedule, "b".to_string())
            ]
        );

        store
            .add("devices/a/histories", Fields::new())
            .await
            .unwrap();
        assert_quiet(&mut rx).await;

        let entry = store
            .add("devices/b/histories", Fields::new())
            .await
            .unwrap();
        let msg = recv(&mut rx).await;
        assert_eq!(msg.data["id"], json!(entry.id));
    }

    #[tokio::test]
    async fn nothing_arrives_after_close_even_from_late_callbacks() {
        let store = LateDeliveryStore::new();
        let hub = hub_for(Arc::new(store.clone()), Arc::new(RecordingDispatcher::new()));
        let (conn, mut rx) = hub.open_connection().await;
        hub.handle_message(conn, subscribe("d1")).await;

        assert!(hub.close_connection(conn).await);
        assert!(!hub.close_connection(conn).await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .add("devices/d1/histories", Fields::new())
            .await
            .unwrap();
        assert_quiet(&mut rx).await;
        assert_eq!(hub.registry().watch_count().await, 0);
        assert!(!hub.connections().is_connected(conn).await);
    }

    #[tokio::test]
    async fn auto_monitor_ends_with_the_last_subscriber() {
        let hub = hub_for(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(RecordingDispatcher::new()),
        );
        let (first, _rx1) = hub.open_connection().await;
        let (second, _rx2) = hub.open_connection().await;
        hub.handle_message(first, subscribe("a")).await;
        hub.handle_message(second, subscribe("a")).await;
        assert_eq!(hub.monitor().watched_devices().await, vec!["a".to_string()]);

        hub.close_connection(first).await;
        assert_eq!(hub.monitor().watched_devices().await, vec!["a".to_string()]);

        hub.handle_message(second, subscribe("b")).await;
        assert_eq!(hub.monitor().watched_devices().await, vec!["b".to_string()]);

        hub.close_connection(second).await;
        assert!(hub.monitor().watched_devices().await.is_empty());
    }

    #[tokio::test]
    async fn configured_devices_stay_monitored() {
        let settings = RelaySettings {
            resubscribe_backoff_ms: 10,
            monitored_devices: vec!["pinned".to_string()],
            ..RelaySettings::default()
        };
        let hub = RelayHub::new(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(RecordingDispatcher::new()),
            &settings,
            Duration::from_secs(1),
        );
        hub.monitor().watch_device("pinned").await.unwrap();

        let (conn, _rx) = hub.open_connection().await;
        hub.handle_message(conn, subscribe("pinned")).await;
        hub.close_connection(conn).await;

        assert_eq!(hub.monitor().watched_devices().await, vec!["pinned".to_string()]);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn close_of_unknown_connection_is_a_no_op() {
        let hub = hub_for(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(RecordingDispatcher::new()),
        );
        assert!(!hub.close_connection(ConnectionId(999)).await);
    }

    #[tokio::test]
    async fn empty_feeder_alerts_once_with_zero_feed_action() {
        let store = InMemoryDocumentStore::new();
        store
            .set("devices/feeder-01/users/u1", fields(json!({"notificationsEnabled": true})))
            .await
            .unwrap();
        store
            .add("users/u1/device_tokens", fields(json!({"token": "tok-1"})))
            .await
            .unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let hub = hub_for(Arc::new(store.clone()), dispatcher.clone());
        let (conn, _rx) = hub.open_connection().await;
        hub.handle_message(conn, subscribe("feeder-01")).await;
        assert_eq!(hub.monitor().watched_devices().await, vec!["feeder-01".to_string()]);

        for _ in 0..2 {
            store
                .set(
                    "devices/feeder-01",
                    fields(json!({"feedLevel": 0, "foodLevelThreshold": 10})),
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        let records: Vec<NotificationRecord> = store
            .query(&Query::collection("devices/feeder-01/notifications"))
            .await
            .unwrap()
            .iter()
            .filter_map(NotificationRecord::from_document)
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "0 Feed Level! Gimme food!");
        assert_eq!(records[0].action.as_deref(), Some("zeroFeedAction"));

        let batches = dispatcher.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, vec!["tok-1".to_string()]);
        assert_eq!(batches[0].1.action_tag.as_deref(), Some("zeroFeedAction"));

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn opted_out_followers_get_no_push() {
        let store = InMemoryDocumentStore::new();
        store
            .set("devices/d1/users/u1", fields(json!({"notificationsEnabled": false})))
            .await
            .unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let hub = hub_for(Arc::new(store.clone()), dispatcher.clone());
        let (conn, _rx) = hub.open_connection().await;
        hub.handle_message(conn, subscribe("d1")).await;

        store
            .set("devices/d1", fields(json!({"feedLevel": 4, "foodLevelThreshold": 10})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let records = store
            .query(&Query::collection("devices/d1/notifications"))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(dispatcher.dispatch_count(), 0);
        hub.shutdown().await;
    }
}
