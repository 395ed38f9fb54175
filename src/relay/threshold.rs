//! Low feed-level detection.
//!
//! Each monitored device has one task consuming its document feed. A [`LevelTracker`]
//! fires once when the level drops below the threshold and re-arms only after the level
//! recovers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::change_feed::{ChangeFeed, FeedEvent};
use super::notifier::DeviceNotifier;
use super::subscriptions::WatchHandle;
use super::{RelayError, RelayResult};
use crate::devices::{paths, Device, FeedReading};
use crate::push::PushMessage;
use crate::server::metrics;
use crate::store::{ChangeKind, DocumentStore, WatchTarget};

/// Label of threshold watches in the `active_watches` gauge.
const THRESHOLD_TOPIC: &str = "threshold";

/// Last known state of every device ever monitored.
type StateBook = Arc<std::sync::Mutex<HashMap<String, FeedState>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedState {
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertVariant {
    /// The feeder is completely empty.
    Empty,
    Low,
}

impl AlertVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertVariant::Empty => "empty",
            AlertVariant::Low => "low",
        }
    }

    pub fn action_tag(&self) -> &'static str {
        match self {
            AlertVariant::Empty => "zeroFeedAction",
            AlertVariant::Low => "lowFeedAction",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LowFeedAlert {
    pub variant: AlertVariant,
    pub reading: FeedReading,
}

impl LowFeedAlert {
    pub fn for_reading(reading: FeedReading) -> Self {
        let variant = if reading.is_empty() {
            AlertVariant::Empty
        } else {
            AlertVariant::Low
        };
        Self { variant, reading }
    }

    pub fn title(&self) -> &'static str {
        match self.variant {
            AlertVariant::Empty => "0 Feed Level! Gimme food!",
            AlertVariant::Low => "Low Feed Level",
        }
    }

    pub fn body(&self) -> String {
        match self.variant {
            AlertVariant::Empty => {
                "Stupid human! Feed level is below threshold: 0%. Refill immediately!".to_string()
            }
            AlertVariant::Low => format!(
                "Feed level is below threshold: {}%. Refill immediately!",
                self.reading.level
            ),
        }
    }

    pub fn to_push_message(&self) -> PushMessage {
        PushMessage::new(self.title(), self.body()).with_action(self.variant.action_tag())
    }
}

/// Edge-triggered Normal/Low state machine.
#[derive(Debug, Default)]
pub struct LevelTracker {
    state: FeedState,
}

impl LevelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes tracking from a previously observed state.
    pub fn starting_at(state: FeedState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    /// Feeds one reading; returns an alert only on a Normal -> Low transition.
    ///
    /// A missing reading leaves the state untouched.
    pub fn observe(&mut self, reading: Option<FeedReading>) -> Option<LowFeedAlert> {
        let reading = reading?;
        match (self.state, reading.is_low()) {
            (FeedState::Normal, true) => {
                self.state = FeedState::Low;
                Some(LowFeedAlert::for_reading(reading))
            }
            (FeedState::Low, true) => None,
            (_, false) => {
                self.state = FeedState::Normal;
                None
            }
        }
    }
}

/// Runs one low-feed watch per device.
///
/// The state of an unwatched device is kept, so watching it again does not alert for a
/// drop that was already reported.
pub struct ThresholdMonitor {
    store: Arc<dyn DocumentStore>,
    notifier: Arc<DeviceNotifier>,
    resubscribe_backoff: Duration,
    devices: Mutex<HashMap<String, WatchHandle>>,
    states: StateBook,
}

impl ThresholdMonitor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifier: Arc<DeviceNotifier>,
        resubscribe_backoff: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            resubscribe_backoff,
            devices: Mutex::new(HashMap::new()),
            states: StateBook::default(),
        }
    }

    /// Starts monitoring `device_id`. Returns `false` if it is already monitored.
    ///
    /// A device whose watch ended after a permanent failure is started again.
    pub async fn watch_device(&self, device_id: &str) -> RelayResult<bool> {
        if !paths::is_valid_device_id(device_id) {
            return Err(RelayError::InvalidDeviceId(device_id.to_string()));
        }

        let mut devices = self.devices.lock().await;
        if let Some(existing) = devices.get(device_id) {
            if !existing.is_finished() {
                return Ok(false);
            }
            debug!("Restarting ended threshold watch of device {}", device_id);
        }

        let target = WatchTarget::Document(paths::device(device_id));
        let feed = ChangeFeed::open(self.store.as_ref(), target)?;
        let token = CancellationToken::new();
        let tracker = LevelTracker::starting_at(self.last_state(device_id));
        let task = tokio::spawn(monitor_device(
            DeviceWatch {
                device_id: device_id.to_string(),
                store: self.store.clone(),
                notifier: self.notifier.clone(),
                backoff: self.resubscribe_backoff,
                states: self.states.clone(),
            },
            tracker,
            feed,
            token.clone(),
        ));
        // Replacing an ended handle drops its gauge.
        devices.insert(
            device_id.to_string(),
            WatchHandle::new(device_id, token, task).counted(THRESHOLD_TOPIC),
        );
        info!("Monitoring feed level of device {}", device_id);
        Ok(true)
    }

    /// Stops monitoring `device_id`. Returns `false` if it was not monitored.
    pub async fn unwatch_device(&self, device_id: &str) -> bool {
        let handle = self.devices.lock().await.remove(device_id);
        match handle {
            Some(handle) => {
                handle.stop().await;
                info!("Stopped monitoring device {}", device_id);
                true
            }
            None => false,
        }
    }

    /// Last state observed for `device_id`, `Normal` if never seen.
    pub fn last_state(&self, device_id: &str) -> FeedState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(device_id).copied())
            .unwrap_or_default()
    }

    pub async fn watched_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.devices.lock().await.keys().cloned().collect();
        devices.sort();
        devices
    }

    pub async fn shutdown(&self) {
        let handles: Vec<(String, WatchHandle)> = self.devices.lock().await.drain().collect();
        for (_, handle) in &handles {
            handle.cancel();
        }
        for (device_id, handle) in handles {
            handle.stop().await;
            debug!("Threshold watch of device {} stopped", device_id);
        }
    }
}

/// Collaborators of one device watch task.
struct DeviceWatch {
    device_id: String,
    store: Arc<dyn DocumentStore>,
    notifier: Arc<DeviceNotifier>,
    backoff: Duration,
    states: StateBook,
}

impl DeviceWatch {
    fn remember(&self, state: FeedState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(self.device_id.clone(), state);
        }
    }
}

async fn monitor_device(
    watch: DeviceWatch,
    mut tracker: LevelTracker,
    mut feed: ChangeFeed,
    token: CancellationToken,
) {
    let DeviceWatch {
        device_id,
        store,
        notifier,
        backoff,
        ..
    } = &watch;
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = feed.next() => event,
        };

        match event {
            Some(FeedEvent::Changes(changes)) => {
                for change in changes {
                    if change.kind == ChangeKind::Removed {
                        continue;
                    }
                    let device = Device::from_document(&change.document);
                    let reading = match device
                        .reading()
                        .ok_or_else(|| RelayError::MalformedDevice(device_id.clone()))
                    {
                        Ok(reading) => reading,
                        Err(e) => {
                            debug!("Skipping update: {}", e);
                            continue;
                        }
                    };
                    if token.is_cancelled() {
                        return;
                    }
                    let alert = tracker.observe(Some(reading));
                    watch.remember(tracker.state());
                    let Some(alert) = alert else {
                        continue;
                    };

                    info!(
                        "Device {} feed level {} is below threshold {}",
                        device_id, reading.level, reading.threshold
                    );
                    metrics::record_notification(alert.variant.as_str());
                    notifier
                        .notify_device(device_id, &alert.to_push_message())
                        .await;
                }
            }
            Some(FeedEvent::Failed(e)) => {
                metrics::record_store_error(e.kind());
                if !e.is_transient() {
                    error!("Threshold watch of device {} failed: {}", device_id, e);
                    break;
                }
                warn!(
                    "Threshold watch of device {} interrupted, re-listening: {}",
                    device_id, e
                );
                let target = WatchTarget::Document(paths::device(device_id));
                match ChangeFeed::reopen(store.as_ref(), &target, *backoff, &token).await {
                    Some(reopened) => feed = reopened,
                    None => break,
                }
            }
            None => break,
        }
    }
    feed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::RecordingDispatcher;
    use crate::relay::CallTimeouts;
    use crate::store::{Fields, InMemoryDocumentStore, StoreError};
    use serde_json::{json, Value};

    fn reading(level: f64, threshold: f64) -> Option<FeedReading> {
        Some(FeedReading { level, threshold })
    }

    #[test]
    fn fires_once_per_drop_below_threshold() {
        let mut tracker = LevelTracker::new();
        let alerts: Vec<_> = [50.0, 3.0, 3.0, 3.0, 60.0, 2.0]
            .into_iter()
            .filter_map(|level| tracker.observe(reading(level, 10.0)))
            .collect();

        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].reading.level, 3.0);
        assert_eq!(alerts[1].reading.level, 2.0);
        assert_eq!(tracker.state(), FeedState::Low);
    }

    #[test]
    fn level_equal_to_threshold_is_normal() {
        let mut tracker = LevelTracker::new();
        assert!(tracker.observe(reading(10.0, 10.0)).is_none());
        assert_eq!(tracker.state(), FeedState::Normal);
    }

    #[test]
    fn missing_readings_do_not_change_state() {
        let mut tracker = LevelTracker::new();
        assert!(tracker.observe(reading(1.0, 10.0)).is_some());
        assert!(tracker.observe(None).is_none());
        assert_eq!(tracker.state(), FeedState::Low);
        assert!(tracker.observe(reading(1.0, 10.0)).is_none());
    }

    #[test]
    fn alert_texts() {
        let empty = LowFeedAlert::for_reading(FeedReading {
            level: 0.0,
            threshold: 10.0,
        });
        assert_eq!(empty.variant, AlertVariant::Empty);
        let message = empty.to_push_message();
        assert_eq!(message.title, "0 Feed Level! Gimme food!");
        assert_eq!(
            message.body,
            "Stupid human! Feed level is below threshold: 0%. Refill immediately!"
        );
        assert_eq!(message.action_tag.as_deref(), Some("zeroFeedAction"));

        let low = LowFeedAlert::for_reading(FeedReading {
            level: 3.0,
            threshold: 10.0,
        });
        let message = low.to_push_message();
        assert_eq!(message.title, "Low Feed Level");
        assert_eq!(
            message.body,
            "Feed level is below threshold: 3%. Refill immediately!"
        );
        assert_eq!(message.action_tag.as_deref(), Some("lowFeedAction"));
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    struct Fixture {
        store: InMemoryDocumentStore,
        dispatcher: Arc<RecordingDispatcher>,
        monitor: ThresholdMonitor,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryDocumentStore::new();
        store
            .set("devices/d1/users/alice", fields(json!({"notificationsEnabled": true})))
            .await
            .unwrap();
        store
            .add("users/alice/device_tokens", fields(json!({"token": "tok-alice"})))
            .await
            .unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());
        let notifier = Arc::new(DeviceNotifier::new(
            shared.clone(),
            dispatcher.clone(),
            CallTimeouts::default(),
        ));
        let monitor = ThresholdMonitor::new(shared, notifier, Duration::from_millis(10));
        Fixture {
            store,
            dispatcher,
            monitor,
        }
    }

    async fn report_level(store: &InMemoryDocumentStore, level: f64) {
        store
            .set(
                "devices/d1",
                fields(json!({"feedLevel": level, "foodLevelThreshold": 10})),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn dispatches_on_each_downward_crossing() {
        let fx = fixture().await;
        assert!(fx.monitor.watch_device("d1").await.unwrap());

        for level in [50.0, 3.0, 3.0, 3.0, 60.0, 2.0] {
            report_level(&fx.store, level).await;
        }

        assert_eq!(fx.dispatcher.dispatch_count(), 2);
        fx.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn watch_device_is_idempotent() {
        let fx = fixture().await;
        assert!(fx.monitor.watch_device("d1").await.unwrap());
        assert!(!fx.monitor.watch_device("d1").await.unwrap());
        assert_eq!(fx.monitor.watched_devices().await, vec!["d1".to_string()]);
        assert_eq!(fx.store.listener_count(), 1);

        assert!(fx.monitor.unwatch_device("d1").await);
        assert!(!fx.monitor.unwatch_device("d1").await);
        assert_eq!(fx.store.listener_count(), 0);
    }

    #[tokio::test]
    async fn malformed_documents_are_skipped() {
        let fx = fixture().await;
        fx.monitor.watch_device("d1").await.unwrap();

        fx.store
            .set("devices/d1", fields(json!({"feedLevel": "empty"})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.dispatcher.dispatch_count(), 0);

        report_level(&fx.store, 1.0).await;
        assert_eq!(fx.dispatcher.dispatch_count(), 1);
        fx.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn resubscribing_keeps_tracker_state() {
        let fx = fixture().await;
        fx.monitor.watch_device("d1").await.unwrap();
        report_level(&fx.store, 2.0).await;
        assert_eq!(fx.dispatcher.dispatch_count(), 1);

        fx.store
            .fail_listeners(StoreError::Unavailable("stream reset".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The re-listen snapshot repeats the low reading without a second alert.
        assert_eq!(fx.store.listener_count(), 1);
        assert_eq!(fx.dispatcher.dispatch_count(), 1);
        fx.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn ended_watch_is_replaced_on_watch_device() {
        let fx = fixture().await;
        assert!(fx.monitor.watch_device("d1").await.unwrap());

        fx.store
            .fail_listeners(StoreError::PermissionDenied("rules changed".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.store.listener_count(), 0);

        assert!(fx.monitor.watch_device("d1").await.unwrap());
        assert_eq!(fx.monitor.watched_devices().await, vec!["d1".to_string()]);
        assert_eq!(fx.store.listener_count(), 1);

        report_level(&fx.store, 2.0).await;
        assert_eq!(fx.dispatcher.dispatch_count(), 1);
        fx.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn rewatching_a_low_device_does_not_alert_again() {
        let fx = fixture().await;
        fx.monitor.watch_device("d1").await.unwrap();
        report_level(&fx.store, 2.0).await;
        assert_eq!(fx.dispatcher.dispatch_count(), 1);

        assert!(fx.monitor.unwatch_device("d1").await);
        assert_eq!(fx.monitor.last_state("d1"), FeedState::Low);

        fx.monitor.watch_device("d1").await.unwrap();
        report_level(&fx.store, 1.0).await;
        assert_eq!(fx.dispatcher.dispatch_count(), 1);

        report_level(&fx.store, 50.0).await;
        report_level(&fx.store, 4.0).await;
        assert_eq!(fx.dispatcher.dispatch_count(), 2);
        fx.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_all_watches() {
        let fx = fixture().await;
        fx.monitor.watch_device("d1").await.unwrap();
        fx.monitor.watch_device("d2").await.unwrap();
        assert_eq!(fx.store.listener_count(), 2);

        fx.monitor.shutdown().await;
        assert_eq!(fx.store.listener_count(), 0);
        assert!(fx.monitor.watched_devices().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_device_ids() {
        let fx = fixture().await;
        assert!(matches!(
            fx.monitor.watch_device("").await,
            Err(RelayError::InvalidDeviceId(_))
        ));
    }
}
