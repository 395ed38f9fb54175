//! Test server lifecycle management
//!
//! Each test gets an isolated relay on a random port, backed by its own in-memory store
//! and a recording push dispatcher.

#![allow(dead_code)]

use super::constants::*;
use feeder_relay::config::RelaySettings;
use feeder_relay::push::RecordingDispatcher;
use feeder_relay::server::make_app;
use feeder_relay::server::state::ServerState;
use feeder_relay::store::{DocumentStore, Fields, InMemoryDocumentStore};
use feeder_relay::RelayHub;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Test relay instance. Dropping it shuts the server down.
pub struct TestServer {
    /// Base URL for HTTP requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// WebSocket endpoint URL
    pub ws_url: String,

    /// Store shared with the relay, for writing device data directly
    pub store: InMemoryDocumentStore,

    /// Every push batch the relay dispatched
    pub dispatcher: Arc<RecordingDispatcher>,

    pub hub: Arc<RelayHub>,

    shutdown: CancellationToken,
}

impl TestServer {
    /// Spawns a relay on a random port with a follower seeded for [`FEEDER_ID`].
    pub async fn spawn() -> Self {
        Self::spawn_with(RelaySettings {
            resubscribe_backoff_ms: 20,
            ..RelaySettings::default()
        })
        .await
    }

    pub async fn spawn_with(settings: RelaySettings) -> Self {
        let store = InMemoryDocumentStore::new();
        seed_follower(&store).await;

        let dispatcher = Arc::new(RecordingDispatcher::new());
        let hub = Arc::new(RelayHub::new(
            Arc::new(store.clone()),
            dispatcher.clone(),
            &settings,
            Duration::from_secs(2),
        ));

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        let app = make_app(ServerState::new(hub.clone()));
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url: format!("http://127.0.0.1:{}", port),
            ws_url: format!("ws://127.0.0.1:{}/ws", port),
            store,
            dispatcher,
            hub,
            shutdown,
        };
        server.wait_for_ready().await;
        server
    }

    /// Writes the device document, replacing it.
    pub async fn report_device(&self, device_id: &str, data: Value) {
        self.store
            .set(&format!("devices/{}", device_id), fields(data))
            .await
            .expect("Failed to write device");
    }

    pub async fn report_level(&self, device_id: &str, level: u64) {
        self.report_device(
            device_id,
            json!({ "feedLevel": level, "foodLevelThreshold": FEED_THRESHOLD }),
        )
        .await;
    }

    /// Appends a history entry and returns its id.
    pub async fn add_history(&self, device_id: &str, data: Value) -> String {
        self.store
            .add(&format!("devices/{}/histories", device_id), fields(data))
            .await
            .expect("Failed to add history")
            .id
    }

    pub async fn notification_count(&self, device_id: &str) -> usize {
        self.store
            .query(&feeder_relay::store::Query::collection(format!(
                "devices/{}/notifications",
                device_id
            )))
            .await
            .expect("Failed to query notifications")
            .len()
    }

    /// Waits until the relay has no live watch left.
    pub async fn wait_for_watch_count(&self, expected: usize) {
        let start = std::time::Instant::now();
        while self.hub.registry().watch_count().await != expected {
            if start.elapsed() > Duration::from_millis(MESSAGE_TIMEOUT_MS) {
                panic!("watch count did not reach {}", expected);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn fields(value: Value) -> Fields {
    value.as_object().cloned().expect("fields must be an object")
}

async fn seed_follower(store: &InMemoryDocumentStore) {
    store
        .set(
            &format!("devices/{}/users/{}", FEEDER_ID, FOLLOWER_USER_ID),
            fields(json!({ "notificationsEnabled": true })),
        )
        .await
        .expect("Failed to seed follower");
    store
        .add(
            &format!("users/{}/device_tokens", FOLLOWER_USER_ID),
            fields(json!({ "token": FOLLOWER_TOKEN })),
        )
        .await
        .expect("Failed to seed push token");
}
