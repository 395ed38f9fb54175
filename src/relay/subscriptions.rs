//! Per-connection subscription bookkeeping.
//!
//! Each connection holds at most one watch per [`Topic`]. Replacing or releasing a watch
//! cancels it and waits for its task to finish, so no event for the old watch is queued
//! after the call returns.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{RelayError, RelayResult};
use crate::server::metrics;
use crate::server::websocket::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Histories,
    Schedule,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Histories => "histories",
            Topic::Schedule => "schedule",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running watch: its cancellation token and the task delivering its events.
pub struct WatchHandle {
    device_id: String,
    token: CancellationToken,
    task: JoinHandle<()>,
    gauge: Option<metrics::WatchGauge>,
}

impl WatchHandle {
    pub fn new(device_id: impl Into<String>, token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            device_id: device_id.into(),
            token,
            task,
            gauge: None,
        }
    }

    /// Counts this watch in the `active_watches` gauge under `topic` until it is dropped.
    pub fn counted(mut self, topic: &'static str) -> Self {
        self.gauge = Some(metrics::WatchGauge::open(topic));
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Signals the watch to stop. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the watch task ended, on its own or after a cancel.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the watch and waits until its task is gone.
    pub async fn stop(self) {
        self.cancel();
        let _ = self.task.await;
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("device_id", &self.device_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Maps connection -> topic -> live watch.
#[derive(Default)]
pub struct SubscriptionRegistry {
    connections: RwLock<HashMap<ConnectionId, HashMap<Topic, WatchHandle>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a connection with no watches.
    pub async fn open(&self, connection: ConnectionId) {
        self.connections
            .write()
            .await
            .entry(connection)
            .or_default();
    }

    pub async fn is_open(&self, connection: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&connection)
    }

    /// Installs the watch built by `start` for `topic`, replacing any previous one.
    ///
    /// The previous watch is cancelled before `start` runs and has fully stopped when
    /// this returns, whether or not `start` succeeded.
    pub async fn subscribe<F>(
        &self,
        connection: ConnectionId,
        topic: Topic,
        start: F,
    ) -> RelayResult<()>
    where
        F: FnOnce() -> RelayResult<WatchHandle>,
    {
        let (previous, result) = {
            let mut connections = self.connections.write().await;
            let watches = connections
                .get_mut(&connection)
                .ok_or(RelayError::ConnectionClosed(connection))?;

            let previous = watches.remove(&topic);
            if let Some(previous) = &previous {
                previous.cancel();
            }

            let result = match start() {
                Ok(handle) => {
                    debug!(
                        "{} watching {} of device {}",
                        connection,
                        topic,
                        handle.device_id()
                    );
                    watches.insert(topic, handle.counted(topic.as_str()));
                    Ok(())
                }
                Err(e) => Err(e),
            };
            (previous, result)
        };

        if let Some(previous) = previous {
            debug!(
                "{} replaced {} watch of device {}",
                connection,
                topic,
                previous.device_id()
            );
            previous.stop().await;
        }
        result
    }

    /// Cancels and forgets every watch of `connection`.
    ///
    /// Returns the number of watches released, or `None` if the connection was already
    /// gone. Every released task has stopped when this returns.
    pub async fn unsubscribe_all(&self, connection: ConnectionId) -> Option<usize> {
        let watches = self.connections.write().await.remove(&connection)?;
        for handle in watches.values() {
            handle.cancel();
        }

        let released = watches.len();
        for handle in watches.into_values() {
            handle.stop().await;
        }
        debug!("{} released {} watches", connection, released);
        Some(released)
    }

    /// Topics and device ids currently watched by `connection`.
    pub async fn active_watches(&self, connection: ConnectionId) -> Vec<(Topic, String)> {
        let connections = self.connections.read().await;
        let mut watches: Vec<_> = connections
            .get(&connection)
            .map(|watches| {
                watches
                    .iter()
                    .map(|(topic, handle)| (*topic, handle.device_id().to_string()))
                    .collect()
            })
            .unwrap_or_default();
        watches.sort();
        watches
    }

    /// Device `connection` watches on `topic`, if any.
    pub async fn watched_device(&self, connection: ConnectionId, topic: Topic) -> Option<String> {
        self.connections
            .read()
            .await
            .get(&connection)?
            .get(&topic)
            .map(|handle| handle.device_id().to_string())
    }

    /// Number of connections watching `device_id` on `topic`.
    pub async fn watchers_of(&self, topic: Topic, device_id: &str) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|watches| {
                watches
                    .get(&topic)
                    .is_some_and(|handle| handle.device_id() == device_id)
            })
            .count()
    }

    /// Total number of live watches across all connections.
    pub async fn watch_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .map(HashMap::len)
            .sum()
    }
}
