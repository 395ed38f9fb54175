//! WebSocket connection manager.
//!
//! Tracks all open client connections. Each connection owns a bounded outgoing queue
//! drained by a single writer task, so messages from concurrent watches on the same
//! connection are never interleaved.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};

use super::messages::ServerMessage;
use crate::server::metrics;

/// Default capacity of a connection's outgoing queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Process-unique identifier of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Error type for send operations.
#[derive(Debug, Clone, PartialEq)]
pub enum SendError {
    /// The connection is not registered.
    NotConnected,
    /// The writer side is gone (client disconnected).
    Disconnected,
}

/// Manages all open WebSocket connections.
pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the connection id and the receiver for outgoing messages. The caller
    /// forwards messages from this receiver to the socket.
    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut conns = self.connections.write().await;
        conns.insert(id, tx);
        metrics::set_active_connections(conns.len());

        (id, rx)
    }

    /// Unregister a connection. Returns false if it was not registered.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut conns = self.connections.write().await;
        let removed = conns.remove(&id).is_some();
        metrics::set_active_connections(conns.len());
        removed
    }

    /// Queue a message for one connection.
    ///
    /// Waits for queue capacity; the table lock is not held while waiting.
    pub async fn send_to_connection(
        &self,
        id: ConnectionId,
        message: ServerMessage,
    ) -> Result<(), SendError> {
        let sender = {
            let conns = self.connections.read().await;
            conns.get(&id).cloned().ok_or(SendError::NotConnected)?
        };
        let event = message.event.clone();
        sender
            .send(message)
            .await
            .map_err(|_| SendError::Disconnected)?;
        metrics::record_message_sent(&event);
        Ok(())
    }

    /// Check if a connection is registered.
    pub async fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Get the number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
