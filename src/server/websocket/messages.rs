//! WebSocket message types.
//!
//! Every frame in either direction is a JSON envelope `{ "event": ..., "data": ... }`.

use serde::{Deserialize, Serialize};

/// Server -> Client message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    /// Event name (e.g. "newHistory", "feedingSchedule")
    pub event: String,
    /// Event payload
    pub data: serde_json::Value,
}

impl ServerMessage {
    /// Create a new server message with the given event name and payload.
    pub fn new(event: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            event: event.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Create a server message with a null payload.
    pub fn empty(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: serde_json::Value::Null,
        }
    }

    /// `error` event; the payload is a plain string.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: events::ERROR.to_string(),
            data: serde_json::Value::String(message.into()),
        }
    }
}

/// Client -> Server message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientMessage {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Event names.
pub mod events {
    /// Client asks for a device's histories and feeding schedule.
    pub const SUBSCRIBE_HISTORIES: &str = "subscribeHistories";
    /// Client heartbeat request.
    pub const PING: &str = "ping";
    /// Server heartbeat response.
    pub const PONG: &str = "pong";
    /// Newest history entry of a subscribed device.
    pub const NEW_HISTORY: &str = "newHistory";
    /// Changed feeding schedule of a subscribed device.
    pub const FEEDING_SCHEDULE: &str = "feedingSchedule";
    /// Full device document (optional passthrough).
    pub const DEVICE: &str = "device";
    /// Server error response.
    pub const ERROR: &str = "error";
}
