//! WebSocket transport for relay clients.
//!
//! Clients send `subscribeHistories` and `ping` envelopes and receive device events on
//! the same socket.

pub mod connection;
pub mod handler;
pub mod messages;

pub use connection::{ConnectionId, ConnectionManager, SendError};
pub use handler::ws_handler;
pub use messages::{ClientMessage, ServerMessage};
