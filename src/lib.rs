//! Feeder Relay Library
//!
//! Relays smart pet feeder activity from the document store to WebSocket clients and
//! sends low feed-level push notifications. Modules are exposed for the binary and for
//! end-to-end tests.

pub mod config;
pub mod devices;
pub mod push;
pub mod relay;
pub mod server;
pub mod store;

// Re-export commonly used types for convenience
pub use config::{AppConfig, CliConfig, FileConfig};
pub use push::{HttpPushDispatcher, LogOnlyDispatcher, NotificationDispatcher, RecordingDispatcher};
pub use relay::RelayHub;
pub use server::run_server;
pub use store::{DocumentStore, InMemoryDocumentStore};
