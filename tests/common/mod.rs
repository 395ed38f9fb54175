//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestServer, WsClient, FEEDER_ID};
//!
//! #[tokio::test]
//! async fn test_ping() {
//!     let server = TestServer::spawn().await;
//!     let mut client = WsClient::connect(&server.ws_url).await;
//!     client.send_event("ping", serde_json::Value::Null).await;
//!     assert!(client.wait_for("pong").await.is_some());
//! }
//! ```

mod client;
mod constants;
mod server;

// Public API - this is what tests import
pub use client::WsClient;
pub use constants::*;
pub use server::TestServer;
