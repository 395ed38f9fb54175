pub mod metrics;
#[allow(clippy::module_inception)]
pub mod server;
pub mod state;
pub mod websocket;

pub use server::{make_app, make_metrics_app, run_server};
