use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::metrics::metrics_handler;
use super::state::ServerState;
use super::websocket::ws_handler;
use crate::relay::RelayHub;

#[derive(Serialize)]
struct HealthStats {
    pub status: &'static str,
    pub uptime: String,
    pub connections: usize,
    pub watches: usize,
    pub monitored_devices: usize,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn health(State(state): State<ServerState>) -> Json<HealthStats> {
    let hub = &state.hub;
    Json(HealthStats {
        status: "ok",
        uptime: format_uptime(state.start_time.elapsed()),
        connections: hub.connections().connection_count().await,
        watches: hub.registry().watch_count().await,
        monitored_devices: hub.monitor().watched_devices().await.len(),
    })
}

pub fn make_app(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves the relay until `shutdown` is cancelled.
pub async fn run_server(
    hub: Arc<RelayHub>,
    bind_address: &str,
    port: u16,
    metrics_port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = make_app(ServerState::new(hub));

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", bind_address, port))
        .await
        .with_context(|| format!("Failed to bind relay listener on port {}", port))?;
    let metrics_listener = tokio::net::TcpListener::bind(format!("{}:{}", bind_address, metrics_port))
        .await
        .with_context(|| format!("Failed to bind metrics listener on port {}", metrics_port))?;

    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let served = axum::serve(metrics_listener, make_metrics_app())
            .with_graceful_shutdown(async move { metrics_shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            error!("Metrics server failed: {}", e);
        }
    });

    info!("Relay listening on {}:{}", bind_address, port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Relay server stopped");
    Ok(())
}
