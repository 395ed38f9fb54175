use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

/// Metric name prefix for all relay metrics
const PREFIX: &str = "feeder_relay";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Connection Metrics
    pub static ref ACTIVE_CONNECTIONS: Gauge = Gauge::new(
        format!("{PREFIX}_active_connections"),
        "Number of open client connections"
    ).expect("Failed to create active_connections metric");

    pub static ref ACTIVE_WATCHES: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_active_watches"), "Live store watches by topic"),
        &["topic"]
    ).expect("Failed to create active_watches metric");

    pub static ref MESSAGES_SENT_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_messages_sent_total"), "Messages queued to clients"),
        &["event"]
    ).expect("Failed to create messages_sent_total metric");

    // Notification Metrics
    pub static ref NOTIFICATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_notifications_total"), "Low feed notifications by variant"),
        &["variant"]
    ).expect("Failed to create notifications_total metric");

    pub static ref PUSH_DELIVERIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_push_deliveries_total"), "Push deliveries by status"),
        &["status"]
    ).expect("Failed to create push_deliveries_total metric");

    // Store Metrics
    pub static ref STORE_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_store_errors_total"), "Document store errors by kind"),
        &["kind"]
    ).expect("Failed to create store_errors_total metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(ACTIVE_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_WATCHES.clone()));
    let _ = REGISTRY.register(Box::new(MESSAGES_SENT_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(NOTIFICATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PUSH_DELIVERIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STORE_ERRORS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn set_active_connections(count: usize) {
    ACTIVE_CONNECTIONS.set(count as f64);
}

pub fn watch_opened(topic: &str) {
    ACTIVE_WATCHES.with_label_values(&[topic]).inc();
}

pub fn watch_closed(topic: &str) {
    ACTIVE_WATCHES.with_label_values(&[topic]).dec();
}

/// Counts one live watch under `topic` until dropped.
#[derive(Debug)]
pub struct WatchGauge {
    topic: &'static str,
}

impl WatchGauge {
    pub fn open(topic: &'static str) -> Self {
        watch_opened(topic);
        Self { topic }
    }
}

impl Drop for WatchGauge {
    fn drop(&mut self) {
        watch_closed(self.topic);
    }
}

pub fn record_message_sent(event: &str) {
    MESSAGES_SENT_TOTAL.with_label_values(&[event]).inc();
}

pub fn record_notification(variant: &str) {
    NOTIFICATIONS_TOTAL.with_label_values(&[variant]).inc();
}

pub fn record_push_deliveries(delivered: usize, failed: usize) {
    PUSH_DELIVERIES_TOTAL
        .with_label_values(&["delivered"])
        .inc_by(delivered as f64);
    PUSH_DELIVERIES_TOTAL
        .with_label_values(&["failed"])
        .inc_by(failed as f64);
}

pub fn record_store_error(kind: &str) {
    STORE_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
