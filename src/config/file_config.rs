use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub bind_address: Option<String>,
    pub seed_file: Option<String>,

    // Feature configs
    pub relay: Option<RelayConfig>,
    pub push: Option<PushConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RelayConfig {
    pub store_timeout_sec: Option<u64>,
    pub resubscribe_backoff_ms: Option<u64>,
    pub outgoing_queue_capacity: Option<usize>,
    pub forward_device_documents: Option<bool>,
    pub auto_monitor_subscribed_devices: Option<bool>,
    pub monitored_devices: Option<Vec<String>>,
    pub notify_cart_changes: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PushConfig {
    /// Push gateway endpoint; notifications are only logged when unset.
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_sec: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
