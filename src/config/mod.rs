mod file_config;

pub use file_config::{FileConfig, PushConfig, RelayConfig};

use crate::devices::paths::is_valid_device_id;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub port: u16,
    pub metrics_port: u16,
    pub bind_address: Option<String>,
    pub seed_file: Option<PathBuf>,
    pub push_url: Option<String>,
    pub push_api_key: Option<String>,
    pub push_timeout_sec: u64,
    pub store_timeout_sec: u64,
    pub monitored_devices: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub port: u16,
    pub metrics_port: u16,
    pub bind_address: String,
    pub seed_file: Option<PathBuf>,

    // Feature configs (with defaults)
    pub relay: RelaySettings,
    pub push: PushSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        if port != 0 && port == metrics_port {
            bail!("port and metrics_port must differ (both are {})", port);
        }

        let bind_address = file
            .bind_address
            .or_else(|| cli.bind_address.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        let seed_file = file
            .seed_file
            .map(PathBuf::from)
            .or_else(|| cli.seed_file.clone());
        if let Some(seed_file) = &seed_file {
            if !seed_file.is_file() {
                bail!("Seed file does not exist: {:?}", seed_file);
            }
        }

        // Relay settings - merge file config with CLI and defaults
        let defaults = RelaySettings::default();
        let relay_file = file.relay.unwrap_or_default();
        let cli_store_timeout = if cli.store_timeout_sec > 0 {
            cli.store_timeout_sec
        } else {
            defaults.store_timeout_sec
        };
        let relay = RelaySettings {
            store_timeout_sec: relay_file.store_timeout_sec.unwrap_or(cli_store_timeout),
            resubscribe_backoff_ms: relay_file
                .resubscribe_backoff_ms
                .unwrap_or(defaults.resubscribe_backoff_ms),
            outgoing_queue_capacity: relay_file
                .outgoing_queue_capacity
                .unwrap_or(defaults.outgoing_queue_capacity),
            forward_device_documents: relay_file
                .forward_device_documents
                .unwrap_or(defaults.forward_device_documents),
            auto_monitor_subscribed_devices: relay_file
                .auto_monitor_subscribed_devices
                .unwrap_or(defaults.auto_monitor_subscribed_devices),
            monitored_devices: relay_file
                .monitored_devices
                .unwrap_or_else(|| cli.monitored_devices.clone()),
            notify_cart_changes: relay_file
                .notify_cart_changes
                .unwrap_or(defaults.notify_cart_changes),
        };
        if relay.store_timeout_sec == 0 {
            bail!("relay.store_timeout_sec must be greater than 0");
        }
        if relay.outgoing_queue_capacity == 0 {
            bail!("relay.outgoing_queue_capacity must be greater than 0");
        }
        if let Some(bad) = relay
            .monitored_devices
            .iter()
            .find(|id| !is_valid_device_id(id))
        {
            bail!("Invalid device id in monitored_devices: {:?}", bad);
        }

        // Push settings - TOML [push] section takes precedence over CLI args
        let push_file = file.push.unwrap_or_default();
        let push = PushSettings {
            url: push_file.url.or_else(|| cli.push_url.clone()),
            api_key: push_file.api_key.or_else(|| cli.push_api_key.clone()),
            timeout_sec: push_file.timeout_sec.unwrap_or(if cli.push_timeout_sec > 0 {
                cli.push_timeout_sec
            } else {
                PushSettings::default().timeout_sec
            }),
        };
        if let Some(url) = &push.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("Push gateway url must be http(s): {}", url);
            }
        }
        if push.timeout_sec == 0 {
            bail!("push.timeout_sec must be greater than 0");
        }

        Ok(Self {
            port,
            metrics_port,
            bind_address,
            seed_file,
            relay,
            push,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub store_timeout_sec: u64,
    /// Delay before re-listening after a transient store failure.
    pub resubscribe_backoff_ms: u64,
    pub outgoing_queue_capacity: usize,
    /// Also relay raw device documents as `device` events.
    pub forward_device_documents: bool,
    /// Start low-feed monitoring for every device a client subscribes to.
    pub auto_monitor_subscribed_devices: bool,
    /// Devices monitored from startup, subscribed or not.
    pub monitored_devices: Vec<String>,
    /// Push cart item changes to the user who created the item.
    pub notify_cart_changes: bool,
}

impl RelaySettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_sec)
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            store_timeout_sec: 10,
            resubscribe_backoff_ms: 2000,
            outgoing_queue_capacity: 64,
            forward_device_documents: false,
            auto_monitor_subscribed_devices: true,
            monitored_devices: Vec::new(),
            notify_cart_changes: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_sec: u64,
}

impl PushSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_sec: 10,
        }
    }
}
