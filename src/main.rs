use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use feeder_relay::config::{AppConfig, CliConfig, FileConfig};
use feeder_relay::push::{HttpPushDispatcher, LogOnlyDispatcher, NotificationDispatcher};
use feeder_relay::server::{metrics, run_server};
use feeder_relay::store::{DocumentStore, InMemoryDocumentStore};
use feeder_relay::RelayHub;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3000)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Address to bind both listeners to.
    #[clap(long)]
    pub bind_address: Option<String>,

    /// JSON file of `{ "<document path>": { fields } }` loaded into the store at startup.
    #[clap(long, value_parser = parse_path)]
    pub seed_file: Option<PathBuf>,

    /// URL of the push gateway. Notifications are only logged when unset.
    #[clap(long)]
    pub push_url: Option<String>,

    /// Bearer key sent to the push gateway.
    #[clap(long)]
    pub push_api_key: Option<String>,

    /// Timeout in seconds for push gateway requests.
    #[clap(long, default_value_t = 10)]
    pub push_timeout_sec: u64,

    /// Timeout in seconds for document store calls.
    #[clap(long, default_value_t = 10)]
    pub store_timeout_sec: u64,

    /// Device to monitor for low feed level from startup. Repeatable.
    #[clap(long = "monitor-device")]
    pub monitored_devices: Vec<String>,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            port: self.port,
            metrics_port: self.metrics_port,
            bind_address: self.bind_address.clone(),
            seed_file: self.seed_file.clone(),
            push_url: self.push_url.clone(),
            push_api_key: self.push_api_key.clone(),
            push_timeout_sec: self.push_timeout_sec,
            store_timeout_sec: self.store_timeout_sec,
            monitored_devices: self.monitored_devices.clone(),
        }
    }
}

fn load_store(config: &AppConfig) -> Result<InMemoryDocumentStore> {
    let store = InMemoryDocumentStore::new();
    if let Some(seed_file) = &config.seed_file {
        let content = std::fs::read_to_string(seed_file)
            .with_context(|| format!("Failed to read seed file: {:?}", seed_file))?;
        let documents: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse seed file: {:?}", seed_file))?;
        let written = store
            .seed(&documents)
            .with_context(|| format!("Invalid seed file: {:?}", seed_file))?;
        info!("Seeded {} documents from {:?}", written, seed_file);
    }
    Ok(store)
}

fn make_dispatcher(config: &AppConfig) -> Result<Arc<dyn NotificationDispatcher>> {
    match &config.push.url {
        Some(url) => {
            info!("Push gateway configured at {}", url);
            let dispatcher =
                HttpPushDispatcher::new(url.clone(), config.push.api_key.clone(), config.push.timeout())?;
            Ok(Arc::new(dispatcher))
        }
        None => {
            warn!("No push gateway configured, notifications will only be logged");
            Ok(Arc::new(LogOnlyDispatcher))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}...", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    let store: Arc<dyn DocumentStore> = Arc::new(load_store(&config)?);
    let dispatcher = make_dispatcher(&config)?;
    let hub = Arc::new(RelayHub::new(
        store,
        dispatcher,
        &config.relay,
        config.push.timeout(),
    ));

    for device_id in &config.relay.monitored_devices {
        if let Err(e) = hub.monitor().watch_device(device_id).await {
            error!("Failed to monitor device {}: {}", device_id, e);
        }
    }

    if config.relay.notify_cart_changes {
        if let Err(e) = hub.carts().start().await {
            error!("Failed to watch carts: {}", e);
        }
    }

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        signal_shutdown.cancel();
    });

    info!("Ready to serve at port {}!", config.port);
    info!("Metrics available at port {}!", config.metrics_port);
    let served = run_server(
        hub.clone(),
        &config.bind_address,
        config.port,
        config.metrics_port,
        shutdown,
    )
    .await;

    hub.shutdown().await;
    served
}
