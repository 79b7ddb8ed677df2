mod server;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use cavisense_core::{logging, Config};
use cavisense_relay::{
    Broker, MemoryBroker, MemorySnapshotStore, RedisBroker, RedisSnapshotStore, RelaySettings,
    SensorRelay, SnapshotStore,
};

use server::CavisenseServer;

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    // Add random suffix for uniqueness
    let suffix = nanoid::nanoid!(6);

    format!("{hostname}-{suffix}")
}

/// Load configuration: env var path > CWD > /config/ mount > environment only
fn load_config() -> Config {
    let config_path = std::env::var("CAVISENSE_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        match Config::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load {path}: {e}");
                eprintln!("Falling back to environment variables");
                Config::from_env().unwrap_or_default()
            }
        }
    } else {
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    }
}

/// Build the snapshot store and broker for this process
fn build_links(config: &Config) -> Result<(Arc<dyn SnapshotStore>, Arc<dyn Broker>)> {
    if !config.redis.enabled {
        warn!("Redis disabled, running in single-node mode with in-memory store and broker");
        return Ok((Arc::new(MemorySnapshotStore::new()), Arc::new(MemoryBroker::new())));
    }

    let url = config.redis.connection_url();
    let timeout = Duration::from_secs(config.redis.timeout_seconds);

    let store = RedisSnapshotStore::new(&url, timeout)?;
    let broker = RedisBroker::new(&url, timeout)?;
    info!(
        host = %config.redis.host,
        port = config.redis.port,
        from_url = !config.redis.url.trim().is_empty(),
        "Using Redis for snapshot store and broker"
    );

    Ok((Arc::new(store), Arc::new(broker)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = load_config();

    // 1.5. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;

    let node_id = generate_node_id();
    info!(node_id = %node_id, "Cavisense relay starting...");
    info!("HTTP address: {}", config.http_address());
    info!("Push channel address: {}{}", config.push_address(), config.push.path);

    // 3. Store and broker links
    let (store, broker) = build_links(&config)?;

    // 4. Relay
    let relay = Arc::new(SensorRelay::new(
        node_id,
        RelaySettings::from(&config.relay),
        store.clone(),
        broker.clone(),
    ));
    relay.start();

    // 5. Serve until shutdown; the server closes the links it was handed
    CavisenseServer::new(Arc::new(config), relay, store, broker)
        .start()
        .await
}
