//! Strata Server - HTTP control surface and compaction trigger for the storage engine

mod api;

use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use strata_core::storage::{StorageConfig, StorageEngine};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Emit JSON log lines
    pub json_logs: bool,
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8086)),
            json_logs: false,
            storage: StorageConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read the JSON file named by the first argument, or use defaults
    fn from_args() -> anyhow::Result<Self> {
        let Some(path) = std::env::args().nth(1) else {
            return Ok(Self::default());
        };
        let data = std::fs::read(&path)?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path, e))?;
        config.storage.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_args()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if config.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Starting Strata server...");
    info!("Data directory: {:?}", config.storage.data_dir);

    // Opening runs crash recovery for every partition
    let engine = Arc::new(StorageEngine::open(config.storage.clone())?);
    info!(
        "Loaded {} storage groups",
        engine.list_storage_groups().len()
    );

    let trigger = tokio::spawn(compaction_trigger(Arc::clone(&engine)));

    // Create router
    let app = api::create_router(Arc::clone(&engine));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("Strata server listening on http://{}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    trigger.abort();
    let engine_for_shutdown = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || engine_for_shutdown.shutdown()).await??;
    info!("Strata server stopped");
    Ok(())
}

/// Periodic compaction scheduling; the period follows the live settings
async fn compaction_trigger(engine: Arc<StorageEngine>) {
    let mut period = engine.compaction_config().compaction_interval_ms.max(1);
    let mut interval = tokio::time::interval(Duration::from_millis(period));
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let cycle_engine = Arc::clone(&engine);
        if let Err(e) =
            tokio::task::spawn_blocking(move || cycle_engine.schedule_compaction()).await
        {
            error!("Compaction cycle panicked: {}", e);
        }

        let configured = engine.compaction_config().compaction_interval_ms.max(1);
        if configured != period {
            period = configured;
            interval = tokio::time::interval(Duration::from_millis(period));
            interval.tick().await;
            info!("Compaction interval changed to {}ms", period);
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
