use anyhow::Result;
use conductor_core::config::Config;
use conductor_core::coordination::{CoordinationStore, RedisCoordinationStore};
use conductor_core::lock::LockConfig;
use conductor_core::orchestrator::SessionOrchestrator;
use conductor_core::store::MemoryEngine;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting Conductor Core orchestration control plane");

    let config = Config::load()?;

    let coordination: Arc<dyn CoordinationStore> =
        Arc::new(RedisCoordinationStore::connect(&config.coordination.url()).await?);
    let engine = Arc::new(MemoryEngine::new());
    let orchestrator = SessionOrchestrator::with_config(
        engine,
        coordination,
        LockConfig::default(),
        config.orchestrator,
    );

    let sweeper = tokio::spawn(orchestrator.registry().clone().run_sweeper());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = sweeper => {
            if let Err(e) = result {
                tracing::error!("Heartbeat sweeper failed: {}", e);
            }
        }
    }

    info!("Conductor Core shutdown complete");
    Ok(())
}
