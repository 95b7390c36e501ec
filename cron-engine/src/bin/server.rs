//! Full notary daemon: server core plus the cron engine run loop

use cron_engine::{CronConfig, CronEngine};
use notary_core::crypto::KeyPair;
use notary_core::{Config, ServerCore};
use std::error::Error;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting notary cron server");

    // Load configuration (file paths via env, else defaults)
    let config = match std::env::var("NOTARY_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::from_env()?,
    };
    let cron_config = match std::env::var("CRON_CONFIG") {
        Ok(path) => CronConfig::from_file(path)?,
        Err(_) => CronConfig::default(),
    };

    // Signed nymboxes must verify across restarts, so the signing seed
    // is persisted rather than generated per process
    let keys = KeyPair::load_or_generate(&config.key_file)?;

    let core = Arc::new(ServerCore::open(config, keys)?);
    let engine = Arc::new(CronEngine::open(
        cron_config,
        core.authority(),
        core.delivery(),
        core.accounts(),
        core.storage(),
        core.metrics().clone(),
    )?);
    tracing::info!(notary_id = %core.notary_id(), "Server core and cron engine ready");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let cron_task = tokio::spawn(engine.run(shutdown_rx));

    // Run until interrupted, then drain in-flight operations
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down notary cron server");
    // Stop the run loop between ticks; aborting the task could cut a
    // tick off between a funds transfer and its item write-back
    let _ = shutdown_tx.send(true);
    cron_task.await?;
    core.shutdown().await;

    Ok(())
}
