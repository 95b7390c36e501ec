//! Notary server binary

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

    tracing::info!("Starting notary server");

    // Load configuration (file path via NOTARY_CONFIG, else env/defaults)
    let config = match std::env::var("NOTARY_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::from_env()?,
    };

    // Signed nymboxes must verify across restarts, so the signing seed
    // is persisted rather than generated per process
    let keys = KeyPair::load_or_generate(&config.key_file)?;

    let core = Arc::new(ServerCore::open(config, keys)?);
    tracing::info!(notary_id = %core.notary_id(), "Server core ready");

    // Run until interrupted, then drain in-flight operations
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down notary server");
    core.shutdown().await;

    Ok(())
}
