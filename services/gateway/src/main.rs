//! Edge gateway binary.
//!
//! Loads the TOML layout named by `EDGE_CONFIG`, binds one listener per
//! `[[server]]` and serves until interrupted.

use anyhow::{Context, Result};
use edge_gateway::{Config, FileConfig, Gateway};
use edge_networking::ResolverConfig;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to EDGE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting edge gateway");

    let file = FileConfig::load(&config.config_path)
        .with_context(|| format!("loading {}", config.config_path.display()))?;
    info!(
        config_path = %config.config_path.display(),
        server_count = file.server.len(),
        parent_proxy = file.upstream.is_some(),
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let resolver = ResolverConfig::system();
    info!(servers = ?resolver.servers, "DNS resolvers");

    let gateway = Gateway::bind(&file, resolver, config.max_connections, None).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = gateway.spawn(&shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Edge gateway stopped");
    Ok(())
}
