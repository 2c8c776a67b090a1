//! Main entry point for the galley compile server.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use galley::{CompileService, config::Config, server::CompileServer, warmup};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting galley server");

    let config = Config::from_env()?;
    info!(?config, "loaded configuration");

    let service = Arc::new(CompileService::new(&config));
    warmup::spawn(Arc::clone(&service), &config);

    let server = CompileServer::start(config.addr, service).await?;
    info!(addr = %server.addr(), "galley server started, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.shutdown().await;

    Ok(())
}
