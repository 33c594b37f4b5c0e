use anyhow::{Context, Result};
use clap::Parser;
use pairline_relay::Relay;
use tokio::{net::TcpListener, signal};
use tracing::info;

mod config;
mod telemetry;

use config::{Cli, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        idle_timeout_secs = config.settings.idle_timeout.as_secs(),
        "starting pairline relay"
    );

    let relay = Relay::new(config.settings.clone());
    let recycler_handle = relay.spawn_recycler();

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("pairline relay listening on {}", config.listen_addr);

    pairline_relay::serve(
        listener,
        relay,
        Some(telemetry.metrics_handle()),
        shutdown_signal(),
    )
    .await
    .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    recycler_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
