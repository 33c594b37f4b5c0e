use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pairline_peer::engine::RtcEngine;
use pairline_peer::session::{initiate, respond, FirstAvailable, Role, SessionContext};
use pairline_peer::{relay_link, AppBoundary, ProcessCommandRunner, TeardownReason};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::{runtime, signal};
use tracing::{debug, info};

mod config;
mod telemetry;

use config::{Cli, PeerConfig};

const LOCAL_INPUT_DEPTH: usize = 64;

fn main() -> Result<()> {
    telemetry::init()?;
    let config = PeerConfig::try_from(Cli::parse())?;

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let outcome = runtime.block_on(run(config));
    // stdin reads block a worker thread; don't wait for them.
    runtime.shutdown_background();
    outcome
}

async fn run(config: PeerConfig) -> Result<()> {
    info!(
        role = ?config.role,
        peer_id = %config.session.peer_id,
        relay = %config.relay_url,
        "starting pairline peer"
    );

    let (engine, events) = RtcEngine::new(&config.rtc)
        .await
        .context("failed to create transport engine")?;
    let (relay_tx, relay_rx) = relay_link::connect(&config.relay_url).await?;
    let (app, local_tx, delivered) = AppBoundary::channel(LOCAL_INPUT_DEPTH);
    let ctx = SessionContext {
        config: config.session,
        engine,
        events,
        relay_tx,
        relay_rx,
        app,
        commands: Arc::new(ProcessCommandRunner),
    };

    let session = match config.role {
        Role::Initiator => match initiate(ctx, &FirstAvailable).await? {
            Some(session) => session,
            None => {
                info!("no peers available; exiting");
                return Ok(());
            }
        },
        Role::Responder => respond(ctx).await?,
    };

    tokio::spawn(read_stdin(local_tx));
    tokio::spawn(print_delivered(delivered));

    let teardown = session.teardown_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            teardown.teardown(TeardownReason::Interrupted).await;
        }
    });

    let report = session.run().await;
    info!(
        reason = ?report.reason,
        remote = ?report.remote,
        negotiation = %report.status.negotiation,
        "pairline peer exiting"
    );
    if report.ended_cleanly() {
        return Ok(());
    }
    match report.reason {
        Some(reason) => bail!("session ended: {reason}"),
        None => bail!("session ended without a teardown reason"),
    }
}

async fn read_stdin(local: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if local.send(line).await.is_err() {
            break;
        }
    }
    debug!("stdin closed");
}

async fn print_delivered(mut delivered: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = delivered.recv().await {
        let line = format!("{message}\n");
        if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }
}
