//! Peer side of the signaling connection.
//!
//! [`connect`] opens a websocket to the relay and splits it into a
//! [`RelaySender`] (cloneable, never blocks) and a [`RelayReceiver`] that
//! yields decoded frames in arrival order. The receiver ends when the relay
//! connection is gone.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pairline_core::{ProtocolError, SignalingMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Send(SignalingMessage),
    Close,
}

pub type Inbound = Result<SignalingMessage, ProtocolError>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to relay at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("relay url must use ws or wss: {0}")]
    Scheme(String),
    #[error("relay connection is closed")]
    Closed,
}

#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl RelaySender {
    pub fn send(&self, message: SignalingMessage) -> Result<(), LinkError> {
        self.tx
            .send(LinkCommand::Send(message))
            .map_err(|_| LinkError::Closed)
    }

    /// Asks the writer to close the websocket after flushing queued frames.
    pub fn close(&self) {
        let _ = self.tx.send(LinkCommand::Close);
    }
}

pub struct RelayReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl RelayReceiver {
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

pub fn validate_url(raw: &str) -> Result<Url, LinkError> {
    let url = Url::parse(raw).map_err(|_| LinkError::Scheme(raw.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        _ => Err(LinkError::Scheme(raw.to_string())),
    }
}

pub async fn connect(url: &Url) -> Result<(RelaySender, RelayReceiver), LinkError> {
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|source| LinkError::Connect {
            url: url.to_string(),
            source,
        })?;
    info!(relay = %url, "connected to relay");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<LinkCommand>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

    tokio::spawn(async move {
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(LinkCommand::Send(message)) => {
                        let text = match message.encode() {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "failed to encode signaling message");
                                continue;
                            }
                        };
                        if let Err(err) = ws_tx.send(Message::Text(text)).await {
                            warn!(error = %err, "failed to send to relay");
                            break;
                        }
                    }
                    Some(LinkCommand::Close) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("relay writer finished");
    });

    tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            let decoded = match frame {
                Ok(Message::Text(text)) => SignalingMessage::decode(&text),
                Ok(Message::Binary(bytes)) => SignalingMessage::decode_bytes(&bytes),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "relay closed websocket");
                    break;
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "error receiving from relay");
                    break;
                }
            };
            if inbound_tx.send(decoded).is_err() {
                break;
            }
        }
        debug!("relay reader finished");
    });

    Ok((
        RelaySender { tx: command_tx },
        RelayReceiver { rx: inbound_rx },
    ))
}

/// Relay link that never touches the network. The [`MemoryRelay`] half sees
/// everything the peer sends and feeds frames back in.
pub fn memory_link() -> (RelaySender, RelayReceiver, MemoryRelay) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    (
        RelaySender { tx: command_tx },
        RelayReceiver { rx: inbound_rx },
        MemoryRelay {
            sent: command_rx,
            inbound: Some(inbound_tx),
        },
    )
}

pub struct MemoryRelay {
    sent: mpsc::UnboundedReceiver<LinkCommand>,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
}

impl MemoryRelay {
    pub fn deliver(&self, message: SignalingMessage) {
        self.deliver_raw(Ok(message));
    }

    pub fn deliver_raw(&self, frame: Inbound) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(frame);
        }
    }

    /// Ends the peer's receive stream, as if the relay went away.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    pub async fn next_sent(&mut self) -> Option<LinkCommand> {
        self.sent.recv().await
    }

    /// Everything sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<LinkCommand> {
        let mut sent = Vec::new();
        while let Ok(command) = self.sent.try_recv() {
            sent.push(command);
        }
        sent
    }
}
