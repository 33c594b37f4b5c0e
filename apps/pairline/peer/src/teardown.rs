use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use pairline_core::{ConnectivityState, PeerId, SignalingMessage};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::TransportEngine;
use crate::relay_link::RelaySender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    /// The remote peer sent `quit` through the relay.
    RemoteQuit,
    /// The remote peer sent the quit token over the data channel.
    ChannelQuit,
    LocalQuit,
    Interrupted,
    ConnectivityLost(ConnectivityState),
    AnswerTimeout,
    ProtocolViolation(String),
    NegotiationFailed(String),
    RelayClosed,
    ChannelClosed,
    EngineGone,
}

impl TeardownReason {
    /// Triggers that originate on this side, which the remote has not seen.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            TeardownReason::LocalQuit | TeardownReason::Interrupted | TeardownReason::AnswerTimeout
        )
    }

    /// A deliberate ending by either side, as opposed to a failure.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            TeardownReason::RemoteQuit
                | TeardownReason::ChannelQuit
                | TeardownReason::LocalQuit
                | TeardownReason::Interrupted
        )
    }
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownReason::RemoteQuit => f.write_str("remote quit"),
            TeardownReason::ChannelQuit => f.write_str("quit token received"),
            TeardownReason::LocalQuit => f.write_str("local quit"),
            TeardownReason::Interrupted => f.write_str("interrupted"),
            TeardownReason::ConnectivityLost(state) => write!(f, "connectivity {state:?}"),
            TeardownReason::AnswerTimeout => f.write_str("no answer before deadline"),
            TeardownReason::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            TeardownReason::NegotiationFailed(detail) => write!(f, "negotiation failed: {detail}"),
            TeardownReason::RelayClosed => f.write_str("relay connection closed"),
            TeardownReason::ChannelClosed => f.write_str("data channel closed"),
            TeardownReason::EngineGone => f.write_str("transport engine went away"),
        }
    }
}

/// Runs a session's shutdown sequence exactly once, whichever trigger fires
/// first. Every task of the session watches [`TeardownController::subscribe`]
/// as its cancellation signal.
pub struct TeardownController {
    fired: AtomicBool,
    engine: Arc<dyn TransportEngine>,
    relay: RelaySender,
    remote: OnceLock<PeerId>,
    done: watch::Sender<Option<TeardownReason>>,
}

impl TeardownController {
    pub fn new(engine: Arc<dyn TransportEngine>, relay: RelaySender) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            fired: AtomicBool::new(false),
            engine,
            relay,
            remote: OnceLock::new(),
            done,
        }
    }

    /// Records who to notify on a local teardown. Only the first call sticks.
    pub fn set_remote(&self, peer: PeerId) {
        let _ = self.remote.set(peer);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TeardownReason>> {
        self.done.subscribe()
    }

    pub fn reason(&self) -> Option<TeardownReason> {
        self.done.borrow().clone()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Closes the engine and then the relay link. Returns `false` without
    /// doing anything if teardown already started.
    pub async fn teardown(&self, reason: TeardownReason) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            debug!(%reason, "teardown already in progress");
            return false;
        }
        info!(%reason, "tearing down session");

        if reason.is_local() {
            if let Some(remote) = self.remote.get() {
                let quit = SignalingMessage::Quit {
                    target: Some(remote.clone()),
                    origin: None,
                };
                if let Err(err) = self.relay.send(quit) {
                    warn!(error = %err, remote = %remote, "could not notify remote peer");
                }
            }
        }

        if let Err(err) = self.engine.close().await {
            warn!(error = %err, "failed to close transport engine");
        }
        self.relay.close();

        self.done.send_replace(Some(reason));
        true
    }
}
