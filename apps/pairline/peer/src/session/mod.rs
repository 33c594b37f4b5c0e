//! Per-endpoint negotiation state machine.
//!
//! A [`PeerSession`] owns one engine and one relay link. Its `run` loop
//! consumes, in a single task, the teardown signal, the engine's event
//! stream, frames from the relay and the answer deadline. Every way out of
//! the loop goes through the session's [`TeardownController`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pairline_core::{
    ChannelState, ConnectivityState, IceCandidate, NegotiationState, PeerId, ProtocolError,
    SignalingMessage,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::commands::CommandRunner;
use crate::engine::{DataChannel, EngineError, EngineEvent, TransportEngine};
use crate::messenger::{AppBoundary, ChannelMessenger, CommandTokens};
use crate::relay_link::{LinkError, RelayReceiver, RelaySender};
use crate::teardown::{TeardownController, TeardownReason};

mod initiator;
mod responder;

pub use initiator::{initiate, FirstAvailable, TargetSelector};
pub use responder::respond;

pub const DEFAULT_CHANNEL_LABEL: &str = "pairline-data";
const MESSENGER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub peer_id: PeerId,
    pub channel_label: String,
    pub answer_timeout: Duration,
    pub query_timeout: Duration,
    pub tokens: CommandTokens,
}

impl SessionConfig {
    pub fn new(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            answer_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(10),
            tokens: CommandTokens::default(),
        }
    }
}

/// Everything a session needs, handed over whole when it starts.
pub struct SessionContext {
    pub config: SessionConfig,
    pub engine: Arc<dyn TransportEngine>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub relay_tx: RelaySender,
    pub relay_rx: RelayReceiver,
    pub app: AppBoundary,
    pub commands: Arc<dyn CommandRunner>,
}

impl SessionContext {
    /// Releases the engine and relay link of a context that never became a
    /// session.
    async fn abandon(&self) {
        if let Err(err) = self.engine.close().await {
            warn!(error = %err, "failed to close transport engine");
        }
        self.relay_tx.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub negotiation: NegotiationState,
    pub connectivity: ConnectivityState,
    /// `None` until a data channel exists.
    pub channel: Option<ChannelState>,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub role: Role,
    pub remote: Option<PeerId>,
    pub reason: Option<TeardownReason>,
    pub status: SessionStatus,
}

impl SessionReport {
    /// False when the session failed, or ended without recording a reason.
    pub fn ended_cleanly(&self) -> bool {
        self.reason.as_ref().is_some_and(TeardownReason::is_clean)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("relay sent `{0}` while waiting for available_peers")]
    UnexpectedMessage(&'static str),
    #[error("relay connection closed before the session started")]
    RelayClosed,
    #[error("no available_peers reply within {0:?}")]
    QueryTimeout(Duration),
}

struct MessengerParts {
    app: AppBoundary,
    commands: Arc<dyn CommandRunner>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
}

pub struct PeerSession {
    role: Role,
    config: SessionConfig,
    engine: Arc<dyn TransportEngine>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    relay_tx: RelaySender,
    relay_rx: RelayReceiver,
    relay_open: bool,
    teardown: Arc<TeardownController>,
    closed: watch::Receiver<Option<TeardownReason>>,
    negotiation: NegotiationState,
    connectivity: ConnectivityState,
    channel: Option<Arc<dyn DataChannel>>,
    channel_state: ChannelState,
    remote: Option<PeerId>,
    pending_local: Vec<IceCandidate>,
    pending_remote: Vec<(IceCandidate, Option<PeerId>)>,
    answer_deadline: Option<Instant>,
    status: watch::Sender<SessionStatus>,
    channel_inbound: mpsc::UnboundedSender<Bytes>,
    messenger_parts: Option<MessengerParts>,
    messenger: Option<JoinHandle<()>>,
}

impl PeerSession {
    fn new(role: Role, ctx: SessionContext) -> Self {
        let teardown = Arc::new(TeardownController::new(
            ctx.engine.clone(),
            ctx.relay_tx.clone(),
        ));
        let closed = teardown.subscribe();
        let (channel_inbound, inbound) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SessionStatus {
            negotiation: NegotiationState::New,
            connectivity: ConnectivityState::New,
            channel: None,
        });
        Self {
            role,
            config: ctx.config,
            engine: ctx.engine,
            events: ctx.events,
            relay_tx: ctx.relay_tx,
            relay_rx: ctx.relay_rx,
            relay_open: true,
            teardown,
            closed,
            negotiation: NegotiationState::New,
            connectivity: ConnectivityState::New,
            channel: None,
            channel_state: ChannelState::Connecting,
            remote: None,
            pending_local: Vec::new(),
            pending_remote: Vec::new(),
            answer_deadline: None,
            status,
            channel_inbound,
            messenger_parts: Some(MessengerParts {
                app: ctx.app,
                commands: ctx.commands,
                inbound,
            }),
            messenger: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn negotiation(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn remote(&self) -> Option<&PeerId> {
        self.remote.as_ref()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Shared handle for triggers outside the session, such as Ctrl-C.
    pub fn teardown_handle(&self) -> Arc<TeardownController> {
        self.teardown.clone()
    }

    /// Drives the session until teardown completes.
    pub async fn run(mut self) -> SessionReport {
        info!(
            role = ?self.role,
            peer_id = %self.config.peer_id,
            remote = ?self.remote.as_ref().map(PeerId::as_str),
            "session running"
        );
        loop {
            if self.closed.borrow().is_some() {
                break;
            }
            tokio::select! {
                biased;
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.on_engine_event(event).await,
                    None => self.shutdown(TeardownReason::EngineGone).await,
                },
                frame = self.relay_rx.recv(), if self.relay_open => match frame {
                    Some(Ok(message)) => self.on_relay_message(message).await,
                    Some(Err(err)) => {
                        warn!(error = %err, "invalid frame from relay");
                        self.shutdown(TeardownReason::ProtocolViolation(err.to_string())).await;
                    }
                    None => self.on_relay_closed().await,
                },
                _ = sleep_until(self.answer_deadline.unwrap_or_else(Instant::now)),
                    if self.answer_deadline.is_some() =>
                {
                    warn!(timeout = ?self.config.answer_timeout, "no answer before deadline");
                    self.answer_deadline = None;
                    self.shutdown(TeardownReason::AnswerTimeout).await;
                }
            }
        }
        self.finish().await
    }

    async fn finish(mut self) -> SessionReport {
        if let Some(mut messenger) = self.messenger.take() {
            if tokio::time::timeout(MESSENGER_GRACE, &mut messenger)
                .await
                .is_err()
            {
                warn!("messenger did not stop in time; aborting it");
                messenger.abort();
            }
        }
        let report = SessionReport {
            role: self.role,
            remote: self.remote.clone(),
            reason: self.teardown.reason(),
            status: self.snapshot(),
        };
        info!(
            role = ?report.role,
            reason = ?report.reason,
            negotiation = %report.status.negotiation,
            "session finished"
        );
        report
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ConnectivityChanged(state) => self.on_connectivity(state).await,
            EngineEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            EngineEvent::DataChannel(channel) => {
                if self.channel.is_some() {
                    warn!(label = channel.label(), "ignoring additional data channel");
                } else {
                    info!(label = channel.label(), "data channel announced by remote");
                    self.attach_channel(channel);
                }
            }
            EngineEvent::ChannelOpen => self.on_channel_open(),
            EngineEvent::ChannelMessage(payload) => {
                if self.channel_inbound.send(payload).is_err() {
                    debug!("messenger gone; dropping channel message");
                }
            }
            EngineEvent::ChannelClosed => {
                if self.channel_state != ChannelState::Closed {
                    self.channel_state = ChannelState::Closed;
                    self.publish();
                    self.shutdown(TeardownReason::ChannelClosed).await;
                }
            }
        }
    }

    async fn on_relay_message(&mut self, message: SignalingMessage) {
        debug!(message_type = message.kind(), "relay message");
        match (self.role, message) {
            (Role::Initiator, SignalingMessage::Answer { sdp, origin, .. }) => {
                self.on_answer(sdp, origin).await
            }
            (Role::Responder, SignalingMessage::Offer { sdp, origin, .. }) => {
                self.on_offer(sdp, origin).await
            }
            (_, SignalingMessage::Candidate {
                candidate, origin, ..
            }) => self.on_remote_candidate(candidate, origin).await,
            (_, SignalingMessage::Quit { origin, .. }) => {
                if !self.is_from_remote(origin.as_ref()) {
                    warn!(
                        origin = ?origin.as_ref().map(PeerId::as_str),
                        "ignoring quit from a peer outside this session"
                    );
                    return;
                }
                info!("remote peer quit");
                self.shutdown(TeardownReason::RemoteQuit).await;
            }
            (_, other) => {
                warn!(message_type = other.kind(), role = ?self.role, "unexpected message from relay");
                self.shutdown(TeardownReason::ProtocolViolation(format!(
                    "unexpected `{}`",
                    other.kind()
                )))
                .await;
            }
        }
    }

    async fn on_relay_closed(&mut self) {
        self.relay_open = false;
        if self.channel_state == ChannelState::Open {
            info!("relay connection closed; continuing on the data channel");
        } else {
            self.shutdown(TeardownReason::RelayClosed).await;
        }
    }

    async fn on_connectivity(&mut self, state: ConnectivityState) {
        if state == self.connectivity {
            return;
        }
        info!(?state, "connectivity changed");
        self.connectivity = state;
        if state.is_ready() {
            self.mark_negotiated();
        }
        self.publish();
        if state.is_terminal() {
            self.shutdown(TeardownReason::ConnectivityLost(state)).await;
        }
    }

    fn mark_negotiated(&mut self) {
        if self.connectivity.is_ready()
            && matches!(
                self.negotiation,
                NegotiationState::RemoteAnswerApplied | NegotiationState::AnswerSent
            )
        {
            self.advance(NegotiationState::Negotiated);
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) {
        match &self.remote {
            Some(remote) => {
                let message = SignalingMessage::Candidate {
                    target: remote.clone(),
                    candidate,
                    origin: Some(self.config.peer_id.clone()),
                };
                self.send_signal(message);
            }
            None => self.pending_local.push(candidate),
        }
    }

    fn flush_local_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_local) {
            self.on_local_candidate(candidate);
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate, origin: Option<PeerId>) {
        if !self.is_from_remote(origin.as_ref()) {
            warn!(
                origin = ?origin.as_ref().map(PeerId::as_str),
                "ignoring candidate from unrelated peer"
            );
            return;
        }
        if !self.negotiation.has_remote_description() {
            debug!("buffering remote candidate until a remote description is applied");
            self.pending_remote.push((candidate, origin));
            return;
        }
        if let Err(err) = self.engine.add_ice_candidate(candidate).await {
            warn!(error = %err, "failed to add remote candidate");
        }
    }

    async fn apply_pending_remote_candidates(&mut self) {
        for (candidate, origin) in std::mem::take(&mut self.pending_remote) {
            self.on_remote_candidate(candidate, origin).await;
        }
    }

    fn attach_channel(&mut self, channel: Arc<dyn DataChannel>) {
        self.channel = Some(channel);
        self.channel_state = ChannelState::Connecting;
        self.publish();
    }

    fn on_channel_open(&mut self) {
        if self.channel_state == ChannelState::Open {
            debug!("duplicate channel open");
            return;
        }
        let Some(channel) = self.channel.clone() else {
            warn!("channel open reported before any channel was attached");
            return;
        };
        self.channel_state = ChannelState::Open;
        self.publish();
        info!(label = channel.label(), "data channel open; handing over to messenger");
        let Some(parts) = self.messenger_parts.take() else {
            return;
        };
        let messenger = ChannelMessenger::new(
            channel,
            parts.inbound,
            parts.app,
            parts.commands,
            self.config.tokens.clone(),
            self.teardown.clone(),
        );
        self.messenger = Some(tokio::spawn(messenger.run()));
    }

    /// Before the remote is known anything goes; afterwards the relay-stamped
    /// origin has to name it.
    fn is_from_remote(&self, origin: Option<&PeerId>) -> bool {
        match &self.remote {
            Some(remote) => origin == Some(remote),
            None => true,
        }
    }

    fn set_remote(&mut self, peer: PeerId) {
        self.teardown.set_remote(peer.clone());
        self.remote = Some(peer);
    }

    fn advance(&mut self, next: NegotiationState) {
        match self.negotiation.advance(next) {
            Ok(()) => {
                debug!(state = %next, "negotiation advanced");
                self.publish();
            }
            Err(err) => warn!(error = %err, "ignoring negotiation transition"),
        }
    }

    fn send_signal(&self, message: SignalingMessage) {
        if let Err(err) = self.relay_tx.send(message) {
            warn!(error = %err, "failed to queue message for relay");
        }
    }

    async fn shutdown(&self, reason: TeardownReason) {
        self.teardown.teardown(reason).await;
    }

    fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            negotiation: self.negotiation,
            connectivity: self.connectivity,
            channel: self.channel.as_ref().map(|_| self.channel_state),
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.snapshot());
    }
}
