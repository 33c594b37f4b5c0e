use pairline_core::{NegotiationState, PeerId, SignalingMessage};
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use super::{PeerSession, Role, SessionContext, SessionError};
use crate::engine::SessionDescription;
use crate::teardown::TeardownReason;

/// Picks the peer to negotiate with from a discovery reply.
pub trait TargetSelector: Send + Sync {
    fn select(&self, local: &PeerId, peers: &[PeerId]) -> Option<PeerId>;
}

/// First listed peer other than ourselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl TargetSelector for FirstAvailable {
    fn select(&self, local: &PeerId, peers: &[PeerId]) -> Option<PeerId> {
        peers.iter().find(|peer| *peer != local).cloned()
    }
}

/// Registers, discovers a target and sends it an offer.
///
/// Returns `Ok(None)` when nobody else is registered; the engine and relay
/// link are released in that case and no session exists.
pub async fn initiate(
    mut ctx: SessionContext,
    selector: &dyn TargetSelector,
) -> Result<Option<PeerSession>, SessionError> {
    let peers = match discover(&mut ctx).await {
        Ok(peers) => peers,
        Err(err) => {
            ctx.abandon().await;
            return Err(err);
        }
    };

    let Some(target) = selector.select(&ctx.config.peer_id, &peers) else {
        info!(peer_id = %ctx.config.peer_id, "no peers available");
        ctx.abandon().await;
        return Ok(None);
    };
    info!(target = %target, available = peers.len(), "selected target");

    let mut session = PeerSession::new(Role::Initiator, ctx);
    session.set_remote(target.clone());
    if let Err(err) = session.send_offer(target).await {
        session
            .shutdown(TeardownReason::NegotiationFailed(err.to_string()))
            .await;
        return Err(err);
    }
    Ok(Some(session))
}

async fn discover(ctx: &mut SessionContext) -> Result<Vec<PeerId>, SessionError> {
    ctx.relay_tx.send(SignalingMessage::Register {
        peer_id: ctx.config.peer_id.clone(),
    })?;
    ctx.relay_tx.send(SignalingMessage::Query)?;

    let limit = ctx.config.query_timeout;
    let reply = timeout(limit, ctx.relay_rx.recv())
        .await
        .map_err(|_| SessionError::QueryTimeout(limit))?;
    match reply {
        Some(Ok(SignalingMessage::AvailablePeers { peers })) => Ok(peers),
        Some(Ok(other)) => Err(SessionError::UnexpectedMessage(other.kind())),
        Some(Err(err)) => Err(SessionError::Protocol(err)),
        None => Err(SessionError::RelayClosed),
    }
}

impl PeerSession {
    /// Creates the data channel, sets the local offer and sends it. The
    /// answer deadline starts once the offer is queued.
    async fn send_offer(&mut self, target: PeerId) -> Result<(), SessionError> {
        let channel = self
            .engine
            .create_data_channel(&self.config.channel_label)
            .await?;
        self.attach_channel(channel);

        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(offer.clone()).await?;
        self.advance(NegotiationState::LocalOfferSet);

        self.relay_tx.send(SignalingMessage::Offer {
            target: target.clone(),
            sdp: offer.sdp,
            origin: Some(self.config.peer_id.clone()),
        })?;
        self.answer_deadline = Some(Instant::now() + self.config.answer_timeout);
        info!(target = %target, "offer sent");
        self.flush_local_candidates();
        Ok(())
    }

    pub(super) async fn on_answer(&mut self, sdp: String, origin: Option<PeerId>) {
        if self.negotiation != NegotiationState::LocalOfferSet {
            warn!(state = %self.negotiation, "ignoring answer outside of a pending offer");
            return;
        }
        if !self.is_from_remote(origin.as_ref()) {
            warn!(
                origin = ?origin.as_ref().map(PeerId::as_str),
                "ignoring answer from a peer we did not offer to"
            );
            return;
        }

        if let Err(err) = self
            .engine
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            self.shutdown(TeardownReason::NegotiationFailed(err.to_string()))
                .await;
            return;
        }
        self.answer_deadline = None;
        self.advance(NegotiationState::RemoteAnswerApplied);
        info!("answer applied");
        self.apply_pending_remote_candidates().await;
        self.mark_negotiated();
    }
}
