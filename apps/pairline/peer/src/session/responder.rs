use pairline_core::{NegotiationState, PeerId, SignalingMessage};
use tracing::{info, warn};

use super::{PeerSession, Role, SessionContext, SessionError};
use crate::engine::SessionDescription;
use crate::teardown::TeardownReason;

/// Registers with the relay and returns a session waiting for an offer.
pub async fn respond(ctx: SessionContext) -> Result<PeerSession, SessionError> {
    let register = SignalingMessage::Register {
        peer_id: ctx.config.peer_id.clone(),
    };
    if let Err(err) = ctx.relay_tx.send(register) {
        ctx.abandon().await;
        return Err(err.into());
    }
    info!(peer_id = %ctx.config.peer_id, "registered; waiting for an offer");
    Ok(PeerSession::new(Role::Responder, ctx))
}

impl PeerSession {
    pub(super) async fn on_offer(&mut self, sdp: String, origin: Option<PeerId>) {
        if self.negotiation != NegotiationState::New {
            warn!(
                state = %self.negotiation,
                origin = ?origin.as_ref().map(PeerId::as_str),
                "ignoring offer; negotiation already under way"
            );
            return;
        }
        let Some(origin) = origin else {
            self.shutdown(TeardownReason::ProtocolViolation(
                "offer does not name its origin".into(),
            ))
            .await;
            return;
        };
        info!(origin = %origin, "offer received");
        self.set_remote(origin.clone());
        if let Err(err) = self.answer_offer(origin, sdp).await {
            self.shutdown(TeardownReason::NegotiationFailed(err.to_string()))
                .await;
        }
    }

    /// The answer goes back to whoever sent the offer.
    async fn answer_offer(&mut self, origin: PeerId, sdp: String) -> Result<(), SessionError> {
        self.engine
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.advance(NegotiationState::RemoteOfferApplied);
        self.apply_pending_remote_candidates().await;

        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        self.relay_tx.send(SignalingMessage::Answer {
            target: origin.clone(),
            sdp: answer.sdp,
            origin: Some(self.config.peer_id.clone()),
        })?;
        self.advance(NegotiationState::AnswerSent);
        info!(target = %origin, "answer sent");

        self.flush_local_candidates();
        self.mark_negotiated();
        Ok(())
    }
}
