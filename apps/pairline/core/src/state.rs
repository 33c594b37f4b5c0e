use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Progress of one offer/answer exchange.
///
/// The Initiator walks `New -> LocalOfferSet -> RemoteAnswerApplied ->
/// Negotiated`; the Responder walks `New -> RemoteOfferApplied -> AnswerSent
/// -> Negotiated`. Within one attempt the state only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    New,
    LocalOfferSet,
    RemoteOfferApplied,
    AnswerSent,
    RemoteAnswerApplied,
    Negotiated,
}

impl NegotiationState {
    fn rank(self) -> u8 {
        match self {
            NegotiationState::New => 0,
            NegotiationState::LocalOfferSet | NegotiationState::RemoteOfferApplied => 1,
            NegotiationState::AnswerSent | NegotiationState::RemoteAnswerApplied => 2,
            NegotiationState::Negotiated => 3,
        }
    }

    fn initiator_path(self) -> bool {
        matches!(
            self,
            NegotiationState::LocalOfferSet | NegotiationState::RemoteAnswerApplied
        )
    }

    fn responder_path(self) -> bool {
        matches!(
            self,
            NegotiationState::RemoteOfferApplied | NegotiationState::AnswerSent
        )
    }

    /// Moves to `next`, refusing any step that goes backwards, stays put, or
    /// crosses from one role's path onto the other's.
    pub fn advance(&mut self, next: NegotiationState) -> Result<(), StateTransitionError> {
        let crosses_roles = (self.initiator_path() && next.responder_path())
            || (self.responder_path() && next.initiator_path());
        if next.rank() <= self.rank() || crosses_roles {
            return Err(StateTransitionError {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    /// True once a remote description has been applied on either side.
    pub fn has_remote_description(self) -> bool {
        matches!(
            self,
            NegotiationState::RemoteOfferApplied
                | NegotiationState::AnswerSent
                | NegotiationState::RemoteAnswerApplied
                | NegotiationState::Negotiated
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::New => "new",
            NegotiationState::LocalOfferSet => "local-offer-set",
            NegotiationState::RemoteOfferApplied => "remote-offer-applied",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::RemoteAnswerApplied => "remote-answer-applied",
            NegotiationState::Negotiated => "negotiated",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("negotiation cannot move from {from} to {to}")]
pub struct StateTransitionError {
    pub from: NegotiationState,
    pub to: NegotiationState,
}

/// Transport engine's view of the direct path between the two peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl ConnectivityState {
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectivityState::Connected | ConnectivityState::Completed)
    }

    /// States that end the session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectivityState::Failed | ConnectivityState::Disconnected | ConnectivityState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn initiator_path_moves_forward() {
        let mut state = NegotiationState::New;
        state.advance(NegotiationState::LocalOfferSet).unwrap();
        state.advance(NegotiationState::RemoteAnswerApplied).unwrap();
        state.advance(NegotiationState::Negotiated).unwrap();
        assert_eq!(state, NegotiationState::Negotiated);
    }

    #[test_timeout::timeout]
    fn responder_path_moves_forward() {
        let mut state = NegotiationState::New;
        state.advance(NegotiationState::RemoteOfferApplied).unwrap();
        state.advance(NegotiationState::AnswerSent).unwrap();
        state.advance(NegotiationState::Negotiated).unwrap();
        assert!(state.has_remote_description());
    }

    #[test_timeout::timeout]
    fn never_reverts() {
        let mut state = NegotiationState::AnswerSent;
        let err = state
            .advance(NegotiationState::RemoteOfferApplied)
            .unwrap_err();
        assert_eq!(err.from, NegotiationState::AnswerSent);
        assert_eq!(state, NegotiationState::AnswerSent);
        assert!(state.advance(NegotiationState::AnswerSent).is_err());
        assert!(state.advance(NegotiationState::New).is_err());
    }

    #[test_timeout::timeout]
    fn cannot_cross_role_paths() {
        let mut state = NegotiationState::LocalOfferSet;
        assert!(state.advance(NegotiationState::AnswerSent).is_err());
        let mut state = NegotiationState::RemoteOfferApplied;
        assert!(state.advance(NegotiationState::RemoteAnswerApplied).is_err());
    }

    #[test_timeout::timeout]
    fn connectivity_classification() {
        assert!(ConnectivityState::Connected.is_ready());
        assert!(ConnectivityState::Completed.is_ready());
        assert!(!ConnectivityState::Checking.is_ready());
        for state in [
            ConnectivityState::Failed,
            ConnectivityState::Disconnected,
            ConnectivityState::Closed,
        ] {
            assert!(state.is_terminal());
        }
        assert!(!ConnectivityState::New.is_terminal());
    }
}
