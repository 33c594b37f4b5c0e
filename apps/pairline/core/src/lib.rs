//! Shared primitives for the Pairline signaling relay and its peers.
//!
//! The relay and both peer roles speak the JSON protocol defined in
//! [`message`]; the negotiation, connectivity and channel state machines
//! tracked by each peer live in [`state`].

pub mod message;
pub mod state;

pub use message::{IceCandidate, PeerId, ProtocolError, SignalingMessage};
pub use state::{ChannelState, ConnectivityState, NegotiationState, StateTransitionError};
