//! Pairline peer.
//!
//! A peer registers with the relay, negotiates one direct data channel with
//! one remote peer and then exchanges text over it. The initiator (client)
//! discovers a target and sends the offer; the responder (worker) waits for
//! one and answers whoever sent it.

pub mod commands;
pub mod engine;
pub mod messenger;
pub mod relay_link;
pub mod session;
pub mod teardown;

pub use commands::{CommandRunner, ProcessCommandRunner};
pub use engine::{DataChannel, EngineEvent, TransportEngine};
pub use messenger::{AppBoundary, ChannelMessenger, CommandTokens};
pub use relay_link::{RelayReceiver, RelaySender};
pub use session::{
    initiate, respond, FirstAvailable, PeerSession, Role, SessionConfig, SessionContext,
    SessionError, SessionReport, SessionStatus, TargetSelector,
};
pub use teardown::{TeardownController, TeardownReason};
