//! Transport engine seam.
//!
//! A session drives negotiation through [`TransportEngine`] and learns what
//! the engine did through a single ordered stream of [`EngineEvent`]s handed
//! out when the engine is created. [`rtc::RtcEngine`] is backed by webrtc-rs;
//! [`mock::MockEngine`] records calls for tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pairline_core::{ChannelState, ConnectivityState, IceCandidate};
use thiserror::Error;

pub mod mock;
pub mod rtc;

pub use mock::{EngineCall, MockDataChannel, MockEngine};
pub use rtc::{RtcConfig, RtcEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Everything the engine reports back to its session, in order.
pub enum EngineEvent {
    ConnectivityChanged(ConnectivityState),
    LocalCandidate(IceCandidate),
    /// A channel opened by the remote peer arrived.
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::ConnectivityChanged(state) => {
                f.debug_tuple("ConnectivityChanged").field(state).finish()
            }
            EngineEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            EngineEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            EngineEvent::ChannelOpen => f.write_str("ChannelOpen"),
            EngineEvent::ChannelMessage(bytes) => {
                f.debug_tuple("ChannelMessage").field(&bytes.len()).finish()
            }
            EngineEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Creates the channel locally. Its open, message and close events are
    /// reported on the engine's event stream.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError>;

    /// Closes the peer connection. Outstanding engine work ends with it.
    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    async fn send(&self, payload: Bytes) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("data channel is not open ({0:?})")]
    ChannelNotOpen(ChannelState),
    #[error("transport engine is closed")]
    Closed,
}
