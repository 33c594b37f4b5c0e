use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const KNOWN_TYPES: [&str; 7] = [
    "register",
    "query",
    "available_peers",
    "offer",
    "answer",
    "candidate",
    "quit",
];

/// Opaque peer identifier, unique among the peers registered at a relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for PeerId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PeerId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A single connectivity candidate discovered by one side's transport engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Messages exchanged between peers and the relay.
///
/// `offer`, `answer` and `candidate` are routed by `target`. `origin` names
/// the sending peer; the relay always overwrites it with the id the sender
/// registered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Register {
        peer_id: PeerId,
    },
    Query,
    AvailablePeers {
        peers: Vec<PeerId>,
    },
    Offer {
        target: PeerId,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<PeerId>,
    },
    Answer {
        target: PeerId,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<PeerId>,
    },
    Candidate {
        target: PeerId,
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<PeerId>,
    },
    Quit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<PeerId>,
    },
}

impl SignalingMessage {
    /// Parses one frame. Unknown `type` tags are reported separately from
    /// otherwise broken payloads so callers can log them as unhandled.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing `type` field".into()))?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| ProtocolError::Malformed(format!("frame is not utf-8: {err}")))?;
        Self::decode(text)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Register { .. } => "register",
            SignalingMessage::Query => "query",
            SignalingMessage::AvailablePeers { .. } => "available_peers",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Quit { .. } => "quit",
        }
    }

    /// Routing key, if this message is addressed to a peer.
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Offer { target, .. }
            | SignalingMessage::Answer { target, .. }
            | SignalingMessage::Candidate { target, .. } => Some(target),
            SignalingMessage::Quit { target, .. } => target.as_ref(),
            _ => None,
        }
    }

    pub fn origin(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Offer { origin, .. }
            | SignalingMessage::Answer { origin, .. }
            | SignalingMessage::Candidate { origin, .. }
            | SignalingMessage::Quit { origin, .. } => origin.as_ref(),
            _ => None,
        }
    }

    /// Replaces `origin` with `sender`, whatever the frame claimed. An
    /// unregistered sender (`None`) clears it.
    pub fn with_origin(mut self, sender: Option<&PeerId>) -> Self {
        match &mut self {
            SignalingMessage::Offer { origin, .. }
            | SignalingMessage::Answer { origin, .. }
            | SignalingMessage::Candidate { origin, .. }
            | SignalingMessage::Quit { origin, .. } => {
                *origin = sender.cloned();
            }
            _ => {}
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("unhandled signaling message type `{0}`")]
    UnknownType(String),
    #[error("failed to encode signaling message: {0}")]
    Encode(#[source] serde_json::Error),
}
