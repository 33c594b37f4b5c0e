use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pairline_core::{ChannelState, ConnectivityState, IceCandidate};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{DataChannel, EngineError, EngineEvent, SdpKind, SessionDescription, TransportEngine};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// STUN/TURN urls. Empty means host candidates only.
    pub ice_servers: Vec<String>,
    pub ordered: bool,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            ordered: true,
        }
    }
}

impl RtcConfig {
    /// No STUN; peers on the same host or LAN only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }
}

/// [`TransportEngine`] backed by a webrtc-rs peer connection.
pub struct RtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<EngineEvent>,
    ordered: bool,
}

impl RtcEngine {
    pub async fn new(
        config: &RtcConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>), EngineError> {
        let api = APIBuilder::new().build();
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);
        let (events, rx) = mpsc::unbounded_channel();

        let state_events = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    debug!(?state, "ice connection state changed");
                    if let Some(state) = connectivity_state(state) {
                        let _ = events.send(EngineEvent::ConnectivityChanged(state));
                    }
                })
            },
        ));

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(EngineEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let channel_events = events.clone();
        peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                info!(label = dc.label(), "remote data channel received");
                let channel = RtcDataChannel::new(dc);
                let _ = events.send(EngineEvent::DataChannel(channel.clone()));
                channel.attach(events);
            })
        }));

        Ok((
            Arc::new(Self {
                peer_connection,
                events,
                ordered: config.ordered,
            }),
            rx,
        ))
    }
}

#[async_trait]
impl TransportEngine for RtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc(description)?;
        self.peer_connection
            .set_local_description(description)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let init = RTCDataChannelInit {
            ordered: Some(self.ordered),
            ..Default::default()
        };
        let dc = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await?;
        let channel = RtcDataChannel::new(dc);
        channel.attach(self.events.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
}

impl RtcDataChannel {
    fn new(inner: Arc<RTCDataChannel>) -> Arc<Self> {
        let label = inner.label().to_string();
        Arc::new(Self { inner, label })
    }

    /// Routes the channel's callbacks onto the engine event stream. A channel
    /// that is already open reports `ChannelOpen` right away; the session
    /// ignores the duplicate if the callback fires too.
    fn attach(&self, events: mpsc::UnboundedSender<EngineEvent>) {
        let open_events = events.clone();
        let label = self.label.clone();
        self.inner.on_open(Box::new(move || {
            let events = open_events.clone();
            let label = label.clone();
            Box::pin(async move {
                info!(label = %label, "data channel open");
                let _ = events.send(EngineEvent::ChannelOpen);
            })
        }));

        let close_events = events.clone();
        let label = self.label.clone();
        self.inner.on_close(Box::new(move || {
            let events = close_events.clone();
            let label = label.clone();
            Box::pin(async move {
                info!(label = %label, "data channel closed");
                let _ = events.send(EngineEvent::ChannelClosed);
            })
        }));

        let message_events = events.clone();
        self.inner
            .on_message(Box::new(move |message: DataChannelMessage| {
                let events = message_events.clone();
                Box::pin(async move {
                    let _ = events.send(EngineEvent::ChannelMessage(message.data));
                })
            }));

        if self.inner.ready_state() == RTCDataChannelState::Open {
            let _ = events.send(EngineEvent::ChannelOpen);
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => ChannelState::Closed,
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                ChannelState::Connecting
            }
        }
    }

    async fn send(&self, payload: Bytes) -> Result<(), EngineError> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(EngineError::ChannelNotOpen(state));
        }
        self.inner.send(&payload).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.inner.close().await?;
        Ok(())
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let description = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(description)
}

fn connectivity_state(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectivityState::New),
        RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectivityState::Completed),
        RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}
