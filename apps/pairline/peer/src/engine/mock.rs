use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pairline_core::{ChannelState, ConnectivityState, IceCandidate};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{DataChannel, EngineError, EngineEvent, SessionDescription, TransportEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    CreateDataChannel(String),
    Close,
}

/// In-process engine that records every call and lets tests inject events.
pub struct MockEngine {
    events: mpsc::UnboundedSender<EngineEvent>,
    calls: Mutex<Vec<EngineCall>>,
    closes: AtomicUsize,
    offer_sdp: String,
    answer_sdp: String,
    channel: Mutex<Option<Arc<MockDataChannel>>>,
}

impl MockEngine {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::with_descriptions("mock-offer", "mock-answer")
    }

    pub fn with_descriptions(
        offer_sdp: impl Into<String>,
        answer_sdp: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            events,
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            offer_sdp: offer_sdp.into(),
            answer_sdp: answer_sdp.into(),
            channel: Mutex::new(None),
        });
        (engine, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// The channel this engine created or delivered, if any.
    pub fn channel(&self) -> Option<Arc<MockDataChannel>> {
        self.channel.lock().clone()
    }

    /// Simulates the remote peer's channel arriving.
    pub fn deliver_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = MockDataChannel::new(label);
        *self.channel.lock() = Some(channel.clone());
        self.emit(EngineEvent::DataChannel(channel.clone()));
        channel
    }

    /// Marks the current channel open and reports it.
    pub fn open_channel(&self) {
        if let Some(channel) = self.channel() {
            channel.set_state(ChannelState::Open);
        }
        self.emit(EngineEvent::ChannelOpen);
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateOffer);
        Ok(SessionDescription::offer(self.offer_sdp.clone()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateAnswer);
        Ok(SessionDescription::answer(self.answer_sdp.clone()))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetLocal(description));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetRemote(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(EngineCall::AddCandidate(candidate));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        self.record(EngineCall::CreateDataChannel(label.to_string()));
        let channel = MockDataChannel::new(label);
        *self.channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Close);
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(channel) = self.channel() {
            channel.set_state(ChannelState::Closed);
        }
        self.emit(EngineEvent::ConnectivityChanged(ConnectivityState::Closed));
        Ok(())
    }
}

pub struct MockDataChannel {
    label: String,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<Bytes>>,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send(&self, payload: Bytes) -> Result<(), EngineError> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(EngineError::ChannelNotOpen(state));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.set_state(ChannelState::Closed);
        Ok(())
    }
}
