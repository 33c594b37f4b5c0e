use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pairline_core::{ConnectivityState, NegotiationState, PeerId, SignalingMessage};
use pairline_peer::commands::{CommandError, CommandRunner};
use pairline_peer::engine::{EngineCall, EngineEvent, MockEngine, SessionDescription};
use pairline_peer::relay_link::{self, validate_url};
use pairline_peer::session::{initiate, respond, FirstAvailable, SessionConfig, SessionContext};
use pairline_peer::{AppBoundary, TeardownReason};
use pairline_relay::{Relay, RelaySettings};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};

struct NoCommands;

#[async_trait]
impl CommandRunner for NoCommands {
    async fn run(&self, token: &str) -> Result<String, CommandError> {
        Err(CommandError::Failed {
            command: token.to_string(),
            status: "disabled".into(),
            stderr: String::new(),
        })
    }
}

async fn start_relay() -> (String, Relay) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let relay = Relay::new(RelaySettings::default());
    let server = relay.clone();
    tokio::spawn(async move {
        let _ = pairline_relay::serve(listener, server, None, std::future::pending()).await;
    });
    (format!("ws://{addr}/"), relay)
}

async fn peer_context(url: &str, peer_id: &str, engine_sdp: &str) -> (SessionContext, Arc<MockEngine>) {
    let (engine, events) = MockEngine::with_descriptions(
        format!("{engine_sdp}-offer"),
        format!("{engine_sdp}-answer"),
    );
    let url = validate_url(url).expect("relay url");
    let (relay_tx, relay_rx) = relay_link::connect(&url).await.expect("connect to relay");
    let (app, _local, _delivered) = AppBoundary::channel(8);
    let ctx = SessionContext {
        config: SessionConfig::new(peer_id),
        engine: engine.clone(),
        events,
        relay_tx,
        relay_rx,
        app,
        commands: Arc::new(NoCommands),
    };
    (ctx, engine)
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[test_timeout::tokio_timeout_test]
async fn client_and_worker_negotiate_through_relay() {
    let (url, relay) = start_relay().await;

    let (worker_ctx, worker_engine) = peer_context(&url, "worker1", "worker").await;
    let worker = respond(worker_ctx).await.unwrap();
    wait_until(|| relay.peers().contains(&PeerId::from("worker1"))).await;
    let mut worker_status = worker.status();
    let worker_task = tokio::spawn(worker.run());

    let (client_ctx, client_engine) = peer_context(&url, "client1", "client").await;
    let client = initiate(client_ctx, &FirstAvailable)
        .await
        .unwrap()
        .expect("worker1 is registered");
    let mut client_status = client.status();
    let client_teardown = client.teardown_handle();
    let client_task = tokio::spawn(client.run());

    worker_status
        .wait_for(|s| s.negotiation == NegotiationState::AnswerSent)
        .await
        .unwrap();
    client_status
        .wait_for(|s| s.negotiation == NegotiationState::RemoteAnswerApplied)
        .await
        .unwrap();
    assert!(worker_engine
        .calls()
        .contains(&EngineCall::SetRemote(SessionDescription::offer("client-offer"))));
    assert!(client_engine
        .calls()
        .contains(&EngineCall::SetRemote(SessionDescription::answer("worker-answer"))));

    client_teardown.teardown(TeardownReason::Interrupted).await;
    let client_report = client_task.await.unwrap();
    let worker_report = worker_task.await.unwrap();
    assert_eq!(client_report.reason, Some(TeardownReason::Interrupted));
    assert_eq!(worker_report.reason, Some(TeardownReason::RemoteQuit));
    assert_eq!(worker_report.remote, Some(PeerId::from("client1")));

    wait_until(|| relay.peers().is_empty()).await;
}

#[test_timeout::tokio_timeout_test]
async fn failed_worker_disappears_from_discovery() {
    let (url, relay) = start_relay().await;

    let (worker_ctx, worker_engine) = peer_context(&url, "worker1", "worker").await;
    let worker = respond(worker_ctx).await.unwrap();
    let mut worker_status = worker.status();
    let worker_task = tokio::spawn(worker.run());
    wait_until(|| relay.peers().contains(&PeerId::from("worker1"))).await;

    let (mut client, _) = connect_async(url.as_str()).await.expect("client connects");
    for message in [
        SignalingMessage::Register {
            peer_id: "client1".into(),
        },
        SignalingMessage::Offer {
            target: "worker1".into(),
            sdp: "raw-offer".into(),
            origin: None,
        },
    ] {
        let text = message.encode().unwrap();
        client.send(Message::Text(text)).await.unwrap();
    }

    let answer = loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("answer before deadline")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            break SignalingMessage::decode(&text).unwrap();
        }
    };
    assert_eq!(
        answer,
        SignalingMessage::Answer {
            target: "client1".into(),
            sdp: "worker-answer".into(),
            origin: Some("worker1".into()),
        }
    );
    worker_status
        .wait_for(|s| s.negotiation == NegotiationState::AnswerSent)
        .await
        .unwrap();

    worker_engine.emit(EngineEvent::ConnectivityChanged(ConnectivityState::Failed));
    let report = worker_task.await.unwrap();
    assert_eq!(
        report.reason,
        Some(TeardownReason::ConnectivityLost(ConnectivityState::Failed))
    );
    assert_eq!(report.status.negotiation, NegotiationState::AnswerSent);

    wait_until(|| !relay.peers().contains(&PeerId::from("worker1"))).await;
    assert_eq!(relay.peers(), vec![PeerId::from("client1")]);
}
