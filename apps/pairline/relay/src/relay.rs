use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, gauge};
use pairline_core::{PeerId, SignalingMessage};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{ConnectionId, PeerRegistry};

const DEFAULT_CHANNEL_DEPTH: usize = 64;

/// Frames queued for one connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Signal(SignalingMessage),
    Close { reason: &'static str },
}

pub type Outbox = mpsc::Sender<Outbound>;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub per_connection_buffer: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// No peer is registered under the target id.
    UnknownTarget,
    /// The target's connection is gone or its queue is full.
    Dropped,
    /// The message carries no target.
    Untargeted,
}

/// One websocket's view of the relay: its identity, the id it registered
/// (if any) and the queue feeding its writer.
pub struct Connection {
    id: ConnectionId,
    peer_id: Option<PeerId>,
    outbox: Outbox,
}

impl Connection {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_id: None,
            outbox,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }
}

/// Routes signaling messages between registered peers.
///
/// The relay never inspects `sdp` or `candidate` payloads; it only reads
/// `type` and `target` and overwrites `origin` on forwarded frames.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    registry: PeerRegistry<Outbox>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                registry: PeerRegistry::new(),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.inner.settings
    }

    /// Opens the queue a new websocket's writer drains.
    pub fn open_connection(&self) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.inner.settings.per_connection_buffer);
        (Connection::new(tx), rx)
    }

    /// Binds `peer_id` to `connection`. An existing binding for the same id
    /// is replaced; the replaced transport is not closed.
    pub fn register(&self, connection: &mut Connection, peer_id: PeerId) {
        if let Some(previous) = connection.peer_id.take() {
            if previous != peer_id {
                self.inner.registry.unregister(&previous, connection.id);
            }
        }

        let registration =
            self.inner
                .registry
                .register(peer_id.clone(), connection.id, connection.outbox.clone());
        if let Some(replaced) = registration.replaced {
            if replaced.connection != connection.id {
                counter!("pairline_relay_registrations_replaced_total", 1);
                warn!(
                    peer_id = %peer_id,
                    connection_id = %connection.id,
                    previous_connection = %replaced.connection,
                    "peer id re-registered; previous connection no longer reachable"
                );
            }
        }
        counter!("pairline_relay_registrations_total", 1);
        gauge!("pairline_relay_registered_peers", registration.registered as f64);
        info!(
            peer_id = %peer_id,
            connection_id = %connection.id,
            registered = registration.registered,
            "peer registered"
        );
        connection.peer_id = Some(peer_id);
    }

    /// Registered ids other than the requester's, in registration order.
    pub fn query(&self, requester: Option<&PeerId>) -> Vec<PeerId> {
        let mut peers = self.inner.registry.peer_ids();
        if let Some(requester) = requester {
            peers.retain(|id| id != requester);
        }
        peers
    }

    /// Every registered id, including the caller's.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.registry.peer_ids()
    }

    /// Forwards a targeted message with `origin` set to the sender's
    /// registered id, or cleared when the sender never registered.
    pub fn route(&self, sender: Option<&PeerId>, message: SignalingMessage) -> RouteOutcome {
        let Some(target) = message.target().cloned() else {
            return RouteOutcome::Untargeted;
        };
        let kind = message.kind();
        let Some(outbox) = self.inner.registry.lookup(&target) else {
            counter!("pairline_relay_unknown_target_total", 1, "type" => kind);
            warn!(
                target = %target,
                sender = ?sender.map(PeerId::as_str),
                message_type = kind,
                "target not registered; dropping message"
            );
            return RouteOutcome::UnknownTarget;
        };

        let message = message.with_origin(sender);
        match outbox.try_send(Outbound::Signal(message)) {
            Ok(()) => {
                counter!("pairline_relay_messages_routed_total", 1, "type" => kind);
                debug!(target = %target, message_type = kind, "message routed");
                RouteOutcome::Delivered
            }
            Err(TrySendError::Full(_)) => {
                counter!("pairline_relay_messages_dropped_total", 1, "reason" => "full");
                warn!(target = %target, message_type = kind, "target queue full; dropping message");
                RouteOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                counter!("pairline_relay_messages_dropped_total", 1, "reason" => "closed");
                warn!(target = %target, message_type = kind, "target connection closed; dropping message");
                RouteOutcome::Dropped
            }
        }
    }

    /// Dispatches one decoded frame received on `connection`.
    pub fn handle(&self, connection: &mut Connection, message: SignalingMessage) {
        match message {
            SignalingMessage::Register { peer_id } => self.register(connection, peer_id),
            SignalingMessage::Query => {
                let peers = self.query(connection.peer_id());
                debug!(
                    connection_id = %connection.id,
                    available = peers.len(),
                    "answering peer query"
                );
                let reply = Outbound::Signal(SignalingMessage::AvailablePeers { peers });
                if connection.outbox.try_send(reply).is_err() {
                    warn!(connection_id = %connection.id, "failed to queue available_peers reply");
                }
            }
            SignalingMessage::Quit { target, .. } => {
                if let Some(target) = target {
                    let forwarded = SignalingMessage::Quit {
                        target: Some(target),
                        origin: None,
                    };
                    let sender = connection.peer_id.clone();
                    self.route(sender.as_ref(), forwarded);
                }
                if let Some(peer_id) = connection.peer_id.take() {
                    self.remove(&peer_id, connection.id, "quit");
                }
            }
            message @ (SignalingMessage::Offer { .. }
            | SignalingMessage::Answer { .. }
            | SignalingMessage::Candidate { .. }) => {
                let sender = connection.peer_id.clone();
                self.route(sender.as_ref(), message);
            }
            SignalingMessage::AvailablePeers { .. } => {
                warn!(
                    connection_id = %connection.id,
                    "ignoring available_peers sent by a client"
                );
            }
        }
    }

    /// Records inbound activity for the idle sweep.
    pub fn touch(&self, connection: &Connection) {
        if let Some(peer_id) = &connection.peer_id {
            self.inner
                .registry
                .touch(peer_id, connection.id, Instant::now());
        }
    }

    /// Drops the connection's registration unless a newer connection owns
    /// the id by now.
    pub fn disconnect(&self, connection: &Connection) {
        if let Some(peer_id) = &connection.peer_id {
            self.remove(peer_id, connection.id, "disconnect");
        }
        counter!("pairline_relay_connections_closed_total", 1);
    }

    fn remove(&self, peer_id: &PeerId, connection: ConnectionId, reason: &'static str) {
        if self.inner.registry.unregister(peer_id, connection) {
            gauge!(
                "pairline_relay_registered_peers",
                self.inner.registry.len() as f64
            );
            info!(
                peer_id = %peer_id,
                connection_id = %connection,
                reason,
                "peer unregistered"
            );
        } else {
            debug!(
                peer_id = %peer_id,
                connection_id = %connection,
                reason,
                "registration already owned by a newer connection"
            );
        }
    }

    /// Closes and unregisters every peer idle longer than the configured
    /// timeout as of `now`.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let idle = self
            .inner
            .registry
            .collect_idle(now, self.inner.settings.idle_timeout);
        let mut evicted = 0usize;
        for entry in idle {
            let _ = entry.handle.try_send(Outbound::Close {
                reason: "idle timeout",
            });
            if self.inner.registry.unregister(&entry.peer_id, entry.connection) {
                counter!("pairline_relay_idle_evicted_total", 1);
                info!(
                    peer_id = %entry.peer_id,
                    connection_id = %entry.connection,
                    idle_secs = entry.idle_for.as_secs(),
                    "evicted idle peer"
                );
                evicted += 1;
            }
        }
        if evicted > 0 {
            gauge!(
                "pairline_relay_registered_peers",
                self.inner.registry.len() as f64
            );
        }
        evicted
    }

    pub fn spawn_recycler(&self) -> JoinHandle<()> {
        let relay = self.clone();
        let mut interval = tokio::time::interval(self.inner.settings.sweep_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let _ = relay.evict_idle(Instant::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairline_core::IceCandidate;

    fn relay() -> Relay {
        Relay::new(RelaySettings::default())
    }

    fn signal(rx: &mut mpsc::Receiver<Outbound>) -> SignalingMessage {
        match rx.try_recv().expect("queued frame") {
            Outbound::Signal(message) => message,
            other => panic!("expected signal, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn query_lists_other_peers_only() {
        let relay = relay();
        let (mut worker, _worker_rx) = relay.open_connection();
        let (mut client, mut client_rx) = relay.open_connection();
        relay.handle(&mut worker, SignalingMessage::Register { peer_id: "worker1".into() });
        relay.handle(&mut client, SignalingMessage::Register { peer_id: "client1".into() });

        relay.handle(&mut client, SignalingMessage::Query);
        assert_eq!(
            signal(&mut client_rx),
            SignalingMessage::AvailablePeers {
                peers: vec!["worker1".into()]
            }
        );
        assert_eq!(relay.peers().len(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unregistered_query_sees_everyone() {
        let relay = relay();
        let (mut worker, _worker_rx) = relay.open_connection();
        relay.handle(&mut worker, SignalingMessage::Register { peer_id: "worker1".into() });
        let (mut anonymous, mut anonymous_rx) = relay.open_connection();
        relay.handle(&mut anonymous, SignalingMessage::Query);
        assert_eq!(
            signal(&mut anonymous_rx),
            SignalingMessage::AvailablePeers {
                peers: vec!["worker1".into()]
            }
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_is_forwarded_unchanged_with_origin() {
        let relay = relay();
        let (mut worker, mut worker_rx) = relay.open_connection();
        let (mut client, _client_rx) = relay.open_connection();
        relay.handle(&mut worker, SignalingMessage::Register { peer_id: "worker1".into() });
        relay.handle(&mut client, SignalingMessage::Register { peer_id: "client1".into() });

        let sdp = "v=0\r\ns=-\r\na=ice-ufrag:abcd\r\n".to_string();
        relay.handle(
            &mut client,
            SignalingMessage::Offer {
                target: "worker1".into(),
                sdp: sdp.clone(),
                origin: None,
            },
        );
        assert_eq!(
            signal(&mut worker_rx),
            SignalingMessage::Offer {
                target: "worker1".into(),
                sdp,
                origin: Some("client1".into()),
            }
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_follows_the_offer_origin_not_a_fixed_name() {
        let relay = relay();
        let (mut worker, _worker_rx) = relay.open_connection();
        let (mut alice, mut alice_rx) = relay.open_connection();
        relay.handle(&mut worker, SignalingMessage::Register { peer_id: "worker1".into() });
        relay.handle(&mut alice, SignalingMessage::Register { peer_id: "alice".into() });

        relay.handle(
            &mut worker,
            SignalingMessage::Answer {
                target: "alice".into(),
                sdp: "S2".into(),
                origin: None,
            },
        );
        match signal(&mut alice_rx) {
            SignalingMessage::Answer { origin, sdp, .. } => {
                assert_eq!(sdp, "S2");
                assert_eq!(origin, Some("worker1".into()));
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn claimed_origin_is_replaced_by_registered_id() {
        let relay = relay();
        let (mut worker, mut worker_rx) = relay.open_connection();
        let (mut mallory, _mallory_rx) = relay.open_connection();
        let (mut anonymous, _anonymous_rx) = relay.open_connection();
        relay.handle(&mut worker, SignalingMessage::Register { peer_id: "worker1".into() });
        relay.handle(&mut mallory, SignalingMessage::Register { peer_id: "mallory".into() });

        relay.handle(
            &mut mallory,
            SignalingMessage::Offer {
                target: "worker1".into(),
                sdp: "S1".into(),
                origin: Some("client1".into()),
            },
        );
        assert_eq!(signal(&mut worker_rx).origin(), Some(&PeerId::from("mallory")));

        relay.handle(
            &mut anonymous,
            SignalingMessage::Quit {
                target: Some("worker1".into()),
                origin: Some("client1".into()),
            },
        );
        assert_eq!(
            signal(&mut worker_rx),
            SignalingMessage::Quit {
                target: Some("worker1".into()),
                origin: None,
            }
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_target_is_dropped_without_side_effects() {
        let relay = relay();
        let (mut client, mut client_rx) = relay.open_connection();
        relay.handle(&mut client, SignalingMessage::Register { peer_id: "client1".into() });

        let outcome = relay.route(
            client.peer_id(),
            SignalingMessage::Candidate {
                target: "ghost".into(),
                candidate: IceCandidate::new("candidate:1"),
                origin: None,
            },
        );
        assert_eq!(outcome, RouteOutcome::UnknownTarget);
        assert!(client_rx.try_recv().is_err());
        assert_eq!(relay.peers(), vec![PeerId::from("client1")]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_connection_disconnect_keeps_newer_registration() {
        let relay = relay();
        let (mut first, _first_rx) = relay.open_connection();
        let (mut second, mut second_rx) = relay.open_connection();
        let (mut client, _client_rx) = relay.open_connection();
        relay.handle(&mut first, SignalingMessage::Register { peer_id: "worker1".into() });
        relay.handle(&mut second, SignalingMessage::Register { peer_id: "worker1".into() });
        relay.handle(&mut client, SignalingMessage::Register { peer_id: "client1".into() });

        relay.disconnect(&first);
        assert!(relay.peers().contains(&"worker1".into()));

        relay.handle(
            &mut client,
            SignalingMessage::Offer {
                target: "worker1".into(),
                sdp: "S1".into(),
                origin: None,
            },
        );
        assert!(matches!(signal(&mut second_rx), SignalingMessage::Offer { .. }));

        relay.disconnect(&second);
        assert_eq!(relay.peers(), vec![PeerId::from("client1")]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn quit_forwards_and_unregisters_sender() {
        let relay = relay();
        let (mut worker, mut worker_rx) = relay.open_connection();
        let (mut client, _client_rx) = relay.open_connection();
        relay.handle(&mut worker, SignalingMessage::Register { peer_id: "worker1".into() });
        relay.handle(&mut client, SignalingMessage::Register { peer_id: "client1".into() });

        relay.handle(
            &mut client,
            SignalingMessage::Quit {
                target: Some("worker1".into()),
                origin: None,
            },
        );
        assert_eq!(
            signal(&mut worker_rx),
            SignalingMessage::Quit {
                target: Some("worker1".into()),
                origin: Some("client1".into()),
            }
        );
        assert_eq!(relay.peers(), vec![PeerId::from("worker1")]);
        assert!(client.peer_id().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn reregistering_under_new_id_releases_old_one() {
        let relay = relay();
        let (mut connection, _rx) = relay.open_connection();
        relay.handle(&mut connection, SignalingMessage::Register { peer_id: "a".into() });
        relay.handle(&mut connection, SignalingMessage::Register { peer_id: "b".into() });
        assert_eq!(relay.peers(), vec![PeerId::from("b")]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn idle_peers_are_closed_and_evicted() {
        let relay = relay();
        let (mut worker, mut worker_rx) = relay.open_connection();
        relay.handle(&mut worker, SignalingMessage::Register { peer_id: "worker1".into() });

        assert_eq!(relay.evict_idle(Instant::now()), 0);
        let later = Instant::now() + relay.settings().idle_timeout + Duration::from_secs(1);
        assert_eq!(relay.evict_idle(later), 1);
        assert_eq!(
            worker_rx.try_recv().expect("close queued"),
            Outbound::Close {
                reason: "idle timeout"
            }
        );
        assert!(relay.peers().is_empty());
    }
}
