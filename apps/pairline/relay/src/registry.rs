use std::collections::HashMap;
use std::time::{Duration, Instant};

use pairline_core::PeerId;
use parking_lot::Mutex;
use uuid::Uuid;

/// Identity of one websocket connection to the relay.
pub type ConnectionId = Uuid;

/// Peer id -> transport handle, last write wins.
///
/// Every entry remembers which connection registered it, so a connection
/// that lost its id to a newer registration cannot evict the newer entry.
/// The mutex is never held across an await point.
pub struct PeerRegistry<T> {
    inner: Mutex<RegistryInner<T>>,
}

struct RegistryInner<T> {
    entries: HashMap<PeerId, RegistryEntry<T>>,
    next_seq: u64,
}

struct RegistryEntry<T> {
    handle: T,
    connection: ConnectionId,
    seq: u64,
    last_activity: Instant,
}

pub struct Registration<T> {
    /// Handle orphaned by this registration, if the id was already taken.
    pub replaced: Option<Replaced<T>>,
    pub registered: usize,
}

pub struct Replaced<T> {
    pub connection: ConnectionId,
    pub handle: T,
}

pub struct IdleEntry<T> {
    pub peer_id: PeerId,
    pub connection: ConnectionId,
    pub handle: T,
    pub idle_for: Duration,
}

impl<T: Clone> PeerRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn register(&self, peer_id: PeerId, connection: ConnectionId, handle: T) -> Registration<T> {
        let mut guard = self.inner.lock();
        let seq = guard.next_seq;
        guard.next_seq += 1;
        let previous = guard.entries.insert(
            peer_id,
            RegistryEntry {
                handle,
                connection,
                seq,
                last_activity: Instant::now(),
            },
        );
        Registration {
            replaced: previous.map(|entry| Replaced {
                connection: entry.connection,
                handle: entry.handle,
            }),
            registered: guard.entries.len(),
        }
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<T> {
        self.inner
            .lock()
            .entries
            .get(peer_id)
            .map(|entry| entry.handle.clone())
    }

    /// Snapshot of the registered ids in registration order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let guard = self.inner.lock();
        let mut ids: Vec<(u64, PeerId)> = guard
            .entries
            .iter()
            .map(|(id, entry)| (entry.seq, id.clone()))
            .collect();
        drop(guard);
        ids.sort_unstable_by_key(|(seq, _)| *seq);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Removes `peer_id` if it still belongs to `connection`.
    pub fn unregister(&self, peer_id: &PeerId, connection: ConnectionId) -> bool {
        let mut guard = self.inner.lock();
        match guard.entries.get(peer_id) {
            Some(entry) if entry.connection == connection => {
                guard.entries.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    pub fn touch(&self, peer_id: &PeerId, connection: ConnectionId, now: Instant) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.entries.get_mut(peer_id) {
            if entry.connection == connection {
                entry.last_activity = now;
            }
        }
    }

    pub fn collect_idle(&self, now: Instant, timeout: Duration) -> Vec<IdleEntry<T>> {
        let guard = self.inner.lock();
        guard
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                let idle_for = now.saturating_duration_since(entry.last_activity);
                (idle_for > timeout).then(|| IdleEntry {
                    peer_id: id.clone(),
                    connection: entry.connection,
                    handle: entry.handle.clone(),
                    idle_for,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for PeerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionId {
        Uuid::new_v4()
    }

    #[test_timeout::timeout]
    fn second_registration_wins() {
        let registry = PeerRegistry::new();
        let (c1, c2) = (conn(), conn());
        let first = registry.register("worker1".into(), c1, "t1");
        assert!(first.replaced.is_none());

        let second = registry.register("worker1".into(), c2, "t2");
        let replaced = second.replaced.expect("t1 replaced");
        assert_eq!(replaced.handle, "t1");
        assert_eq!(replaced.connection, c1);
        assert_eq!(second.registered, 1);
        assert_eq!(registry.lookup(&"worker1".into()), Some("t2"));
    }

    #[test_timeout::timeout]
    fn orphaned_connection_cannot_evict_replacement() {
        let registry = PeerRegistry::new();
        let (c1, c2) = (conn(), conn());
        registry.register("worker1".into(), c1, 1);
        registry.register("worker1".into(), c2, 2);

        assert!(!registry.unregister(&"worker1".into(), c1));
        assert_eq!(registry.lookup(&"worker1".into()), Some(2));
        assert!(registry.unregister(&"worker1".into(), c2));
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn ids_come_back_in_registration_order() {
        let registry = PeerRegistry::new();
        registry.register("b".into(), conn(), ());
        registry.register("a".into(), conn(), ());
        registry.register("c".into(), conn(), ());
        let ids = registry.peer_ids();
        assert_eq!(ids, vec![PeerId::from("b"), "a".into(), "c".into()]);

        registry.register("b".into(), conn(), ());
        assert_eq!(registry.peer_ids().len(), 3);
        assert_eq!(registry.peer_ids().last(), Some(&PeerId::from("b")));
    }

    #[test_timeout::timeout]
    fn idle_entries_are_reported_until_touched() {
        let registry = PeerRegistry::new();
        let c1 = conn();
        registry.register("worker1".into(), c1, ());
        registry.register("client1".into(), conn(), ());

        let later = Instant::now() + Duration::from_secs(120);
        registry.touch(&"worker1".into(), c1, later);

        let idle = registry.collect_idle(later, Duration::from_secs(60));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].peer_id, "client1");
        assert!(idle[0].idle_for > Duration::from_secs(60));
    }
}
