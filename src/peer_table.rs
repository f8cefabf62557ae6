//! The live peer table: liveness tracking, deduplication, and expiry.
//!
//! Mirrors the teacher's `DiscoveredPeers` (`parking_lot::RwLock` guarding a
//! `HashMap`), generalized from a single `device_id -> DiscoveredPeer`
//! lookup into the full `PeerRecord` lifecycle §3/§4.2 describes: raw and
//! normalized identifiers, online/offline transitions, and single-fire
//! offline callbacks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::codec::PeerId;
use crate::events::{EventSender, PeerEvent};

/// Default liveness window: a peer silent longer than this is expired.
pub const DEFAULT_PEER_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub raw: [u8; 20],
    pub normalized: String,
    pub address: SocketAddr,
    pub last_seen: Instant,
    pub online: bool,
}

struct Inner {
    peers: HashMap<String, PeerRecord>,
}

/// Thread-safe, shareable table of live peers, keyed by normalized id.
///
/// `self_id` is excluded from every insert and snapshot per §3 invariant 2
/// — a peer never appears in its own table.
pub struct PeerTable {
    inner: RwLock<Inner>,
    self_id: String,
    events: EventSender,
    timeout: Duration,
}

impl PeerTable {
    pub fn new(self_id: impl Into<String>, events: EventSender, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
            }),
            self_id: crate::codec::normalize_str(&self_id.into()),
            events,
            timeout,
        })
    }

    /// Insert or refresh a peer record. `raw_id` is the 20-byte wire form
    /// seen on an incoming header/reply; self-origin traffic is ignored.
    ///
    /// On collision (same normalized key, different record) the entry with
    /// the greater `last_seen`/address wins (§3 invariant 3) — since this
    /// call always carries "now", a fresh touch always wins over whatever
    /// was stored.
    ///
    /// Returns `true` if this transitioned the peer from absent/offline to
    /// online, in which case the caller should consider emitting
    /// `PeerOnline` (this function does not emit itself so that callers can
    /// batch discovery replies before notifying the host).
    pub fn touch(&self, raw_id: [u8; 20], address: SocketAddr) -> bool {
        let peer = PeerId::from_raw(raw_id);
        if peer.normalized() == self.self_id {
            return false;
        }

        let mut guard = self.inner.write();
        let became_online = match guard.peers.get(peer.normalized()) {
            Some(existing) => !existing.online,
            None => true,
        };

        guard.peers.insert(
            peer.normalized().to_string(),
            PeerRecord {
                raw: raw_id,
                normalized: peer.normalized().to_string(),
                address,
                last_seen: Instant::now(),
                online: true,
            },
        );

        became_online
    }

    /// Touch a peer and emit `PeerOnline` if this was a fresh sighting.
    pub async fn touch_and_notify(&self, raw_id: [u8; 20], address: SocketAddr) {
        let peer = PeerId::from_raw(raw_id);
        if self.touch(raw_id, address) {
            let _ = self
                .events
                .send(PeerEvent::PeerOnline {
                    peer: peer.normalized().to_string(),
                })
                .await;
        }
    }

    /// Expire peers silent longer than the liveness window, emitting
    /// `PeerOffline` exactly once per transition.
    pub async fn expire(&self, now: Instant) {
        let newly_offline: Vec<String> = {
            let mut guard = self.inner.write();
            let mut offline = Vec::new();
            for record in guard.peers.values_mut() {
                if record.online && now.duration_since(record.last_seen) >= self.timeout {
                    record.online = false;
                    offline.push(record.normalized.clone());
                }
            }
            offline
        };

        for peer in newly_offline {
            let _ = self.events.send(PeerEvent::PeerOffline { peer }).await;
        }
    }

    /// Snapshot-copy every currently online peer. Callers must not hold
    /// the table's lock across a callback invocation, so this always
    /// returns an owned copy.
    pub fn snapshot_online(&self) -> Vec<PeerRecord> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|r| r.online)
            .cloned()
            .collect()
    }

    /// Resolve a normalized peer id to its last-known address.
    pub fn resolve(&self, normalized_id: &str) -> Option<SocketAddr> {
        self.inner
            .read()
            .peers
            .get(normalized_id)
            .filter(|r| r.online)
            .map(|r| r.address)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn raw(id: &str) -> [u8; 20] {
        *PeerId::from_str(id).raw()
    }

    #[tokio::test]
    async fn touch_excludes_self() {
        let (tx, _rx) = crate::events::channel();
        let table = PeerTable::new("alice", tx, Duration::from_secs(90));
        table.touch(raw("alice"), addr(1));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn dedup_collapses_same_normalized_key() {
        let (tx, _rx) = crate::events::channel();
        let table = PeerTable::new("alice", tx, Duration::from_secs(90));

        // Two raw encodings (NUL- vs space-padded) of the same logical id.
        let mut nul_padded = [0u8; 20];
        nul_padded[..3].copy_from_slice(b"bob");
        let mut space_padded = [b' '; 20];
        space_padded[..3].copy_from_slice(b"bob");

        table.touch(nul_padded, addr(1));
        table.touch(space_padded, addr(2));

        let snapshot = table.snapshot_online();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, addr(2));
    }

    #[tokio::test]
    async fn expire_emits_offline_exactly_once() {
        let (tx, mut rx) = crate::events::channel();
        let table = PeerTable::new("alice", tx, Duration::from_millis(1));
        table.touch(raw("bob"), addr(1));

        tokio::time::sleep(Duration::from_millis(5)).await;
        table.expire(Instant::now()).await;
        table.expire(Instant::now()).await;

        let mut offline_count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PeerEvent::PeerOffline { .. }) {
                offline_count += 1;
            }
        }
        assert_eq!(offline_count, 1);
    }

    #[tokio::test]
    async fn resolve_returns_last_known_address() {
        let (tx, _rx) = crate::events::channel();
        let table = PeerTable::new("alice", tx, Duration::from_secs(90));
        table.touch(raw("bob"), addr(42));
        assert_eq!(table.resolve("bob"), Some(addr(42)));
        assert_eq!(table.resolve("carol"), None);
    }
}
