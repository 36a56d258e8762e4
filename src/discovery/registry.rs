//! Known-peer registry with query-time expiry

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// A peer learned from its beacons
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    pub id: String,
    pub ip: Ipv4Addr,
    pub control_port: u16,
    pub display_name: String,
    pub username: String,
    /// Wall-clock time of the last beacon, for display
    pub last_seen: DateTime<Utc>,
    /// Monotonic time of the last beacon, for freshness checks
    #[serde(skip)]
    seen_at: Instant,
}

impl Peer {
    /// Time since the last beacon, measured at `now`
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.seen_at)
    }
}

/// Thread-safe map of peers keyed by id
///
/// Stale entries stay in storage and are filtered out by
/// [`list_active`](Self::list_active); only an explicit goodbye or
/// [`prune`](Self::prune) deletes them.
pub struct PeerRegistry {
    self_id: String,
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Insert or refresh a peer, stamping it as seen now
    ///
    /// Returns false, without touching storage, when `id` is our own.
    pub fn upsert(
        &self,
        id: &str,
        ip: Ipv4Addr,
        control_port: u16,
        display_name: &str,
        username: Option<&str>,
    ) -> bool {
        self.upsert_at(id, ip, control_port, display_name, username, Instant::now())
    }

    pub(crate) fn upsert_at(
        &self,
        id: &str,
        ip: Ipv4Addr,
        control_port: u16,
        display_name: &str,
        username: Option<&str>,
        now: Instant,
    ) -> bool {
        if id == self.self_id {
            return false;
        }

        let peer = Peer {
            id: id.to_string(),
            ip,
            control_port,
            display_name: display_name.to_string(),
            username: username.unwrap_or(display_name).to_string(),
            last_seen: Utc::now(),
            seen_at: now,
        };
        self.peers.lock().insert(peer.id.clone(), peer);
        true
    }

    /// Delete a peer immediately; returns whether it was known
    pub fn remove(&self, id: &str) -> bool {
        self.peers.lock().remove(id).is_some()
    }

    /// Peers seen within `max_age`
    pub fn list_active(&self, max_age: Duration) -> Vec<Peer> {
        self.list_active_at(Instant::now(), max_age)
    }

    pub(crate) fn list_active_at(&self, now: Instant, max_age: Duration) -> Vec<Peer> {
        let mut active: Vec<Peer> = self
            .peers
            .lock()
            .values()
            .filter(|peer| peer.age_at(now) <= max_age)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
        active
    }

    /// Look up a stored peer regardless of age
    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.lock().get(id).cloned()
    }

    /// Number of stored peers, stale ones included
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Delete peers silent for longer than `older_than`; returns how many
    pub fn prune(&self, older_than: Duration) -> usize {
        self.prune_at(Instant::now(), older_than)
    }

    pub(crate) fn prune_at(&self, now: Instant, older_than: Duration) -> usize {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|_, peer| peer.age_at(now) <= older_than);
        before - peers.len()
    }
}
