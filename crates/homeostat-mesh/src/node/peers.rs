//! Known peers

use std::time::Duration;

use dashmap::DashMap;
use homeostat_common::unix_seconds;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A peer this node can dial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    /// Dialable `host:port`
    pub address: String,
    /// Last contact (Unix seconds)
    pub last_seen: f64,
    /// Data announced during discovery
    pub metadata: serde_json::Value,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            address: address.into(),
            last_seen: unix_seconds(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Concurrent peer table keyed by node id
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: DashMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer; returns true when it was not known before
    pub fn upsert(&self, record: PeerRecord) -> bool {
        self.peers.insert(record.peer_id.clone(), record).is_none()
    }

    /// Refresh `last_seen` of a known peer
    pub fn touch(&self, peer_id: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut peer) => {
                peer.last_seen = unix_seconds();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    pub fn remove(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.remove(peer_id).map(|(_, p)| p)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop peers not seen within `max_age`; returns how many were removed
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        self.prune_older_than(unix_seconds() - max_age.as_secs_f64())
    }

    fn prune_older_than(&self, cutoff: f64) -> usize {
        let before = self.peers.len();
        self.peers.retain(|peer_id, peer| {
            let keep = peer.last_seen >= cutoff;
            if !keep {
                debug!(peer_id = %peer_id, "Pruning stale peer");
            }
            keep
        });
        before - self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_touch() {
        let table = PeerTable::new();
        assert!(table.upsert(PeerRecord::new("a", "127.0.0.1:1")));
        assert!(!table.upsert(PeerRecord::new("a", "127.0.0.1:2")));
        assert_eq!(table.get("a").unwrap().address, "127.0.0.1:2");

        assert!(table.touch("a"));
        assert!(!table.touch("b"));
    }

    #[test]
    fn test_prune_older_than() {
        let table = PeerTable::new();
        let mut old = PeerRecord::new("old", "127.0.0.1:1");
        old.last_seen = 100.0;
        table.upsert(old);
        table.upsert(PeerRecord::new("fresh", "127.0.0.1:2"));

        assert_eq!(table.prune_older_than(1_000.0), 1);
        assert!(table.contains("fresh"));
        assert!(!table.contains("old"));
    }

    #[test]
    fn test_prune_stale_keeps_recent() {
        let table = PeerTable::new();
        table.upsert(PeerRecord::new("a", "127.0.0.1:1"));
        assert_eq!(table.prune_stale(Duration::from_secs(60)), 0);
        assert_eq!(table.len(), 1);
    }
}
