//! Priority-weighted tag store (§3, §4.7), independent of [`crate::protection::ProtectionStore`].

use std::collections::HashMap;

use libp2p::PeerId;
use parking_lot::RwLock;

/// Summary returned by [`TagStore::get_tag_info`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagInfo {
    /// Sum of all weights — the peer's priority score.
    pub value: i64,
    pub tags: HashMap<String, i64>,
    pub first_seen: u64,
}

struct PeerTags {
    weights: HashMap<String, i64>,
    first_seen: u64,
}

#[derive(Default)]
pub struct TagStore {
    peers: RwLock<HashMap<PeerId, PeerTags>>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `tag`'s weight for `peer_id` to `weight`, creating the peer's
    /// tag entry (and first-seen timestamp) if it didn't exist.
    pub fn tag_peer(&self, peer_id: PeerId, tag: &str, weight: i64, now: u64) {
        let mut peers = self.peers.write();
        let entry = peers.entry(peer_id).or_insert_with(|| PeerTags {
            weights: HashMap::new(),
            first_seen: now,
        });
        entry.weights.insert(tag.to_string(), weight);
    }

    /// Removes `tag` for `peer_id`. Deleting the peer's last tag also drops
    /// its first-seen timestamp.
    pub fn untag_peer(&self, peer_id: &PeerId, tag: &str) {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.weights.remove(tag);
            if entry.weights.is_empty() {
                peers.remove(peer_id);
            }
        }
    }

    /// Applies `f(old_weight) -> new_weight` to `tag`'s weight for
    /// `peer_id`; a missing tag is passed `0`.
    pub fn upsert_tag(&self, peer_id: PeerId, tag: &str, now: u64, f: impl FnOnce(i64) -> i64) {
        let mut peers = self.peers.write();
        let entry = peers.entry(peer_id).or_insert_with(|| PeerTags {
            weights: HashMap::new(),
            first_seen: now,
        });
        let old = entry.weights.get(tag).copied().unwrap_or(0);
        entry.weights.insert(tag.to_string(), f(old));
    }

    pub fn get_tag_info(&self, peer_id: &PeerId) -> TagInfo {
        let peers = self.peers.read();
        match peers.get(peer_id) {
            Some(entry) => TagInfo {
                value: entry.weights.values().sum(),
                tags: entry.weights.clone(),
                first_seen: entry.first_seen,
            },
            None => TagInfo::default(),
        }
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.peers.write().remove(peer_id);
    }
}
