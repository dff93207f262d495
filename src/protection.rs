//! Protection store (§3, §4.7): peers carrying at least one protection tag
//! are never evicted by the trimmer. Orthogonal to the priority-weighted
//! [`crate::tags::TagStore`].

use std::collections::{HashMap, HashSet};

use libp2p::PeerId;
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct ProtectionStore {
    tags: RwLock<HashMap<PeerId, HashSet<String>>>,
}

impl ProtectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `tag` for `peer_id`. The peer is protected from this call on.
    pub fn protect(&self, peer_id: PeerId, tag: &str) {
        self.tags.write().entry(peer_id).or_default().insert(tag.to_string());
    }

    /// Removes `tag` for `peer_id`. Returns whether the peer is still
    /// protected (has any remaining protection tags) afterward.
    pub fn unprotect(&self, peer_id: &PeerId, tag: &str) -> bool {
        let mut tags = self.tags.write();
        let Some(set) = tags.get_mut(peer_id) else {
            return false;
        };
        set.remove(tag);
        let still_protected = !set.is_empty();
        if !still_protected {
            tags.remove(peer_id);
        }
        still_protected
    }

    pub fn is_protected(&self, peer_id: &PeerId) -> bool {
        self.tags.read().get(peer_id).map(|set| !set.is_empty()).unwrap_or(false)
    }

    pub fn tags_for_peer(&self, peer_id: &PeerId) -> HashSet<String> {
        self.tags.read().get(peer_id).cloned().unwrap_or_default()
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.tags.write().remove(peer_id);
    }
}
