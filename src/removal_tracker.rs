//! Protection tracker (§3, §4.9): records when a peer was last removed so a
//! too-eager re-add can be refused for `protection_duration`. Orthogonal to
//! both [`crate::protection::ProtectionStore`] (eviction immunity while
//! connected) and [`crate::grace::GraceTable`] (the disconnect grace window
//! itself) — this tracker only ever sees a peer *after* it's gone.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::RwLock;
use web_time::Instant;

#[derive(Default)]
pub struct RemovalProtectionTracker {
    removed_at: RwLock<HashMap<PeerId, Instant>>,
}

impl RemovalProtectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_removal(&self, peer_id: PeerId, now: Instant) {
        self.removed_at.write().insert(peer_id, now);
    }

    /// `true` iff `peer_id` was removed within the last `duration`.
    pub fn is_protected(&self, peer_id: &PeerId, now: Instant, duration: Duration) -> bool {
        self.removed_at
            .read()
            .get(peer_id)
            .is_some_and(|removed_at| now.saturating_duration_since(*removed_at) < duration)
    }

    /// Drops entries older than `duration`. Called by the Manager's
    /// disconnect-protection reaper so the map doesn't grow unbounded.
    /// Returns the peer-ids dropped, so a caller can also retire any other
    /// per-peer state keyed on "has this peer been fully forgotten yet".
    pub fn sweep_expired(&self, now: Instant, duration: Duration) -> Vec<PeerId> {
        let mut removed_at = self.removed_at.write();
        let expired: Vec<PeerId> = removed_at
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= duration)
            .map(|(peer_id, _)| *peer_id)
            .collect();
        for peer_id in &expired {
            removed_at.remove(peer_id);
        }
        expired
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.removed_at.write().remove(peer_id);
    }
}
