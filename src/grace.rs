//! Per-peer disconnect grace state machine (§4.8), used internally by
//! [`crate::jitter::JitterController`].

use std::collections::HashMap;
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::RwLock;
use web_time::Instant;

/// Extensions a single disconnect grace window may receive via
/// `on_communication` before it stops refreshing.
const MAX_EXTENSIONS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceState {
    Disconnecting,
    Reconnecting,
    Held,
}

#[derive(Debug, Clone)]
pub struct GraceEntry {
    pub state: GraceState,
    pub disconnected_at: Instant,
    pub next_retry_at: Instant,
    pub attempts: u32,
    pub extensions: u32,
    pub last_error: Option<String>,
}

/// Bounded per-peer map of active grace windows.
#[derive(Default)]
pub struct GraceTable {
    entries: RwLock<HashMap<PeerId, GraceEntry>>,
}

impl GraceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or refreshes) a grace window for `peer_id`. Refreshing an
    /// existing entry resets `disconnected_at` but preserves its
    /// `next_retry_at`/`attempts` so an in-flight backoff isn't reset.
    pub fn arm(&self, peer_id: PeerId, now: Instant, initial_reconnect_delay: Duration) {
        let mut entries = self.entries.write();
        match entries.get_mut(&peer_id) {
            Some(entry) => {
                entry.disconnected_at = now;
                entry.state = GraceState::Disconnecting;
            }
            None => {
                entries.insert(
                    peer_id,
                    GraceEntry {
                        state: GraceState::Disconnecting,
                        disconnected_at: now,
                        next_retry_at: now + initial_reconnect_delay,
                        attempts: 0,
                        extensions: 0,
                        last_error: None,
                    },
                );
            }
        }
    }

    /// Drops the grace entry for `peer_id`, returning `true` if one existed.
    pub fn drop_entry(&self, peer_id: &PeerId) -> bool {
        self.entries.write().remove(peer_id).is_some()
    }

    /// Extends the grace window's clock if still `Disconnecting` and under
    /// the extension cap. Returns whether an extension was applied.
    pub fn on_communication(&self, peer_id: &PeerId, now: Instant) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(peer_id) else {
            return false;
        };
        if entry.state != GraceState::Disconnecting || entry.extensions >= MAX_EXTENSIONS {
            return false;
        }
        entry.extensions += 1;
        entry.disconnected_at = now;
        true
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<GraceEntry> {
        self.entries.read().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.entries.read().contains_key(peer_id)
    }

    /// `true` iff a grace entry exists for `peer_id` and it has either
    /// exceeded `state_hold_time` or exhausted its retry budget.
    pub fn should_remove(&self, peer_id: &PeerId, now: Instant, state_hold_time: Duration, max_attempts: u32) -> bool {
        let entries = self.entries.read();
        let Some(entry) = entries.get(peer_id) else {
            return false;
        };
        now.saturating_duration_since(entry.disconnected_at) > state_hold_time
            || (max_attempts > 0 && entry.attempts >= max_attempts)
    }

    pub fn enter_reconnecting(&self, peer_id: &PeerId) {
        if let Some(entry) = self.entries.write().get_mut(peer_id) {
            entry.state = GraceState::Reconnecting;
            entry.attempts += 1;
        }
    }

    pub fn enter_held(&self, peer_id: &PeerId, next_retry_at: Instant, error: String) {
        if let Some(entry) = self.entries.write().get_mut(peer_id) {
            entry.state = GraceState::Held;
            entry.next_retry_at = next_retry_at;
            entry.last_error = Some(error);
        }
    }

    /// Snapshot of peer-ids with an active grace entry, for the background
    /// monitor to scan without holding the lock while it acts.
    pub fn active_peers(&self) -> Vec<PeerId> {
        self.entries.read().keys().copied().collect()
    }
}
