//! Flap detection (§4.8/§4.9): a peer toggling connect/disconnect too fast
//! within `tolerance_window` is "flapping" and is suppressed from grace/trim
//! churn until it goes quiet for a full window.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::RwLock;
use web_time::Instant;

/// Transitions within one `tolerance_window` before a peer is flagged
/// flapping. Not spelled out numerically in the design; five matches the
/// jitter controller's default `max_reconnect_attempts`.
const FLAP_THRESHOLD: usize = 5;

struct PeerFlapState {
    transitions: VecDeque<Instant>,
    flapping: bool,
}

/// Sliding-window per-peer transition counter.
pub struct FlapTracker {
    window: Duration,
    threshold: usize,
    peers: RwLock<HashMap<PeerId, PeerFlapState>>,
}

impl FlapTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            threshold: FLAP_THRESHOLD,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Records a connect or disconnect transition for `peer_id` and returns
    /// whether the peer is (now) considered flapping.
    pub fn record_transition(&self, peer_id: PeerId, now: Instant) -> bool {
        let mut peers = self.peers.write();
        let entry = peers.entry(peer_id).or_insert_with(|| PeerFlapState {
            transitions: VecDeque::new(),
            flapping: false,
        });

        entry.transitions.push_back(now);
        while let Some(front) = entry.transitions.front() {
            if now.saturating_duration_since(*front) > self.window {
                entry.transitions.pop_front();
            } else {
                break;
            }
        }

        if entry.transitions.len() > self.threshold {
            entry.flapping = true;
        } else if entry.transitions.len() <= 1 {
            // A single transition after a quiet period longer than the
            // window means the peer has recovered.
            entry.flapping = false;
        }
        entry.flapping
    }

    pub fn is_flapping(&self, peer_id: &PeerId) -> bool {
        self.peers.read().get(peer_id).map(|entry| entry.flapping).unwrap_or(false)
    }

    /// Test hook: forces `peer_id` into the flapping state regardless of its
    /// recorded transition history.
    pub fn force_flap(&self, peer_id: PeerId, now: Instant) {
        let mut peers = self.peers.write();
        let entry = peers.entry(peer_id).or_insert_with(|| PeerFlapState {
            transitions: VecDeque::new(),
            flapping: false,
        });
        entry.transitions.push_back(now);
        entry.flapping = true;
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.peers.write().remove(peer_id);
    }

    /// Drops entries whose last transition fell out of the window at least
    /// `quiet_for` ago and which aren't currently flagged flapping. Driven
    /// by the Manager's anti-false-positive reaper so a peer that flaps a
    /// few times below threshold and then stays quiet doesn't pin a
    /// `PeerFlapState` in the map forever.
    pub fn sweep_stale(&self, now: Instant, quiet_for: Duration) -> usize {
        let mut peers = self.peers.write();
        let stale: Vec<PeerId> = peers
            .iter()
            .filter(|(_, entry)| {
                !entry.flapping
                    && entry
                        .transitions
                        .back()
                        .is_none_or(|last| now.saturating_duration_since(*last) >= quiet_for)
            })
            .map(|(peer_id, _)| *peer_id)
            .collect();
        for peer_id in &stale {
            peers.remove(peer_id);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_peer_id as peer;

    #[test]
    fn rapid_transitions_trigger_flapping() {
        let tracker = FlapTracker::new(Duration::from_secs(5));
        let p = peer(1);
        let now = Instant::now();

        for _ in 0..FLAP_THRESHOLD {
            assert!(!tracker.record_transition(p, now));
        }
        assert!(tracker.record_transition(p, now));
        assert!(tracker.is_flapping(&p));
    }

    #[test]
    fn old_transitions_fall_out_of_window() {
        let tracker = FlapTracker::new(Duration::from_millis(10));
        let p = peer(2);
        let t0 = Instant::now();

        for _ in 0..(FLAP_THRESHOLD + 1) {
            tracker.record_transition(p, t0);
        }
        assert!(tracker.is_flapping(&p));

        let later = t0 + Duration::from_millis(50);
        tracker.record_transition(p, later);
        assert!(!tracker.is_flapping(&p));
    }

    #[test]
    fn force_flap_test_hook() {
        let tracker = FlapTracker::new(Duration::from_secs(5));
        let p = peer(3);
        assert!(!tracker.is_flapping(&p));
        tracker.force_flap(p, Instant::now());
        assert!(tracker.is_flapping(&p));
    }

    #[test]
    fn sweep_stale_drops_quiet_non_flapping_entries_only() {
        let tracker = FlapTracker::new(Duration::from_millis(10));
        let quiet = peer(4);
        let flapping = peer(5);
        let t0 = Instant::now();

        tracker.record_transition(quiet, t0);
        tracker.force_flap(flapping, t0);

        let later = t0 + Duration::from_secs(1);
        let dropped = tracker.sweep_stale(later, Duration::from_millis(100));

        assert_eq!(dropped, 1);
        assert!(!tracker.is_flapping(&quiet));
        assert!(tracker.is_flapping(&flapping), "flapping entries survive the sweep");
    }
}
