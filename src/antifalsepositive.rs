//! Anti-false-positive wrapper (§4.9): the canonical jitter-tolerance
//! surface the Manager talks to. Composes [`FlapTracker`], the stand-alone
//! [`JitterController`] (grace state-machines + reconnect backoff), and the
//! [`RemovalProtectionTracker`] — per the resolved Open Question, this
//! wrapper is the collaborator the Manager depends on; the jitter controller
//! is its internal implementation detail.

use std::sync::Arc;

use libp2p::PeerId;
use parking_lot::RwLock;
use web_time::Instant;

use crate::callbacks::ReconnectCallback;
use crate::config::JitterConfig;
use crate::flap::FlapTracker;
use crate::jitter::{JitterController, RemovalObserver};
use crate::removal_tracker::RemovalProtectionTracker;

use std::time::Duration;

/// Why [`AntiFalsePositive::should_reject_add`] refused a re-add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The peer was removed less than `protection_duration` ago.
    RecentlyRemoved,
    /// The peer is currently flagged as flapping.
    Flapping,
}

/// Invoked when the wrapper has definitively decided a peer is gone (grace
/// window exhausted without recovery). The Manager wires this to remove the
/// peer from [`crate::peer_state::PeerStateTable`].
pub trait ManagerRemoveCallback: Send + Sync {
    fn on_removed(&self, peer_id: PeerId);
}

impl<F: Fn(PeerId) + Send + Sync> ManagerRemoveCallback for F {
    fn on_removed(&self, peer_id: PeerId) {
        self(peer_id)
    }
}

pub struct AntiFalsePositive {
    flap: FlapTracker,
    jitter: Arc<JitterController>,
    protection: RemovalProtectionTracker,
    protection_duration: Duration,
    manager_remove_callback: RwLock<Option<Arc<dyn ManagerRemoveCallback>>>,
}

impl AntiFalsePositive {
    pub fn new(jitter_config: JitterConfig, protection_duration: Duration) -> Arc<Self> {
        let jitter_config = jitter_config.normalized();
        let jitter = JitterController::new(jitter_config);

        let wrapper = Arc::new(Self {
            flap: FlapTracker::new(jitter_config.tolerance_window),
            jitter,
            protection: RemovalProtectionTracker::new(),
            protection_duration,
            manager_remove_callback: RwLock::new(None),
        });

        wrapper.jitter.set_removal_observer(Arc::clone(&wrapper) as Arc<dyn RemovalObserver>);
        wrapper
    }

    pub fn set_reconnect_callback(&self, callback: Arc<dyn ReconnectCallback>) {
        self.jitter.set_reconnect_callback(callback);
    }

    pub fn set_remove_callback(&self, callback: Arc<dyn ManagerRemoveCallback>) {
        *self.manager_remove_callback.write() = Some(callback);
    }

    /// §4.9 point 1: record a disconnect transition and (unless flapping)
    /// arm the peer's grace window.
    pub fn on_peer_disconnected(&self, peer_id: PeerId) -> (bool, bool) {
        let now = Instant::now();
        let flapping = self.flap.record_transition(peer_id, now);
        if flapping {
            return (false, false);
        }
        self.jitter.notify_disconnected(peer_id)
    }

    /// §4.9 point 2: record a reconnect transition and resume the grace
    /// state-machine if one existed.
    pub fn on_peer_reconnected(&self, peer_id: PeerId) -> (bool, bool) {
        let now = Instant::now();
        let flapping = self.flap.record_transition(peer_id, now);
        if flapping {
            return (false, true);
        }
        let recovered = self.jitter.notify_reconnected(&peer_id);
        (recovered, false)
    }

    pub fn on_communication(&self, peer_id: &PeerId) {
        self.jitter.on_communication(peer_id);
    }

    /// §4.9's `should_reject_add`: protection tracker first, then flap state.
    pub fn should_reject_add(&self, peer_id: &PeerId) -> (bool, Option<RejectReason>) {
        let now = Instant::now();
        if self.protection.is_protected(peer_id, now, self.protection_duration) {
            return (true, Some(RejectReason::RecentlyRemoved));
        }
        if self.flap.is_flapping(peer_id) {
            return (true, Some(RejectReason::Flapping));
        }
        (false, None)
    }

    /// Expires stale removal-protection entries; driven by the Manager's
    /// disconnect-protection reaper. A peer whose protection window just
    /// lapsed is, at that point, fully forgotten: its flap history is
    /// retired alongside so neither of the two bounded maps grows without
    /// limit across a node's lifetime.
    pub fn sweep_expired_protections(&self) -> usize {
        let expired = self.protection.sweep_expired(Instant::now(), self.protection_duration);
        let count = expired.len();
        for peer_id in expired {
            self.flap.remove_peer(&peer_id);
        }
        count
    }

    /// Sweeps `FlapTracker` entries that have gone quiet since before
    /// `quiet_for` ago and aren't currently flagged flapping. A peer that
    /// flaps a couple of times below threshold and then simply stays
    /// connected — or disconnects with jitter disabled, where
    /// `notify_disconnected` never arms a grace entry — never reaches
    /// `sweep_expired_protections`' cleanup path; this is the dedicated
    /// sweep for that case.
    pub fn sweep_stale_flaps(&self, quiet_for: Duration) -> usize {
        self.flap.sweep_stale(Instant::now(), quiet_for)
    }

    /// Test hook (Design Notes §9): forces `peer_id` into the flapping state.
    pub fn debug_force_flap(&self, peer_id: PeerId) {
        self.flap.force_flap(peer_id, Instant::now());
    }

    pub fn debug_is_flapping(&self, peer_id: &PeerId) -> bool {
        self.flap.is_flapping(peer_id)
    }

    /// Stops the internal jitter monitor. Idempotent.
    pub async fn close(&self) {
        self.jitter.close().await;
    }
}

impl RemovalObserver for AntiFalsePositive {
    /// Called by the jitter monitor when a grace window's budget is
    /// exhausted: record the peer into the protection tracker, then forward
    /// to whatever the Manager wired up as its remove callback.
    fn on_removed(&self, peer_id: PeerId) {
        self.protection.record_removal(peer_id, Instant::now());
        if let Some(callback) = self.manager_remove_callback.read().clone() {
            callback.on_removed(peer_id);
        }
    }
}
