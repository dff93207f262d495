//! Manager facade (§4.10): the single entry point higher layers depend on.
//! Owns every other component in this crate and is the only one to hold
//! strong references to them (Design Notes, "Cyclic ownership pitfalls").

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::antifalsepositive::{AntiFalsePositive, RejectReason};
use crate::blocklist::BlocklistStore;
use crate::callbacks::{CloseCallback, ReconnectCallback};
use crate::config::{GaterConfig, JitterConfig, ManagerConfig, SubnetLimiterConfig, TrimScoringConfig};
use crate::error::ConnMgrError;
use crate::gater::Gater;
use crate::peer_state::{Direction, NewConnection, PeerConnInfo, PeerStateTable};
use crate::protection::ProtectionStore;
use crate::shutdown::BackgroundTask;
use crate::subnet_limiter::SubnetLimiter;
use crate::tags::{TagInfo, TagStore};
use crate::trimmer::Trimmer;

/// Outcome of [`Manager::register`]; a rejection is a policy verdict, not an
/// error (§7's `GaterReject` disposition applies equally here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted,
    Rejected(RejectReason),
    /// The pool is already at `emergency_water`; checked ahead of the
    /// anti-false-positive verdict.
    RejectedAtCapacity,
    /// An inbound connection would push the inbound:outbound ratio past
    /// `dial_ratio`.
    RejectedByDialRatio,
}

/// Snapshot returned by the narrow [`Manager::debug_state`] test hook
/// (Design Notes §9) rather than leaking internal lock guards.
#[derive(Debug, Clone)]
pub struct DebugPeerState {
    pub conn_info: Option<PeerConnInfo>,
    pub protected: bool,
    pub flapping: bool,
}

struct Components {
    subnet_limiter: Arc<SubnetLimiter>,
    trimmer: Arc<Trimmer>,
    afp: Arc<AntiFalsePositive>,
    reapers: Vec<BackgroundTask>,
}

/// Connection-management core. Construction validates configuration but
/// performs no I/O and spawns no background tasks; call [`Manager::start`]
/// to bring the trim loop, jitter monitor, subnet-limiter GC, and the
/// Manager's own three reaper loops online.
pub struct Manager {
    config: ManagerConfig,
    jitter_config: JitterConfig,
    subnet_config: SubnetLimiterConfig,
    scoring_config: TrimScoringConfig,

    table: Arc<PeerStateTable>,
    protection: Arc<ProtectionStore>,
    tags: Arc<TagStore>,
    gater: Arc<Gater>,

    close_callback: RwLock<Option<Arc<dyn CloseCallback>>>,
    reconnect_callback: RwLock<Option<Arc<dyn ReconnectCallback>>>,

    components: RwLock<Option<Components>>,
    started: AtomicBool,
    closed: AtomicBool,
    stop_lock: Mutex<()>,
}

impl Manager {
    /// Validates every config and builds the Manager's non-background-task
    /// state (peer table, protection/tag stores, gater). `store` backs the
    /// gater's blocklist persistence if given.
    pub fn new(
        config: ManagerConfig,
        gater_config: GaterConfig,
        jitter_config: JitterConfig,
        subnet_config: SubnetLimiterConfig,
        scoring_config: TrimScoringConfig,
        store: Option<Arc<dyn BlocklistStore>>,
    ) -> Result<Arc<Self>, ConnMgrError> {
        config.validate()?;
        gater_config.validate()?;
        jitter_config.validate()?;
        subnet_config.validate()?;

        let gater = Arc::new(Gater::new(gater_config, store)?);

        Ok(Arc::new(Self {
            config,
            jitter_config,
            subnet_config,
            scoring_config,
            table: Arc::new(PeerStateTable::new()),
            protection: Arc::new(ProtectionStore::new()),
            tags: Arc::new(TagStore::new()),
            gater,
            close_callback: RwLock::new(None),
            reconnect_callback: RwLock::new(None),
            components: RwLock::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop_lock: Mutex::new(()),
        }))
    }

    /// Brings the trim loop, jitter monitor, subnet-limiter GC, and the
    /// Manager's own three reaper loops online. Not idempotent: a second
    /// call returns [`ConnMgrError::AlreadyStarted`].
    pub fn start(self: &Arc<Self>) -> Result<(), ConnMgrError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnMgrError::ManagerClosed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConnMgrError::AlreadyStarted);
        }

        let subnet_limiter = SubnetLimiter::new(self.subnet_config.clone());

        let trimmer = Trimmer::new(Arc::clone(&self.table), Arc::clone(&self.protection), &self.config, self.scoring_config);
        if let Some(callback) = self.close_callback.read().clone() {
            trimmer.set_close_callback(callback);
        }

        let afp = AntiFalsePositive::new(self.jitter_config, self.config.disconnect_protection);
        if let Some(callback) = self.reconnect_callback.read().clone() {
            afp.set_reconnect_callback(callback);
        }
        let table_for_removal = Arc::clone(&self.table);
        let protection_for_removal = Arc::clone(&self.protection);
        let tags_for_removal = Arc::clone(&self.tags);
        afp.set_remove_callback(Arc::new(move |peer_id: PeerId| {
            table_for_removal.notify_disconnected(&peer_id);
            protection_for_removal.remove_peer(&peer_id);
            tags_for_removal.remove_peer(&peer_id);
            info!(peer_id = %peer_id, "peer removed after grace-window timeout");
        }));

        let reapers = vec![
            self.spawn_stale_peer_reaper(),
            self.spawn_disconnect_protection_reaper(Arc::clone(&afp)),
            self.spawn_anti_false_positive_reaper(Arc::clone(&afp)),
        ];

        *self.components.write() = Some(Components {
            subnet_limiter,
            trimmer,
            afp,
            reapers,
        });

        Ok(())
    }

    /// Sweeps peers idle past `4 * idle_timeout`, a ceiling meant to catch a
    /// stuck trimmer rather than do routine eviction (that's the trimmer's
    /// job). Ticks on `decay_interval`.
    fn spawn_stale_peer_reaper(&self) -> BackgroundTask {
        let table = Arc::clone(&self.table);
        let interval = self.config.decay_interval.max(Duration::from_secs(1));
        let ceiling = self.config.idle_timeout.saturating_mul(4);
        BackgroundTask::spawn(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let stale: Vec<PeerId> = table
                            .all_conn_info()
                            .into_iter()
                            .filter(|info| !info.protected && now.saturating_duration_since(info.last_active) > ceiling)
                            .map(|info| info.peer_id)
                            .collect();
                        for peer_id in &stale {
                            table.notify_disconnected(peer_id);
                        }
                        if !stale.is_empty() {
                            warn!(count = stale.len(), "stale-peer reaper force-removed peers past idle ceiling");
                        }
                    }
                }
            }
        })
    }

    /// Expires [`crate::removal_tracker::RemovalProtectionTracker`] entries
    /// past `disconnect_protection`. Ticks on `decay_interval`.
    fn spawn_disconnect_protection_reaper(&self, afp: Arc<AntiFalsePositive>) -> BackgroundTask {
        let interval = self.config.decay_interval.max(Duration::from_secs(1));
        BackgroundTask::spawn(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return,
                    _ = ticker.tick() => {
                        let removed = afp.sweep_expired_protections();
                        if removed > 0 {
                            debug!(removed, "disconnect-protection reaper swept expired entries");
                        }
                    }
                }
            }
        })
    }

    /// Sweeps stale, non-flapping `FlapTracker` entries so a peer that
    /// flaps a few times below threshold and then goes quiet indefinitely
    /// doesn't pin state in the anti-false-positive wrapper. Ticks on
    /// `decay_interval`, quiet window is the jitter controller's
    /// `tolerance_window`.
    fn spawn_anti_false_positive_reaper(&self, afp: Arc<AntiFalsePositive>) -> BackgroundTask {
        let interval = self.config.decay_interval.max(Duration::from_secs(1));
        let quiet_for = self.jitter_config.normalized().tolerance_window;
        BackgroundTask::spawn(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return,
                    _ = ticker.tick() => {
                        let swept = afp.sweep_stale_flaps(quiet_for);
                        if swept > 0 {
                            debug!(swept, "anti-false-positive reaper swept stale flap entries");
                        }
                    }
                }
            }
        })
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent: the first call stops every owned background task in
    /// reverse construction order; later calls return `Ok(())` immediately.
    pub async fn stop(&self) -> Result<(), ConnMgrError> {
        let _guard = self.stop_lock.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(components) = self.components.write().take() else {
            return Ok(());
        };
        for reaper in components.reapers.into_iter().rev() {
            reaper.stop().await;
        }
        components.afp.close().await;
        components.trimmer.close().await;
        components.subnet_limiter.close().await;
        Ok(())
    }

    fn components(&self) -> Result<parking_lot::RwLockReadGuard<'_, Option<Components>>, ConnMgrError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ConnMgrError::NotStarted);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnMgrError::ManagerClosed);
        }
        Ok(self.components.read())
    }

    // -- connection flow, §4.10 --

    /// Consults the anti-false-positive wrapper's `should_reject_add` before
    /// inserting the peer into the pool; requests a trim if the insertion
    /// crosses `high_water`.
    pub fn register(&self, peer_id: PeerId, direction: Direction) -> Result<RegisterOutcome, ConnMgrError> {
        let guard = self.components()?;
        let components = guard.as_ref().expect("started implies Some");

        if let Some(emergency_water) = self.config.emergency_water {
            if self.table.conn_count() as u64 >= emergency_water {
                warn!(peer_id = %peer_id, emergency_water, "register rejected: pool at emergency watermark");
                return Ok(RegisterOutcome::RejectedAtCapacity);
            }
        }

        if direction == Direction::Inbound
            && self.config.dial_ratio > 0
            && self.table.conn_count() as u64 >= self.config.low_water
        {
            let inbound = self.table.conn_count_by_direction(Direction::Inbound) as u64;
            let outbound = self.table.conn_count_by_direction(Direction::Outbound) as u64;
            if inbound + 1 > u64::from(self.config.dial_ratio) * outbound.max(1) {
                debug!(
                    peer_id = %peer_id,
                    inbound,
                    outbound,
                    dial_ratio = self.config.dial_ratio,
                    "register rejected by inbound:outbound dial ratio"
                );
                return Ok(RegisterOutcome::RejectedByDialRatio);
            }
        }

        let (reject, reason) = components.afp.should_reject_add(&peer_id);
        if reject {
            let reason = reason.expect("reject implies a reason");
            debug!(peer_id = %peer_id, ?reason, "register rejected by anti-false-positive wrapper");
            return Ok(RegisterOutcome::Rejected(reason));
        }

        self.table.notify_connected(NewConnection { peer_id, direction });
        if self.table.conn_count() as u64 > self.config.high_water {
            components.trimmer.request_trim();
        }
        Ok(RegisterOutcome::Accepted)
    }

    /// Routes a disconnect through the anti-false-positive wrapper. If it
    /// decides the peer should be removed immediately (disabled jitter, or
    /// the wrapper already timed it out), removes it from the pool now;
    /// otherwise the peer stays in the table until the grace window lapses.
    pub fn notify_disconnected(&self, peer_id: PeerId) -> Result<(bool, bool), ConnMgrError> {
        let guard = self.components()?;
        let components = guard.as_ref().expect("started implies Some");

        let (should_remove, in_grace) = components.afp.on_peer_disconnected(peer_id);
        if should_remove {
            self.table.notify_disconnected(&peer_id);
        }
        Ok((should_remove, in_grace))
    }

    /// Routes a reconnect through the anti-false-positive wrapper.
    pub fn notify_reconnected(&self, peer_id: PeerId) -> Result<(bool, bool), ConnMgrError> {
        let guard = self.components()?;
        let components = guard.as_ref().expect("started implies Some");
        Ok(components.afp.on_peer_reconnected(peer_id))
    }

    pub fn on_communication(&self, peer_id: &PeerId) -> Result<(), ConnMgrError> {
        let guard = self.components()?;
        let components = guard.as_ref().expect("started implies Some");
        components.afp.on_communication(peer_id);
        Ok(())
    }

    pub fn update_stats(&self, peer_id: &PeerId, bytes_sent: u64, bytes_recv: u64, rtt: Option<Duration>) -> Result<(), ConnMgrError> {
        self.table.update_stats(peer_id, bytes_sent, bytes_recv, rtt)
    }

    pub fn update_last_active(&self, peer_id: &PeerId) -> Result<(), ConnMgrError> {
        self.table.update_last_active(peer_id)
    }

    // -- pool introspection --

    pub fn conn_count(&self) -> usize {
        self.table.conn_count()
    }

    pub fn conn_count_by_tag(&self, tag: &str) -> usize {
        self.table.conn_count_by_tag(tag)
    }

    pub fn get_conn_info(&self, peer_id: &PeerId) -> Option<PeerConnInfo> {
        self.table.get_conn_info(peer_id)
    }

    pub fn all_conn_info(&self) -> Vec<PeerConnInfo> {
        self.table.all_conn_info()
    }

    // -- trim --

    pub fn request_trim(&self) -> Result<(), ConnMgrError> {
        let guard = self.components()?;
        guard.as_ref().expect("started implies Some").trimmer.request_trim();
        Ok(())
    }

    /// Synchronous trim pass, primarily for tests.
    pub async fn trim_now(&self) -> Result<(), ConnMgrError> {
        let trimmer = {
            let guard = self.components()?;
            Arc::clone(&guard.as_ref().expect("started implies Some").trimmer)
        };
        trimmer.trim_now().await;
        Ok(())
    }

    // -- protection / tagging, §4.7 --

    pub fn protect(&self, peer_id: PeerId, tag: &str) {
        self.protection.protect(peer_id, tag);
        self.table.ensure_peer_with_tags(peer_id, self.protection.tags_for_peer(&peer_id), true);
    }

    pub fn unprotect(&self, peer_id: PeerId, tag: &str) -> bool {
        let still_protected = self.protection.unprotect(&peer_id, tag);
        self.table.ensure_peer_with_tags(peer_id, self.protection.tags_for_peer(&peer_id), still_protected);
        still_protected
    }

    pub fn is_protected(&self, peer_id: &PeerId) -> bool {
        self.protection.is_protected(peer_id)
    }

    pub fn tags_for_peer(&self, peer_id: &PeerId) -> std::collections::HashSet<String> {
        self.protection.tags_for_peer(peer_id)
    }

    pub fn tag_peer(&self, peer_id: PeerId, tag: &str, weight: i64, now: u64) {
        self.tags.tag_peer(peer_id, tag, weight, now);
    }

    pub fn untag_peer(&self, peer_id: &PeerId, tag: &str) {
        self.tags.untag_peer(peer_id, tag);
    }

    pub fn upsert_tag(&self, peer_id: PeerId, tag: &str, now: u64, f: impl FnOnce(i64) -> i64) {
        self.tags.upsert_tag(peer_id, tag, now, f);
    }

    pub fn get_tag_info(&self, peer_id: &PeerId) -> TagInfo {
        self.tags.get_tag_info(peer_id)
    }

    // -- gating passthrough --

    pub fn gater(&self) -> &Arc<Gater> {
        &self.gater
    }

    /// Blocks a peer-id through the gater and, when `auto_close_blocked` is
    /// set, closes and removes it from the pool if currently connected.
    /// The close runs after the block has been persisted, so a concurrent
    /// `intercept_*` already observes the peer as blocked either way.
    pub async fn block_peer(&self, peer_id: PeerId) -> Result<(), ConnMgrError> {
        self.gater.block_peer(&peer_id)?;
        if self.gater.config().auto_close_blocked && self.table.contains(&peer_id) {
            let callback = self.close_callback.read().clone();
            match callback {
                Some(callback) => match callback.close(peer_id).await {
                    Ok(()) => self.table.notify_disconnected(&peer_id),
                    Err(err) => warn!(peer_id = %peer_id, %err, "auto-close of newly-blocked peer failed"),
                },
                None => self.table.notify_disconnected(&peer_id),
            }
        }
        Ok(())
    }

    pub fn unblock_peer(&self, peer_id: &PeerId) {
        self.gater.unblock_peer(peer_id);
    }

    pub fn subnet_limiter(&self) -> Result<Arc<SubnetLimiter>, ConnMgrError> {
        let guard = self.components()?;
        Ok(Arc::clone(&guard.as_ref().expect("started implies Some").subnet_limiter))
    }

    // -- callbacks --

    pub fn set_close_callback(&self, callback: Arc<dyn CloseCallback>) {
        *self.close_callback.write() = Some(Arc::clone(&callback));
        if let Some(components) = self.components.read().as_ref() {
            components.trimmer.set_close_callback(callback);
        }
    }

    pub fn set_reconnect_callback(&self, callback: Arc<dyn ReconnectCallback>) {
        *self.reconnect_callback.write() = Some(Arc::clone(&callback));
        if let Some(components) = self.components.read().as_ref() {
            components.afp.set_reconnect_callback(callback);
        }
    }

    // -- test hooks, Design Notes §9 --

    pub fn debug_force_flap(&self, peer_id: PeerId) -> Result<(), ConnMgrError> {
        let guard = self.components()?;
        guard.as_ref().expect("started implies Some").afp.debug_force_flap(peer_id);
        Ok(())
    }

    pub fn debug_state(&self, peer_id: &PeerId) -> Result<DebugPeerState, ConnMgrError> {
        let guard = self.components()?;
        let components = guard.as_ref().expect("started implies Some");
        Ok(DebugPeerState {
            conn_info: self.table.get_conn_info(peer_id),
            protected: self.protection.is_protected(peer_id),
            flapping: components.afp.debug_is_flapping(peer_id),
        })
    }
}
