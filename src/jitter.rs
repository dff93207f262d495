//! Stand-alone jitter controller (§4.8): disconnect grace windows, exponential
//! reconnect backoff, and the background monitor that drives both. Composed
//! into, not duplicated by, [`crate::antifalsepositive::AntiFalsePositive`]
//! per the resolved Open Question on where this logic canonically lives.

use std::sync::Arc;

use libp2p::PeerId;
use parking_lot::RwLock;
use tracing::{debug, warn};
use web_time::Instant;

use crate::callbacks::ReconnectCallback;
use crate::config::JitterConfig;
use crate::grace::GraceTable;
use crate::shutdown::BackgroundTask;

/// Invoked by the background monitor when a grace window's budget is
/// exhausted: the peer should be considered gone.
pub trait RemovalObserver: Send + Sync {
    fn on_removed(&self, peer_id: PeerId);
}

impl<F: Fn(PeerId) + Send + Sync> RemovalObserver for F {
    fn on_removed(&self, peer_id: PeerId) {
        self(peer_id)
    }
}

pub struct JitterController {
    config: JitterConfig,
    grace: Arc<GraceTable>,
    reconnect_callback: RwLock<Option<Arc<dyn ReconnectCallback>>>,
    removal_observer: RwLock<Option<Arc<dyn RemovalObserver>>>,
    task: RwLock<Option<BackgroundTask>>,
}

impl JitterController {
    pub fn new(config: JitterConfig) -> Arc<Self> {
        let config = config.normalized();
        let controller = Arc::new(Self {
            config,
            grace: Arc::new(GraceTable::new()),
            reconnect_callback: RwLock::new(None),
            removal_observer: RwLock::new(None),
            task: RwLock::new(None),
        });

        let this = Arc::clone(&controller);
        let task = BackgroundTask::spawn(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return,
                    _ = ticker.tick() => this.monitor_tick().await,
                }
            }
        });
        *controller.task.write() = Some(task);

        controller
    }

    pub fn set_reconnect_callback(&self, callback: Arc<dyn ReconnectCallback>) {
        *self.reconnect_callback.write() = Some(callback);
    }

    pub fn set_removal_observer(&self, observer: Arc<dyn RemovalObserver>) {
        *self.removal_observer.write() = Some(observer);
    }

    /// Returns `(should_remove, in_grace)`. A disabled controller offers no
    /// protection: it reports the peer as immediately removable.
    pub fn notify_disconnected(&self, peer_id: PeerId) -> (bool, bool) {
        if !self.config.enabled {
            return (true, false);
        }
        self.grace.arm(peer_id, Instant::now(), self.config.initial_reconnect_delay);
        (false, true)
    }

    /// Returns whether a grace entry existed (and was cleared) for `peer_id`.
    pub fn notify_reconnected(&self, peer_id: &PeerId) -> bool {
        self.grace.drop_entry(peer_id)
    }

    pub fn on_communication(&self, peer_id: &PeerId) {
        self.grace.on_communication(peer_id, Instant::now());
    }

    pub fn should_remove(&self, peer_id: &PeerId) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.grace.should_remove(
            peer_id,
            Instant::now(),
            self.config.state_hold_time,
            self.config.max_reconnect_attempts,
        )
    }

    async fn monitor_tick(&self) {
        let now = Instant::now();
        for peer_id in self.grace.active_peers() {
            if self.grace.should_remove(&peer_id, now, self.config.state_hold_time, self.config.max_reconnect_attempts) {
                self.grace.drop_entry(&peer_id);
                if let Some(observer) = self.removal_observer.read().clone() {
                    observer.on_removed(peer_id);
                }
                continue;
            }

            let Some(entry) = self.grace.get(&peer_id) else {
                continue;
            };
            if self.config.reconnect_enabled && now >= entry.next_retry_at {
                self.attempt_reconnect(peer_id).await;
            }
        }
    }

    async fn attempt_reconnect(&self, peer_id: PeerId) {
        self.grace.enter_reconnecting(&peer_id);
        let Some(callback) = self.reconnect_callback.read().clone() else {
            return;
        };
        debug!(peer_id = %peer_id, "attempting jitter reconnect");
        match callback.reconnect(peer_id).await {
            Ok(()) => {
                // Success is recognized only through `notify_reconnected`.
            }
            Err(err) => {
                let Some(entry) = self.grace.get(&peer_id) else {
                    return;
                };
                let delay = std::time::Duration::from_secs_f64(
                    (self.config.initial_reconnect_delay.as_secs_f64() * self.config.backoff_multiplier.powi(entry.attempts as i32 - 1))
                        .min(self.config.max_reconnect_delay.as_secs_f64()),
                );
                warn!(peer_id = %peer_id, %err, "jitter reconnect attempt failed");
                self.grace.enter_held(&peer_id, Instant::now() + delay, err.to_string());
            }
        }
    }

    pub async fn close(&self) {
        let task = self.task.write().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::reconnect_callback_fn;
    use crate::test_support::test_peer_id as peer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> JitterConfig {
        JitterConfig {
            enabled: true,
            reconnect_enabled: false,
            tolerance_window: Duration::from_secs(5),
            state_hold_time: Duration::from_millis(50),
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 3,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn disabled_controller_offers_no_protection() {
        let controller = JitterController::new(JitterConfig { enabled: false, ..test_config() });
        let p = peer(1);
        let (should_remove, in_grace) = controller.notify_disconnected(p);
        assert!(should_remove);
        assert!(!in_grace);
        controller.close().await;
    }

    #[tokio::test]
    async fn reconnect_clears_grace_entry() {
        let controller = JitterController::new(test_config());
        let p = peer(2);
        let (should_remove, in_grace) = controller.notify_disconnected(p);
        assert!(!should_remove);
        assert!(in_grace);

        controller.notify_reconnected(&p);
        assert!(!controller.should_remove(&p));
        controller.close().await;
    }

    #[tokio::test]
    async fn monitor_removes_peer_after_hold_time_expires() {
        let controller = JitterController::new(test_config());
        let p = peer(3);
        let removed = Arc::new(AtomicUsize::new(0));
        let removed_clone = Arc::clone(&removed);
        controller.set_removal_observer(Arc::new(move |_peer_id: PeerId| {
            removed_clone.fetch_add(1, Ordering::SeqCst);
        }));

        controller.notify_disconnected(p);
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert_eq!(removed.load(Ordering::SeqCst), 1);
        controller.close().await;
    }

    #[tokio::test]
    async fn monitor_retries_reconnect_with_backoff_on_failure() {
        let mut config = test_config();
        config.reconnect_enabled = true;
        config.state_hold_time = Duration::from_secs(10);
        let controller = JitterController::new(config);
        let p = peer(4);

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        controller.set_reconnect_callback(reconnect_callback_fn(move |_peer_id| {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(crate::error::ConnMgrError::CallbackFailure("down".into())) }
        }));

        controller.notify_disconnected(p);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(attempts.load(Ordering::SeqCst) >= 1);
        controller.close().await;
    }
}
