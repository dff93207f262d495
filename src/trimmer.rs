//! Periodic and edge-triggered connection trimming (§4.6).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};
use web_time::Instant;

use crate::callbacks::CloseCallback;
use crate::config::{ManagerConfig, TrimScoringConfig};
use crate::peer_state::{PeerConnInfo, PeerStateTable};
use crate::protection::ProtectionStore;
use crate::shutdown::{BackgroundTask, Shutdown};

fn score(
    candidate: &PeerConnInfo,
    now: Instant,
    idle_timeout: Duration,
    stable_threshold: Duration,
    high_latency_threshold: Duration,
    max_bytes: u64,
) -> f64 {
    let mut total = 0.0;

    let idle = now.saturating_duration_since(candidate.last_active);
    total += if idle > idle_timeout {
        100.0
    } else {
        (idle.as_secs_f64() / idle_timeout.as_secs_f64()) * 50.0
    };

    let age = now.saturating_duration_since(candidate.created_at);
    if age < stable_threshold {
        total += (1.0 - age.as_secs_f64() / stable_threshold.as_secs_f64()) * 30.0;
    }

    let bytes = candidate.bytes_sent.saturating_add(candidate.bytes_recv);
    total += if bytes == 0 {
        40.0
    } else {
        (1.0 - bytes as f64 / max_bytes.max(1) as f64) * 40.0
    };

    total += match candidate.rtt {
        Some(rtt) if rtt > high_latency_threshold => 20.0,
        Some(rtt) => (rtt.as_secs_f64() / high_latency_threshold.as_secs_f64()) * 20.0,
        None => 0.0,
    };

    if candidate.direction == crate::peer_state::Direction::Inbound {
        total += 5.0;
    }

    total
}

/// Periodic ticker plus an edge-triggered, 1-slot-coalescing trim request.
pub struct Trimmer {
    table: Arc<PeerStateTable>,
    protection: Arc<ProtectionStore>,
    low_water: u64,
    high_water: u64,
    grace_period: Duration,
    idle_timeout: Duration,
    scoring: TrimScoringConfig,
    close_callback: RwLock<Option<Arc<dyn CloseCallback>>>,
    notify: Arc<tokio::sync::Notify>,
    task: RwLock<Option<BackgroundTask>>,
}

impl Trimmer {
    pub fn new(
        table: Arc<PeerStateTable>,
        protection: Arc<ProtectionStore>,
        manager_config: &ManagerConfig,
        scoring: TrimScoringConfig,
    ) -> Arc<Self> {
        let trimmer = Arc::new(Self {
            table,
            protection,
            low_water: manager_config.low_water,
            high_water: manager_config.high_water,
            grace_period: manager_config.grace_period,
            idle_timeout: manager_config.idle_timeout,
            scoring,
            close_callback: RwLock::new(None),
            notify: Arc::new(tokio::sync::Notify::new()),
            task: RwLock::new(None),
        });

        let interval = manager_config.trim_interval;
        let this = Arc::clone(&trimmer);
        let notify = Arc::clone(&trimmer.notify);
        let task = BackgroundTask::spawn(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return,
                    _ = ticker.tick() => this.run_trim(Some(&shutdown)).await,
                    _ = notify.notified() => this.run_trim(Some(&shutdown)).await,
                }
            }
        });
        *trimmer.task.write() = Some(task);

        trimmer
    }

    pub fn set_close_callback(&self, callback: Arc<dyn CloseCallback>) {
        *self.close_callback.write() = Some(callback);
    }

    /// Non-blocking trim request; multiple pending requests coalesce into
    /// one pass since `Notify` only buffers a single permit.
    pub fn request_trim(&self) {
        self.notify.notify_one();
    }

    /// Runs one trim pass synchronously. Safe to call directly from tests
    /// or from the background loop.
    pub async fn trim_now(&self) {
        self.run_trim(None).await;
    }

    /// Trim pass with an optional mid-loop cancellation check. The periodic
    /// loop passes its own shutdown signal so a `stop()` issued mid-pass
    /// stops closing further candidates instead of running the whole batch
    /// to completion; `trim_now()` (tests, `Manager::trim_now`) has no
    /// shutdown signal available and always runs to completion.
    async fn run_trim(&self, shutdown: Option<&Shutdown>) {
        let count = self.table.conn_count() as u64;
        if count <= self.high_water {
            return;
        }
        let excess = (count - self.low_water) as usize;

        let now = Instant::now();
        let candidates: Vec<PeerConnInfo> = self
            .table
            .all_conn_info()
            .into_iter()
            .filter(|info| !self.protection.is_protected(&info.peer_id))
            .filter(|info| now.saturating_duration_since(info.created_at) >= self.grace_period)
            .collect();

        if candidates.is_empty() {
            return;
        }

        let max_bytes = candidates
            .iter()
            .map(|info| info.bytes_sent.saturating_add(info.bytes_recv))
            .max()
            .unwrap_or(0);

        let mut scored: Vec<(f64, PeerConnInfo)> = candidates
            .into_iter()
            .map(|info| {
                let s = score(
                    &info,
                    now,
                    self.idle_timeout,
                    self.scoring.stable_threshold,
                    self.scoring.high_latency_threshold,
                    max_bytes,
                );
                (s, info)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(excess);

        let callback = self.close_callback.read().clone();
        let mut removed = 0;
        for (_, info) in scored {
            if shutdown.is_some_and(Shutdown::is_signaled) {
                info!(removed, "trim pass cancelled mid-run by shutdown");
                return;
            }
            match &callback {
                Some(callback) => match callback.close(info.peer_id).await {
                    Ok(()) => {
                        self.table.notify_disconnected(&info.peer_id);
                        removed += 1;
                    }
                    Err(err) => {
                        warn!(peer_id = %info.peer_id, %err, "trim close callback failed, peer left in table");
                    }
                },
                None => {
                    self.table.notify_disconnected(&info.peer_id);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "trimmed connections");
        }
    }

    /// Stops the periodic ticker. Idempotent.
    pub async fn close(&self) {
        let task = self.task.write().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}
