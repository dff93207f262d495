//! Per-prefix token-bucket fleet resisting Sybil connection bursts (§4.2).

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::RwLock;
use tracing::{debug, trace};
use web_time::Instant;

use crate::config::{PrefixRule, SubnetLimiterConfig};
use crate::shutdown::BackgroundTask;
use crate::token_bucket::TokenBucket;

/// Active-bucket and rule-count snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetLimiterStats {
    pub active_buckets: usize,
    pub v4_rules: usize,
    pub v6_rules: usize,
}

fn sort_rules(rules: &mut Vec<PrefixRule>) {
    // Stable sort: equal prefix lengths keep insertion order, so the
    // earlier-added rule wins ties, per §4.2.
    rules.sort_by(|a, b| b.prefix_len.cmp(&a.prefix_len));
}

fn v4_prefix_key(ip: std::net::Ipv4Addr, prefix_len: u8) -> Option<String> {
    Ipv4Net::new(ip, prefix_len).ok().map(|net| net.trunc().to_string())
}

fn v6_prefix_key(ip: std::net::Ipv6Addr, prefix_len: u8) -> Option<String> {
    Ipv6Net::new(ip, prefix_len).ok().map(|net| net.trunc().to_string())
}

/// Per-prefix token-bucket fleet. Cheap to clone (everything shared behind
/// `Arc`/concurrent maps); a single instance is meant to be shared by the
/// Gater and the transport layer.
pub struct SubnetLimiter {
    v4_rules: RwLock<Vec<PrefixRule>>,
    v6_rules: RwLock<Vec<PrefixRule>>,
    buckets: Arc<DashMap<String, Arc<TokenBucket>>>,
    bucket_expiry: std::time::Duration,
    cleanup_task: RwLock<Option<BackgroundTask>>,
}

impl SubnetLimiter {
    /// Constructs the limiter and starts its background cleanup ticker.
    pub fn new(config: SubnetLimiterConfig) -> Arc<Self> {
        let mut v4_rules = config.v4_rules;
        let mut v6_rules = config.v6_rules;
        sort_rules(&mut v4_rules);
        sort_rules(&mut v6_rules);

        let limiter = Arc::new(Self {
            v4_rules: RwLock::new(v4_rules),
            v6_rules: RwLock::new(v6_rules),
            buckets: Arc::new(DashMap::new()),
            bucket_expiry: config.bucket_expiry,
            cleanup_task: RwLock::new(None),
        });

        let buckets = Arc::clone(&limiter.buckets);
        let expiry = limiter.bucket_expiry;
        let interval = config.cleanup_interval;
        let task = BackgroundTask::spawn(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let before = buckets.len();
                        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill()) < expiry);
                        let removed = before - buckets.len();
                        if removed > 0 {
                            trace!(removed, "swept idle subnet-limiter buckets");
                        }
                    }
                }
            }
        });
        *limiter.cleanup_task.write() = Some(task);

        limiter
    }

    /// `true` iff every applicable rule (v4 or v6, most-specific first)
    /// admits the request. Invalid/unclassifiable addresses always pass.
    pub fn allow(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                let rules = self.v4_rules.read().clone();
                for rule in rules {
                    let Some(key) = v4_prefix_key(v4, rule.prefix_len) else {
                        continue;
                    };
                    if !self.bucket_for(key, rule).take() {
                        return false;
                    }
                }
                true
            }
            IpAddr::V6(v6) => {
                let rules = self.v6_rules.read().clone();
                for rule in rules {
                    let Some(key) = v6_prefix_key(v6, rule.prefix_len) else {
                        continue;
                    };
                    if !self.bucket_for(key, rule).take() {
                        return false;
                    }
                }
                true
            }
        }
    }

    fn bucket_for(&self, key: String, rule: PrefixRule) -> Arc<TokenBucket> {
        Arc::clone(
            self.buckets
                .entry(key)
                .or_insert_with(|| Arc::new(TokenBucket::new(rule.rps, rule.burst))),
        )
    }

    pub fn add_v4_limit(&self, prefix_len: u8, rps: f64, burst: f64) {
        let mut rules = self.v4_rules.write();
        rules.push(PrefixRule::new(prefix_len, rps, burst));
        sort_rules(&mut rules);
        debug!(prefix_len, rps, burst, "added ipv4 subnet-limiter rule");
    }

    pub fn add_v6_limit(&self, prefix_len: u8, rps: f64, burst: f64) {
        let mut rules = self.v6_rules.write();
        rules.push(PrefixRule::new(prefix_len, rps, burst));
        sort_rules(&mut rules);
        debug!(prefix_len, rps, burst, "added ipv6 subnet-limiter rule");
    }

    pub fn stats(&self) -> SubnetLimiterStats {
        SubnetLimiterStats {
            active_buckets: self.buckets.len(),
            v4_rules: self.v4_rules.read().len(),
            v6_rules: self.v6_rules.read().len(),
        }
    }

    /// Stops the background cleanup ticker. Idempotent.
    pub async fn close(&self) {
        let task = self.cleanup_task.write().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}
