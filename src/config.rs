//! Configuration structs for every component in this crate.
//!
//! Each config is a plain `serde`-able struct with a [`Default`] impl carrying
//! the documented defaults, plus a `validate` method invoked once at
//! construction time — the same load-defaults-then-validate shape
//! `InfraConfig`/`FullNodeConfig` use in the node crate. This crate does not
//! itself read TOML/env/CLI args; a caller composing it into a node binary is
//! expected to merge those layers and hand the result here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConnMgrError;

/// Configuration for the [`crate::gater::Gater`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GaterConfig {
    /// Master switch; when `false` every intercept short-circuits to permit.
    pub enabled: bool,
    /// When `true`, [`crate::manager::Manager::block_peer`] actively closes
    /// and removes a currently-connected peer as part of blocking it.
    pub auto_close_blocked: bool,
}

impl Default for GaterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_close_blocked: false,
        }
    }
}

impl GaterConfig {
    pub fn validate(&self) -> Result<(), ConnMgrError> {
        Ok(())
    }
}

/// A single `{prefix_length, rps, burst}` rule for the subnet limiter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PrefixRule {
    pub prefix_len: u8,
    pub rps: f64,
    pub burst: f64,
}

impl PrefixRule {
    pub fn new(prefix_len: u8, rps: f64, burst: f64) -> Self {
        Self {
            prefix_len,
            rps,
            burst,
        }
    }
}

/// Configuration for the [`crate::subnet_limiter::SubnetLimiter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetLimiterConfig {
    pub v4_rules: Vec<PrefixRule>,
    pub v6_rules: Vec<PrefixRule>,
    pub cleanup_interval: Duration,
    pub bucket_expiry: Duration,
}

impl Default for SubnetLimiterConfig {
    fn default() -> Self {
        Self {
            v4_rules: vec![PrefixRule::new(24, 10.0, 50.0), PrefixRule::new(16, 100.0, 500.0)],
            v6_rules: vec![PrefixRule::new(64, 10.0, 50.0), PrefixRule::new(48, 100.0, 500.0)],
            cleanup_interval: Duration::from_secs(5 * 60),
            bucket_expiry: Duration::from_secs(10 * 60),
        }
    }
}

impl SubnetLimiterConfig {
    pub fn validate(&self) -> Result<(), ConnMgrError> {
        for rule in self.v4_rules.iter() {
            if rule.prefix_len > 32 {
                return Err(ConnMgrError::invalid_config(format!(
                    "ipv4 prefix length {} exceeds 32",
                    rule.prefix_len
                )));
            }
        }
        for rule in self.v6_rules.iter() {
            if rule.prefix_len > 128 {
                return Err(ConnMgrError::invalid_config(format!(
                    "ipv6 prefix length {} exceeds 128",
                    rule.prefix_len
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for the jitter/anti-false-positive discipline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    pub enabled: bool,
    pub reconnect_enabled: bool,
    pub tolerance_window: Duration,
    pub state_hold_time: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// 0 means unlimited.
    pub max_reconnect_attempts: u32,
    pub backoff_multiplier: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_enabled: true,
            tolerance_window: Duration::from_secs(5),
            state_hold_time: Duration::from_secs(30),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 5,
            backoff_multiplier: 2.0,
        }
    }
}

impl JitterConfig {
    /// Invalid values are silently normalized to defaults, per §6.
    pub fn normalized(mut self) -> Self {
        let default = Self::default();
        if self.tolerance_window.is_zero() {
            self.tolerance_window = default.tolerance_window;
        }
        if self.state_hold_time.is_zero() {
            self.state_hold_time = default.state_hold_time;
        }
        if self.initial_reconnect_delay.is_zero() {
            self.initial_reconnect_delay = default.initial_reconnect_delay;
        }
        if self.max_reconnect_delay.is_zero() {
            self.max_reconnect_delay = default.max_reconnect_delay;
        }
        if !(self.backoff_multiplier > 1.0) {
            self.backoff_multiplier = default.backoff_multiplier;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConnMgrError> {
        Ok(())
    }
}

/// Configuration for the [`crate::manager::Manager`] facade and its owned
/// pool/trimmer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub low_water: u64,
    pub high_water: u64,
    /// `None` disables the emergency watermark.
    pub emergency_water: Option<u64>,
    pub grace_period: Duration,
    pub idle_timeout: Duration,
    pub trim_interval: Duration,
    pub decay_interval: Duration,
    pub disconnect_protection: Duration,
    pub dial_ratio: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            low_water: 50,
            high_water: 200,
            emergency_water: None,
            grace_period: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(5 * 60),
            trim_interval: Duration::from_secs(10),
            decay_interval: Duration::from_secs(60),
            disconnect_protection: Duration::from_secs(10),
            dial_ratio: 3,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), ConnMgrError> {
        if self.low_water == 0 {
            return Err(ConnMgrError::invalid_config("low_water must be > 0"));
        }
        if self.high_water <= self.low_water {
            return Err(ConnMgrError::invalid_config(
                "high_water must be greater than low_water",
            ));
        }
        if let Some(emergency) = self.emergency_water {
            if emergency <= self.high_water {
                return Err(ConnMgrError::invalid_config(
                    "emergency_water must be greater than high_water",
                ));
            }
        }
        Ok(())
    }
}

/// Tunables for the trimmer's scoring rubric (§4.6). Broken out of
/// `ManagerConfig` since they are trimmer-internal constants a caller rarely
/// needs to touch, but are still configurable for tests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimScoringConfig {
    pub stable_threshold: Duration,
    pub high_latency_threshold: Duration,
}

impl Default for TrimScoringConfig {
    fn default() -> Self {
        Self {
            stable_threshold: Duration::from_secs(10 * 60),
            high_latency_threshold: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_config_validates_watermarks() {
        let mut config = ManagerConfig::default();
        config.low_water = 0;
        assert!(config.validate().is_err());

        config.low_water = 10;
        config.high_water = 10;
        assert!(config.validate().is_err());

        config.high_water = 20;
        config.emergency_water = Some(15);
        assert!(config.validate().is_err());

        config.emergency_water = Some(30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn jitter_config_normalizes_invalid_values() {
        let config = JitterConfig {
            tolerance_window: Duration::ZERO,
            backoff_multiplier: 0.5,
            ..JitterConfig::default()
        }
        .normalized();

        assert_eq!(config.tolerance_window, JitterConfig::default().tolerance_window);
        assert_eq!(config.backoff_multiplier, JitterConfig::default().backoff_multiplier);
    }

    #[test]
    fn subnet_limiter_config_default_matches_spec() {
        let config = SubnetLimiterConfig::default();
        assert_eq!(config.v4_rules.len(), 2);
        assert_eq!(config.v6_rules.len(), 2);
        assert!(config.validate().is_ok());
    }
}
