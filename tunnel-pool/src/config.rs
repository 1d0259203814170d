// Copyright (c) 2024 Botho Foundation

//! Tunnel subsystem configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or a file written by an
//! older version) yields a working configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{handshake::RetryPolicy, policy::ClientCircuitPolicy, selection::SelectionConfig};

/// Top-level tunnel configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub tester: TesterConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// How long to wait for one hop's join reply.
    #[serde(default = "default_hop_timeout_ms")]
    pub hop_timeout_ms: u64,

    /// Send attempts per hop when the carrier circuit fails.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,

    /// Delay before the first resend; grows linearly per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long a participation request may wait to resolve its next hop.
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

fn default_hop_timeout_ms() -> u64 {
    10_000
}

fn default_max_send_attempts() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_lookup_timeout_ms() -> u64 {
    5_000
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            hop_timeout_ms: default_hop_timeout_ms(),
            max_send_attempts: default_max_send_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl HandshakeConfig {
    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_send_attempts: self.max_send_attempts.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Minimum usable free-inbound and outbound circuits kept at all times.
    #[serde(default = "default_fallback_floor")]
    pub fallback_floor: usize,

    /// Chance that a non-strict build becomes zero-hop anyway.
    #[serde(default = "default_zero_hop_probability")]
    pub zero_hop_probability: f64,

    /// Unbound inbound circuits kept for the router's own use.
    #[serde(default = "default_exploratory_quantity")]
    pub exploratory_inbound: usize,

    /// Unbound outbound circuits kept for the router's own use.
    #[serde(default = "default_exploratory_quantity")]
    pub exploratory_outbound: usize,

    #[serde(default = "default_exploratory_depth")]
    pub exploratory_depth: usize,

    /// Lifetime of circuits built for the router itself.
    #[serde(default = "default_duration_secs")]
    pub default_duration_secs: u64,

    /// Circuits with less remaining lifetime are not handed out.
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,

    /// Cap on circuits we relay for others.
    #[serde(default = "default_max_participating")]
    pub max_participating: usize,
}

fn default_fallback_floor() -> usize {
    3
}

fn default_zero_hop_probability() -> f64 {
    0.05
}

fn default_exploratory_quantity() -> usize {
    2
}

fn default_exploratory_depth() -> usize {
    2
}

fn default_duration_secs() -> u64 {
    600
}

fn default_safety_margin_secs() -> u64 {
    60
}

fn default_max_participating() -> usize {
    2_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fallback_floor: default_fallback_floor(),
            zero_hop_probability: default_zero_hop_probability(),
            exploratory_inbound: default_exploratory_quantity(),
            exploratory_outbound: default_exploratory_quantity(),
            exploratory_depth: default_exploratory_depth(),
            default_duration_secs: default_duration_secs(),
            safety_margin_secs: default_safety_margin_secs(),
            max_participating: default_max_participating(),
        }
    }
}

impl PoolConfig {
    pub fn safety_margin_ms(&self) -> u64 {
        self.safety_margin_secs * 1_000
    }

    pub fn default_duration(&self) -> Duration {
        Duration::from_secs(self.default_duration_secs)
    }

    /// Policy of the router's own (unbound) circuits.
    pub fn exploratory_policy(&self) -> ClientCircuitPolicy {
        ClientCircuitPolicy {
            inbound_quantity: self.exploratory_inbound,
            outbound_quantity: self.exploratory_outbound,
            inbound_depth: self.exploratory_depth,
            outbound_depth: self.exploratory_depth,
            duration_ms: self.default_duration_secs * 1_000,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_pool_manager_interval_secs")]
    pub pool_manager_interval_secs: u64,

    #[serde(default = "default_expiration_interval_secs")]
    pub expiration_interval_secs: u64,

    /// How often clients are checked for disconnect/reconnect.
    #[serde(default = "default_client_manager_interval_secs")]
    pub client_manager_interval_secs: u64,

    #[serde(default = "default_lease_check_interval_secs")]
    pub lease_check_interval_secs: u64,

    #[serde(default = "default_lease_request_timeout_secs")]
    pub lease_request_timeout_secs: u64,
}

fn default_pool_manager_interval_secs() -> u64 {
    5
}

fn default_expiration_interval_secs() -> u64 {
    10
}

fn default_client_manager_interval_secs() -> u64 {
    30
}

fn default_lease_check_interval_secs() -> u64 {
    15
}

fn default_lease_request_timeout_secs() -> u64 {
    60
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            pool_manager_interval_secs: default_pool_manager_interval_secs(),
            expiration_interval_secs: default_expiration_interval_secs(),
            client_manager_interval_secs: default_client_manager_interval_secs(),
            lease_check_interval_secs: default_lease_check_interval_secs(),
            lease_request_timeout_secs: default_lease_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TesterConfig {
    #[serde(default = "default_tester_interval_secs")]
    pub interval_secs: u64,

    /// Random extra delay added to each interval.
    #[serde(default = "default_tester_jitter_secs")]
    pub jitter_secs: u64,

    /// Chance that an eligible circuit is tested in a pass.
    #[serde(default = "default_test_probability")]
    pub probability: f64,

    /// Circuits expiring within this window are not worth testing.
    #[serde(default = "default_test_window_secs")]
    pub window_secs: u64,

    /// Circuits younger than this are not tested yet.
    #[serde(default = "default_test_min_age_secs")]
    pub min_age_secs: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_max_tests_per_pass")]
    pub max_per_pass: usize,
}

fn default_tester_interval_secs() -> u64 {
    60
}

fn default_tester_jitter_secs() -> u64 {
    30
}

fn default_test_probability() -> f64 {
    0.5
}

fn default_test_window_secs() -> u64 {
    90
}

fn default_test_min_age_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    15_000
}

fn default_max_tests_per_pass() -> usize {
    8
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_tester_interval_secs(),
            jitter_secs: default_tester_jitter_secs(),
            probability: default_test_probability(),
            window_secs: default_test_window_secs(),
            min_age_secs: default_test_min_age_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_per_pass: default_max_tests_per_pass(),
        }
    }
}

impl TesterConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Pool file; persistence is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_persist_interval_secs")]
    pub interval_secs: u64,
}

fn default_persist_interval_secs() -> u64 {
    300
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval_secs: default_persist_interval_secs(),
        }
    }
}

impl TunnelConfig {
    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tunnel config from {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse tunnel config from {}", path.display()))
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize tunnel config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write tunnel config to {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tunnels.toml");

        let mut config = TunnelConfig::default();
        config.pool.fallback_floor = 5;
        config.tester.probability = 0.25;
        config.persist.path = Some(dir.path().join("pool.dat"));
        config.save(&path).unwrap();

        let loaded = TunnelConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: TunnelConfig = toml::from_str("").unwrap();
        assert_eq!(config, TunnelConfig::default());
        assert_eq!(config.pool.fallback_floor, 3);
        assert_eq!(config.maintenance.lease_check_interval_secs, 15);
    }

    #[test]
    fn test_partial_section() {
        let config: TunnelConfig = toml::from_str(
            r#"
            [handshake]
            hop_timeout_ms = 2500

            [selection]
            strict_diversity = true
            "#,
        )
        .unwrap();

        assert_eq!(config.handshake.hop_timeout(), Duration::from_millis(2500));
        assert_eq!(config.handshake.max_send_attempts, 2);
        assert!(config.selection.strict_diversity);
        assert_eq!(config.selection.min_relay_score, 0.2);
    }

    #[test]
    fn test_load_missing_file_fails_with_context() {
        let dir = tempdir().unwrap();
        let err = TunnelConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read tunnel config"));
    }

    #[test]
    fn test_exploratory_policy() {
        let pool = PoolConfig::default();
        let policy = pool.exploratory_policy();
        assert_eq!(policy.inbound_depth, 2);
        assert_eq!(policy.duration_ms, 600_000);
    }
}
