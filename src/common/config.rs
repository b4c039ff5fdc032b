//! Configuration for the kvkeeper controller

use crate::common::{parse_duration, Error, Result};
use crate::model::ComponentKind;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Reconciliation settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Metrics and health endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            server: ServerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// `KVKEEPER__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(p) => builder.add_source(config::File::from(p)),
            None => builder.add_source(config::File::with_name("kvkeeper").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("KVKEEPER")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.workers == 0 {
            return Err(Error::InvalidConfig("controller.workers must be > 0".into()));
        }
        if c.rpc_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "controller.rpc_timeout must be > 0".into(),
            ));
        }
        if c.requeue_base_delay > c.requeue_max_delay {
            return Err(Error::InvalidConfig(
                "controller.requeue_base_delay exceeds requeue_max_delay".into(),
            ));
        }
        for (kind, rule) in &c.recovery_quorum {
            if let QuorumRule::AtLeast(0) = rule {
                return Err(Error::InvalidConfig(format!(
                    "recovery quorum for {} must require at least one member",
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// Minimum number of healthy members required before failure records may be
/// cleared by a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumRule {
    /// Every live replica must be healthy
    All,
    /// More than half of the live replicas must be healthy
    Majority,
    /// At least this many healthy replicas
    AtLeast(u32),
}

impl QuorumRule {
    /// Healthy members required out of `members` live replicas
    pub fn required(&self, members: u32) -> u32 {
        match self {
            QuorumRule::All => members,
            QuorumRule::Majority => members / 2 + 1,
            QuorumRule::AtLeast(n) => *n,
        }
    }

    pub fn is_met(&self, healthy: u32, members: u32) -> bool {
        healthy >= self.required(members)
    }
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,

    /// Period between full resyncs of every cluster
    #[serde(with = "duration_str")]
    pub resync_interval: Duration,

    /// Upper bound for each store / capture control RPC
    #[serde(with = "duration_str")]
    pub rpc_timeout: Duration,

    /// Enable automatic failover of unhealthy replicas
    pub auto_failover: bool,

    /// How long a member must stay unhealthy before it is recorded as failed
    #[serde(with = "duration_str")]
    pub failover_period: Duration,

    /// Grace window before a deferred-deletion volume is physically removed
    #[serde(with = "duration_str")]
    pub volume_defer_grace: Duration,

    /// Default graceful shutdown timeout for capture replicas
    #[serde(with = "duration_str")]
    pub graceful_shutdown_timeout: Duration,

    /// Give up waiting for leader eviction after this long during upgrades
    #[serde(with = "duration_str")]
    pub evict_leader_timeout: Duration,

    /// First retry delay after a failed tick
    #[serde(with = "duration_str")]
    pub requeue_base_delay: Duration,

    /// Retry delay cap
    #[serde(with = "duration_str")]
    pub requeue_max_delay: Duration,

    /// Recovery quorum rule per component (defaults to `all`)
    pub recovery_quorum: BTreeMap<ComponentKind, QuorumRule>,

    /// Override for the coordinator API endpoint (otherwise derived from the
    /// cluster's service name)
    pub coordinator_url: Option<String>,

    /// Coordinator client port
    pub coordinator_port: u16,

    /// Capture API port
    pub capture_port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(5),
            auto_failover: true,
            failover_period: Duration::from_secs(5 * 60),
            volume_defer_grace: Duration::from_secs(10 * 60),
            graceful_shutdown_timeout: Duration::from_secs(10 * 60),
            evict_leader_timeout: Duration::from_secs(25 * 60),
            requeue_base_delay: Duration::from_secs(1),
            requeue_max_delay: Duration::from_secs(5 * 60),
            recovery_quorum: BTreeMap::new(),
            coordinator_url: None,
            coordinator_port: 2379,
            capture_port: 8301,
        }
    }
}

impl ControllerConfig {
    pub fn quorum_rule(&self, kind: ComponentKind) -> QuorumRule {
        self.recovery_quorum
            .get(&kind)
            .copied()
            .unwrap_or(QuorumRule::All)
    }
}

/// Metrics / health HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

/// Durations are written as "30s", "5m", "250ms" in config files
mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        if d.subsec_millis() != 0 {
            s.serialize_str(&format!("{}ms", d.as_millis()))
        } else {
            s.serialize_str(&format!("{}s", d.as_secs()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
