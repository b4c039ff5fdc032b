//! Cluster topology (desired state) and the status sub-resource this
//! controller owns.

use crate::common::{parse_duration, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::objects::ReplicaSetStatus;

/// The stateful components of a cluster, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Placement coordinator
    Coordinator,
    /// Key-value storage engine
    Storage,
    /// Columnar replica
    Columnar,
    /// SQL gateway
    Gateway,
    /// Change-data-capture replica
    Cdc,
    /// Binlog node
    Binlog,
}

impl ComponentKind {
    /// Reconcile order: leaves of the dependency graph first
    pub const ALL: [ComponentKind; 6] = [
        ComponentKind::Coordinator,
        ComponentKind::Storage,
        ComponentKind::Columnar,
        ComponentKind::Gateway,
        ComponentKind::Cdc,
        ComponentKind::Binlog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Coordinator => "coordinator",
            ComponentKind::Storage => "storage",
            ComponentKind::Columnar => "columnar",
            ComponentKind::Gateway => "gateway",
            ComponentKind::Cdc => "cdc",
            ComponentKind::Binlog => "binlog",
        }
    }

    /// Components whose replicas register as stores with the coordinator
    pub fn has_stores(&self) -> bool {
        matches!(self, ComponentKind::Storage | ComponentKind::Columnar)
    }

    /// Components with automatic failover
    pub fn supports_failover(&self) -> bool {
        matches!(
            self,
            ComponentKind::Storage | ComponentKind::Columnar | ComponentKind::Gateway
        )
    }

    /// Ports exposed on the headless peer service
    pub fn peer_ports(&self) -> &'static [(&'static str, u16)] {
        match self {
            ComponentKind::Coordinator => &[("client", 2379), ("peer", 2380)],
            ComponentKind::Storage => &[("peer", 20160), ("status", 20180)],
            ComponentKind::Columnar => &[
                ("columnar", 3930),
                ("proxy", 20170),
                ("metrics", 8234),
                ("proxy-metrics", 20292),
            ],
            ComponentKind::Gateway => &[("status", 10080)],
            ComponentKind::Cdc => &[("capture", 8301)],
            ComponentKind::Binlog => &[("binlog", 8250)],
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling strategy for the replica set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategyKind {
    #[default]
    RollingUpdate,
    OnDelete,
}

/// How rendered config changes reach running replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigUpdateStrategy {
    /// Overwrite the config object in use; replicas pick it up on restart
    InPlace,
    /// Create a new content-addressed config object and roll the replicas
    #[default]
    RollingUpdate,
}

/// Persistent volume claim template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClaim {
    pub name: String,
    pub size: String,
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// Desired topology of one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub replicas: u32,
    pub image: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub storage_claims: Vec<StorageClaim>,
    /// Rendered config files, file name → content
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub config_update_strategy: ConfigUpdateStrategy,
    #[serde(default)]
    pub update_strategy: UpdateStrategyKind,
    #[serde(default)]
    pub suspended: bool,
    /// Upper bound on failure records; `None` disables failover
    #[serde(default = "default_max_failover_count")]
    pub max_failover_count: Option<u32>,
    /// Opt-in: clear failure records once the quorum is healthy
    #[serde(default)]
    pub recover_failover: bool,
    /// One-shot recovery: must equal the status `failover_uid`
    #[serde(default)]
    pub recover_by_uid: Option<String>,
    /// Per-component override, e.g. "10m"
    #[serde(default)]
    pub graceful_shutdown_timeout: Option<String>,
}

fn default_max_failover_count() -> Option<u32> {
    Some(3)
}

impl ComponentSpec {
    pub fn new(replicas: u32, image: impl Into<String>) -> Self {
        Self {
            replicas,
            image: image.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            storage_claims: Vec::new(),
            config: BTreeMap::new(),
            config_update_strategy: ConfigUpdateStrategy::default(),
            update_strategy: UpdateStrategyKind::default(),
            suspended: false,
            max_failover_count: default_max_failover_count(),
            recover_failover: false,
            recover_by_uid: None,
            graceful_shutdown_timeout: None,
        }
    }

    pub fn graceful_shutdown_timeout(&self, default: Duration) -> Result<Duration> {
        match &self.graceful_shutdown_timeout {
            Some(raw) => parse_duration(raw)
                .map_err(|e| Error::InvalidSpec(format!("graceful_shutdown_timeout: {}", e))),
            None => Ok(default),
        }
    }
}

/// Declared cluster specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub cluster_domain: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub components: BTreeMap<ComponentKind, ComponentSpec>,
}

impl ClusterSpec {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            cluster_domain: String::new(),
            paused: false,
            components: BTreeMap::new(),
        }
    }

    pub fn with_component(mut self, kind: ComponentKind, spec: ComponentSpec) -> Self {
        self.components.insert(kind, spec);
        self
    }

    pub fn component(&self, kind: ComponentKind) -> Option<&ComponentSpec> {
        self.components.get(&kind)
    }

    /// `namespace/name`, the work-queue key
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// `.svc` suffix including the optional cluster domain
    pub fn service_suffix(&self) -> String {
        if self.cluster_domain.is_empty() {
            "svc".to_string()
        } else {
            format!("svc.{}", self.cluster_domain)
        }
    }
}

/// Component lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Normal,
    Scale,
    Upgrade,
}

/// Store state as reported by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    Up,
    Down,
    Offline,
    Tombstone,
}

impl StoreState {
    pub fn parse(name: &str) -> Option<StoreState> {
        match name {
            "Up" => Some(StoreState::Up),
            "Down" | "Disconnected" => Some(StoreState::Down),
            "Offline" => Some(StoreState::Offline),
            "Tombstone" => Some(StoreState::Tombstone),
            _ => None,
        }
    }
}

/// One member of the coordinator's store membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: u64,
    pub address: String,
    pub pod_name: String,
    pub state: StoreState,
    pub leader_count: u32,
    pub last_transition_time: DateTime<Utc>,
}

/// A recorded failure of one ordinal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub pod_name: String,
    #[serde(default)]
    pub store_id: Option<u64>,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
    /// Whether a recovery may clear this record
    pub recovery_eligible: bool,
}

/// Status of one component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub phase: Phase,
    /// Whether the last store refresh succeeded
    pub synced: bool,
    #[serde(default)]
    pub replica_set: Option<ReplicaSetStatus>,
    #[serde(default)]
    pub stores: BTreeMap<u64, StoreRecord>,
    #[serde(default)]
    pub peer_stores: BTreeMap<u64, StoreRecord>,
    #[serde(default)]
    pub tombstone_stores: BTreeMap<u64, StoreRecord>,
    /// Failure records keyed by ordinal
    #[serde(default)]
    pub failures: BTreeMap<u32, FailureRecord>,
    /// Token identifying the current failover episode
    #[serde(default)]
    pub failover_uid: Option<String>,
    /// Healthy coordinator members (coordinator component only)
    #[serde(default)]
    pub healthy_members: u32,
    #[serde(default)]
    pub image: Option<String>,
}

impl ComponentStatus {
    /// Store backing a given pod, if it is one of our own
    pub fn store_for_pod(&self, pod_name: &str) -> Option<&StoreRecord> {
        self.stores.values().find(|s| s.pod_name == pod_name)
    }

    pub fn tombstone_for_pod(&self, pod_name: &str) -> Option<&StoreRecord> {
        self.tombstone_stores.values().find(|s| s.pod_name == pod_name)
    }
}

/// Cluster status sub-resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub components: BTreeMap<ComponentKind, ComponentStatus>,
}

/// A cluster object: declared spec plus the status this controller writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
    /// Optimistic concurrency token for status writes
    #[serde(default)]
    pub resource_version: u64,
}

impl Cluster {
    pub fn new(spec: ClusterSpec) -> Self {
        Self {
            spec,
            status: ClusterStatus::default(),
            resource_version: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    pub fn status(&self, kind: ComponentKind) -> Option<&ComponentStatus> {
        self.status.components.get(&kind)
    }

    pub fn status_mut(&mut self, kind: ComponentKind) -> &mut ComponentStatus {
        self.status.components.entry(kind).or_default()
    }

    pub fn phase(&self, kind: ComponentKind) -> Phase {
        self.status(kind).map(|s| s.phase).unwrap_or_default()
    }

    /// Replica count the replica set should converge to. Failure records
    /// add one replacement replica each.
    pub fn desired_replicas(&self, kind: ComponentKind) -> u32 {
        let Some(spec) = self.spec.component(kind) else {
            return 0;
        };
        let failures = if kind.supports_failover() {
            self.status(kind).map(|s| s.failures.len() as u32).unwrap_or(0)
        } else {
            0
        };
        spec.replicas + failures
    }

    /// Coordinator has a healthy majority
    pub fn coordinator_available(&self) -> bool {
        let Some(spec) = self.spec.component(ComponentKind::Coordinator) else {
            return false;
        };
        let healthy = self
            .status(ComponentKind::Coordinator)
            .map(|s| s.healthy_members)
            .unwrap_or(0);
        healthy > spec.replicas / 2
    }

    /// Every replica of the replica set has been created
    pub fn all_pods_started(&self, kind: ComponentKind) -> bool {
        let desired = self.desired_replicas(kind);
        self.status(kind)
            .and_then(|s| s.replica_set.as_ref())
            .map(|rs| rs.replicas == desired)
            .unwrap_or(false)
    }

    /// Every expected store is registered and Up
    pub fn all_stores_ready(&self, kind: ComponentKind) -> bool {
        let Some(status) = self.status(kind) else {
            return false;
        };
        if (status.stores.len() as u32) < self.desired_replicas(kind) {
            return false;
        }
        status.stores.values().all(|s| s.state == StoreState::Up)
    }
}
