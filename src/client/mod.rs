//! Collaborator interfaces
//!
//! Everything the reconciler reads or mutates goes through the traits in
//! this module, bundled in [`Dependencies`] and passed explicitly to every
//! component. Object reads return snapshots; there is no shared cache.
//!
//! - [`memory`]: in-memory implementations for tests and dry runs
//! - [`coordinator`]: HTTP client for the placement coordinator
//! - [`capture`]: HTTP client for change-data-capture replicas

pub mod capture;
pub mod coordinator;
pub mod memory;

use crate::common::{ControllerConfig, Result};
use crate::model::{
    Cluster, ClusterSpec, ConfigMap, Labels, Node, Pod, ReplicaSet, Service, VolumeClaim,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Replica-set CRUD with optimistic concurrency
#[async_trait]
pub trait ReplicaSetControl: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>>;

    async fn create(&self, set: &ReplicaSet) -> Result<ReplicaSet>;

    /// Fails with `Error::Conflict` when `set.meta.resource_version` is stale
    async fn update(&self, set: &ReplicaSet) -> Result<ReplicaSet>;
}

#[async_trait]
pub trait PodControl: Send + Sync {
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Persist labels and annotations of `pod`
    async fn update(&self, pod: &Pod) -> Result<Pod>;
}

#[async_trait]
pub trait VolumeControl: Send + Sync {
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<VolumeClaim>>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<VolumeClaim>>;

    async fn update(&self, claim: &VolumeClaim) -> Result<VolumeClaim>;

    /// Deleting an absent claim is success
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn create(&self, svc: &Service) -> Result<Service>;

    async fn update(&self, svc: &Service) -> Result<Service>;
}

#[async_trait]
pub trait ConfigMapControl: Send + Sync {
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<ConfigMap>>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn create(&self, cm: &ConfigMap) -> Result<ConfigMap>;

    async fn update(&self, cm: &ConfigMap) -> Result<ConfigMap>;

    /// Deleting an absent config map is success
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Node topology-label lookup
#[async_trait]
pub trait NodeLister: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Node>>;
}

/// Persisted cluster objects and their status sub-resource
#[async_trait]
pub trait ClusterControl: Send + Sync {
    async fn list(&self) -> Result<Vec<Cluster>>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    /// Write `cluster.status`; fails with `Error::Conflict` on a stale version
    async fn update_status(&self, cluster: &Cluster) -> Result<Cluster>;
}

/// A store as reported by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub id: u64,
    pub address: String,
    pub state_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub leader_count: u32,
}

/// Replication section of the coordinator config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub location_labels: Vec<String>,
    #[serde(default)]
    pub enable_placement_rules: Option<bool>,
    #[serde(default)]
    pub max_replicas: u32,
}

/// Health of one coordinator member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberHealth {
    pub name: String,
    pub healthy: bool,
}

/// Control RPC of the distributed store's placement coordinator
#[async_trait]
pub trait StoreControl: Send + Sync {
    /// Up / Down / Offline stores
    async fn get_stores(&self, cluster: &ClusterSpec) -> Result<Vec<StoreInfo>>;

    async fn get_tombstone_stores(&self, cluster: &ClusterSpec) -> Result<Vec<StoreInfo>>;

    async fn get_config(&self, cluster: &ClusterSpec) -> Result<ReplicationConfig>;

    async fn update_replication_config(
        &self,
        cluster: &ClusterSpec,
        config: &ReplicationConfig,
    ) -> Result<()>;

    /// Returns whether the labels were written
    async fn set_store_labels(
        &self,
        cluster: &ClusterSpec,
        store_id: u64,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool>;

    /// Start taking a store offline; it becomes Tombstone once drained
    async fn delete_store(&self, cluster: &ClusterSpec, store_id: u64) -> Result<()>;

    async fn begin_evict_leader(&self, cluster: &ClusterSpec, store_id: u64) -> Result<()>;

    async fn end_evict_leader(&self, cluster: &ClusterSpec, store_id: u64) -> Result<()>;

    async fn get_members(&self, cluster: &ClusterSpec) -> Result<Vec<MemberHealth>>;
}

/// Result of one drain request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainStatus {
    /// Work items still assigned to the replica
    pub remaining: u32,
    /// The capture asked to be asked again later
    pub retry: bool,
}

/// Control RPC of change-data-capture replicas
#[async_trait]
pub trait CaptureControl: Send + Sync {
    async fn drain(&self, cluster: &ClusterSpec, ordinal: u32) -> Result<DrainStatus>;

    /// `Ok(false)` means ownership has not moved yet
    async fn resign_ownership(&self, cluster: &ClusterSpec, ordinal: u32) -> Result<bool>;
}

/// Dependency bundle threaded through every component call
#[derive(Clone)]
pub struct Dependencies {
    pub replica_sets: Arc<dyn ReplicaSetControl>,
    pub pods: Arc<dyn PodControl>,
    pub volumes: Arc<dyn VolumeControl>,
    pub services: Arc<dyn ServiceControl>,
    pub config_maps: Arc<dyn ConfigMapControl>,
    /// `None` when the controller lacks permission to read nodes
    pub nodes: Option<Arc<dyn NodeLister>>,
    pub stores: Arc<dyn StoreControl>,
    pub captures: Arc<dyn CaptureControl>,
    pub config: Arc<ControllerConfig>,
}
