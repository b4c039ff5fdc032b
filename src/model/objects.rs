//! Orchestration-layer objects as seen by the controller
//!
//! These are deliberately thin: only the fields the reconciler reads or
//! writes are modelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::cluster::StorageClaim;

pub type Labels = BTreeMap<String, String>;

/// Common object metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Optimistic concurrency token, bumped on every write
    #[serde(default)]
    pub resource_version: u64,
    /// Spec generation, bumped on spec changes
    #[serde(default)]
    pub generation: u64,
    pub creation_timestamp: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: Labels::new(),
            annotations: BTreeMap::new(),
            resource_version: 0,
            generation: 0,
            creation_timestamp: Utc::now(),
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Does this object carry every label in `selector`?
    pub fn matches(&self, selector: &Labels) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|x| x == v).unwrap_or(false))
    }
}

/// Pod template: the part of the replica set whose change triggers a rollout
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub image: String,
    #[serde(default)]
    pub config_map: Option<String>,
}

/// Update strategy of a replica set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Ordinals >= partition run the new template
    RollingUpdate { partition: u32 },
    OnDelete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    pub replicas: u32,
    pub template: PodTemplate,
    pub update_strategy: UpdateStrategy,
    pub service_name: String,
    #[serde(default)]
    pub claim_templates: Vec<StorageClaim>,
}

/// Live rollout status reported by the orchestration layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetStatus {
    pub observed_generation: u64,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub current_replicas: u32,
    pub updated_replicas: u32,
    #[serde(default)]
    pub current_revision: String,
    #[serde(default)]
    pub update_revision: String,
}

/// An ordered set of identical stateful replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub meta: ObjectMeta,
    pub spec: ReplicaSetSpec,
    #[serde(default)]
    pub status: ReplicaSetStatus,
}

impl ReplicaSet {
    pub fn partition(&self) -> Option<u32> {
        match self.spec.update_strategy {
            UpdateStrategy::RollingUpdate { partition } => Some(partition),
            UpdateStrategy::OnDelete => None,
        }
    }

    pub fn set_partition(&mut self, partition: u32) {
        if let UpdateStrategy::RollingUpdate { .. } = self.spec.update_strategy {
            self.spec.update_strategy = UpdateStrategy::RollingUpdate { partition };
        }
    }

    /// Rollout counters say the replica set is still moving between revisions
    pub fn rollout_in_progress(&self) -> bool {
        if self.status.current_revision != self.status.update_revision {
            return true;
        }
        self.meta.generation > self.status.observed_generation
            && self.spec.replicas == self.status.replicas
    }
}

/// A running replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub node_name: Option<String>,
    pub ready: bool,
    /// When `ready` last flipped
    pub ready_transition_time: DateTime<Utc>,
    /// Names of the volume claims mounted by this pod
    #[serde(default)]
    pub claims: Vec<String>,
}

/// A persistent volume claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub meta: ObjectMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

/// Network endpoint object for the component's replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub meta: ObjectMeta,
    pub selector: Labels,
    pub ports: Vec<ServicePort>,
    pub headless: bool,
    pub publish_not_ready: bool,
}

impl Service {
    /// Fields the controller owns; anything else is left untouched
    pub fn spec_equal(&self, other: &Service) -> bool {
        self.selector == other.selector
            && self.ports == other.ports
            && self.headless == other.headless
            && self.publish_not_ready == other.publish_not_ready
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub meta: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

/// A cluster node with its topology labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub labels: Labels,
}
