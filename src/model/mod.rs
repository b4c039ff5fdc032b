//! Data model: the declared cluster, its status, and the orchestration
//! objects the controller manipulates.

pub mod cluster;
pub mod objects;

pub use cluster::{
    Cluster, ClusterSpec, ClusterStatus, ComponentKind, ComponentSpec, ComponentStatus,
    ConfigUpdateStrategy, FailureRecord, Phase, StorageClaim, StoreRecord, StoreState,
    UpdateStrategyKind,
};
pub use objects::{
    ConfigMap, Labels, Node, ObjectMeta, Pod, PodTemplate, ReplicaSet, ReplicaSetSpec,
    ReplicaSetStatus, Service, ServicePort, UpdateStrategy, VolumeClaim,
};
