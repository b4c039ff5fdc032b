//! In-memory collaborators
//!
//! [`MemoryObjects`] stands in for the orchestration layer: it keeps every
//! object in a map, enforces resource versions, and can emulate what the
//! replica-set controller would do with a replica set ([`MemoryObjects::materialize`]).
//! [`MemoryStoreControl`] and [`MemoryCaptureControl`] are scripted fakes of
//! the coordinator and capture APIs. All of them record the writes they see
//! and accept one-shot error injection keyed by operation name.

use super::{
    CaptureControl, ClusterControl, ConfigMapControl, Dependencies, DrainStatus, MemberHealth,
    NodeLister, PodControl, ReplicaSetControl, ReplicationConfig, ServiceControl, StoreControl,
    StoreInfo, VolumeControl,
};
use crate::common::labels::{
    ordinal_claim_name, ordinal_of, peer_member_name, pod_name, LABEL_REVISION_HASH,
    STORE_ENGINE_COLUMNAR, STORE_ENGINE_LABEL,
};
use crate::common::{fingerprint, ControllerConfig, Error, Result};
use crate::model::{
    Cluster, ClusterSpec, ComponentKind, ConfigMap, Labels, Node, ObjectMeta, Pod, PodTemplate,
    ReplicaSet, Service, UpdateStrategy, VolumeClaim,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One-shot failures keyed by operation name, e.g. `"volume.update"`
#[derive(Default)]
struct Faults {
    pending: Mutex<HashMap<String, Error>>,
}

impl Faults {
    fn inject(&self, op: &str, err: Error) {
        lock(&self.pending).insert(op.to_string(), err);
    }

    fn check(&self, op: &str) -> Result<()> {
        match lock(&self.pending).remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Revision fingerprint of a pod template
pub fn template_revision(template: &PodTemplate) -> Result<String> {
    Ok(fingerprint(template)?[..10].to_string())
}

#[derive(Default)]
struct ObjectState {
    replica_sets: BTreeMap<Key, ReplicaSet>,
    pods: BTreeMap<Key, Pod>,
    volumes: BTreeMap<Key, VolumeClaim>,
    services: BTreeMap<Key, Service>,
    config_maps: BTreeMap<Key, ConfigMap>,
    nodes: BTreeMap<String, Node>,
    clusters: BTreeMap<Key, Cluster>,
    next_version: u64,
}

impl ObjectState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// In-memory orchestration layer
pub struct MemoryObjects {
    state: Mutex<ObjectState>,
    faults: Faults,
    writes: AtomicU64,
    status_writes: AtomicU64,
    log: Mutex<Vec<String>>,
    pods_start_ready: Mutex<bool>,
}

impl Default for MemoryObjects {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ObjectState::default()),
            faults: Faults::default(),
            writes: AtomicU64::new(0),
            status_writes: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            pods_start_ready: Mutex::new(true),
        }
    }

    /// Fail the next call of `op` with `err`
    pub fn fail_once(&self, op: &str, err: Error) {
        self.faults.inject(op, err);
    }

    /// Object writes issued by the controller (status writes excluded)
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Write log entries like `"volume.update default/data-basic-storage-3"`
    pub fn write_log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    fn record(&self, op: &str, namespace: &str, name: &str) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        lock(&self.log).push(format!("{} {}/{}", op, namespace, name));
    }

    /// Whether pods created by [`materialize`](Self::materialize) start ready
    pub fn set_pods_start_ready(&self, ready: bool) {
        *lock(&self.pods_start_ready) = ready;
    }

    // --- seeding and inspection, bypassing write accounting ---

    pub fn put_cluster(&self, mut cluster: Cluster) -> Cluster {
        let mut state = lock(&self.state);
        cluster.resource_version = state.bump();
        state.clusters.insert(
            key(cluster.namespace(), cluster.name()),
            cluster.clone(),
        );
        cluster
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<Cluster> {
        lock(&self.state).clusters.get(&key(namespace, name)).cloned()
    }

    /// Replace the declared spec of a stored cluster, keeping its status
    pub fn update_cluster_spec(&self, spec: ClusterSpec) -> Result<Cluster> {
        let mut state = lock(&self.state);
        let version = state.bump();
        let cluster = state
            .clusters
            .get_mut(&key(&spec.namespace, &spec.name))
            .ok_or_else(|| Error::NotFound(format!("cluster {}", spec.key())))?;
        cluster.spec = spec;
        cluster.resource_version = version;
        Ok(cluster.clone())
    }

    pub fn replica_set(&self, namespace: &str, name: &str) -> Option<ReplicaSet> {
        lock(&self.state)
            .replica_sets
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn put_replica_set(&self, mut set: ReplicaSet) {
        let mut state = lock(&self.state);
        set.meta.resource_version = state.bump();
        state
            .replica_sets
            .insert(key(&set.meta.namespace, &set.meta.name), set);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        lock(&self.state).pods.get(&key(namespace, name)).cloned()
    }

    pub fn put_pod(&self, mut pod: Pod) {
        let mut state = lock(&self.state);
        pod.meta.resource_version = state.bump();
        state
            .pods
            .insert(key(&pod.meta.namespace, &pod.meta.name), pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        lock(&self.state).pods.remove(&key(namespace, name))
    }

    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) -> Result<()> {
        let mut state = lock(&self.state);
        let pod = state
            .pods
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("pod {}/{}", namespace, name)))?;
        if pod.ready != ready {
            pod.ready = ready;
            pod.ready_transition_time = Utc::now();
        }
        Ok(())
    }

    pub fn volume(&self, namespace: &str, name: &str) -> Option<VolumeClaim> {
        lock(&self.state).volumes.get(&key(namespace, name)).cloned()
    }

    pub fn put_volume(&self, mut claim: VolumeClaim) {
        let mut state = lock(&self.state);
        claim.meta.resource_version = state.bump();
        state
            .volumes
            .insert(key(&claim.meta.namespace, &claim.meta.name), claim);
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        lock(&self.state).services.get(&key(namespace, name)).cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        lock(&self.state)
            .config_maps
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn put_node(&self, node: Node) {
        lock(&self.state).nodes.insert(node.name.clone(), node);
    }

    /// Emulate the replica-set controller for every replica set
    pub fn materialize_all(&self) -> Result<()> {
        let keys: Vec<Key> = lock(&self.state).replica_sets.keys().cloned().collect();
        for (ns, name) in keys {
            self.materialize(&ns, &name)?;
        }
        Ok(())
    }

    /// Emulate the replica-set controller for one replica set: create and
    /// remove pods to match the replica count, create claims from the claim
    /// templates, recreate pods at or above the partition on the update
    /// revision, and refresh the rollout status.
    pub fn materialize(&self, namespace: &str, name: &str) -> Result<()> {
        let start_ready = *lock(&self.pods_start_ready);
        let mut state = lock(&self.state);
        let set = state
            .replica_sets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("replica set {}/{}", namespace, name)))?;

        let update_revision = template_revision(&set.spec.template)?;
        let current_revision = if set.status.current_revision.is_empty() {
            update_revision.clone()
        } else {
            set.status.current_revision.clone()
        };
        let replicas = set.spec.replicas;
        let prefix = format!("{}-", name);

        state.pods.retain(|(ns, pod), _| {
            ns != namespace
                || !pod.starts_with(&prefix)
                || ordinal_of(pod).map(|o| o < replicas).unwrap_or(true)
        });

        let now = Utc::now();
        for ordinal in 0..replicas {
            let pod_name = format!("{}{}", prefix, ordinal);
            let wants_update = match set.spec.update_strategy {
                UpdateStrategy::RollingUpdate { partition } => ordinal >= partition,
                UpdateStrategy::OnDelete => false,
            };
            let existing = state.pods.get(&key(namespace, &pod_name)).cloned();
            let on_delete = matches!(set.spec.update_strategy, UpdateStrategy::OnDelete);
            let revision = match &existing {
                Some(pod) => {
                    let rev = pod.meta.labels.get(LABEL_REVISION_HASH);
                    if !wants_update || rev == Some(&update_revision) {
                        continue;
                    }
                    update_revision.clone()
                }
                None if wants_update || on_delete => update_revision.clone(),
                None => current_revision.clone(),
            };

            let mut claims = Vec::new();
            for template in &set.spec.claim_templates {
                let claim_name = ordinal_claim_name(&template.name, name, ordinal);
                if !state.volumes.contains_key(&key(namespace, &claim_name)) {
                    let version = state.bump();
                    let mut meta = ObjectMeta::new(namespace, &claim_name)
                        .with_labels(set.spec.template.labels.clone());
                    meta.resource_version = version;
                    state
                        .volumes
                        .insert(key(namespace, &claim_name), VolumeClaim { meta });
                }
                claims.push(claim_name);
            }

            let mut labels = set.spec.template.labels.clone();
            labels.insert(LABEL_REVISION_HASH.to_string(), revision);
            let mut meta = ObjectMeta::new(namespace, &pod_name).with_labels(labels);
            meta.annotations = set.spec.template.annotations.clone();
            meta.resource_version = state.bump();
            let node_name = existing.as_ref().and_then(|p| p.node_name.clone());
            state.pods.insert(
                key(namespace, &pod_name),
                Pod {
                    meta,
                    node_name,
                    ready: start_ready,
                    ready_transition_time: now,
                    claims,
                },
            );
        }

        let pods: Vec<&Pod> = state
            .pods
            .iter()
            .filter(|((ns, pod), _)| ns == namespace && pod.starts_with(&prefix))
            .filter(|((_, pod), _)| ordinal_of(pod).is_some())
            .map(|(_, p)| p)
            .collect();
        let revision_count = |rev: &str| {
            pods.iter()
                .filter(|p| p.meta.labels.get(LABEL_REVISION_HASH).map(String::as_str) == Some(rev))
                .count() as u32
        };
        let updated = revision_count(&update_revision);
        let ready = pods.iter().filter(|p| p.ready).count() as u32;
        let current_revision = if updated == replicas {
            update_revision.clone()
        } else {
            current_revision
        };
        let current = revision_count(&current_revision);

        if let Some(set) = state.replica_sets.get_mut(&key(namespace, name)) {
            set.status.observed_generation = set.meta.generation;
            set.status.replicas = replicas;
            set.status.ready_replicas = ready;
            set.status.updated_replicas = updated;
            set.status.current_replicas = current;
            set.status.current_revision = current_revision;
            set.status.update_revision = update_revision;
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicaSetControl for MemoryObjects {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>> {
        self.faults.check("replica_set.get")?;
        Ok(self.replica_set(namespace, name))
    }

    async fn create(&self, set: &ReplicaSet) -> Result<ReplicaSet> {
        self.faults.check("replica_set.create")?;
        let mut state = lock(&self.state);
        let k = key(&set.meta.namespace, &set.meta.name);
        if state.replica_sets.contains_key(&k) {
            return Err(Error::AlreadyExists(format!("replica set {}", set.meta.name)));
        }
        let mut created = set.clone();
        created.meta.resource_version = state.bump();
        created.meta.generation = 1;
        state.replica_sets.insert(k, created.clone());
        drop(state);
        self.record("replica_set.create", &set.meta.namespace, &set.meta.name);
        Ok(created)
    }

    async fn update(&self, set: &ReplicaSet) -> Result<ReplicaSet> {
        self.faults.check("replica_set.update")?;
        let mut state = lock(&self.state);
        let version = state.bump();
        let k = key(&set.meta.namespace, &set.meta.name);
        let live = state
            .replica_sets
            .get_mut(&k)
            .ok_or_else(|| Error::NotFound(format!("replica set {}", set.meta.name)))?;
        if live.meta.resource_version != set.meta.resource_version {
            return Err(Error::conflict(
                "replicaset",
                &set.meta.name,
                format!(
                    "resource version {} is stale, live is {}",
                    set.meta.resource_version, live.meta.resource_version
                ),
            ));
        }
        let spec_changed = live.spec != set.spec;
        live.meta.labels = set.meta.labels.clone();
        live.meta.annotations = set.meta.annotations.clone();
        live.spec = set.spec.clone();
        live.meta.resource_version = version;
        if spec_changed {
            live.meta.generation += 1;
        }
        let updated = live.clone();
        drop(state);
        self.record("replica_set.update", &set.meta.namespace, &set.meta.name);
        Ok(updated)
    }
}

#[async_trait]
impl PodControl for MemoryObjects {
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>> {
        self.faults.check("pod.list")?;
        Ok(lock(&self.state)
            .pods
            .values()
            .filter(|p| p.meta.namespace == namespace && p.meta.matches(selector))
            .cloned()
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.faults.check("pod.get")?;
        Ok(self.pod(namespace, name))
    }

    async fn update(&self, pod: &Pod) -> Result<Pod> {
        self.faults.check("pod.update")?;
        let mut state = lock(&self.state);
        let version = state.bump();
        let live = state
            .pods
            .get_mut(&key(&pod.meta.namespace, &pod.meta.name))
            .ok_or_else(|| Error::NotFound(format!("pod {}", pod.meta.name)))?;
        live.meta.labels = pod.meta.labels.clone();
        live.meta.annotations = pod.meta.annotations.clone();
        live.meta.resource_version = version;
        let updated = live.clone();
        drop(state);
        self.record("pod.update", &pod.meta.namespace, &pod.meta.name);
        Ok(updated)
    }
}

#[async_trait]
impl VolumeControl for MemoryObjects {
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<VolumeClaim>> {
        self.faults.check("volume.list")?;
        Ok(lock(&self.state)
            .volumes
            .values()
            .filter(|v| v.meta.namespace == namespace && v.meta.matches(selector))
            .cloned()
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<VolumeClaim>> {
        self.faults.check("volume.get")?;
        Ok(self.volume(namespace, name))
    }

    async fn update(&self, claim: &VolumeClaim) -> Result<VolumeClaim> {
        self.faults.check("volume.update")?;
        let mut state = lock(&self.state);
        let version = state.bump();
        let live = state
            .volumes
            .get_mut(&key(&claim.meta.namespace, &claim.meta.name))
            .ok_or_else(|| Error::NotFound(format!("volume claim {}", claim.meta.name)))?;
        live.meta.labels = claim.meta.labels.clone();
        live.meta.annotations = claim.meta.annotations.clone();
        live.meta.resource_version = version;
        let updated = live.clone();
        drop(state);
        self.record("volume.update", &claim.meta.namespace, &claim.meta.name);
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.faults.check("volume.delete")?;
        let removed = lock(&self.state).volumes.remove(&key(namespace, name));
        if removed.is_some() {
            self.record("volume.delete", namespace, name);
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for MemoryObjects {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.faults.check("service.get")?;
        Ok(self.service(namespace, name))
    }

    async fn create(&self, svc: &Service) -> Result<Service> {
        self.faults.check("service.create")?;
        let mut state = lock(&self.state);
        let k = key(&svc.meta.namespace, &svc.meta.name);
        if state.services.contains_key(&k) {
            return Err(Error::AlreadyExists(format!("service {}", svc.meta.name)));
        }
        let mut created = svc.clone();
        created.meta.resource_version = state.bump();
        state.services.insert(k, created.clone());
        drop(state);
        self.record("service.create", &svc.meta.namespace, &svc.meta.name);
        Ok(created)
    }

    async fn update(&self, svc: &Service) -> Result<Service> {
        self.faults.check("service.update")?;
        let mut state = lock(&self.state);
        let version = state.bump();
        let live = state
            .services
            .get_mut(&key(&svc.meta.namespace, &svc.meta.name))
            .ok_or_else(|| Error::NotFound(format!("service {}", svc.meta.name)))?;
        *live = svc.clone();
        live.meta.resource_version = version;
        let updated = live.clone();
        drop(state);
        self.record("service.update", &svc.meta.namespace, &svc.meta.name);
        Ok(updated)
    }
}

#[async_trait]
impl ConfigMapControl for MemoryObjects {
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<ConfigMap>> {
        self.faults.check("config_map.list")?;
        Ok(lock(&self.state)
            .config_maps
            .values()
            .filter(|cm| cm.meta.namespace == namespace && cm.meta.matches(selector))
            .cloned()
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.faults.check("config_map.get")?;
        Ok(self.config_map(namespace, name))
    }

    async fn create(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        self.faults.check("config_map.create")?;
        let mut state = lock(&self.state);
        let k = key(&cm.meta.namespace, &cm.meta.name);
        if state.config_maps.contains_key(&k) {
            return Err(Error::AlreadyExists(format!("config map {}", cm.meta.name)));
        }
        let mut created = cm.clone();
        created.meta.resource_version = state.bump();
        state.config_maps.insert(k, created.clone());
        drop(state);
        self.record("config_map.create", &cm.meta.namespace, &cm.meta.name);
        Ok(created)
    }

    async fn update(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        self.faults.check("config_map.update")?;
        let mut state = lock(&self.state);
        let version = state.bump();
        let live = state
            .config_maps
            .get_mut(&key(&cm.meta.namespace, &cm.meta.name))
            .ok_or_else(|| Error::NotFound(format!("config map {}", cm.meta.name)))?;
        *live = cm.clone();
        live.meta.resource_version = version;
        let updated = live.clone();
        drop(state);
        self.record("config_map.update", &cm.meta.namespace, &cm.meta.name);
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.faults.check("config_map.delete")?;
        let removed = lock(&self.state).config_maps.remove(&key(namespace, name));
        if removed.is_some() {
            self.record("config_map.delete", namespace, name);
        }
        Ok(())
    }
}

#[async_trait]
impl NodeLister for MemoryObjects {
    async fn get(&self, name: &str) -> Result<Option<Node>> {
        self.faults.check("node.get")?;
        Ok(lock(&self.state).nodes.get(name).cloned())
    }
}

#[async_trait]
impl ClusterControl for MemoryObjects {
    async fn list(&self) -> Result<Vec<Cluster>> {
        self.faults.check("cluster.list")?;
        Ok(lock(&self.state).clusters.values().cloned().collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        self.faults.check("cluster.get")?;
        Ok(self.cluster(namespace, name))
    }

    async fn update_status(&self, cluster: &Cluster) -> Result<Cluster> {
        self.faults.check("cluster.update_status")?;
        let mut state = lock(&self.state);
        let version = state.bump();
        let live = state
            .clusters
            .get_mut(&key(cluster.namespace(), cluster.name()))
            .ok_or_else(|| Error::NotFound(format!("cluster {}", cluster.spec.key())))?;
        if live.resource_version != cluster.resource_version {
            return Err(Error::conflict(
                "cluster",
                cluster.name(),
                format!(
                    "resource version {} is stale, live is {}",
                    cluster.resource_version, live.resource_version
                ),
            ));
        }
        live.status = cluster.status.clone();
        live.resource_version = version;
        let updated = live.clone();
        drop(state);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

/// Address a replica's store registers with:
/// `{pod}.{peer}.{ns}.{svc}:{port}`
pub fn store_address(cluster: &ClusterSpec, kind: ComponentKind, ordinal: u32) -> String {
    let port = kind.peer_ports().first().map(|p| p.1).unwrap_or(20160);
    format!(
        "{}.{}.{}.{}:{}",
        pod_name(&cluster.name, kind, ordinal),
        peer_member_name(&cluster.name, kind),
        cluster.namespace,
        cluster.service_suffix(),
        port
    )
}

#[derive(Default)]
struct CoordinatorState {
    stores: BTreeMap<u64, StoreInfo>,
    tombstones: BTreeMap<u64, StoreInfo>,
    config: ReplicationConfig,
    members: Vec<MemberHealth>,
    evicting: BTreeSet<u64>,
    next_id: u64,
}

/// Scripted placement coordinator
#[derive(Default)]
pub struct MemoryStoreControl {
    state: Mutex<CoordinatorState>,
    faults: Faults,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MemoryStoreControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_once(&self, op: &str, err: Error) {
        self.faults.inject(op, err);
    }

    /// Delay every call, e.g. to exercise RPC timeouts
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    /// Calls seen so far, e.g. `"delete_store 4"`
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn put_store(&self, info: StoreInfo) {
        let mut state = lock(&self.state);
        state.next_id = state.next_id.max(info.id);
        state.stores.insert(info.id, info);
    }

    pub fn put_tombstone(&self, mut info: StoreInfo) {
        info.state_name = "Tombstone".into();
        let mut state = lock(&self.state);
        state.next_id = state.next_id.max(info.id);
        state.tombstones.insert(info.id, info);
    }

    /// Register an Up store for one ordinal of `kind`; returns its id
    pub fn register(&self, cluster: &ClusterSpec, kind: ComponentKind, ordinal: u32) -> u64 {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        let mut labels = BTreeMap::new();
        if kind == ComponentKind::Columnar {
            labels.insert(
                STORE_ENGINE_LABEL.to_string(),
                STORE_ENGINE_COLUMNAR.to_string(),
            );
        }
        state.stores.insert(
            id,
            StoreInfo {
                id,
                address: store_address(cluster, kind, ordinal),
                state_name: "Up".into(),
                labels,
                leader_count: 0,
            },
        );
        id
    }

    pub fn store(&self, id: u64) -> Option<StoreInfo> {
        let state = lock(&self.state);
        state
            .stores
            .get(&id)
            .or_else(|| state.tombstones.get(&id))
            .cloned()
    }

    pub fn store_id_for(&self, address: &str) -> Option<u64> {
        lock(&self.state)
            .stores
            .values()
            .find(|s| s.address == address)
            .map(|s| s.id)
    }

    pub fn set_store_state(&self, id: u64, state_name: &str) {
        if let Some(store) = lock(&self.state).stores.get_mut(&id) {
            store.state_name = state_name.to_string();
        }
    }

    pub fn set_leader_count(&self, id: u64, leaders: u32) {
        if let Some(store) = lock(&self.state).stores.get_mut(&id) {
            store.leader_count = leaders;
        }
    }

    /// Finish taking an Offline store away: it becomes a tombstone
    pub fn finish_offline(&self, id: u64) {
        let mut state = lock(&self.state);
        if let Some(mut store) = state.stores.remove(&id) {
            store.state_name = "Tombstone".into();
            state.tombstones.insert(id, store);
        }
    }

    pub fn set_members(&self, members: Vec<MemberHealth>) {
        lock(&self.state).members = members;
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        lock(&self.state).config.clone()
    }

    pub fn evicting(&self) -> BTreeSet<u64> {
        lock(&self.state).evicting.clone()
    }

    async fn enter(&self, op: &str, call: String) -> Result<()> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.calls).push(call);
        self.faults.check(op)
    }
}

#[async_trait]
impl StoreControl for MemoryStoreControl {
    async fn get_stores(&self, _cluster: &ClusterSpec) -> Result<Vec<StoreInfo>> {
        self.enter("get_stores", "get_stores".into()).await?;
        Ok(lock(&self.state).stores.values().cloned().collect())
    }

    async fn get_tombstone_stores(&self, _cluster: &ClusterSpec) -> Result<Vec<StoreInfo>> {
        self.enter("get_tombstone_stores", "get_tombstone_stores".into())
            .await?;
        Ok(lock(&self.state).tombstones.values().cloned().collect())
    }

    async fn get_config(&self, _cluster: &ClusterSpec) -> Result<ReplicationConfig> {
        self.enter("get_config", "get_config".into()).await?;
        Ok(lock(&self.state).config.clone())
    }

    async fn update_replication_config(
        &self,
        _cluster: &ClusterSpec,
        config: &ReplicationConfig,
    ) -> Result<()> {
        self.enter(
            "update_replication_config",
            "update_replication_config".into(),
        )
        .await?;
        let mut state = lock(&self.state);
        if config.enable_placement_rules.is_some() {
            state.config.enable_placement_rules = config.enable_placement_rules;
        }
        if !config.location_labels.is_empty() {
            state.config.location_labels = config.location_labels.clone();
        }
        if config.max_replicas > 0 {
            state.config.max_replicas = config.max_replicas;
        }
        Ok(())
    }

    async fn set_store_labels(
        &self,
        _cluster: &ClusterSpec,
        store_id: u64,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool> {
        self.enter("set_store_labels", format!("set_store_labels {}", store_id))
            .await?;
        let mut state = lock(&self.state);
        let store = state
            .stores
            .get_mut(&store_id)
            .ok_or_else(|| Error::Store(format!("store {} not found", store_id)))?;
        for (k, v) in labels {
            store.labels.insert(k.clone(), v.clone());
        }
        Ok(true)
    }

    async fn delete_store(&self, _cluster: &ClusterSpec, store_id: u64) -> Result<()> {
        self.enter("delete_store", format!("delete_store {}", store_id))
            .await?;
        if let Some(store) = lock(&self.state).stores.get_mut(&store_id) {
            if store.state_name == "Up" || store.state_name == "Down" {
                store.state_name = "Offline".into();
            }
        }
        Ok(())
    }

    async fn begin_evict_leader(&self, _cluster: &ClusterSpec, store_id: u64) -> Result<()> {
        self.enter(
            "begin_evict_leader",
            format!("begin_evict_leader {}", store_id),
        )
        .await?;
        lock(&self.state).evicting.insert(store_id);
        Ok(())
    }

    async fn end_evict_leader(&self, _cluster: &ClusterSpec, store_id: u64) -> Result<()> {
        self.enter("end_evict_leader", format!("end_evict_leader {}", store_id))
            .await?;
        lock(&self.state).evicting.remove(&store_id);
        Ok(())
    }

    async fn get_members(&self, _cluster: &ClusterSpec) -> Result<Vec<MemberHealth>> {
        self.enter("get_members", "get_members".into()).await?;
        Ok(lock(&self.state).members.clone())
    }
}

/// Scripted capture replicas. Unscripted calls drain nothing and resign
/// immediately.
#[derive(Default)]
pub struct MemoryCaptureControl {
    drains: Mutex<VecDeque<Result<DrainStatus>>>,
    resigns: Mutex<VecDeque<Result<bool>>>,
    drain_calls: AtomicU64,
    resign_calls: AtomicU64,
}

impl MemoryCaptureControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_drain(&self, result: Result<DrainStatus>) {
        lock(&self.drains).push_back(result);
    }

    pub fn push_resign(&self, result: Result<bool>) {
        lock(&self.resigns).push_back(result);
    }

    pub fn drain_calls(&self) -> u64 {
        self.drain_calls.load(Ordering::SeqCst)
    }

    pub fn resign_calls(&self) -> u64 {
        self.resign_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureControl for MemoryCaptureControl {
    async fn drain(&self, _cluster: &ClusterSpec, _ordinal: u32) -> Result<DrainStatus> {
        self.drain_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.drains)
            .pop_front()
            .unwrap_or(Ok(DrainStatus::default()))
    }

    async fn resign_ownership(&self, _cluster: &ClusterSpec, _ordinal: u32) -> Result<bool> {
        self.resign_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.resigns).pop_front().unwrap_or(Ok(true))
    }
}

/// Bundle of in-memory collaborators sharing one controller config
#[derive(Clone)]
pub struct MemoryEnv {
    pub objects: Arc<MemoryObjects>,
    pub stores: Arc<MemoryStoreControl>,
    pub captures: Arc<MemoryCaptureControl>,
    pub config: Arc<ControllerConfig>,
}

impl MemoryEnv {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            objects: Arc::new(MemoryObjects::new()),
            stores: Arc::new(MemoryStoreControl::new()),
            captures: Arc::new(MemoryCaptureControl::new()),
            config: Arc::new(config),
        }
    }

    pub fn dependencies(&self) -> Dependencies {
        Dependencies {
            replica_sets: self.objects.clone(),
            pods: self.objects.clone(),
            volumes: self.objects.clone(),
            services: self.objects.clone(),
            config_maps: self.objects.clone(),
            nodes: Some(self.objects.clone()),
            stores: self.stores.clone(),
            captures: self.captures.clone(),
            config: self.config.clone(),
        }
    }
}

impl Default for MemoryEnv {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}
