//! Replica count changes, one ordinal per tick
//!
//! Scaling out adds the ordinal `live`, scaling in removes `live - 1`. When
//! a step cannot be taken yet the replica count of the new replica set is
//! reset to the live one, so a failed step never changes the target.

use crate::client::Dependencies;
use crate::common::labels::pod_name;
use crate::common::{with_timeout, Error, Result};
use crate::model::{Cluster, ComponentKind, Phase, ReplicaSet, StoreState};
use async_trait::async_trait;
use std::cmp::Ordering;

use super::shutdown::graceful_shutdown_capture;
use super::volume::{defer_delete_ordinal, prepare_scale_out};

#[async_trait]
pub trait Scaler: Send + Sync {
    fn kind(&self) -> ComponentKind;

    /// Move `next.spec.replicas` one ordinal from `current` toward the
    /// replica count `next` was built with
    async fn scale(
        &self,
        cluster: &mut Cluster,
        current: &ReplicaSet,
        next: &mut ReplicaSet,
        deps: &Dependencies,
    ) -> Result<()> {
        let live = current.spec.replicas;
        let desired = next.spec.replicas;
        next.spec.replicas = live;

        match desired.cmp(&live) {
            Ordering::Greater => {
                if self.scale_out(cluster, live, deps).await? {
                    next.spec.replicas = live + 1;
                    tracing::info!(
                        "Scaling out {} of {}: {} -> {} (desired {})",
                        self.kind(),
                        cluster.spec.key(),
                        live,
                        live + 1,
                        desired
                    );
                }
            }
            Ordering::Less => {
                if self.scale_in(cluster, live - 1, deps).await? {
                    next.spec.replicas = live - 1;
                    tracing::info!(
                        "Scaling in {} of {}: {} -> {} (desired {})",
                        self.kind(),
                        cluster.spec.key(),
                        live,
                        live - 1,
                        desired
                    );
                }
            }
            Ordering::Equal => {}
        }
        Ok(())
    }

    /// Prepare adding `ordinal`; `Ok(false)` holds the step back
    async fn scale_out(
        &self,
        cluster: &mut Cluster,
        ordinal: u32,
        deps: &Dependencies,
    ) -> Result<bool> {
        let kind = self.kind();
        if cluster.phase(kind) == Phase::Upgrade {
            return Err(Error::requeue(format!(
                "{} of {} is upgrading, cannot scale out ordinal {}",
                kind,
                cluster.spec.key(),
                ordinal
            )));
        }
        prepare_scale_out(&cluster.spec, kind, ordinal, deps).await?;
        Ok(true)
    }

    /// Prepare removing `ordinal`; `Ok(false)` holds the step back
    async fn scale_in(
        &self,
        cluster: &mut Cluster,
        ordinal: u32,
        deps: &Dependencies,
    ) -> Result<bool>;
}

/// Scaler for components without a removal protocol
pub struct GeneralScaler {
    kind: ComponentKind,
}

impl GeneralScaler {
    pub fn new(kind: ComponentKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Scaler for GeneralScaler {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    async fn scale_in(
        &self,
        cluster: &mut Cluster,
        ordinal: u32,
        deps: &Dependencies,
    ) -> Result<bool> {
        defer_delete_ordinal(&cluster.spec, self.kind, ordinal, deps).await?;
        Ok(true)
    }
}

/// Scaler for store-bearing components: a replica is removed only after
/// its store has been taken offline and became a tombstone
pub struct StoreScaler {
    kind: ComponentKind,
}

impl StoreScaler {
    pub fn new(kind: ComponentKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Scaler for StoreScaler {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    async fn scale_in(
        &self,
        cluster: &mut Cluster,
        ordinal: u32,
        deps: &Dependencies,
    ) -> Result<bool> {
        let kind = self.kind;
        let pod = pod_name(&cluster.spec.name, kind, ordinal);
        let status = cluster.status(kind).cloned().unwrap_or_default();
        if !status.synced {
            return Err(Error::requeue(format!(
                "{} stores of {} not synced, cannot scale in {}",
                kind,
                cluster.spec.key(),
                pod
            )));
        }

        if let Some(store) = status.store_for_pod(&pod) {
            match store.state {
                StoreState::Up | StoreState::Down => {
                    with_timeout(
                        deps.config.rpc_timeout,
                        "delete store",
                        deps.stores.delete_store(&cluster.spec, store.id),
                    )
                    .await?;
                    tracing::info!("Taking store {} of pod {} offline", store.id, pod);
                    return Err(Error::requeue(format!(
                        "store {} of {} is going offline",
                        store.id, pod
                    )));
                }
                StoreState::Offline => {
                    return Err(Error::requeue(format!(
                        "store {} of {} is still offline, waiting for tombstone",
                        store.id, pod
                    )));
                }
                StoreState::Tombstone => {}
            }
        } else if status.tombstone_for_pod(&pod).is_none() {
            // no store at all: only safe once the pod cannot register one
            if let Some(p) = deps.pods.get(&cluster.spec.namespace, &pod).await? {
                if p.ready {
                    return Err(Error::requeue(format!(
                        "pod {} is ready but has no store yet",
                        pod
                    )));
                }
            }
        }

        defer_delete_ordinal(&cluster.spec, kind, ordinal, deps).await?;
        Ok(true)
    }
}

/// Scaler for capture replicas: drain and resign before removal
pub struct CaptureScaler;

#[async_trait]
impl Scaler for CaptureScaler {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Cdc
    }

    async fn scale_in(
        &self,
        cluster: &mut Cluster,
        ordinal: u32,
        deps: &Dependencies,
    ) -> Result<bool> {
        let pod = pod_name(&cluster.spec.name, ComponentKind::Cdc, ordinal);
        if let Some(p) = deps.pods.get(&cluster.spec.namespace, &pod).await? {
            if p.ready {
                graceful_shutdown_capture(&cluster.spec, ordinal, deps, chrono::Utc::now()).await?;
            }
        }
        defer_delete_ordinal(&cluster.spec, ComponentKind::Cdc, ordinal, deps).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{store_address, MemoryEnv};
    use crate::client::{DrainStatus, StoreInfo};
    use crate::common::labels::{component_labels, ANN_DEFER_DELETING};
    use crate::common::format_timestamp;
    use crate::member::store_status::refresh_store_status;
    use crate::model::{
        ClusterSpec, ComponentSpec, ObjectMeta, Pod, PodTemplate, ReplicaSetSpec, StorageClaim,
        UpdateStrategy, VolumeClaim,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn cluster(kind: ComponentKind, replicas: u32) -> Cluster {
        let mut spec = ComponentSpec::new(replicas, "img:v1");
        spec.storage_claims.push(StorageClaim {
            name: "data".into(),
            size: "1Gi".into(),
            storage_class: None,
        });
        Cluster::new(ClusterSpec::new("default", "basic").with_component(kind, spec))
    }

    fn replica_set(kind: ComponentKind, replicas: u32) -> ReplicaSet {
        ReplicaSet {
            meta: ObjectMeta::new("default", format!("basic-{}", kind)),
            spec: ReplicaSetSpec {
                replicas,
                template: PodTemplate::default(),
                update_strategy: UpdateStrategy::RollingUpdate { partition: replicas },
                service_name: format!("basic-{}-peer", kind),
                claim_templates: vec![],
            },
            status: Default::default(),
        }
    }

    fn put_claim(
        env: &MemoryEnv,
        cluster: &Cluster,
        kind: ComponentKind,
        name: &str,
        deferred: bool,
    ) {
        let mut meta = ObjectMeta::new("default", name)
            .with_labels(component_labels(&cluster.spec, kind));
        if deferred {
            meta.annotations
                .insert(ANN_DEFER_DELETING.into(), format_timestamp(Utc::now()));
        }
        env.objects.put_volume(VolumeClaim { meta });
    }

    fn put_pod(env: &MemoryEnv, name: &str, ready: bool, claims: Vec<String>) {
        env.objects.put_pod(Pod {
            meta: ObjectMeta::new("default", name),
            node_name: None,
            ready,
            ready_transition_time: Utc::now(),
            claims,
        });
    }

    fn deferred(env: &MemoryEnv, name: &str) -> bool {
        env.objects
            .volume("default", name)
            .map(|c| c.meta.annotations.contains_key(ANN_DEFER_DELETING))
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_scale_out_one_step() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 5);
        let current = replica_set(ComponentKind::Gateway, 3);
        let mut next = replica_set(ComponentKind::Gateway, 5);

        GeneralScaler::new(ComponentKind::Gateway)
            .scale(&mut c, &current, &mut next, &env.dependencies())
            .await
            .unwrap();
        assert_eq!(next.spec.replicas, 4);
    }

    #[tokio::test]
    async fn test_scale_out_refused_while_upgrading() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 5);
        c.status_mut(ComponentKind::Gateway).phase = Phase::Upgrade;
        let current = replica_set(ComponentKind::Gateway, 3);
        let mut next = replica_set(ComponentKind::Gateway, 5);

        let err = GeneralScaler::new(ComponentKind::Gateway)
            .scale(&mut c, &current, &mut next, &env.dependencies())
            .await
            .unwrap_err();
        assert!(err.is_requeue());
        assert_eq!(next.spec.replicas, 3);
    }

    #[tokio::test]
    async fn test_scale_out_cases() {
        // (upgrading, claim present, claim deferred, delete fails, expect ok, expected replicas)
        let cases = [
            (false, false, false, false, true, 4),
            (true, false, false, false, false, 3),
            (false, true, true, false, true, 4),
            (false, true, true, true, false, 3),
            (false, true, false, false, false, 3),
        ];
        for (upgrading, has_claim, is_deferred, delete_fails, ok, expected) in cases {
            let env = MemoryEnv::default();
            let mut c = cluster(ComponentKind::Cdc, 5);
            if upgrading {
                c.status_mut(ComponentKind::Cdc).phase = Phase::Upgrade;
            }
            if has_claim {
                put_claim(&env, &c, ComponentKind::Cdc, "data-basic-cdc-3", is_deferred);
            }
            if delete_fails {
                env.objects
                    .fail_once("volume.delete", Error::Http("api server failed".into()));
            }
            let current = replica_set(ComponentKind::Cdc, 3);
            let mut next = replica_set(ComponentKind::Cdc, 5);

            let res = CaptureScaler
                .scale(&mut c, &current, &mut next, &env.dependencies())
                .await;
            assert_eq!(res.is_ok(), ok, "case {:?}", (upgrading, has_claim, is_deferred));
            assert_eq!(next.spec.replicas, expected);
        }
    }

    #[tokio::test]
    async fn test_capture_scale_in_cases() {
        // (upgrading, has claims, pod ready, claim update fails, expect ok)
        let cases = [
            (false, true, true, false, true),
            (true, true, true, false, true),
            (false, true, false, false, true),
            (false, false, true, false, true),
            (false, true, true, true, false),
        ];
        for (upgrading, has_claims, ready, update_fails, ok) in cases {
            let env = MemoryEnv::default();
            let mut c = cluster(ComponentKind::Cdc, 3);
            c.spec
                .components
                .get_mut(&ComponentKind::Cdc)
                .unwrap()
                .storage_claims
                .clear();
            if upgrading {
                c.status_mut(ComponentKind::Cdc).phase = Phase::Upgrade;
            }
            let mut claims = vec![];
            if has_claims {
                for name in ["sort-dir-basic-cdc-4-1", "sort-dir-basic-cdc-4-2"] {
                    put_claim(&env, &c, ComponentKind::Cdc, name, false);
                    claims.push(name.to_string());
                }
            }
            put_pod(&env, "basic-cdc-4", ready, claims.clone());
            if update_fails {
                env.objects
                    .fail_once("volume.update", Error::Http("api server failed".into()));
            }
            let current = replica_set(ComponentKind::Cdc, 5);
            let mut next = replica_set(ComponentKind::Cdc, 3);

            let res = CaptureScaler
                .scale(&mut c, &current, &mut next, &env.dependencies())
                .await;
            assert_eq!(res.is_ok(), ok);
            if ok {
                assert_eq!(next.spec.replicas, 4);
                for claim in &claims {
                    assert!(deferred(&env, claim));
                }
            } else {
                assert_eq!(next.spec.replicas, 5);
            }
            assert_eq!(env.captures.drain_calls() > 0, ready);
        }
    }

    #[tokio::test]
    async fn test_capture_scale_in_waits_for_drain() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Cdc, 1);
        put_pod(&env, "basic-cdc-1", true, vec![]);
        env.captures.push_drain(Ok(DrainStatus {
            remaining: 2,
            retry: false,
        }));
        let current = replica_set(ComponentKind::Cdc, 2);
        let mut next = replica_set(ComponentKind::Cdc, 1);

        let err = CaptureScaler
            .scale(&mut c, &current, &mut next, &env.dependencies())
            .await
            .unwrap_err();
        assert!(err.is_requeue());
        assert_eq!(next.spec.replicas, 2);
    }

    #[tokio::test]
    async fn test_store_scale_in_protocol() {
        let env = MemoryEnv::default();
        let deps = env.dependencies();
        let mut c = cluster(ComponentKind::Storage, 2);
        let mut ids = BTreeMap::new();
        for ordinal in 0..3 {
            ids.insert(
                ordinal,
                env.stores.register(&c.spec, ComponentKind::Storage, ordinal),
            );
        }
        put_claim(&env, &c, ComponentKind::Storage, "data-basic-storage-2", false);
        let current = replica_set(ComponentKind::Storage, 3);
        let scaler = StoreScaler::new(ComponentKind::Storage);

        // Up store: taken offline, requeue
        refresh_store_status(&mut c, ComponentKind::Storage, &deps).await.unwrap();
        let mut next = replica_set(ComponentKind::Storage, 2);
        let err = scaler.scale(&mut c, &current, &mut next, &deps).await.unwrap_err();
        assert!(err.is_requeue());
        assert_eq!(next.spec.replicas, 3);
        assert!(env.stores.calls().contains(&format!("delete_store {}", ids[&2])));

        // Offline: still waiting
        refresh_store_status(&mut c, ComponentKind::Storage, &deps).await.unwrap();
        let mut next = replica_set(ComponentKind::Storage, 2);
        assert!(scaler
            .scale(&mut c, &current, &mut next, &deps)
            .await
            .unwrap_err()
            .is_requeue());
        assert!(!deferred(&env, "data-basic-storage-2"));

        // Tombstone: claims deferred and replica removed
        env.stores.finish_offline(ids[&2]);
        refresh_store_status(&mut c, ComponentKind::Storage, &deps).await.unwrap();
        let mut next = replica_set(ComponentKind::Storage, 2);
        scaler.scale(&mut c, &current, &mut next, &deps).await.unwrap();
        assert_eq!(next.spec.replicas, 2);
        assert!(deferred(&env, "data-basic-storage-2"));
    }

    #[tokio::test]
    async fn test_store_scale_in_without_store() {
        let env = MemoryEnv::default();
        let deps = env.dependencies();
        let mut c = cluster(ComponentKind::Columnar, 1);
        env.stores.put_store(StoreInfo {
            id: 7,
            address: store_address(&c.spec, ComponentKind::Columnar, 0),
            state_name: "Up".into(),
            labels: BTreeMap::new(),
            leader_count: 0,
        });
        refresh_store_status(&mut c, ComponentKind::Columnar, &deps).await.unwrap();
        let current = replica_set(ComponentKind::Columnar, 2);
        let scaler = StoreScaler::new(ComponentKind::Columnar);

        put_pod(&env, "basic-columnar-1", true, vec![]);
        let mut next = replica_set(ComponentKind::Columnar, 1);
        assert!(scaler.scale(&mut c, &current, &mut next, &deps).await.unwrap_err().is_requeue());

        env.objects.set_pod_ready("default", "basic-columnar-1", false).unwrap();
        let mut next = replica_set(ComponentKind::Columnar, 1);
        scaler.scale(&mut c, &current, &mut next, &deps).await.unwrap();
        assert_eq!(next.spec.replicas, 1);
    }

    #[tokio::test]
    async fn test_store_scale_in_requires_synced() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Storage, 2);
        let current = replica_set(ComponentKind::Storage, 3);
        let mut next = replica_set(ComponentKind::Storage, 2);
        let err = StoreScaler::new(ComponentKind::Storage)
            .scale(&mut c, &current, &mut next, &env.dependencies())
            .await
            .unwrap_err();
        assert!(err.is_requeue());
        assert_eq!(next.spec.replicas, 3);
    }

    #[tokio::test]
    async fn test_at_target_is_noop() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Binlog, 3);
        let current = replica_set(ComponentKind::Binlog, 3);
        let mut next = replica_set(ComponentKind::Binlog, 3);
        GeneralScaler::new(ComponentKind::Binlog)
            .scale(&mut c, &current, &mut next, &env.dependencies())
            .await
            .unwrap();
        assert_eq!(next.spec.replicas, 3);
        assert_eq!(env.objects.writes(), 0);
    }
}
