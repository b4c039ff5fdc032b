//! Per-component reconcile tick
//!
//! [`ComponentReconciler::sync`] is the single entry point for one
//! component of one cluster. It runs the steps in a fixed order and stops
//! at the first error; whatever was written before the error stays.

use crate::client::Dependencies;
use crate::common::labels::{component_labels, member_name};
use crate::common::{with_timeout, Error, Result};
use crate::model::{Cluster, ComponentKind, Phase, ReplicaSet, StoreState};
use chrono::Utc;
use std::collections::BTreeMap;

use super::desired::{desired_config_map, desired_replica_set, desired_service, template_changed};
use super::failover::{Failover, PodFailover, StoreFailover};
use super::scaler::{CaptureScaler, GeneralScaler, Scaler, StoreScaler};
use super::store_status::refresh_store_status;
use super::upgrader::{replica_set_is_upgrading, RollingUpgrader};
use super::volume::sweep_deferred;

/// Location label that falls back to the node name
const HOST_LABEL: &str = "host";

pub struct ComponentReconciler {
    kind: ComponentKind,
    scaler: Box<dyn Scaler>,
    failover: Option<Box<dyn Failover>>,
    upgrader: RollingUpgrader,
}

impl ComponentReconciler {
    pub fn new(kind: ComponentKind) -> Self {
        let scaler: Box<dyn Scaler> = match kind {
            ComponentKind::Storage | ComponentKind::Columnar => Box::new(StoreScaler::new(kind)),
            ComponentKind::Cdc => Box::new(CaptureScaler),
            _ => Box::new(GeneralScaler::new(kind)),
        };
        let failover: Option<Box<dyn Failover>> = match kind {
            ComponentKind::Storage | ComponentKind::Columnar => {
                Some(Box::new(StoreFailover::new(kind)))
            }
            ComponentKind::Gateway => Some(Box::new(PodFailover::new(kind))),
            _ => None,
        };
        Self {
            kind,
            scaler,
            failover,
            upgrader: RollingUpgrader::new(kind),
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Reconcile this component of `cluster` once. Mutates `cluster.status`;
    /// the caller persists it.
    pub async fn sync(&self, cluster: &mut Cluster, deps: &Dependencies) -> Result<()> {
        let kind = self.kind;
        let Some(spec) = cluster.spec.component(kind).cloned() else {
            return Ok(());
        };
        if spec.suspended {
            tracing::info!("{} of {} is suspended, skipping", kind, cluster.spec.key());
            return Ok(());
        }

        if kind == ComponentKind::Columnar {
            if let Err(e) = self.ensure_placement_rules(cluster, deps).await {
                tracing::warn!(
                    "Enabling placement rules for {} failed: {}",
                    cluster.spec.key(),
                    e
                );
            }
        }

        if !cluster.spec.paused {
            self.sync_service(cluster, deps).await?;
        }

        let set_name = member_name(cluster.name(), kind);
        let current = deps
            .replica_sets
            .get(cluster.namespace(), &set_name)
            .await?;
        self.sync_status(cluster, current.as_ref(), deps).await?;

        if cluster.spec.paused {
            tracing::info!("{} is paused, not touching {}", cluster.spec.key(), set_name);
            return Ok(());
        }

        let config_map = self.sync_config_map(cluster, current.as_ref(), deps).await?;

        if let Some(failover) = &self.failover {
            let has_failures = cluster
                .status(kind)
                .map(|s| !s.failures.is_empty())
                .unwrap_or(false);
            if has_failures {
                failover.remove_undesired_failures(cluster, deps).await?;
                failover.recover(cluster, deps).await?;
            }
        }

        let mut next = desired_replica_set(cluster, kind, config_map)?;

        let Some(current) = current else {
            if kind != ComponentKind::Coordinator && !cluster.coordinator_available() {
                return Err(Error::requeue(format!(
                    "coordinator of {} is not available, deferring creation of {}",
                    cluster.spec.key(),
                    set_name
                )));
            }
            deps.replica_sets.create(&next).await?;
            tracing::info!(
                "Created replica set {} with {} replicas",
                set_name,
                next.spec.replicas
            );
            return Ok(());
        };

        if let Err(e) = self.sync_store_labels(cluster, deps).await {
            tracing::warn!("Syncing store labels of {} failed: {}", set_name, e);
        }

        self.scaler.scale(cluster, &current, &mut next, deps).await?;
        let live = current.spec.replicas.min(next.spec.replicas);
        match sweep_deferred(&cluster.spec, kind, live, deps, Utc::now()).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Swept {} deferred volume claims of {}", n, set_name),
            Err(e) => tracing::warn!("Sweeping volume claims of {} failed: {}", set_name, e),
        }

        if let Some(failover) = &self.failover {
            if deps.config.auto_failover
                && cluster.all_pods_started(kind)
                && !self.all_members_healthy(cluster)
            {
                failover.failover(cluster, deps).await?;
            }
        }

        if template_changed(&current, &next) || cluster.phase(kind) == Phase::Upgrade {
            self.upgrader
                .upgrade(cluster, &current, &mut next, deps)
                .await?;
        } else if let Some(partition) = current.partition() {
            next.set_partition(partition);
        }

        let in_use = [
            current.spec.template.config_map.clone(),
            next.spec.template.config_map.clone(),
        ];
        self.persist(&current, next, deps).await?;

        // superseded maps may still be mounted until the rollout is done
        if cluster.phase(kind) == Phase::Normal {
            match self.sweep_config_maps(cluster, &in_use, deps).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Deleted {} superseded config maps of {}", n, set_name),
                Err(e) => tracing::warn!("Sweeping config maps of {} failed: {}", set_name, e),
            }
        }
        Ok(())
    }

    fn all_members_healthy(&self, cluster: &Cluster) -> bool {
        if self.kind.has_stores() {
            return cluster.all_stores_ready(self.kind);
        }
        cluster
            .status(self.kind)
            .and_then(|s| s.replica_set.as_ref())
            .map(|rs| rs.ready_replicas >= rs.replicas)
            .unwrap_or(false)
    }

    async fn ensure_placement_rules(&self, cluster: &Cluster, deps: &Dependencies) -> Result<()> {
        let timeout = deps.config.rpc_timeout;
        let mut config =
            with_timeout(timeout, "get config", deps.stores.get_config(&cluster.spec)).await?;
        if config.enable_placement_rules != Some(false) {
            return Ok(());
        }
        config.enable_placement_rules = Some(true);
        with_timeout(
            timeout,
            "update replication config",
            deps.stores.update_replication_config(&cluster.spec, &config),
        )
        .await?;
        tracing::info!("Enabled placement rules for {}", cluster.spec.key());
        Ok(())
    }

    async fn sync_service(&self, cluster: &Cluster, deps: &Dependencies) -> Result<()> {
        let desired = desired_service(cluster, self.kind);
        match deps
            .services
            .get(&desired.meta.namespace, &desired.meta.name)
            .await?
        {
            None => {
                deps.services.create(&desired).await?;
                tracing::info!("Created service {}", desired.meta.name);
            }
            Some(live) if !live.spec_equal(&desired) => {
                let mut svc = live;
                svc.selector = desired.selector;
                svc.ports = desired.ports;
                svc.headless = desired.headless;
                svc.publish_not_ready = desired.publish_not_ready;
                svc.meta.labels.extend(desired.meta.labels);
                deps.services.update(&svc).await?;
                tracing::info!("Updated service {}", svc.meta.name);
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn sync_status(
        &self,
        cluster: &mut Cluster,
        current: Option<&ReplicaSet>,
        deps: &Dependencies,
    ) -> Result<()> {
        let kind = self.kind;
        let Some(set) = current else {
            let status = cluster.status_mut(kind);
            status.phase = Phase::Normal;
            status.replica_set = None;
            return Ok(());
        };

        let selector = component_labels(&cluster.spec, kind);
        let pods = deps.pods.list(cluster.namespace(), &selector).await?;
        let desired = cluster.desired_replicas(kind);
        let phase = if desired != set.spec.replicas {
            Phase::Scale
        } else if replica_set_is_upgrading(set, &pods) {
            Phase::Upgrade
        } else {
            Phase::Normal
        };

        let status = cluster.status_mut(kind);
        status.phase = phase;
        status.replica_set = Some(set.status.clone());
        status.image = Some(set.spec.template.image.clone());

        if kind.has_stores() {
            return refresh_store_status(cluster, kind, deps).await;
        }
        if kind == ComponentKind::Coordinator {
            let members = with_timeout(
                deps.config.rpc_timeout,
                "get coordinator members",
                deps.stores.get_members(&cluster.spec),
            )
            .await;
            let key = cluster.spec.key();
            let status = cluster.status_mut(kind);
            match members {
                Ok(members) => {
                    status.healthy_members = members.iter().filter(|m| m.healthy).count() as u32;
                    status.synced = true;
                }
                Err(e) => {
                    tracing::warn!("Coordinator health of {} unavailable: {}", key, e);
                    status.synced = false;
                }
            }
            return Ok(());
        }
        cluster.status_mut(kind).synced = true;
        Ok(())
    }

    /// Delete this component's config maps that no template mounts.
    /// Returns how many were removed.
    async fn sweep_config_maps(
        &self,
        cluster: &Cluster,
        in_use: &[Option<String>],
        deps: &Dependencies,
    ) -> Result<usize> {
        let selector = component_labels(&cluster.spec, self.kind);
        let mut removed = 0;
        for cm in deps.config_maps.list(cluster.namespace(), &selector).await? {
            if in_use.iter().flatten().any(|name| *name == cm.meta.name) {
                continue;
            }
            deps.config_maps
                .delete(&cm.meta.namespace, &cm.meta.name)
                .await?;
            tracing::debug!("Deleted config map {}", cm.meta.name);
            removed += 1;
        }
        Ok(removed)
    }

    /// Returns the name of the config map the template should mount
    async fn sync_config_map(
        &self,
        cluster: &Cluster,
        current: Option<&ReplicaSet>,
        deps: &Dependencies,
    ) -> Result<Option<String>> {
        let in_use = current.and_then(|s| s.spec.template.config_map.clone());
        let Some(desired) = desired_config_map(cluster, self.kind, in_use.as_deref())? else {
            return Ok(None);
        };
        match deps
            .config_maps
            .get(&desired.meta.namespace, &desired.meta.name)
            .await?
        {
            None => {
                deps.config_maps.create(&desired).await?;
                tracing::info!("Created config map {}", desired.meta.name);
            }
            Some(live) if live.data != desired.data => {
                let mut cm = desired.clone();
                cm.meta.resource_version = live.meta.resource_version;
                deps.config_maps.update(&cm).await?;
                tracing::info!("Overwrote config map {} in place", cm.meta.name);
            }
            Some(_) => {}
        }
        Ok(Some(desired.meta.name))
    }

    /// Copy the configured location labels of each Up store's node onto
    /// the store
    async fn sync_store_labels(&self, cluster: &Cluster, deps: &Dependencies) -> Result<()> {
        if !self.kind.has_stores() {
            return Ok(());
        }
        let Some(nodes) = &deps.nodes else {
            return Ok(());
        };
        let timeout = deps.config.rpc_timeout;
        let config =
            with_timeout(timeout, "get config", deps.stores.get_config(&cluster.spec)).await?;
        if config.location_labels.is_empty() {
            return Ok(());
        }

        let owned: Vec<_> = cluster
            .status(self.kind)
            .map(|s| s.stores.values().cloned().collect())
            .unwrap_or_default();
        if owned.is_empty() {
            return Ok(());
        }
        let reported: BTreeMap<u64, BTreeMap<String, String>> =
            with_timeout(timeout, "get stores", deps.stores.get_stores(&cluster.spec))
                .await?
                .into_iter()
                .map(|s| (s.id, s.labels))
                .collect();

        for store in owned {
            if store.state != StoreState::Up {
                continue;
            }
            let Some(pod) = deps.pods.get(cluster.namespace(), &store.pod_name).await? else {
                continue;
            };
            let Some(node_name) = pod.node_name else {
                continue;
            };
            let Some(node) = nodes.get(&node_name).await? else {
                continue;
            };

            let mut labels = BTreeMap::new();
            for key in &config.location_labels {
                match node.labels.get(key) {
                    Some(value) => {
                        labels.insert(key.clone(), value.clone());
                    }
                    None if key == HOST_LABEL => {
                        labels.insert(key.clone(), node.name.clone());
                    }
                    None => {}
                }
            }
            if labels.is_empty() {
                continue;
            }
            let current = reported.get(&store.id);
            let up_to_date = labels
                .iter()
                .all(|(k, v)| current.and_then(|l| l.get(k)) == Some(v));
            if up_to_date {
                continue;
            }
            if with_timeout(
                timeout,
                "set store labels",
                deps.stores.set_store_labels(&cluster.spec, store.id, &labels),
            )
            .await?
            {
                tracing::info!("Store {} labelled with {:?}", store.id, labels);
            }
        }
        Ok(())
    }

    /// Write `next` if it differs from `current`, refusing when the live
    /// object moved since it was read
    async fn persist(
        &self,
        current: &ReplicaSet,
        mut next: ReplicaSet,
        deps: &Dependencies,
    ) -> Result<()> {
        let mut labels = current.meta.labels.clone();
        labels.extend(next.meta.labels);
        next.meta.labels = labels;
        let mut annotations = current.meta.annotations.clone();
        annotations.extend(next.meta.annotations);
        next.meta.annotations = annotations;

        if current.spec == next.spec
            && current.meta.labels == next.meta.labels
            && current.meta.annotations == next.meta.annotations
        {
            return Ok(());
        }

        let name = &current.meta.name;
        let live = deps
            .replica_sets
            .get(&current.meta.namespace, name)
            .await?
            .ok_or_else(|| Error::MissingState(format!("replica set {} vanished", name)))?;
        if live.meta.resource_version != current.meta.resource_version {
            return Err(Error::conflict(
                "replicaset",
                name,
                format!(
                    "changed since read ({} -> {})",
                    current.meta.resource_version, live.meta.resource_version
                ),
            ));
        }

        next.meta.resource_version = live.meta.resource_version;
        next.meta.generation = live.meta.generation;
        next.meta.creation_timestamp = live.meta.creation_timestamp;
        next.status = live.status;
        let written = deps.replica_sets.update(&next).await?;
        tracing::info!(
            "Updated replica set {}: replicas {}, partition {:?}",
            name,
            written.spec.replicas,
            written.partition()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryEnv;
    use crate::client::{MemberHealth, ReplicationConfig, StoreControl};
    use crate::common::labels::peer_member_name;
    use crate::model::{ClusterSpec, ComponentSpec, Node};

    fn healthy_members(env: &MemoryEnv, n: usize) {
        env.stores.set_members(
            (0..n)
                .map(|i| MemberHealth {
                    name: format!("basic-coordinator-{}", i),
                    healthy: true,
                })
                .collect(),
        );
    }

    fn cluster(kind: ComponentKind, replicas: u32) -> Cluster {
        let mut c = Cluster::new(
            ClusterSpec::new("default", "basic")
                .with_component(ComponentKind::Coordinator, ComponentSpec::new(3, "coord:v1"))
                .with_component(kind, ComponentSpec::new(replicas, "img:v1")),
        );
        c.status_mut(ComponentKind::Coordinator).healthy_members = 3;
        c
    }

    #[tokio::test]
    async fn test_suspended_is_noop() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 2);
        c.spec
            .components
            .get_mut(&ComponentKind::Gateway)
            .unwrap()
            .suspended = true;

        ComponentReconciler::new(ComponentKind::Gateway)
            .sync(&mut c, &env.dependencies())
            .await
            .unwrap();
        assert_eq!(env.objects.writes(), 0);
    }

    #[tokio::test]
    async fn test_paused_touches_only_status() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 2);
        c.spec.paused = true;

        ComponentReconciler::new(ComponentKind::Gateway)
            .sync(&mut c, &env.dependencies())
            .await
            .unwrap();
        assert_eq!(env.objects.writes(), 0);
        assert!(env.objects.replica_set("default", "basic-gateway").is_none());
    }

    #[tokio::test]
    async fn test_creation_waits_for_coordinator() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Storage, 3);
        c.status_mut(ComponentKind::Coordinator).healthy_members = 1;
        let r = ComponentReconciler::new(ComponentKind::Storage);

        let err = r.sync(&mut c, &env.dependencies()).await.unwrap_err();
        assert!(err.is_requeue());
        assert!(env.objects.replica_set("default", "basic-storage").is_none());
        // the service is written before the check
        assert!(env
            .objects
            .service("default", &peer_member_name("basic", ComponentKind::Storage))
            .is_some());

        c.status_mut(ComponentKind::Coordinator).healthy_members = 2;
        r.sync(&mut c, &env.dependencies()).await.unwrap();
        let set = env.objects.replica_set("default", "basic-storage").unwrap();
        assert_eq!(set.spec.replicas, 3);
    }

    #[tokio::test]
    async fn test_coordinator_created_without_quorum() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 1);
        c.status_mut(ComponentKind::Coordinator).healthy_members = 0;
        let r = ComponentReconciler::new(ComponentKind::Coordinator);

        r.sync(&mut c, &env.dependencies()).await.unwrap();
        assert!(env
            .objects
            .replica_set("default", "basic-coordinator")
            .is_some());

        env.objects.materialize_all().unwrap();
        healthy_members(&env, 3);
        r.sync(&mut c, &env.dependencies()).await.unwrap();
        assert_eq!(c.status(ComponentKind::Coordinator).unwrap().healthy_members, 3);
        assert!(c.coordinator_available());
    }

    #[tokio::test]
    async fn test_coordinator_health_failure_keeps_last_count() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 1);
        let r = ComponentReconciler::new(ComponentKind::Coordinator);
        r.sync(&mut c, &env.dependencies()).await.unwrap();
        env.objects.materialize_all().unwrap();
        healthy_members(&env, 3);
        r.sync(&mut c, &env.dependencies()).await.unwrap();

        env.stores.fail_once(
            "get_members",
            Error::ConnectionFailed("coordinator unreachable".into()),
        );
        r.sync(&mut c, &env.dependencies()).await.unwrap();
        let status = c.status(ComponentKind::Coordinator).unwrap();
        assert!(!status.synced);
        assert_eq!(status.healthy_members, 3);

        r.sync(&mut c, &env.dependencies()).await.unwrap();
        assert!(c.status(ComponentKind::Coordinator).unwrap().synced);
    }

    #[tokio::test]
    async fn test_second_sync_writes_nothing() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 3);
        c.spec
            .components
            .get_mut(&ComponentKind::Gateway)
            .unwrap()
            .config
            .insert("gateway.toml".into(), "[log]\n".into());
        let r = ComponentReconciler::new(ComponentKind::Gateway);
        let deps = env.dependencies();

        r.sync(&mut c, &deps).await.unwrap();
        env.objects.materialize_all().unwrap();
        r.sync(&mut c, &deps).await.unwrap();
        let writes = env.objects.writes();

        r.sync(&mut c, &deps).await.unwrap();
        assert_eq!(env.objects.writes(), writes);
        assert_eq!(c.phase(ComponentKind::Gateway), Phase::Normal);
    }

    #[tokio::test]
    async fn test_scale_out_one_ordinal_per_tick() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 2);
        let r = ComponentReconciler::new(ComponentKind::Gateway);
        let deps = env.dependencies();
        r.sync(&mut c, &deps).await.unwrap();
        env.objects.materialize_all().unwrap();

        c.spec
            .components
            .get_mut(&ComponentKind::Gateway)
            .unwrap()
            .replicas = 4;
        r.sync(&mut c, &deps).await.unwrap();
        assert_eq!(c.phase(ComponentKind::Gateway), Phase::Scale);
        let set = env.objects.replica_set("default", "basic-gateway").unwrap();
        assert_eq!(set.spec.replicas, 3);

        env.objects.materialize_all().unwrap();
        r.sync(&mut c, &deps).await.unwrap();
        let set = env.objects.replica_set("default", "basic-gateway").unwrap();
        assert_eq!(set.spec.replicas, 4);
    }

    #[tokio::test]
    async fn test_persist_refuses_stale_read() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 2);
        let r = ComponentReconciler::new(ComponentKind::Gateway);
        let deps = env.dependencies();
        r.sync(&mut c, &deps).await.unwrap();
        env.objects.materialize_all().unwrap();

        let current = env.objects.replica_set("default", "basic-gateway").unwrap();
        let mut next = current.clone();
        next.spec.replicas = 3;
        // someone else writes in between
        env.objects.put_replica_set(current.clone());

        let err = r.persist(&current, next, &deps).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_placement_rules_best_effort() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Columnar, 1);
        let r = ComponentReconciler::new(ComponentKind::Columnar);
        StoreControl::update_replication_config(
            env.stores.as_ref(),
            &c.spec,
            &ReplicationConfig {
                enable_placement_rules: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        env.stores
            .fail_once("get_config", Error::Store("unreachable".into()));
        r.sync(&mut c, &env.dependencies()).await.unwrap();
        assert_eq!(
            env.stores.replication_config().enable_placement_rules,
            Some(false)
        );

        r.sync(&mut c, &env.dependencies()).await.unwrap();
        assert_eq!(
            env.stores.replication_config().enable_placement_rules,
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_placement_rules_left_alone_when_unset() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Columnar, 1);
        ComponentReconciler::new(ComponentKind::Columnar)
            .sync(&mut c, &env.dependencies())
            .await
            .unwrap();
        assert_eq!(env.stores.replication_config().enable_placement_rules, None);
        assert!(!env
            .stores
            .calls()
            .iter()
            .any(|call| call.starts_with("update_replication_config")));
    }

    #[tokio::test]
    async fn test_scale_during_rollout_holds_partition() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 3);
        let r = ComponentReconciler::new(ComponentKind::Gateway);
        let deps = env.dependencies();
        r.sync(&mut c, &deps).await.unwrap();
        env.objects.materialize_all().unwrap();
        r.sync(&mut c, &deps).await.unwrap();

        let gateway = c.spec.components.get_mut(&ComponentKind::Gateway).unwrap();
        gateway.image = "img:v2".into();
        r.sync(&mut c, &deps).await.unwrap();
        env.objects.materialize_all().unwrap();
        let set = env.objects.replica_set("default", "basic-gateway").unwrap();
        assert_eq!(set.partition(), Some(3));

        // replicas change mid-rollout: the scale resolves first
        c.spec
            .components
            .get_mut(&ComponentKind::Gateway)
            .unwrap()
            .replicas = 4;
        r.sync(&mut c, &deps).await.unwrap();
        assert_eq!(c.phase(ComponentKind::Gateway), Phase::Scale);
        let set = env.objects.replica_set("default", "basic-gateway").unwrap();
        assert_eq!(set.spec.replicas, 4);
        assert_eq!(set.partition(), Some(3));

        // scale done: the rollout moves on
        env.objects.materialize_all().unwrap();
        r.sync(&mut c, &deps).await.unwrap();
        assert_eq!(c.phase(ComponentKind::Gateway), Phase::Upgrade);
        let set = env.objects.replica_set("default", "basic-gateway").unwrap();
        assert_eq!(set.partition(), Some(2));
    }

    #[tokio::test]
    async fn test_superseded_config_map_removed_after_rollout() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Gateway, 2);
        let gateway = c.spec.components.get_mut(&ComponentKind::Gateway).unwrap();
        gateway.config.insert("gateway.toml".into(), "[log]\n".into());
        let r = ComponentReconciler::new(ComponentKind::Gateway);
        let deps = env.dependencies();

        r.sync(&mut c, &deps).await.unwrap();
        env.objects.materialize_all().unwrap();
        let old = env
            .objects
            .replica_set("default", "basic-gateway")
            .unwrap()
            .spec
            .template
            .config_map
            .unwrap();

        c.spec
            .components
            .get_mut(&ComponentKind::Gateway)
            .unwrap()
            .config
            .insert("gateway.toml".into(), "[log]\nlevel = \"debug\"\n".into());
        r.sync(&mut c, &deps).await.unwrap();
        assert_eq!(c.phase(ComponentKind::Gateway), Phase::Upgrade);
        // old pods still mount it
        assert!(env.objects.config_map("default", &old).is_some());

        for _ in 0..6 {
            env.objects.materialize_all().unwrap();
            let _ = r.sync(&mut c, &deps).await;
        }
        assert_eq!(c.phase(ComponentKind::Gateway), Phase::Normal);
        let new = env
            .objects
            .replica_set("default", "basic-gateway")
            .unwrap()
            .spec
            .template
            .config_map
            .unwrap();
        assert_ne!(new, old);
        assert!(env.objects.config_map("default", &old).is_none());
        assert!(env.objects.config_map("default", &new).is_some());
    }

    #[tokio::test]
    async fn test_store_labels_from_node() {
        let env = MemoryEnv::default();
        let mut c = cluster(ComponentKind::Storage, 1);
        let r = ComponentReconciler::new(ComponentKind::Storage);
        let deps = env.dependencies();
        StoreControl::update_replication_config(
            env.stores.as_ref(),
            &c.spec,
            &ReplicationConfig {
                location_labels: vec!["zone".into(), "host".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        r.sync(&mut c, &deps).await.unwrap();
        env.objects.materialize_all().unwrap();
        let mut pod = env.objects.pod("default", "basic-storage-0").unwrap();
        pod.node_name = Some("node-a".into());
        env.objects.put_pod(pod);
        let mut labels = BTreeMap::new();
        labels.insert("zone".to_string(), "z1".to_string());
        env.objects.put_node(Node {
            name: "node-a".into(),
            labels,
        });
        let id = env.stores.register(&c.spec, ComponentKind::Storage, 0);

        r.sync(&mut c, &deps).await.unwrap();
        let store = env.stores.store(id).unwrap();
        assert_eq!(store.labels.get("zone").map(String::as_str), Some("z1"));
        assert_eq!(store.labels.get("host").map(String::as_str), Some("node-a"));

        // already labelled: no further RPC
        let before = env
            .stores
            .calls()
            .iter()
            .filter(|call| call.starts_with("set_store_labels"))
            .count();
        r.sync(&mut c, &deps).await.unwrap();
        let after = env
            .stores
            .calls()
            .iter()
            .filter(|call| call.starts_with("set_store_labels"))
            .count();
        assert_eq!(before, after);
    }
}
