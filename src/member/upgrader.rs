//! Rolling upgrades
//!
//! Ordinals are rolled from the highest down by lowering the partition of
//! the replica set one ordinal at a time. An ordinal is only handed over
//! once every ordinal above it runs the new revision and is healthy.

use crate::client::Dependencies;
use crate::common::labels::{
    component_labels, ordinal_of, ANN_EVICT_LEADER_BEGIN, LABEL_REVISION_HASH,
};
use crate::common::{elapsed_since, format_timestamp, parse_timestamp, with_timeout, Error, Result};
use crate::model::{Cluster, ComponentKind, Phase, Pod, ReplicaSet, StoreState};
use chrono::Utc;
use std::collections::BTreeMap;

use super::desired::{keep_live_template, template_changed};
use super::shutdown::graceful_shutdown_capture;

/// Does the replica set still have replicas on an old revision?
///
/// A pod without a revision label has not been observed by the
/// orchestration layer yet and does not count as upgrading.
pub fn replica_set_is_upgrading(set: &ReplicaSet, pods: &[Pod]) -> bool {
    if set.rollout_in_progress() {
        return true;
    }
    for pod in pods {
        match pod.meta.labels.get(LABEL_REVISION_HASH) {
            Some(revision) if *revision != set.status.update_revision => return true,
            Some(_) => {}
            None => return false,
        }
    }
    false
}

/// What has to happen before an ordinal may be restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeSafety {
    None,
    /// Move region leaders off the ordinal's store first
    EvictLeaders,
    /// Drain the capture and resign ownership first
    GracefulShutdown,
}

impl UpgradeSafety {
    pub fn for_component(kind: ComponentKind) -> Self {
        match kind {
            ComponentKind::Storage => UpgradeSafety::EvictLeaders,
            ComponentKind::Cdc => UpgradeSafety::GracefulShutdown,
            _ => UpgradeSafety::None,
        }
    }
}

pub struct RollingUpgrader {
    kind: ComponentKind,
    safety: UpgradeSafety,
}

impl RollingUpgrader {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            safety: UpgradeSafety::for_component(kind),
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Decide the template and partition of `next`
    pub async fn upgrade(
        &self,
        cluster: &mut Cluster,
        current: &ReplicaSet,
        next: &mut ReplicaSet,
        deps: &Dependencies,
    ) -> Result<()> {
        let kind = self.kind;
        if cluster.phase(kind) == Phase::Scale {
            tracing::info!(
                "{} of {} is scaling, postponing the template change",
                kind,
                cluster.spec.key()
            );
            keep_live_template(current, next);
            if let Some(partition) = current.partition() {
                next.set_partition(partition);
            }
            return Ok(());
        }
        if next.partition().is_none() {
            // on-delete: replicas pick the template up when they restart
            return Ok(());
        }

        cluster.status_mut(kind).phase = Phase::Upgrade;
        if template_changed(current, next) {
            // write the new template without rolling anything yet
            next.set_partition(next.spec.replicas);
            tracing::info!(
                "Starting upgrade of {} of {} to image {}",
                kind,
                cluster.spec.key(),
                next.spec.template.image
            );
            return Ok(());
        }

        let mut partition = current.partition().unwrap_or(next.spec.replicas);
        next.set_partition(partition);
        let update_revision = current.status.update_revision.clone();
        let settled = update_revision == current.status.current_revision
            && current.status.updated_replicas == current.status.replicas;
        if update_revision.is_empty() || settled {
            return Ok(());
        }

        let selector = component_labels(&cluster.spec, kind);
        let pods: BTreeMap<u32, Pod> = deps
            .pods
            .list(&cluster.spec.namespace, &selector)
            .await?
            .into_iter()
            .filter_map(|p| ordinal_of(&p.meta.name).map(|o| (o, p)))
            .collect();

        for ordinal in (0..next.spec.replicas).rev() {
            let Some(pod) = pods.get(&ordinal) else {
                return Err(Error::requeue(format!(
                    "{} of {}: pod of ordinal {} missing during upgrade",
                    kind,
                    cluster.spec.key(),
                    ordinal
                )));
            };
            let Some(revision) = pod.meta.labels.get(LABEL_REVISION_HASH) else {
                return Err(Error::requeue(format!(
                    "pod {} has no revision label yet",
                    pod.meta.name
                )));
            };

            if *revision == update_revision {
                self.check_upgraded(cluster, pod, deps).await?;
                continue;
            }

            if ordinal < partition {
                self.before_restart(cluster, ordinal, pod, deps).await?;
                partition = ordinal;
                next.set_partition(partition);
                tracing::info!(
                    "Upgrading {} of {}: partition set to {}",
                    kind,
                    cluster.spec.key(),
                    partition
                );
            }
            // the ordinal is being restarted by the orchestration layer
            return Ok(());
        }

        next.set_partition(0);
        Ok(())
    }

    /// An upgraded ordinal must be healthy before the next one is rolled
    async fn check_upgraded(
        &self,
        cluster: &Cluster,
        pod: &Pod,
        deps: &Dependencies,
    ) -> Result<()> {
        if !pod.ready {
            return Err(Error::requeue(format!(
                "upgraded pod {} is not ready yet",
                pod.meta.name
            )));
        }
        if self.safety != UpgradeSafety::EvictLeaders {
            return Ok(());
        }

        let status = cluster.status(self.kind).cloned().unwrap_or_default();
        let Some(store) = status.store_for_pod(&pod.meta.name) else {
            return Err(Error::requeue(format!(
                "store of upgraded pod {} not registered yet",
                pod.meta.name
            )));
        };
        if store.state != StoreState::Up {
            return Err(Error::requeue(format!(
                "store {} of upgraded pod {} is {:?}",
                store.id, pod.meta.name, store.state
            )));
        }
        // a restarted pod comes back without the annotation, so the
        // scheduler is removed by store id every time
        with_timeout(
            deps.config.rpc_timeout,
            "end evict leader",
            deps.stores.end_evict_leader(&cluster.spec, store.id),
        )
        .await?;
        if pod.meta.annotations.contains_key(ANN_EVICT_LEADER_BEGIN) {
            let mut pod = pod.clone();
            pod.meta.annotations.remove(ANN_EVICT_LEADER_BEGIN);
            deps.pods.update(&pod).await?;
            tracing::info!("Ended leader eviction on store {}", store.id);
        }
        Ok(())
    }

    async fn before_restart(
        &self,
        cluster: &Cluster,
        ordinal: u32,
        pod: &Pod,
        deps: &Dependencies,
    ) -> Result<()> {
        match self.safety {
            UpgradeSafety::None => Ok(()),
            UpgradeSafety::GracefulShutdown => {
                graceful_shutdown_capture(&cluster.spec, ordinal, deps, Utc::now()).await?;
                Ok(())
            }
            UpgradeSafety::EvictLeaders => self.evict_leaders(cluster, pod, deps).await,
        }
    }

    async fn evict_leaders(&self, cluster: &Cluster, pod: &Pod, deps: &Dependencies) -> Result<()> {
        let status = cluster.status(self.kind).cloned().unwrap_or_default();
        let Some(store) = status.store_for_pod(&pod.meta.name) else {
            // nothing registered, nothing to move
            return Ok(());
        };
        if store.state != StoreState::Up {
            return Ok(());
        }

        let now = Utc::now();
        let begin = match pod
            .meta
            .annotations
            .get(ANN_EVICT_LEADER_BEGIN)
            .and_then(|raw| parse_timestamp(raw))
        {
            Some(begin) => begin,
            None => {
                with_timeout(
                    deps.config.rpc_timeout,
                    "begin evict leader",
                    deps.stores.begin_evict_leader(&cluster.spec, store.id),
                )
                .await?;
                let mut pod = pod.clone();
                pod.meta
                    .annotations
                    .insert(ANN_EVICT_LEADER_BEGIN.to_string(), format_timestamp(now));
                deps.pods.update(&pod).await?;
                tracing::info!(
                    "Evicting leaders from store {} of pod {}",
                    store.id,
                    pod.meta.name
                );
                now
            }
        };

        if store.leader_count == 0 {
            return Ok(());
        }
        let waited = elapsed_since(begin, now);
        if waited > deps.config.evict_leader_timeout {
            tracing::warn!(
                "Store {} still holds {} leaders after {:?}, restarting anyway",
                store.id,
                store.leader_count,
                waited
            );
            return Ok(());
        }
        Err(Error::requeue(format!(
            "store {} still holds {} leaders",
            store.id, store.leader_count
        )))
    }
}
