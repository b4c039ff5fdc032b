//! Failure detection and replacement bookkeeping
//!
//! A failed ordinal gets a [`FailureRecord`]; every record raises the
//! desired replica count by one, so the scaler brings up the replacement.
//! Records are dropped when the member turns healthy again, and cleared by
//! a recovery once the operator asked for it and the quorum rule holds.

use crate::client::Dependencies;
use crate::common::labels::{component_labels, ordinal_of, pod_name};
use crate::common::{elapsed_since, format_timestamp, Result};
use crate::model::{Cluster, ComponentKind, FailureRecord, Pod, StoreState};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;

/// Pods of one component keyed by ordinal
async fn pods_by_ordinal(
    cluster: &Cluster,
    kind: ComponentKind,
    deps: &Dependencies,
) -> Result<BTreeMap<u32, Pod>> {
    let selector = component_labels(&cluster.spec, kind);
    let pods = deps.pods.list(&cluster.spec.namespace, &selector).await?;
    Ok(pods
        .into_iter()
        .filter_map(|p| ordinal_of(&p.meta.name).map(|o| (o, p)))
        .collect())
}

/// Count healthy ordinals among the live replicas: the pod is ready and,
/// for store-bearing components, its store is Up
pub async fn count_healthy(
    cluster: &Cluster,
    kind: ComponentKind,
    live: u32,
    deps: &Dependencies,
) -> Result<u32> {
    let pods = pods_by_ordinal(cluster, kind, deps).await?;
    let status = cluster.status(kind).cloned().unwrap_or_default();
    let healthy = (0..live)
        .filter(|ordinal| {
            let Some(pod) = pods.get(ordinal) else {
                return false;
            };
            if !pod.ready {
                return false;
            }
            if !kind.has_stores() {
                return true;
            }
            status
                .store_for_pod(&pod.meta.name)
                .map(|s| s.state == StoreState::Up)
                .unwrap_or(false)
        })
        .count();
    Ok(healthy as u32)
}

/// Has the quorum rule configured for `kind` been met?
pub async fn quorum_met(
    cluster: &Cluster,
    kind: ComponentKind,
    deps: &Dependencies,
) -> Result<bool> {
    let live = cluster
        .status(kind)
        .and_then(|s| s.replica_set.as_ref())
        .map(|rs| rs.replicas)
        .unwrap_or(0);
    if live == 0 {
        return Ok(false);
    }
    let healthy = count_healthy(cluster, kind, live, deps).await?;
    let rule = deps.config.quorum_rule(kind);
    tracing::debug!(
        "{} of {}: {} of {} members healthy, rule {:?} needs {}",
        kind,
        cluster.spec.key(),
        healthy,
        live,
        rule,
        rule.required(live)
    );
    Ok(rule.is_met(healthy, live))
}

/// Record a failure for `ordinal` unless one exists or the cap is reached.
/// Returns whether a record was added.
fn record_failure(
    cluster: &mut Cluster,
    kind: ComponentKind,
    ordinal: u32,
    store_id: Option<u64>,
    reason: String,
) -> bool {
    let Some(spec) = cluster.spec.component(kind).cloned() else {
        return false;
    };
    let Some(max) = spec.max_failover_count else {
        return false;
    };
    let key = cluster.spec.key();
    let status = cluster.status_mut(kind);
    if status.failures.contains_key(&ordinal) {
        return false;
    }
    if status.failures.len() as u32 >= max {
        tracing::warn!(
            "{} of {} reached max failover count {}, not replacing ordinal {}",
            kind,
            key,
            max,
            ordinal
        );
        return false;
    }

    let pod = pod_name(&cluster.spec.name, kind, ordinal);
    tracing::warn!("{} of {}: recording failure of {}: {}", kind, key, pod, reason);
    let status = cluster.status_mut(kind);
    status.failures.insert(
        ordinal,
        FailureRecord {
            pod_name: pod,
            store_id,
            reason,
            detected_at: Utc::now(),
            recovery_eligible: ordinal < spec.replicas,
        },
    );
    if status.failover_uid.is_none() {
        status.failover_uid = Some(uuid::Uuid::new_v4().to_string());
    }
    true
}

fn clear_uid_if_done(cluster: &mut Cluster, kind: ComponentKind) {
    let status = cluster.status_mut(kind);
    if status.failures.is_empty() {
        status.failover_uid = None;
    }
}

#[async_trait]
pub trait Failover: Send + Sync {
    fn kind(&self) -> ComponentKind;

    /// Detect failed members and record them
    async fn failover(&self, cluster: &mut Cluster, deps: &Dependencies) -> Result<()>;

    /// Drop records of members that turned healthy again
    async fn remove_undesired_failures(
        &self,
        cluster: &mut Cluster,
        deps: &Dependencies,
    ) -> Result<()>;

    /// Clear recovery-eligible records. Needs explicit intent (the
    /// `recover_failover` flag, or `recover_by_uid` matching the current
    /// failover token) and the quorum rule; otherwise records are left as
    /// they are. Returns whether records were cleared.
    async fn recover(&self, cluster: &mut Cluster, deps: &Dependencies) -> Result<bool> {
        let kind = self.kind();
        let Some(spec) = cluster.spec.component(kind).cloned() else {
            return Ok(false);
        };
        let status = cluster.status(kind).cloned().unwrap_or_default();
        if status.failures.is_empty() {
            return Ok(false);
        }

        let by_uid = spec.recover_by_uid.is_some() && spec.recover_by_uid == status.failover_uid;
        if !spec.recover_failover && !by_uid {
            return Ok(false);
        }
        if !quorum_met(cluster, kind, deps).await? {
            tracing::info!(
                "{} of {}: recovery requested but quorum not met, deferring",
                kind,
                cluster.spec.key()
            );
            return Ok(false);
        }

        let status = cluster.status_mut(kind);
        let before = status.failures.len();
        status.failures.retain(|_, r| !r.recovery_eligible);
        let cleared = before - status.failures.len();
        clear_uid_if_done(cluster, kind);
        tracing::info!(
            "{} of {}: recovered, cleared {} failure records",
            kind,
            cluster.spec.key(),
            cleared
        );
        Ok(cleared > 0)
    }
}

/// Failover for store-bearing components, driven by store state
pub struct StoreFailover {
    kind: ComponentKind,
}

impl StoreFailover {
    pub fn new(kind: ComponentKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Failover for StoreFailover {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    async fn failover(&self, cluster: &mut Cluster, deps: &Dependencies) -> Result<()> {
        let kind = self.kind;
        let period = deps.config.failover_period;
        let now = Utc::now();
        let stores: Vec<_> = cluster
            .status(kind)
            .map(|s| s.stores.values().cloned().collect())
            .unwrap_or_default();

        for store in stores {
            if store.state != StoreState::Down {
                continue;
            }
            let Some(ordinal) = ordinal_of(&store.pod_name) else {
                continue;
            };
            if elapsed_since(store.last_transition_time, now) <= period {
                tracing::debug!(
                    "Store {} of {} is down since {}, within failover period",
                    store.id,
                    store.pod_name,
                    format_timestamp(store.last_transition_time)
                );
                continue;
            }
            record_failure(
                cluster,
                kind,
                ordinal,
                Some(store.id),
                format!(
                    "store {} down since {}",
                    store.id,
                    format_timestamp(store.last_transition_time)
                ),
            );
        }
        Ok(())
    }

    async fn remove_undesired_failures(
        &self,
        cluster: &mut Cluster,
        _deps: &Dependencies,
    ) -> Result<()> {
        let kind = self.kind;
        let key = cluster.spec.key();
        let status = cluster.status_mut(kind);
        let stores = status.stores.clone();
        status.failures.retain(|ordinal, record| {
            let up = record
                .store_id
                .and_then(|id| stores.get(&id))
                .map(|s| s.state == StoreState::Up)
                .unwrap_or(false);
            if up {
                tracing::info!(
                    "{} of {}: store of ordinal {} is up again, dropping failure record",
                    kind,
                    key,
                    ordinal
                );
            }
            !up
        });
        clear_uid_if_done(cluster, kind);
        Ok(())
    }
}

/// Failover for stateless members, driven by pod readiness
pub struct PodFailover {
    kind: ComponentKind,
}

impl PodFailover {
    pub fn new(kind: ComponentKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Failover for PodFailover {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    async fn failover(&self, cluster: &mut Cluster, deps: &Dependencies) -> Result<()> {
        let kind = self.kind;
        let period = deps.config.failover_period;
        let now = Utc::now();
        let replicas = cluster.spec.component(kind).map(|s| s.replicas).unwrap_or(0);

        for (ordinal, pod) in pods_by_ordinal(cluster, kind, deps).await? {
            if ordinal >= replicas || pod.ready {
                continue;
            }
            if elapsed_since(pod.ready_transition_time, now) <= period {
                continue;
            }
            record_failure(
                cluster,
                kind,
                ordinal,
                None,
                format!(
                    "pod not ready since {}",
                    format_timestamp(pod.ready_transition_time)
                ),
            );
        }
        Ok(())
    }

    async fn remove_undesired_failures(
        &self,
        cluster: &mut Cluster,
        deps: &Dependencies,
    ) -> Result<()> {
        let kind = self.kind;
        let pods = pods_by_ordinal(cluster, kind, deps).await?;
        let status = cluster.status_mut(kind);
        status
            .failures
            .retain(|ordinal, _| !pods.get(ordinal).map(|p| p.ready).unwrap_or(false));
        clear_uid_if_done(cluster, kind);
        Ok(())
    }
}
