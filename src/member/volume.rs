//! Volume claim lifecycle around scaling
//!
//! Claims of a removed ordinal are never deleted right away. Scale-in marks
//! them with a deferred-deletion timestamp; they are deleted either when the
//! ordinal comes back (scale-out must not reuse stale data) or by the sweep
//! once the grace window has passed and the owning pod is gone.

use crate::client::Dependencies;
use crate::common::labels::{
    component_labels, member_name, ordinal_claim_name, ordinal_of, pod_name, ANN_DEFER_DELETING,
    ANN_OWNER_POD,
};
use crate::common::{elapsed_since, format_timestamp, parse_timestamp, Error, Result};
use crate::model::{ClusterSpec, ComponentKind};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Claim names an ordinal may own: the ones its pod mounts plus the ones
/// its claim templates would produce
pub async fn claims_for_ordinal(
    cluster: &ClusterSpec,
    kind: ComponentKind,
    ordinal: u32,
    deps: &Dependencies,
) -> Result<BTreeSet<String>> {
    let set_name = member_name(&cluster.name, kind);
    let mut claims: BTreeSet<String> = cluster
        .component(kind)
        .map(|spec| {
            spec.storage_claims
                .iter()
                .map(|c| ordinal_claim_name(&c.name, &set_name, ordinal))
                .collect()
        })
        .unwrap_or_default();

    let pod = pod_name(&cluster.name, kind, ordinal);
    if let Some(pod) = deps.pods.get(&cluster.namespace, &pod).await? {
        claims.extend(pod.claims);
    }
    Ok(claims)
}

/// Mark one claim for deferred deletion. Returns whether the claim was
/// annotated by this call; a missing or already-marked claim is a no-op.
pub async fn defer_delete_claim(
    deps: &Dependencies,
    namespace: &str,
    claim_name: &str,
    owner_pod: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(mut claim) = deps.volumes.get(namespace, claim_name).await? else {
        tracing::debug!("Claim {}/{} already gone", namespace, claim_name);
        return Ok(false);
    };
    if claim.meta.annotations.contains_key(ANN_DEFER_DELETING) {
        return Ok(false);
    }

    claim
        .meta
        .annotations
        .insert(ANN_DEFER_DELETING.to_string(), format_timestamp(now));
    claim
        .meta
        .annotations
        .insert(ANN_OWNER_POD.to_string(), owner_pod.to_string());
    deps.volumes.update(&claim).await?;
    tracing::info!(
        "Marked claim {}/{} of pod {} for deferred deletion",
        namespace,
        claim_name,
        owner_pod
    );
    Ok(true)
}

/// Mark every claim of `ordinal` for deferred deletion. Stops at the first
/// failed update.
pub async fn defer_delete_ordinal(
    cluster: &ClusterSpec,
    kind: ComponentKind,
    ordinal: u32,
    deps: &Dependencies,
) -> Result<()> {
    let owner = pod_name(&cluster.name, kind, ordinal);
    let now = Utc::now();
    for claim in claims_for_ordinal(cluster, kind, ordinal, deps).await? {
        defer_delete_claim(deps, &cluster.namespace, &claim, &owner, now).await?;
    }
    Ok(())
}

/// Clear leftover claims before `ordinal` is created again.
///
/// A claim marked for deferred deletion is deleted. An unmarked claim means
/// the data might still be wanted, so the scale-out is refused.
pub async fn prepare_scale_out(
    cluster: &ClusterSpec,
    kind: ComponentKind,
    ordinal: u32,
    deps: &Dependencies,
) -> Result<()> {
    for name in claims_for_ordinal(cluster, kind, ordinal, deps).await? {
        let Some(claim) = deps.volumes.get(&cluster.namespace, &name).await? else {
            continue;
        };
        if !claim.meta.annotations.contains_key(ANN_DEFER_DELETING) {
            return Err(Error::conflict(
                "volumeclaim",
                &name,
                format!(
                    "claim exists without {} annotation, refusing to reuse it for ordinal {}",
                    ANN_DEFER_DELETING, ordinal
                ),
            ));
        }
        deps.volumes.delete(&cluster.namespace, &name).await?;
        tracing::info!(
            "Deleted deferred claim {}/{} before scaling out {}",
            cluster.namespace,
            name,
            kind
        );
    }
    Ok(())
}

/// Delete deferred claims whose grace window has passed and whose owning
/// pod is gone. Ordinals below `live_replicas` are left alone. Returns the
/// number of claims deleted.
pub async fn sweep_deferred(
    cluster: &ClusterSpec,
    kind: ComponentKind,
    live_replicas: u32,
    deps: &Dependencies,
    now: DateTime<Utc>,
) -> Result<usize> {
    let grace = deps.config.volume_defer_grace;
    let selector = component_labels(cluster, kind);
    let mut deleted = 0;

    for claim in deps.volumes.list(&cluster.namespace, &selector).await? {
        let Some(raw) = claim.meta.annotations.get(ANN_DEFER_DELETING) else {
            continue;
        };
        let Some(since) = parse_timestamp(raw) else {
            tracing::warn!(
                "Claim {} has unparsable {} value {:?}, skipping",
                claim.meta.name,
                ANN_DEFER_DELETING,
                raw
            );
            continue;
        };
        if elapsed_since(since, now) < grace {
            continue;
        }

        let owner = match claim.meta.annotations.get(ANN_OWNER_POD) {
            Some(pod) => pod.clone(),
            None => match ordinal_of(&claim.meta.name) {
                Some(ordinal) => pod_name(&cluster.name, kind, ordinal),
                None => continue,
            },
        };
        match ordinal_of(&owner) {
            Some(ordinal) if ordinal >= live_replicas => {}
            _ => continue,
        }
        if deps.pods.get(&cluster.namespace, &owner).await?.is_some() {
            continue;
        }

        deps.volumes
            .delete(&cluster.namespace, &claim.meta.name)
            .await?;
        tracing::info!(
            "Deleted claim {}/{} deferred since {}",
            cluster.namespace,
            claim.meta.name,
            raw
        );
        deleted += 1;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryEnv;
    use crate::model::{ComponentSpec, ObjectMeta, StorageClaim, VolumeClaim};
    use chrono::Duration as ChronoDuration;

    fn cluster() -> ClusterSpec {
        let mut spec = ComponentSpec::new(3, "storage:v1");
        spec.storage_claims.push(StorageClaim {
            name: "data".into(),
            size: "10Gi".into(),
            storage_class: None,
        });
        ClusterSpec::new("default", "basic").with_component(ComponentKind::Storage, spec)
    }

    fn claim(env: &MemoryEnv, name: &str, deferred_since: Option<DateTime<Utc>>) {
        let c = cluster();
        let mut meta = ObjectMeta::new("default", name)
            .with_labels(component_labels(&c, ComponentKind::Storage));
        if let Some(since) = deferred_since {
            meta.annotations
                .insert(ANN_DEFER_DELETING.into(), format_timestamp(since));
        }
        env.objects.put_volume(VolumeClaim { meta });
    }

    #[tokio::test]
    async fn test_defer_delete_missing_claim_is_clean() {
        let env = MemoryEnv::default();
        let annotated = defer_delete_claim(
            &env.dependencies(),
            "default",
            "data-basic-storage-3",
            "basic-storage-3",
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(!annotated);
        assert_eq!(env.objects.writes(), 0);
    }

    #[tokio::test]
    async fn test_defer_delete_is_idempotent() {
        let env = MemoryEnv::default();
        let deps = env.dependencies();
        claim(&env, "data-basic-storage-2", None);

        let now = Utc::now();
        assert!(
            defer_delete_claim(&deps, "default", "data-basic-storage-2", "basic-storage-2", now)
                .await
                .unwrap()
        );
        let later = now + ChronoDuration::minutes(5);
        assert!(
            !defer_delete_claim(&deps, "default", "data-basic-storage-2", "basic-storage-2", later)
                .await
                .unwrap()
        );
        let stored = env.objects.volume("default", "data-basic-storage-2").unwrap();
        assert_eq!(
            stored.meta.annotations.get(ANN_DEFER_DELETING),
            Some(&format_timestamp(now))
        );
        assert_eq!(env.objects.writes(), 1);
    }

    #[tokio::test]
    async fn test_prepare_scale_out() {
        let env = MemoryEnv::default();
        let deps = env.dependencies();
        let c = cluster();

        // absent claim
        prepare_scale_out(&c, ComponentKind::Storage, 3, &deps)
            .await
            .unwrap();

        // deferred claim is deleted
        claim(&env, "data-basic-storage-3", Some(Utc::now()));
        prepare_scale_out(&c, ComponentKind::Storage, 3, &deps)
            .await
            .unwrap();
        assert!(env.objects.volume("default", "data-basic-storage-3").is_none());

        // deletion error aborts
        claim(&env, "data-basic-storage-3", Some(Utc::now()));
        env.objects
            .fail_once("volume.delete", Error::Http("api server failed".into()));
        assert!(prepare_scale_out(&c, ComponentKind::Storage, 3, &deps)
            .await
            .is_err());

        // unmarked claim refuses the scale-out
        claim(&env, "data-basic-storage-4", None);
        let err = prepare_scale_out(&c, ComponentKind::Storage, 4, &deps)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_sweep_respects_grace_and_owner() {
        let env = MemoryEnv::default();
        let deps = env.dependencies();
        let c = cluster();
        let now = Utc::now();
        let old = now - ChronoDuration::hours(1);

        claim(&env, "data-basic-storage-3", Some(old));
        claim(&env, "data-basic-storage-4", Some(now));
        claim(&env, "data-basic-storage-1", Some(old));
        claim(&env, "data-basic-storage-5", None);

        let deleted = sweep_deferred(&c, ComponentKind::Storage, 3, &deps, now)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(env.objects.volume("default", "data-basic-storage-3").is_none());
        // inside the grace window
        assert!(env.objects.volume("default", "data-basic-storage-4").is_some());
        // ordinal still part of the replica set
        assert!(env.objects.volume("default", "data-basic-storage-1").is_some());
        assert!(env.objects.volume("default", "data-basic-storage-5").is_some());

        // a second sweep has nothing left to do
        let deleted = sweep_deferred(&c, ComponentKind::Storage, 3, &deps, now)
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }
}
