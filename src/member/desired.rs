//! Desired objects of one component
//!
//! Builders for the replica set, the headless peer service and the
//! content-addressed config map a component should have.

use crate::common::labels::{
    component_labels, member_name, peer_member_name, ANN_LAST_APPLIED_TEMPLATE,
};
use crate::common::{fingerprint, short_hash, Error, Result};
use crate::model::{
    Cluster, ComponentKind, ConfigMap, ConfigUpdateStrategy, ObjectMeta, PodTemplate, ReplicaSet,
    ReplicaSetSpec, Service, ServicePort, UpdateStrategy, UpdateStrategyKind,
};

/// Headless service giving every replica a stable DNS name
pub fn desired_service(cluster: &Cluster, kind: ComponentKind) -> Service {
    let labels = component_labels(&cluster.spec, kind);
    Service {
        meta: ObjectMeta::new(
            cluster.namespace(),
            peer_member_name(cluster.name(), kind),
        )
        .with_labels(labels.clone()),
        selector: labels,
        ports: kind
            .peer_ports()
            .iter()
            .map(|(name, port)| ServicePort {
                name: name.to_string(),
                port: *port,
            })
            .collect(),
        headless: true,
        publish_not_ready: true,
    }
}

/// Config map holding the component's rendered config, or `None` when the
/// component has no config.
///
/// The name carries a hash of the content, so new content means a new
/// object and a rollout. With the in-place strategy the name in use is
/// kept and only its content is replaced.
pub fn desired_config_map(
    cluster: &Cluster,
    kind: ComponentKind,
    in_use: Option<&str>,
) -> Result<Option<ConfigMap>> {
    let Some(spec) = cluster.spec.component(kind) else {
        return Ok(None);
    };
    if spec.config.is_empty() {
        return Ok(None);
    }

    let content = serde_json::to_vec(&spec.config)?;
    let hashed = format!(
        "{}-{}",
        member_name(cluster.name(), kind),
        short_hash(&content)
    );
    let name = match (spec.config_update_strategy, in_use) {
        (ConfigUpdateStrategy::InPlace, Some(current)) => current.to_string(),
        _ => hashed,
    };

    Ok(Some(ConfigMap {
        meta: ObjectMeta::new(cluster.namespace(), name)
            .with_labels(component_labels(&cluster.spec, kind)),
        data: spec.config.clone(),
    }))
}

/// Replica set the component should converge to. The partition starts at
/// the replica count so that a template change rolls nothing by itself;
/// the upgrader lowers it.
pub fn desired_replica_set(
    cluster: &Cluster,
    kind: ComponentKind,
    config_map: Option<String>,
) -> Result<ReplicaSet> {
    let spec = cluster.spec.component(kind).ok_or_else(|| {
        Error::InvalidSpec(format!("{} has no {} component", cluster.spec.key(), kind))
    })?;
    let selector = component_labels(&cluster.spec, kind);

    let mut set_labels = selector.clone();
    set_labels.extend(spec.labels.clone());

    let template = PodTemplate {
        labels: selector,
        annotations: spec.annotations.clone(),
        image: spec.image.clone(),
        config_map,
    };
    let replicas = cluster.desired_replicas(kind);
    let update_strategy = match spec.update_strategy {
        UpdateStrategyKind::RollingUpdate => UpdateStrategy::RollingUpdate {
            partition: replicas,
        },
        UpdateStrategyKind::OnDelete => UpdateStrategy::OnDelete,
    };

    let mut meta = ObjectMeta::new(cluster.namespace(), member_name(cluster.name(), kind))
        .with_labels(set_labels);
    meta.annotations
        .insert(ANN_LAST_APPLIED_TEMPLATE.to_string(), fingerprint(&template)?);

    Ok(ReplicaSet {
        meta,
        spec: ReplicaSetSpec {
            replicas,
            template,
            update_strategy,
            service_name: peer_member_name(cluster.name(), kind),
            claim_templates: spec.storage_claims.clone(),
        },
        status: Default::default(),
    })
}

/// Does `next` carry a different template than the one `current` was last
/// written with?
pub fn template_changed(current: &ReplicaSet, next: &ReplicaSet) -> bool {
    current.meta.annotations.get(ANN_LAST_APPLIED_TEMPLATE)
        != next.meta.annotations.get(ANN_LAST_APPLIED_TEMPLATE)
}

/// Put the live template back on `next`, dropping a pending template change
pub fn keep_live_template(current: &ReplicaSet, next: &mut ReplicaSet) {
    next.spec.template = current.spec.template.clone();
    match current.meta.annotations.get(ANN_LAST_APPLIED_TEMPLATE) {
        Some(applied) => {
            next.meta
                .annotations
                .insert(ANN_LAST_APPLIED_TEMPLATE.to_string(), applied.clone());
        }
        None => {
            next.meta.annotations.remove(ANN_LAST_APPLIED_TEMPLATE);
        }
    }
}
