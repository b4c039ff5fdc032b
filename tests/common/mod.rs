//! Shared helpers: play the orchestration layer and the coordinator

#![allow(dead_code)]

use kvkeeper::client::memory::{store_address, MemoryEnv};
use kvkeeper::client::MemberHealth;
use kvkeeper::common::labels::pod_name;
use kvkeeper::common::ControllerConfig;
use kvkeeper::model::{Cluster, ClusterSpec, ComponentKind, ComponentSpec, StorageClaim, StoreState};
use std::time::Duration;

pub const NS: &str = "default";
pub const NAME: &str = "basic";

/// Highest ordinal the helpers look at
const MAX_ORDINAL: u32 = 16;

pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        volume_defer_grace: Duration::ZERO,
        failover_period: Duration::ZERO,
        requeue_base_delay: Duration::from_millis(20),
        requeue_max_delay: Duration::from_millis(200),
        resync_interval: Duration::from_millis(100),
        rpc_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

pub fn component(replicas: u32, image: &str, claim: Option<&str>) -> ComponentSpec {
    let mut spec = ComponentSpec::new(replicas, image);
    if let Some(name) = claim {
        spec.storage_claims.push(StorageClaim {
            name: name.into(),
            size: "1Gi".into(),
            storage_class: None,
        });
    }
    spec
}

pub fn cluster_spec(components: &[(ComponentKind, ComponentSpec)]) -> ClusterSpec {
    let mut spec = ClusterSpec::new(NS, NAME);
    for (kind, component) in components {
        spec = spec.with_component(*kind, component.clone());
    }
    spec
}

/// One step of the outside world: replica sets materialize, every store
/// pod registers a store, offline stores become tombstones and the
/// coordinator members report healthy.
pub fn emulate(env: &MemoryEnv, cluster: &Cluster) {
    env.objects.materialize_all().unwrap();
    let spec = &cluster.spec;

    for kind in [ComponentKind::Storage, ComponentKind::Columnar] {
        if spec.component(kind).is_none() {
            continue;
        }
        for ordinal in 0..MAX_ORDINAL {
            if env.objects.pod(NS, &pod_name(NAME, kind, ordinal)).is_none() {
                continue;
            }
            if env.stores.store_id_for(&store_address(spec, kind, ordinal)).is_none() {
                env.stores.register(spec, kind, ordinal);
            }
        }
        if let Some(status) = cluster.status(kind) {
            for store in status.stores.values() {
                if store.state == StoreState::Offline {
                    env.stores.finish_offline(store.id);
                }
            }
        }
    }

    let members = (0..MAX_ORDINAL)
        .filter_map(|o| env.objects.pod(NS, &pod_name(NAME, ComponentKind::Coordinator, o)))
        .map(|p| MemberHealth {
            name: p.meta.name,
            healthy: p.ready,
        })
        .collect();
    env.stores.set_members(members);
}
