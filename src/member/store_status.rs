//! Store membership tracking
//!
//! The coordinator reports every store it knows about, including stores of
//! other clusters that share it. Each refresh splits that report into three
//! disjoint maps on the component status:
//!
//! - `stores`: addresses served by this component's own replicas
//! - `peer_stores`: stores of the same engine kind served by someone else
//! - `tombstone_stores`: our own stores that were removed for good
//!
//! A record keeps its `last_transition_time` while its state is unchanged.

use crate::client::{Dependencies, StoreInfo};
use crate::common::labels::{
    pod_name_from_address, store_address_pattern, STORE_ENGINE_COLUMNAR, STORE_ENGINE_LABEL,
};
use crate::common::{with_timeout, Result};
use crate::model::{Cluster, ClusterSpec, ComponentKind, ComponentStatus, StoreRecord, StoreState};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// The three partitions of one refresh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub stores: BTreeMap<u64, StoreRecord>,
    pub peer_stores: BTreeMap<u64, StoreRecord>,
    pub tombstone_stores: BTreeMap<u64, StoreRecord>,
}

/// Does a store's engine label say it is a replica of `kind`?
fn engine_matches(info: &StoreInfo, kind: ComponentKind) -> bool {
    let columnar = info
        .labels
        .get(STORE_ENGINE_LABEL)
        .map(|v| v == STORE_ENGINE_COLUMNAR)
        .unwrap_or(false);
    match kind {
        ComponentKind::Columnar => columnar,
        ComponentKind::Storage => !columnar,
        _ => false,
    }
}

fn previous_record<'a>(previous: &'a ComponentStatus, id: u64) -> Option<&'a StoreRecord> {
    previous
        .stores
        .get(&id)
        .or_else(|| previous.peer_stores.get(&id))
        .or_else(|| previous.tombstone_stores.get(&id))
}

fn to_record(
    info: &StoreInfo,
    state: StoreState,
    previous: &ComponentStatus,
    now: DateTime<Utc>,
) -> StoreRecord {
    let last_transition_time = match previous_record(previous, info.id) {
        Some(prev) if prev.state == state => prev.last_transition_time,
        _ => now,
    };
    StoreRecord {
        id: info.id,
        address: info.address.clone(),
        pod_name: pod_name_from_address(&info.address),
        state,
        leader_count: info.leader_count,
        last_transition_time,
    }
}

/// Classify a coordinator report into owned, peer and tombstone stores
pub fn classify_stores(
    cluster: &ClusterSpec,
    kind: ComponentKind,
    previous: &ComponentStatus,
    active: &[StoreInfo],
    tombstones: &[StoreInfo],
    now: DateTime<Utc>,
) -> Result<StoreSnapshot> {
    let pattern = store_address_pattern(cluster, kind)?;
    let mut snapshot = StoreSnapshot::default();

    for info in active {
        let Some(state) = StoreState::parse(&info.state_name) else {
            tracing::debug!(
                "Ignoring store {} in unknown state {}",
                info.id,
                info.state_name
            );
            continue;
        };
        let record = to_record(info, state, previous, now);
        if pattern.is_match(&info.address) {
            if state == StoreState::Tombstone {
                snapshot.tombstone_stores.insert(info.id, record);
            } else {
                snapshot.stores.insert(info.id, record);
            }
        } else if engine_matches(info, kind) {
            snapshot.peer_stores.insert(info.id, record);
        }
    }

    for info in tombstones {
        if !pattern.is_match(&info.address) || snapshot.stores.contains_key(&info.id) {
            continue;
        }
        let record = to_record(info, StoreState::Tombstone, previous, now);
        snapshot.tombstone_stores.insert(info.id, record);
    }

    Ok(snapshot)
}

/// Refresh the store partitions of one component from the coordinator.
///
/// On any failure, including the RPC timeout, `synced` is cleared and the
/// previous snapshot is left in place.
pub async fn refresh_store_status(
    cluster: &mut Cluster,
    kind: ComponentKind,
    deps: &Dependencies,
) -> Result<()> {
    let timeout = deps.config.rpc_timeout;
    let fetched = async {
        let active =
            with_timeout(timeout, "get stores", deps.stores.get_stores(&cluster.spec)).await?;
        let tombstones = with_timeout(
            timeout,
            "get tombstone stores",
            deps.stores.get_tombstone_stores(&cluster.spec),
        )
        .await?;
        Ok::<_, crate::Error>((active, tombstones))
    }
    .await;

    let (active, tombstones) = match fetched {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                "Failed to refresh {} stores of {}: {}",
                kind,
                cluster.spec.key(),
                e
            );
            cluster.status_mut(kind).synced = false;
            return Err(e);
        }
    };

    let previous = cluster.status(kind).cloned().unwrap_or_default();
    let snapshot = classify_stores(
        &cluster.spec,
        kind,
        &previous,
        &active,
        &tombstones,
        Utc::now(),
    )?;

    let status = cluster.status_mut(kind);
    status.stores = snapshot.stores;
    status.peer_stores = snapshot.peer_stores;
    status.tombstone_stores = snapshot.tombstone_stores;
    status.synced = true;
    Ok(())
}
