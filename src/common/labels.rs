//! Label and annotation keys, and object naming conventions

use crate::model::{ClusterSpec, ComponentKind, Labels};
use once_cell::sync::Lazy;
use regex::Regex;

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Revision fingerprint written on every pod by the orchestration layer
pub const LABEL_REVISION_HASH: &str = "controller-revision-hash";

pub const NAME_VALUE: &str = "kv-cluster";
pub const MANAGED_BY_VALUE: &str = "kvkeeper";

/// Deferred-deletion timestamp on a volume claim
pub const ANN_DEFER_DELETING: &str = "kvkeeper.io/pvc-defer-deleting";
/// Pod that owned a deferred claim
pub const ANN_OWNER_POD: &str = "kvkeeper.io/owner-pod";
/// Graceful shutdown handshake begin timestamp on a pod
pub const ANN_GRACEFUL_SHUTDOWN_BEGIN: &str = "kvkeeper.io/graceful-shutdown-begin-time";
/// Leader eviction begin timestamp on a pod
pub const ANN_EVICT_LEADER_BEGIN: &str = "kvkeeper.io/evict-leader-begin-time";
/// Fingerprint of the template last written by this controller
pub const ANN_LAST_APPLIED_TEMPLATE: &str = "kvkeeper.io/last-applied-template";

/// Store label carrying the engine kind
pub const STORE_ENGINE_LABEL: &str = "engine";
pub const STORE_ENGINE_COLUMNAR: &str = "columnar";

static ORDINAL_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"-(\d+)$").expect("static regex"));

/// Labels selecting every object of one component of one cluster
pub fn component_labels(cluster: &ClusterSpec, kind: ComponentKind) -> Labels {
    let mut labels = Labels::new();
    labels.insert(LABEL_NAME.to_string(), NAME_VALUE.to_string());
    labels.insert(LABEL_INSTANCE.to_string(), cluster.name.clone());
    labels.insert(LABEL_COMPONENT.to_string(), kind.as_str().to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Replica set name: `{cluster}-{component}`
pub fn member_name(cluster: &str, kind: ComponentKind) -> String {
    format!("{}-{}", cluster, kind.as_str())
}

/// Headless service name: `{cluster}-{component}-peer`
pub fn peer_member_name(cluster: &str, kind: ComponentKind) -> String {
    format!("{}-{}-peer", cluster, kind.as_str())
}

pub fn pod_name(cluster: &str, kind: ComponentKind, ordinal: u32) -> String {
    format!("{}-{}", member_name(cluster, kind), ordinal)
}

/// Claim created from a claim template for one ordinal
pub fn ordinal_claim_name(claim_template: &str, set_name: &str, ordinal: u32) -> String {
    format!("{}-{}-{}", claim_template, set_name, ordinal)
}

/// Trailing ordinal of a pod or claim name
pub fn ordinal_of(name: &str) -> Option<u32> {
    ORDINAL_SUFFIX
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Pattern matching store addresses served by this cluster's own replicas,
/// e.g. `basic-storage-0.basic-storage-peer.default.svc:20160`
pub fn store_address_pattern(cluster: &ClusterSpec, kind: ComponentKind) -> crate::Result<Regex> {
    let member = regex::escape(&member_name(&cluster.name, kind));
    let peer = regex::escape(&peer_member_name(&cluster.name, kind));
    let ns = regex::escape(&cluster.namespace);
    let suffix = regex::escape(&cluster.service_suffix());
    Ok(Regex::new(&format!(
        r"^{}-\d+\.{}\.{}\.{}:\d+$",
        member, peer, ns, suffix
    ))?)
}

/// Pod name from a store address (`pod.peer-svc.ns.svc:port`)
pub fn pod_name_from_address(address: &str) -> String {
    let host = address.split(':').next().unwrap_or(address);
    host.split('.').next().unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(member_name("basic", ComponentKind::Cdc), "basic-cdc");
        assert_eq!(pod_name("basic", ComponentKind::Cdc, 4), "basic-cdc-4");
        assert_eq!(
            ordinal_claim_name("sort-dir", "basic-cdc", 4),
            "sort-dir-basic-cdc-4"
        );
        assert_eq!(ordinal_of("basic-cdc-12"), Some(12));
        assert_eq!(ordinal_of("basic-cdc"), None);
    }

    #[test]
    fn test_store_address_pattern() {
        let mut cluster = ClusterSpec::new("prod", "basic");
        let re = store_address_pattern(&cluster, ComponentKind::Storage).unwrap();
        assert!(re.is_match("basic-storage-0.basic-storage-peer.prod.svc:20160"));
        assert!(!re.is_match("other-storage-0.other-storage-peer.prod.svc:20160"));
        assert!(!re.is_match("basic-storage-0.basic-storage-peer.staging.svc:20160"));
        assert!(!re.is_match("basic-columnar-0.basic-columnar-peer.prod.svc:3930"));

        cluster.cluster_domain = "cluster.local".into();
        let re = store_address_pattern(&cluster, ComponentKind::Storage).unwrap();
        assert!(re.is_match("basic-storage-2.basic-storage-peer.prod.svc.cluster.local:20160"));
    }

    #[test]
    fn test_pod_name_from_address() {
        assert_eq!(
            pod_name_from_address("basic-storage-1.basic-storage-peer.prod.svc:20160"),
            "basic-storage-1"
        );
    }
}
