//! Whole-cluster reconcile: every present component, in dependency order

use crate::client::Dependencies;
use crate::common::{Outcome, Result, METRICS};
use crate::model::{Cluster, ComponentKind};
use std::time::Instant;

use super::reconciler::ComponentReconciler;

pub struct ClusterReconciler {
    members: Vec<ComponentReconciler>,
}

impl Default for ClusterReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterReconciler {
    pub fn new() -> Self {
        Self {
            members: ComponentKind::ALL
                .iter()
                .map(|kind| ComponentReconciler::new(*kind))
                .collect(),
        }
    }

    /// Reconcile every component declared in `cluster.spec`. Stops at the
    /// first component that fails; components after it wait for the next
    /// tick.
    pub async fn sync(&self, cluster: &mut Cluster, deps: &Dependencies) -> Result<()> {
        for member in &self.members {
            let kind = member.kind();
            if cluster.spec.component(kind).is_none() {
                continue;
            }

            let start = Instant::now();
            let result = member.sync(cluster, deps).await;
            let outcome = match &result {
                Ok(()) => Outcome::Success,
                Err(e) if e.is_requeue() => Outcome::Requeue,
                Err(_) => Outcome::Error,
            };
            METRICS.record_sync(kind.as_str(), start.elapsed(), outcome);
            if let Err(e) = result {
                tracing::debug!("{} of {} stopped the tick: {}", kind, cluster.spec.key(), e);
                return Err(e);
            }
        }

        // status of components dropped from the spec
        let declared = cluster.spec.components.clone();
        cluster
            .status
            .components
            .retain(|kind, _| declared.contains_key(kind));
        Ok(())
    }
}
