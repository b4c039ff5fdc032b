//! Controller loop
//!
//! A pool of tokio workers pulls cluster keys (`namespace/name`) from a
//! [`WorkQueue`], runs one [`ClusterReconciler`] tick per key and writes the
//! cluster status back. Failed ticks are requeued: requeue signals after
//! their own delay or the backoff, infrastructure errors after the backoff.
//! Validation errors are logged and dropped until the next resync.

pub mod queue;
pub mod server;

pub use queue::WorkQueue;
pub use server::{create_router, serve, ServerState};

use crate::client::{ClusterControl, Dependencies};
use crate::common::{ControllerConfig, ErrorClass, Result, METRICS};
use crate::member::ClusterReconciler;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Controller {
    clusters: Arc<dyn ClusterControl>,
    deps: Dependencies,
    reconciler: ClusterReconciler,
    queue: Arc<WorkQueue>,
    config: Arc<ControllerConfig>,
    ready: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(clusters: Arc<dyn ClusterControl>, deps: Dependencies) -> Self {
        let config = deps.config.clone();
        Self {
            clusters,
            deps,
            reconciler: ClusterReconciler::new(),
            queue: Arc::new(WorkQueue::new()),
            config,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Flipped once the first listing has been queued
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// One reconcile tick of one cluster. The status is written back when it
    /// changed, also when the sync failed half way.
    pub async fn tick(&self, namespace: &str, name: &str) -> Result<()> {
        METRICS.ticks_total.inc();
        let Some(mut cluster) = self.clusters.get(namespace, name).await? else {
            tracing::debug!("Cluster {}/{} is gone", namespace, name);
            return Ok(());
        };
        let before = cluster.status.clone();

        let result = self.reconciler.sync(&mut cluster, &self.deps).await;

        if cluster.status != before {
            match self.clusters.update_status(&cluster).await {
                Ok(_) => METRICS.status_writes.inc(),
                Err(e) if result.is_ok() => return Err(e),
                Err(e) => {
                    tracing::warn!("Writing status of {} failed: {}", cluster.spec.key(), e);
                }
            }
        }
        result
    }

    /// Queue every known cluster
    pub async fn enqueue_all(&self) -> Result<usize> {
        let clusters = self.clusters.list().await?;
        METRICS.clusters.set(clusters.len() as u64);
        for cluster in &clusters {
            self.queue.add(cluster.spec.key()).await;
        }
        Ok(clusters.len())
    }

    /// Take one key off the queue and reconcile it. Returns `false` once the
    /// queue has shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let Some((namespace, name)) = key.split_once('/') else {
            tracing::error!("Dropping malformed queue key {:?}", key);
            self.queue.done(&key).await;
            return true;
        };

        match self.tick(namespace, name).await {
            Ok(()) => self.queue.forget(&key).await,
            Err(e) => match e.class() {
                ErrorClass::Validation => {
                    tracing::error!("Cluster {} is invalid, not retrying: {}", key, e);
                    self.queue.forget(&key).await;
                }
                ErrorClass::Requeue => {
                    let delay = match e.retry_after() {
                        Some(after) => {
                            self.queue.add_after(key.clone(), after);
                            after
                        }
                        None => {
                            self.queue
                                .add_rate_limited(
                                    key.clone(),
                                    self.config.requeue_base_delay,
                                    self.config.requeue_max_delay,
                                )
                                .await
                        }
                    };
                    tracing::info!("Requeueing {} in {:?}: {}", key, delay, e);
                }
                _ => {
                    METRICS.tick_errors.inc();
                    let delay = self
                        .queue
                        .add_rate_limited(
                            key.clone(),
                            self.config.requeue_base_delay,
                            self.config.requeue_max_delay,
                        )
                        .await;
                    tracing::warn!("Tick of {} failed, retrying in {:?}: {}", key, delay, e);
                }
            },
        }
        self.queue.done(&key).await;
        true
    }

    /// Run workers and the periodic resync until `shutdown` resolves
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let count = self.enqueue_all().await?;
        tracing::info!(
            "Controller starting with {} workers, {} clusters",
            self.config.workers,
            count
        );

        let mut workers = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers.max(1) {
            let controller = self.clone();
            workers.push(tokio::spawn(async move {
                while controller.process_next().await {}
            }));
        }
        self.ready.store(true, Ordering::SeqCst);

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.tick().await;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = resync.tick() => {
                    if let Err(e) = self.enqueue_all().await {
                        tracing::warn!("Resync listing failed: {}", e);
                    }
                }
            }
        }

        tracing::info!("Controller shutting down");
        self.ready.store(false, Ordering::SeqCst);
        self.queue.shut_down().await;
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Worker panicked: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryEnv;
    use crate::common::Error;
    use crate::model::{Cluster, ClusterSpec, ComponentKind, ComponentSpec};

    fn controller(env: &MemoryEnv) -> Controller {
        Controller::new(env.objects.clone(), env.dependencies())
    }

    fn seed(env: &MemoryEnv) {
        env.objects.put_cluster(Cluster::new(
            ClusterSpec::new("default", "basic")
                .with_component(ComponentKind::Coordinator, ComponentSpec::new(1, "coord:v1")),
        ));
    }

    #[tokio::test]
    async fn test_tick_persists_status() {
        let env = MemoryEnv::default();
        seed(&env);
        let c = controller(&env);

        c.tick("default", "basic").await.unwrap();
        assert_eq!(env.objects.status_writes(), 1);
        let stored = env.objects.cluster("default", "basic").unwrap();
        assert!(stored.status(ComponentKind::Coordinator).is_some());

        // the replica set now exists and its status gets recorded
        c.tick("default", "basic").await.unwrap();
        let writes = env.objects.status_writes();

        // nothing changed: no status write
        c.tick("default", "basic").await.unwrap();
        assert_eq!(env.objects.status_writes(), writes);
    }

    #[tokio::test]
    async fn test_missing_cluster_is_ok() {
        let env = MemoryEnv::default();
        controller(&env).tick("default", "nope").await.unwrap();
        assert_eq!(env.objects.status_writes(), 0);
    }

    #[tokio::test]
    async fn test_status_written_when_sync_fails() {
        let env = MemoryEnv::default();
        env.objects.put_cluster(Cluster::new(
            ClusterSpec::new("default", "basic")
                .with_component(ComponentKind::Coordinator, ComponentSpec::new(3, "coord:v1"))
                .with_component(ComponentKind::Gateway, ComponentSpec::new(1, "gw:v1")),
        ));
        let c = controller(&env);

        let err = c.tick("default", "basic").await.unwrap_err();
        assert!(err.is_requeue());
        assert_eq!(env.objects.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_process_next_backs_off_on_error() {
        let env = MemoryEnv::default();
        seed(&env);
        env.objects
            .fail_once("cluster.get", Error::ConnectionFailed("api down".into()));
        let c = controller(&env);

        c.queue().add("default/basic").await;
        assert!(c.process_next().await);
        assert_eq!(c.queue().failures("default/basic").await, 1);

        // requeued after the backoff, then succeeds and resets it
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), c.process_next())
            .await
            .unwrap();
        assert!(next);
        assert_eq!(c.queue().failures("default/basic").await, 0);
    }
}
