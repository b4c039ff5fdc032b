//! Graceful shutdown handshake for change-data-capture replicas
//!
//! Before a capture pod goes away its tables are drained to the other
//! captures and, if it is the owner, ownership is resigned. Progress lives
//! in a begin-time annotation on the pod, so the handshake can be resumed
//! by any tick (or by the pre-termination hook) and gives up once the grace
//! timeout has passed.

use crate::client::memory::MemoryEnv;
use crate::client::{CaptureControl, Dependencies};
use crate::common::labels::{pod_name, ANN_GRACEFUL_SHUTDOWN_BEGIN};
use crate::common::{
    elapsed_since, format_timestamp, parse_timestamp, with_timeout, ControllerConfig, Error,
    Result,
};
use crate::model::{ClusterSpec, ComponentKind, ObjectMeta, Pod};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    NotStarted,
    ShutdownRequested,
    Draining,
    OwnerResignPending,
    Complete,
    TimedOut,
}

impl ShutdownPhase {
    /// The pod may be removed
    pub fn is_finished(&self) -> bool {
        matches!(self, ShutdownPhase::Complete | ShutdownPhase::TimedOut)
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShutdownPhase::NotStarted => "not-started",
            ShutdownPhase::ShutdownRequested => "shutdown-requested",
            ShutdownPhase::Draining => "draining",
            ShutdownPhase::OwnerResignPending => "owner-resign-pending",
            ShutdownPhase::Complete => "complete",
            ShutdownPhase::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

/// Run one step of the handshake for capture `ordinal`.
///
/// Returns a finished phase once the pod may be removed. While the drain or
/// the ownership move is still in progress a requeue error is returned.
pub async fn graceful_shutdown_capture(
    cluster: &ClusterSpec,
    ordinal: u32,
    deps: &Dependencies,
    now: DateTime<Utc>,
) -> Result<ShutdownPhase> {
    let name = pod_name(&cluster.name, ComponentKind::Cdc, ordinal);
    let Some(mut pod) = deps.pods.get(&cluster.namespace, &name).await? else {
        tracing::info!("Capture pod {} is gone, nothing to drain", name);
        return Ok(ShutdownPhase::Complete);
    };

    let timeout = match cluster.component(ComponentKind::Cdc) {
        Some(spec) => spec.graceful_shutdown_timeout(deps.config.graceful_shutdown_timeout)?,
        None => deps.config.graceful_shutdown_timeout,
    };

    let begin = match pod
        .meta
        .annotations
        .get(ANN_GRACEFUL_SHUTDOWN_BEGIN)
        .and_then(|raw| parse_timestamp(raw))
    {
        Some(begin) => begin,
        None => {
            if let Some(raw) = pod.meta.annotations.get(ANN_GRACEFUL_SHUTDOWN_BEGIN) {
                tracing::warn!(
                    "Pod {} has malformed {} value {:?}, restarting the handshake",
                    name,
                    ANN_GRACEFUL_SHUTDOWN_BEGIN,
                    raw
                );
            }
            pod.meta
                .annotations
                .insert(ANN_GRACEFUL_SHUTDOWN_BEGIN.to_string(), format_timestamp(now));
            deps.pods.update(&pod).await?;
            tracing::info!("Graceful shutdown of capture {} requested", name);
            now
        }
    };

    let elapsed = elapsed_since(begin, now);
    if elapsed > timeout {
        tracing::warn!(
            "Graceful shutdown of capture {} exceeded {:?}, removing it anyway",
            name,
            timeout
        );
        return Ok(ShutdownPhase::TimedOut);
    }

    let rpc_timeout = deps.config.rpc_timeout;
    let drain = with_timeout(
        rpc_timeout,
        "drain capture",
        deps.captures.drain(cluster, ordinal),
    )
    .await?;
    if drain.retry {
        // the capture asked to be polled again rather than backed off
        return Err(Error::requeue_after(
            format!(
                "capture {} is {}: {} tables remaining, asked to retry",
                name,
                ShutdownPhase::Draining,
                drain.remaining
            ),
            deps.config.requeue_base_delay,
        ));
    }
    if drain.remaining > 0 {
        return Err(Error::requeue(format!(
            "capture {} is {}: {} tables remaining",
            name,
            ShutdownPhase::Draining,
            drain.remaining
        )));
    }

    let resigned = with_timeout(
        rpc_timeout,
        "resign capture owner",
        deps.captures.resign_ownership(cluster, ordinal),
    )
    .await?;
    if !resigned {
        return Err(Error::requeue(format!(
            "capture {} is {}",
            name,
            ShutdownPhase::OwnerResignPending
        )));
    }

    tracing::info!("Capture {} drained and resigned after {:?}", name, elapsed);
    Ok(ShutdownPhase::Complete)
}

/// Outcome of one pre-termination hook run
#[derive(Debug)]
pub struct HookStep {
    /// Begin time the next run must be given
    pub begin_time: DateTime<Utc>,
    pub result: Result<ShutdownPhase>,
}

/// One handshake step run from inside the terminating capture pod.
///
/// The hook cannot write the pod object, so the begin time travels with the
/// caller between runs instead of living in the annotation. The step runs
/// against a local copy of the pod seeded with that time; the grace clock
/// therefore keeps running across restarts of the hook.
pub async fn shutdown_hook_step(
    cluster: &ClusterSpec,
    ordinal: u32,
    begin_time: Option<DateTime<Utc>>,
    captures: Arc<dyn CaptureControl>,
    config: &ControllerConfig,
    now: DateTime<Utc>,
) -> HookStep {
    let env = MemoryEnv::new(config.clone());
    let name = pod_name(&cluster.name, ComponentKind::Cdc, ordinal);
    let mut meta = ObjectMeta::new(&cluster.namespace, &name);
    if let Some(begin) = begin_time {
        meta.annotations
            .insert(ANN_GRACEFUL_SHUTDOWN_BEGIN.to_string(), format_timestamp(begin));
    }
    env.objects.put_pod(Pod {
        meta,
        node_name: None,
        ready: true,
        ready_transition_time: now,
        claims: vec![],
    });
    let mut deps = env.dependencies();
    deps.captures = captures;

    let result = graceful_shutdown_capture(cluster, ordinal, &deps, now).await;
    let begin_time = env
        .objects
        .pod(&cluster.namespace, &name)
        .and_then(|p| {
            p.meta
                .annotations
                .get(ANN_GRACEFUL_SHUTDOWN_BEGIN)
                .and_then(|raw| parse_timestamp(raw))
        })
        .unwrap_or(now);
    HookStep { begin_time, result }
}
