//! kvkeeper binary

use chrono::Utc;
use clap::{Parser, Subcommand};
use kvkeeper::client::capture::HttpCaptureControl;
use kvkeeper::client::coordinator::HttpStoreControl;
use kvkeeper::client::memory::{store_address, MemoryEnv};
use kvkeeper::client::{MemberHealth, PodControl, StoreControl};
use kvkeeper::common::labels::{
    component_labels, ordinal_of, pod_name, ANN_GRACEFUL_SHUTDOWN_BEGIN,
};
use kvkeeper::common::{format_timestamp, parse_duration, parse_timestamp, Config};
use kvkeeper::controller::{serve, Controller, ServerState};
use kvkeeper::member::{classify_stores, shutdown_hook_step};
use kvkeeper::model::{
    Cluster, ClusterSpec, ComponentKind, ComponentSpec, ComponentStatus, StoreState,
};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvkeeper")]
#[command(about = "Reconciles the stateful components of a distributed KV database cluster")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller against an in-memory object store seeded from a
    /// topology file
    Run {
        /// Topology file (TOML) with one `[[clusters]]` table per cluster
        #[arg(long)]
        topology: PathBuf,

        /// Stop after this long ("30s", "5m") and print the final status
        #[arg(long)]
        duration: Option<String>,
    },

    /// Classify the stores a live coordinator reports for one component
    Stores {
        #[arg(long, default_value = "default")]
        namespace: String,

        #[arg(long)]
        cluster: String,

        /// storage or columnar
        #[arg(long, default_value = "storage")]
        component: String,

        /// Coordinator base URL, e.g. http://127.0.0.1:2379
        #[arg(long)]
        coordinator_url: Option<String>,
    },

    /// Run one step of the drain and resign handshake of a capture replica.
    /// Exits non-zero while the handshake is still in progress; the caller
    /// retries with the begin time printed on the first run.
    ShutdownHook {
        #[arg(long, default_value = "default")]
        namespace: String,

        #[arg(long)]
        cluster: String,

        #[arg(long)]
        ordinal: u32,

        /// Give up after this long ("10m")
        #[arg(long)]
        timeout: Option<String>,

        /// Begin time of the handshake (RFC 3339), as printed by an earlier run
        /// or read from the pod's begin-time annotation
        #[arg(long)]
        begin_time: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

/// Topology file layout
#[derive(Debug, Deserialize)]
struct Topology {
    #[serde(default)]
    clusters: Vec<ClusterSpec>,
}

fn load_topology(path: &Path) -> anyhow::Result<Topology> {
    let topology: Topology = config::Config::builder()
        .add_source(config::File::from(path))
        .build()?
        .try_deserialize()?;
    Ok(topology)
}

fn parse_component(name: &str) -> anyhow::Result<ComponentKind> {
    ComponentKind::ALL
        .into_iter()
        .find(|k| k.as_str() == name)
        .ok_or_else(|| anyhow::anyhow!("unknown component {:?}", name))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Run { topology, duration } => {
            let topology = load_topology(&topology)?;
            let duration = duration
                .as_deref()
                .map(parse_duration)
                .transpose()?;
            run(config, topology, duration).await?;
        }
        Commands::Stores {
            namespace,
            cluster,
            component,
            coordinator_url,
        } => {
            let kind = parse_component(&component)?;
            let mut controller = config.controller.clone();
            if coordinator_url.is_some() {
                controller.coordinator_url = coordinator_url;
            }
            let client = HttpStoreControl::new(&controller)?;
            let spec = ClusterSpec::new(namespace, cluster);
            let active = client.get_stores(&spec).await?;
            let tombstones = client.get_tombstone_stores(&spec).await?;
            let snapshot = classify_stores(
                &spec,
                kind,
                &ComponentStatus::default(),
                &active,
                &tombstones,
                Utc::now(),
            )?;
            let out = json!({
                "cluster": spec.key(),
                "component": kind.as_str(),
                "stores": snapshot.stores,
                "peer_stores": snapshot.peer_stores,
                "tombstone_stores": snapshot.tombstone_stores,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::ShutdownHook {
            namespace,
            cluster,
            ordinal,
            timeout,
            begin_time,
        } => {
            shutdown_hook(config, namespace, cluster, ordinal, timeout, begin_time).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run(
    config: Config,
    topology: Topology,
    duration: Option<Duration>,
) -> anyhow::Result<()> {
    if topology.clusters.is_empty() {
        anyhow::bail!("topology declares no clusters");
    }
    let env = Arc::new(MemoryEnv::new(config.controller.clone()));
    for spec in &topology.clusters {
        tracing::info!(
            "Seeding cluster {} with {} components",
            spec.key(),
            spec.components.len()
        );
        env.objects.put_cluster(Cluster::new(spec.clone()));
    }

    let controller = Arc::new(Controller::new(env.objects.clone(), env.dependencies()));

    let (stop_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let server = if config.server.enabled {
        let state = ServerState {
            ready: controller.ready_flag(),
        };
        let mut stop = stop_tx.subscribe();
        let addr = config.server.bind_addr;
        Some(tokio::spawn(async move {
            serve(addr, state, async move {
                let _ = stop.recv().await;
            })
            .await
        }))
    } else {
        None
    };

    // stand-in for the orchestration layer and the coordinator
    let emulator = {
        let env = env.clone();
        let specs = topology.clusters.clone();
        let mut stop = stop_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = emulate(&env, &specs).await {
                            tracing::warn!("Emulation step failed: {}", e);
                        }
                    }
                }
            }
        })
    };

    let shutdown = {
        let mut stop = stop_tx.subscribe();
        async move {
            let _ = stop.recv().await;
        }
    };
    let signal = {
        let stop_tx = stop_tx.clone();
        async move {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Waiting for ctrl-c failed: {}", e);
                    }
                }
            }
            let _ = stop_tx.send(());
        }
    };
    tokio::spawn(signal);

    controller.run(shutdown).await?;
    let _ = emulator.await;
    if let Some(server) = server {
        server.await??;
    }

    for spec in &topology.clusters {
        if let Some(cluster) = env.objects.cluster(&spec.namespace, &spec.name) {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "cluster": spec.key(),
                    "status": cluster.status,
                }))?
            );
        }
    }
    Ok(())
}

/// Play the replica-set controller, the stores and the coordinator members
async fn emulate(env: &MemoryEnv, specs: &[ClusterSpec]) -> anyhow::Result<()> {
    env.objects.materialize_all()?;

    for spec in specs {
        if spec.component(ComponentKind::Coordinator).is_some() {
            let selector = component_labels(spec, ComponentKind::Coordinator);
            let pods = PodControl::list(env.objects.as_ref(), &spec.namespace, &selector).await?;
            env.stores.set_members(
                pods.iter()
                    .map(|p| MemberHealth {
                        name: p.meta.name.clone(),
                        healthy: p.ready,
                    })
                    .collect(),
            );
        }

        for kind in [ComponentKind::Storage, ComponentKind::Columnar] {
            if spec.component(kind).is_none() {
                continue;
            }
            let selector = component_labels(spec, kind);
            for pod in PodControl::list(env.objects.as_ref(), &spec.namespace, &selector).await? {
                let Some(ordinal) = ordinal_of(&pod.meta.name) else {
                    continue;
                };
                let address = store_address(spec, kind, ordinal);
                if env.stores.store_id_for(&address).is_none() {
                    let id = env.stores.register(spec, kind, ordinal);
                    tracing::info!("Store {} registered for {}", id, pod.meta.name);
                }
            }

            // offline stores finish draining instantly
            let Some(cluster) = env.objects.cluster(&spec.namespace, &spec.name) else {
                continue;
            };
            if let Some(status) = cluster.status(kind) {
                for store in status.stores.values() {
                    if store.state == StoreState::Offline {
                        env.stores.finish_offline(store.id);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn shutdown_hook(
    config: Config,
    namespace: String,
    cluster: String,
    ordinal: u32,
    timeout: Option<String>,
    begin_time: Option<String>,
) -> anyhow::Result<()> {
    let mut component = ComponentSpec::new(ordinal + 1, "");
    component.graceful_shutdown_timeout = timeout;
    let spec = ClusterSpec::new(namespace, cluster).with_component(ComponentKind::Cdc, component);
    let begin_time = match begin_time {
        Some(raw) => match parse_timestamp(&raw) {
            Some(t) => Some(t),
            None => anyhow::bail!("--begin-time {:?} is not an RFC 3339 timestamp", raw),
        },
        None => None,
    };
    let captures = Arc::new(HttpCaptureControl::new(&config.controller)?);

    let step = shutdown_hook_step(
        &spec,
        ordinal,
        begin_time,
        captures,
        &config.controller,
        Utc::now(),
    )
    .await;
    let name = pod_name(&spec.name, ComponentKind::Cdc, ordinal);
    let retry_after_ms = step
        .result
        .as_ref()
        .err()
        .and_then(|e| e.retry_after())
        .map(|d| d.as_millis() as u64);
    let phase = match &step.result {
        Ok(phase) => phase.to_string(),
        Err(e) if e.is_requeue() => "in-progress".to_string(),
        Err(_) => "failed".to_string(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "pod": name,
            "phase": phase,
            "finished": step.result.is_ok(),
            "annotation": ANN_GRACEFUL_SHUTDOWN_BEGIN,
            "begin_time": format_timestamp(step.begin_time),
            "retry_after_ms": retry_after_ms,
        }))?
    );

    let phase = step.result?;
    tracing::info!("Shutdown handshake of {} finished: {}", name, phase);
    Ok(())
}
