//! The controller loop driving a cluster to its declared topology

mod common;

use common::{cluster_spec, component, emulate, fast_config, NAME, NS};
use kvkeeper::client::memory::MemoryEnv;
use kvkeeper::common::METRICS;
use kvkeeper::controller::{create_router, ServerState};
use kvkeeper::model::{Cluster, ComponentKind, Phase};
use kvkeeper::Controller;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_controller_brings_up_cluster() {
    let env = Arc::new(MemoryEnv::new(fast_config()));
    env.objects.put_cluster(Cluster::new(cluster_spec(&[
        (ComponentKind::Coordinator, component(3, "coord:v1", None)),
        (ComponentKind::Storage, component(3, "storage:v1", Some("data"))),
        (ComponentKind::Gateway, component(2, "gw:v1", None)),
    ])));

    let controller = Arc::new(Controller::new(env.objects.clone(), env.dependencies()));
    let ready = controller.ready_flag();
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);

    let world = {
        let env = env.clone();
        let mut stop = stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {
                        if let Some(cluster) = env.objects.cluster(NS, NAME) {
                            emulate(&env, &cluster);
                        }
                    }
                }
            }
        })
    };

    let run = tokio::spawn(controller.clone().run(async move {
        let _ = stop_rx.changed().await;
    }));

    // converge within a few resync rounds
    let mut converged = false;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cluster = env.objects.cluster(NS, NAME).unwrap();
        let stores_up = cluster
            .status(ComponentKind::Storage)
            .map(|s| s.synced && s.stores.len() == 3)
            .unwrap_or(false);
        if stores_up && env.objects.replica_set(NS, "basic-gateway").is_some() {
            converged = true;
            break;
        }
    }
    assert!(converged, "cluster did not converge");
    assert!(ready.load(Ordering::SeqCst));

    stop_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    world.await.unwrap();
    assert!(!ready.load(Ordering::SeqCst));

    let cluster = env.objects.cluster(NS, NAME).unwrap();
    for kind in [
        ComponentKind::Coordinator,
        ComponentKind::Storage,
        ComponentKind::Gateway,
    ] {
        let name = format!("{}-{}", NAME, kind);
        assert!(env.objects.replica_set(NS, &name).is_some(), "{}", name);
        assert_ne!(cluster.phase(kind), Phase::Upgrade);
    }
    assert!(METRICS.ticks_total.get() > 0);
    assert!(METRICS.status_writes.get() > 0);
}

#[tokio::test]
async fn test_metrics_endpoint_reports_components() {
    let env = MemoryEnv::new(fast_config());
    let mut cluster = Cluster::new(cluster_spec(&[(
        ComponentKind::Coordinator,
        component(1, "coord:v1", None),
    )]));
    kvkeeper::ClusterReconciler::new()
        .sync(&mut cluster, &env.dependencies())
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = create_router(ServerState {
        ready: Arc::new(AtomicBool::new(true)),
    });
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let resp = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let text = resp.text().await.unwrap();
    assert!(text.contains("component=\"coordinator\""));

    let live = reqwest::get(format!("http://{}/health/live", addr)).await.unwrap();
    let body: serde_json::Value = live.json().await.unwrap();
    assert_eq!(body["alive"], true);
}
