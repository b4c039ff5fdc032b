//! Metrics and health endpoints
//!
//! - `GET /metrics`: Prometheus text format
//! - `GET /health/live`: the process is up
//! - `GET /health/ready`: the controller finished its initial listing

use crate::common::{Result, METRICS};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Router};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct ServerState {
    pub ready: Arc<AtomicBool>,
}

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/metrics", axum::routing::get(metrics))
        .route("/health/live", axum::routing::get(health_live))
        .route("/health/ready", axum::routing::get(health_ready))
        .with_state(state)
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}

async fn health_live() -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(json!({
            "alive": true,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": METRICS.uptime_seconds(),
        })),
    )
}

async fn health_ready(State(state): State<ServerState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, axum::Json(json!({ "ready": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "ready": false,
                "reason": "initial cluster listing not finished",
            })),
        )
    }
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, state: ServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics and health endpoints on {}", listener.local_addr()?);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
