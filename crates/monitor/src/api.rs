//! HTTP API for health checks, Prometheus metrics and workload snapshots

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use monitor_lib::{health::ComponentStatus, HealthRegistry, WorkloadRegistry};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub workloads: Arc<WorkloadRegistry>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, workloads: Arc<WorkloadRegistry>) -> Self {
        Self {
            health_registry,
            workloads,
        }
    }
}

#[derive(Debug, Serialize)]
struct CommandAccepted {
    id: String,
    command: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Snapshot of every tracked workload, ordered by ID
async fn list_containers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.workloads.snapshot().await)
}

async fn get_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.workloads.get(&id).await {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("container {id} is not tracked"),
            }),
        )
            .into_response(),
    }
}

/// Stop a workload in the background; unknown IDs are accepted and ignored
async fn stop_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!(container_id = %id, "Stop requested");
    let workloads = state.workloads.clone();
    let target = id.clone();
    tokio::spawn(async move { workloads.stop(&target).await });

    (
        StatusCode::ACCEPTED,
        Json(CommandAccepted {
            id,
            command: "stop",
        }),
    )
}

/// Restart a workload in the background; unknown IDs are accepted and ignored
async fn restart_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!(container_id = %id, "Restart requested");
    let workloads = state.workloads.clone();
    let target = id.clone();
    tokio::spawn(async move { workloads.restart(&target).await });

    (
        StatusCode::ACCEPTED,
        Json(CommandAccepted {
            id,
            command: "restart",
        }),
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/containers", get(list_containers))
        .route("/containers/:id", get(get_container))
        .route("/containers/:id/stop", post(stop_container))
        .route("/containers/:id/restart", post(restart_container))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
