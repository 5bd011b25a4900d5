//! HTTP API for health checks, Prometheus metrics and tracked VMs

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use telemetry_lib::{
    health::{ComponentStatus, HealthRegistry},
    manager::GuestMetricsManager,
    observability::AgentMetrics,
};
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub manager: Arc<GuestMetricsManager>,
    pub node_name: String,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AgentMetrics,
        manager: Arc<GuestMetricsManager>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            manager,
            node_name: node_name.into(),
        }
    }
}

/// One VM as reported by `/api/v1/vms`
#[derive(Debug, Serialize)]
pub struct VmSummary {
    pub key: String,
    pub namespace: String,
    pub name: String,
    pub pid: u32,
    pub vcpus: u32,
    pub memory_kib: u64,
    pub exchange_disk: Option<PathBuf>,
    pub guest_channel: Option<PathBuf>,
    pub channel_active: bool,
}

#[derive(Debug, Serialize)]
pub struct VmListResponse {
    pub node: String,
    pub generated_at: DateTime<Utc>,
    pub vms: Vec<VmSummary>,
}

/// Health check response - returns 200 unless a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
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
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// VMs currently tracked on this node
async fn list_vms(State(state): State<Arc<AppState>>) -> Json<VmListResponse> {
    let vms = state
        .manager
        .registry()
        .list()
        .into_iter()
        .map(|vm| {
            let key = vm.key();
            VmSummary {
                channel_active: state.manager.has_channel(&key),
                key,
                namespace: vm.namespace,
                name: vm.name,
                pid: vm.pid,
                vcpus: vm.vcpus,
                memory_kib: vm.memory_kib,
                exchange_disk: vm.guest_metrics.disk,
                guest_channel: vm.guest_metrics.channel,
            }
        })
        .collect();

    Json(VmListResponse {
        node: state.node_name.clone(),
        generated_at: Utc::now(),
        vms,
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/vms", get(list_vms))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
