//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use telemetry_lib::{
    collector::VmRegistry,
    health::{components, HealthRegistry},
    manager::{GuestMetricsManager, ManagerConfig},
    models::{GuestMetricsConfig, VmInfo},
    observability::AgentMetrics,
    report::{HostStatsReader, ProcDomainStats},
};
use tower::ServiceExt;
use vm_telemetry_agent::api::{create_router, AppState};

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::with_agent_components().await;

    let registry = Arc::new(VmRegistry::new());
    let manager = Arc::new(GuestMetricsManager::new(
        registry,
        Arc::new(ProcDomainStats::new("/nonexistent/proc")),
        HostStatsReader::new("/nonexistent/proc", "node-1"),
        health_registry.clone(),
        ManagerConfig::default(),
        "node-1",
    ));

    let metrics = AgentMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics, manager, "node-1"));
    let router = create_router(state.clone());

    (router, state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::EXCHANGE_DISK, "Failed to write 1 exchange disk")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::GUEST_CHANNEL, "Connect attempts exhausted")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["components"]["guest_channel"]["status"], "unhealthy");
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let (app, _state) = setup_test_app().await;

    let (_, health) = get_json(app, "/healthz").await;

    for name in components::ALL {
        assert!(health["components"][*name].is_object(), "missing {}", name);
    }
}

#[tokio::test]
async fn test_readyz_returns_503_before_discovery() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_collector_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::COLLECTOR, "Failed to read host statistics")
        .await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Collector unhealthy");
}

#[tokio::test]
async fn test_readyz_ignores_unhealthy_guest_channel() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::GUEST_CHANNEL, "Connect attempts exhausted")
        .await;

    let (status, _) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.record_round(0.002, true, 0, 0);
    state.metrics.set_vms_monitored(3);
    state.metrics.inc_exchange_writes();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("vm_telemetry_collection_latency_seconds_bucket"));
    assert!(metrics_text.contains("vm_telemetry_collection_rounds_total"));
    assert!(metrics_text.contains("vm_telemetry_vms_monitored"));
    assert!(metrics_text.contains("vm_telemetry_exchange_writes_total"));
}

#[tokio::test]
async fn test_vms_lists_tracked_vms() {
    let (app, state) = setup_test_app().await;

    let registry = state.manager.registry();
    registry.register(VmInfo {
        name: "fedora".to_string(),
        namespace: "default".to_string(),
        pid: 4242,
        vcpus: 2,
        memory_kib: 2_097_152,
        guest_metrics: GuestMetricsConfig {
            disk: Some(PathBuf::from("/var/run/vms/default_fedora/metrics.img")),
            channel: Some(PathBuf::from("/var/run/vms/default_fedora/metrics.sock")),
        },
    });
    registry.register(VmInfo {
        name: "alpine".to_string(),
        namespace: "dev".to_string(),
        pid: 77,
        vcpus: 1,
        memory_kib: 524_288,
        guest_metrics: GuestMetricsConfig::default(),
    });

    let (status, body) = get_json(app, "/api/v1/vms").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node"], "node-1");
    assert!(body["generated_at"].is_string());

    let vms = body["vms"].as_array().unwrap();
    assert_eq!(vms.len(), 2);
    assert_eq!(vms[0]["key"], "default/fedora");
    assert_eq!(vms[0]["pid"], 4242);
    assert_eq!(
        vms[0]["exchange_disk"],
        "/var/run/vms/default_fedora/metrics.img"
    );
    // registered without starting delivery
    assert_eq!(vms[0]["channel_active"], false);
    assert_eq!(vms[1]["key"], "dev/alpine");
    assert!(vms[1]["guest_channel"].is_null());
}

#[tokio::test]
async fn test_vms_empty_registry() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get_json(app, "/api/v1/vms").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["vms"].as_array().unwrap().is_empty());
}
