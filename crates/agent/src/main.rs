//! VM Telemetry Agent - per-VM guest metrics delivery
//!
//! This binary runs as a DaemonSet on each node, refreshing the metrics
//! exchange disk of every VM and answering guest channel requests.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use telemetry_lib::{
    collector::{discover_existing_vms, RefreshLoopBuilder, VmRegistry, VmWatcher},
    health::{components, HealthRegistry},
    manager::GuestMetricsManager,
    observability::{AgentMetrics, StructuredLogger},
    report::{HostStatsReader, ProcDomainStats},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vm_telemetry_agent::{api, config::AgentConfig};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting vm-telemetry-agent");

    let config = AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        vm_dir = %config.vm_dir.display(),
        refresh_interval_secs = config.refresh_interval_secs,
        "Agent configured"
    );

    let health_registry = HealthRegistry::with_agent_components().await;
    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let registry = Arc::new(VmRegistry::new());
    let source = Arc::new(ProcDomainStats::new(&config.proc_root));
    let host = HostStatsReader::new(&config.proc_root, &config.node_name);

    let manager = Arc::new(GuestMetricsManager::new(
        registry.clone(),
        source.clone(),
        host.clone(),
        health_registry.clone(),
        config.manager_config(),
        &config.node_name,
    ));

    // Pick up VMs that were running before the agent started
    match discover_existing_vms(&config.vm_dir).await {
        Ok(vms) => {
            for vm in vms {
                let key = vm.key();
                if let Err(e) = manager.start_vm(vm).await {
                    warn!(vm = %key, error = %e, "Failed to start guest metrics");
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Initial VM discovery failed");
            health_registry
                .set_degraded(components::DISCOVERY, format!("Initial discovery failed: {}", e))
                .await;
        }
    }

    let (event_tx, event_rx) = mpsc::channel(256);
    let _watcher = match VmWatcher::new(&config.vm_dir, event_tx).start().await {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(error = %e, "Failed to watch VM directory");
            health_registry
                .set_unhealthy(components::DISCOVERY, format!("VM watcher failed: {}", e))
                .await;
            None
        }
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let refresh = RefreshLoopBuilder::new()
        .registry(registry.clone())
        .source(source)
        .host_reader(host)
        .health(health_registry.clone())
        .node_name(&config.node_name)
        .interval(config.refresh_interval())
        .timeout(config.collection_timeout())
        .max_per_key(config.max_requests_per_key)
        .build()?;
    let refresh_handle = tokio::spawn(refresh.run(shutdown_tx.subscribe()));

    let manager_handle = {
        let manager = manager.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { manager.run(event_rx, shutdown).await })
    };

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        manager.clone(),
        &config.node_name,
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_ready(true).await;
    logger.log_startup(AGENT_VERSION, registry.len());

    let reason = wait_for_signal().await?;
    logger.log_shutdown(reason);

    let _ = shutdown_tx.send(());
    for (name, handle) in [("refresh loop", refresh_handle), ("VM manager", manager_handle)] {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!(task = name, "Task did not stop in time");
        }
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<&'static str> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}
