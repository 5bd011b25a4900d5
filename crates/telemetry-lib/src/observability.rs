//! Observability for the telemetry agent
//!
//! Provides:
//! - Prometheus metrics (collection rounds, exchange writes, guest channel traffic, per-VM usage)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for collection rounds (in seconds)
const ROUND_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Guest request outcome labels
pub mod outcomes {
    pub const SERVED: &str = "served";
    pub const PLACEHOLDER: &str = "placeholder";
    pub const INVALID: &str = "invalid";
}

static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    collection_latency_seconds: Histogram,
    collection_rounds: IntCounter,
    collection_timeouts: IntCounter,
    skipped_sources: IntCounter,
    key_collisions: IntCounter,
    vms_monitored: IntGauge,
    exchange_writes: IntCounter,
    exchange_write_errors: IntCounter,
    guest_requests: IntCounterVec,
    guest_channels_active: IntGauge,
    vm_cpu_time_seconds: GaugeVec,
    vm_resident_memory_kib: GaugeVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            collection_latency_seconds: register_histogram!(
                "vm_telemetry_collection_latency_seconds",
                "Wall time of one collection round",
                ROUND_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            collection_rounds: register_int_counter!(
                "vm_telemetry_collection_rounds_total",
                "Collection rounds started"
            )
            .expect("Failed to register collection_rounds"),

            collection_timeouts: register_int_counter!(
                "vm_telemetry_collection_timeouts_total",
                "Collection rounds that hit the round timeout"
            )
            .expect("Failed to register collection_timeouts"),

            skipped_sources: register_int_counter!(
                "vm_telemetry_skipped_sources_total",
                "Sources skipped because earlier scrapes were still running"
            )
            .expect("Failed to register skipped_sources"),

            key_collisions: register_int_counter!(
                "vm_telemetry_key_collisions_total",
                "Targets dropped because another target shared their source key"
            )
            .expect("Failed to register key_collisions"),

            vms_monitored: register_int_gauge!(
                "vm_telemetry_vms_monitored",
                "Number of VMs currently tracked on this node"
            )
            .expect("Failed to register vms_monitored"),

            exchange_writes: register_int_counter!(
                "vm_telemetry_exchange_writes_total",
                "Exchange disk writes that completed"
            )
            .expect("Failed to register exchange_writes"),

            exchange_write_errors: register_int_counter!(
                "vm_telemetry_exchange_write_errors_total",
                "Exchange disk writes that failed"
            )
            .expect("Failed to register exchange_write_errors"),

            guest_requests: register_int_counter_vec!(
                "vm_telemetry_guest_requests_total",
                "Guest channel requests by outcome",
                &["outcome"]
            )
            .expect("Failed to register guest_requests"),

            guest_channels_active: register_int_gauge!(
                "vm_telemetry_guest_channels_active",
                "Guest channels currently connected"
            )
            .expect("Failed to register guest_channels_active"),

            vm_cpu_time_seconds: register_gauge_vec!(
                "vm_telemetry_vm_cpu_time_seconds",
                "CPU time consumed by the VM process",
                &["namespace", "name"]
            )
            .expect("Failed to register vm_cpu_time_seconds"),

            vm_resident_memory_kib: register_gauge_vec!(
                "vm_telemetry_vm_resident_memory_kib",
                "Resident memory of the VM process",
                &["namespace", "name"]
            )
            .expect("Failed to register vm_resident_memory_kib"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    /// Record the result of one collection round
    pub fn record_round(
        &self,
        duration_secs: f64,
        completed: bool,
        skipped: usize,
        collisions: usize,
    ) {
        let inner = self.inner();
        inner.collection_latency_seconds.observe(duration_secs);
        inner.collection_rounds.inc();
        if !completed {
            inner.collection_timeouts.inc();
        }
        inner.skipped_sources.inc_by(skipped as u64);
        inner.key_collisions.inc_by(collisions as u64);
    }

    pub fn set_vms_monitored(&self, count: i64) {
        self.inner().vms_monitored.set(count);
    }

    pub fn inc_exchange_writes(&self) {
        self.inner().exchange_writes.inc();
    }

    pub fn inc_exchange_write_errors(&self) {
        self.inner().exchange_write_errors.inc();
    }

    /// Count one guest request; see [`outcomes`] for labels
    pub fn inc_guest_request(&self, outcome: &str) {
        self.inner()
            .guest_requests
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn guest_channel_connected(&self) {
        self.inner().guest_channels_active.inc();
    }

    pub fn guest_channel_disconnected(&self) {
        self.inner().guest_channels_active.dec();
    }

    /// Publish the latest statistics of one VM
    pub fn set_vm_stats(&self, namespace: &str, name: &str, cpu_time_secs: f64, resident_kib: u64) {
        let inner = self.inner();
        inner
            .vm_cpu_time_seconds
            .with_label_values(&[namespace, name])
            .set(cpu_time_secs);
        inner
            .vm_resident_memory_kib
            .with_label_values(&[namespace, name])
            .set(resident_kib as f64);
    }

    /// Drop the series of a VM that stopped
    pub fn remove_vm(&self, namespace: &str, name: &str) {
        let inner = self.inner();
        let _ = inner
            .vm_cpu_time_seconds
            .remove_label_values(&[namespace, name]);
        let _ = inner
            .vm_resident_memory_kib
            .remove_label_values(&[namespace, name]);
    }
}

/// Structured logger for agent events
///
/// Emits records tagged with an `event` field so log pipelines can filter
/// on them.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log the end of a collection round
    pub fn log_collection_round(
        &self,
        vms: usize,
        scraped: usize,
        skipped: &[String],
        collisions: usize,
        completed: bool,
        elapsed_ms: u64,
    ) {
        if completed && skipped.is_empty() {
            info!(
                event = "collection_round",
                node = %self.node_name,
                vms = vms,
                scraped = scraped,
                collisions = collisions,
                elapsed_ms = elapsed_ms,
                "Collection round complete"
            );
        } else {
            warn!(
                event = "collection_round",
                node = %self.node_name,
                vms = vms,
                scraped = scraped,
                skipped = ?skipped,
                collisions = collisions,
                completed = completed,
                elapsed_ms = elapsed_ms,
                "Collection round degraded"
            );
        }
    }

    pub fn log_exchange_write_failed(&self, vm: &str, path: &str, error: &str) {
        warn!(
            event = "exchange_write_failed",
            node = %self.node_name,
            vm = %vm,
            path = %path,
            error = %error,
            "Failed to write exchange disk"
        );
    }

    /// Log a guest channel leaving service
    pub fn log_guest_channel(&self, vm: &str, socket: &str, error: Option<&str>) {
        match error {
            None => info!(
                event = "guest_channel",
                node = %self.node_name,
                vm = %vm,
                socket = %socket,
                "Guest channel stopped"
            ),
            Some(error) => warn!(
                event = "guest_channel",
                node = %self.node_name,
                vm = %vm,
                socket = %socket,
                error = %error,
                "Guest channel failed, guest delivery disabled for this VM"
            ),
        }
    }

    pub fn log_vm_started(&self, vm: &str, pid: u32, disk: bool, channel: bool) {
        info!(
            event = "vm_started",
            node = %self.node_name,
            vm = %vm,
            pid = pid,
            exchange_disk = disk,
            guest_channel = channel,
            "VM registered"
        );
    }

    pub fn log_vm_stopped(&self, vm: &str) {
        info!(
            event = "vm_stopped",
            node = %self.node_name,
            vm = %vm,
            "VM unregistered"
        );
    }

    pub fn log_startup(&self, version: &str, vms: usize) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            vms = vms,
            "VM telemetry agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "VM telemetry agent shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(name: &str, label: Option<(&str, &str)>) -> f64 {
        prometheus::gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().iter())
            .filter(|metric| match label {
                None => true,
                Some((key, value)) => metric
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == key && l.get_value() == value),
            })
            .map(|metric| metric.get_counter().get_value())
            .sum()
    }

    #[test]
    fn test_agent_metrics_recording() {
        // Metrics live in the process-wide registry; handles share it
        let metrics = AgentMetrics::new();
        let other = metrics.clone();

        metrics.record_round(0.01, false, 2, 1);
        other.set_vms_monitored(3);
        metrics.inc_exchange_writes();
        metrics.inc_exchange_write_errors();
        metrics.guest_channel_connected();
        metrics.guest_channel_disconnected();

        assert!(counter_value("vm_telemetry_collection_timeouts_total", None) >= 1.0);
        assert!(counter_value("vm_telemetry_skipped_sources_total", None) >= 2.0);
    }

    #[test]
    fn test_guest_requests_by_outcome() {
        let metrics = AgentMetrics::new();
        let before = counter_value(
            "vm_telemetry_guest_requests_total",
            Some(("outcome", outcomes::INVALID)),
        );

        metrics.inc_guest_request(outcomes::INVALID);

        let after = counter_value(
            "vm_telemetry_guest_requests_total",
            Some(("outcome", outcomes::INVALID)),
        );
        assert!(after >= before + 1.0);
    }

    #[test]
    fn test_vm_series_removed() {
        let metrics = AgentMetrics::new();
        metrics.set_vm_stats("obs-test", "vm-a", 12.5, 2048);
        metrics.remove_vm("obs-test", "vm-a");
        metrics.remove_vm("obs-test", "never-seen");

        let remaining = prometheus::gather()
            .iter()
            .filter(|family| family.get_name() == "vm_telemetry_vm_cpu_time_seconds")
            .flat_map(|family| family.get_metric().iter())
            .filter(|metric| metric.get_label().iter().any(|l| l.get_value() == "obs-test"))
            .count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
        logger.log_collection_round(1, 1, &[], 0, true, 3);
    }
}
