//! Periodic telemetry refresh
//!
//! Every tick reads host statistics once, scrapes every tracked VM through
//! the busy-key collector, and republishes the results to Prometheus and to
//! each VM's exchange disk.

use super::{BusyKeyCollector, CollectionOutcome, Scraper, VmRegistry};
use crate::exchange::MetricsExchangeDisk;
use crate::health::{components, HealthRegistry};
use crate::models::{DomainStats, VmInfo};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::report::{build_document, DomainStatsSource, HostStatsReader};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing of the refresh loop
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Time between rounds (default: 5 seconds)
    pub interval: Duration,
    /// How long a round waits for its scrapes (default: 10 seconds)
    pub timeout: Duration,
    /// Concurrent scrapes allowed per source (default: 1)
    pub max_per_key: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            max_per_key: 1,
        }
    }
}

/// What one refresh round did
#[derive(Debug, Clone, Default)]
pub struct RoundSummary {
    pub vms: usize,
    /// VMs whose statistics arrived before the round ended
    pub scraped: usize,
    pub disks_written: usize,
    pub disk_errors: usize,
    pub outcome: CollectionOutcome,
}

/// Scraper collecting domain statistics for one round
///
/// Results arriving after `complete` are stale and dropped.
struct RefreshScraper {
    source: Arc<dyn DomainStatsSource>,
    results: Mutex<Vec<(VmInfo, DomainStats)>>,
    closed: AtomicBool,
}

impl RefreshScraper {
    fn new(source: Arc<dyn DomainStatsSource>) -> Self {
        Self {
            source,
            results: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn results(&self) -> MutexGuard<'_, Vec<(VmInfo, DomainStats)>> {
        self.results.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_results(&self) -> Vec<(VmInfo, DomainStats)> {
        std::mem::take(&mut *self.results())
    }
}

#[async_trait]
impl Scraper<VmInfo> for RefreshScraper {
    async fn scrape(&self, key: &str, vm: VmInfo) {
        match self.source.domain_stats(&vm).await {
            Ok(stats) => {
                let mut results = self.results();
                if self.closed.load(Ordering::SeqCst) {
                    debug!(vm = %vm.key(), source = %key, "Discarding late statistics");
                    return;
                }
                results.push((vm, stats));
            }
            Err(e) => {
                debug!(vm = %vm.key(), source = %key, error = %e, "Failed to read VM statistics");
            }
        }
    }

    fn complete(&self) {
        // taken under the results lock so no push can race the close
        let _results = self.results();
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Periodic refresh of every tracked VM
pub struct RefreshLoop {
    collector: BusyKeyCollector,
    registry: Arc<VmRegistry>,
    source: Arc<dyn DomainStatsSource>,
    host: HostStatsReader,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    config: RefreshConfig,
}

impl RefreshLoop {
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Starting telemetry refresh loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!(error = %e, "Refresh round failed");
                        self.health
                            .set_unhealthy(components::COLLECTOR, e.to_string())
                            .await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down telemetry refresh loop");
                    break;
                }
            }
        }
    }

    /// Run a single round
    pub async fn refresh_once(&self) -> Result<RoundSummary> {
        let start = Instant::now();

        let host = self
            .host
            .read()
            .await
            .context("Failed to read host statistics")?;

        let vms = self.registry.list();
        self.metrics.set_vms_monitored(vms.len() as i64);

        let scraper = Arc::new(RefreshScraper::new(Arc::clone(&self.source)));
        let source = Arc::clone(&self.source);
        let outcome = self
            .collector
            .collect(
                vms.iter().cloned(),
                move |vm: &VmInfo| source.endpoint(vm),
                Arc::clone(&scraper),
                self.config.timeout,
            )
            .await;
        let results = scraper.take_results();

        let mut writes = JoinSet::new();
        for (vm, stats) in &results {
            self.metrics
                .set_vm_stats(&vm.namespace, &vm.name, stats.cpu_time_secs, stats.resident_kib);

            let Some(path) = vm.guest_metrics.disk.clone() else {
                continue;
            };
            let doc = build_document(&host, vm, stats);
            let key = vm.key();
            writes.spawn_blocking(move || {
                let disk = MetricsExchangeDisk::new(path);
                let result = disk.write(&doc);
                (key, disk, result)
            });
        }

        let mut disks_written = 0;
        let mut disk_errors = 0;
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => {
                    disks_written += 1;
                    self.metrics.inc_exchange_writes();
                }
                Ok((key, disk, Err(e))) => {
                    disk_errors += 1;
                    self.metrics.inc_exchange_write_errors();
                    self.logger.log_exchange_write_failed(
                        &key,
                        &disk.path().display().to_string(),
                        &e.to_string(),
                    );
                }
                Err(e) => {
                    disk_errors += 1;
                    self.metrics.inc_exchange_write_errors();
                    warn!(error = %e, "Exchange disk write task failed");
                }
            }
        }

        let elapsed = start.elapsed();
        self.metrics.record_round(
            elapsed.as_secs_f64(),
            outcome.completed,
            outcome.skipped.len(),
            outcome.collisions,
        );
        self.logger.log_collection_round(
            vms.len(),
            results.len(),
            &outcome.skipped,
            outcome.collisions,
            outcome.completed,
            elapsed.as_millis() as u64,
        );

        if outcome.completed && outcome.skipped.is_empty() {
            self.health.set_healthy(components::COLLECTOR).await;
        } else {
            self.health
                .set_degraded(
                    components::COLLECTOR,
                    format!(
                        "round completed={}, {} sources skipped",
                        outcome.completed,
                        outcome.skipped.len()
                    ),
                )
                .await;
        }

        if disk_errors == 0 {
            self.health.set_healthy(components::EXCHANGE_DISK).await;
        } else {
            self.health
                .set_degraded(
                    components::EXCHANGE_DISK,
                    format!("{} exchange disk writes failed", disk_errors),
                )
                .await;
        }

        Ok(RoundSummary {
            vms: vms.len(),
            scraped: results.len(),
            disks_written,
            disk_errors,
            outcome,
        })
    }
}

/// Builder for the refresh loop
pub struct RefreshLoopBuilder {
    registry: Option<Arc<VmRegistry>>,
    source: Option<Arc<dyn DomainStatsSource>>,
    host: Option<HostStatsReader>,
    health: Option<HealthRegistry>,
    node_name: String,
    config: RefreshConfig,
}

impl RefreshLoopBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            source: None,
            host: None,
            health: None,
            node_name: String::new(),
            config: RefreshConfig::default(),
        }
    }

    pub fn registry(mut self, registry: Arc<VmRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn source(mut self, source: Arc<dyn DomainStatsSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn host_reader(mut self, host: HostStatsReader) -> Self {
        self.host = Some(host);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_per_key(mut self, max_per_key: usize) -> Self {
        self.config.max_per_key = max_per_key;
        self
    }

    pub fn build(self) -> Result<RefreshLoop> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("VM registry is required"))?;
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Domain statistics source is required"))?;
        let host = self
            .host
            .ok_or_else(|| anyhow::anyhow!("Host statistics reader is required"))?;
        let collector = BusyKeyCollector::new(self.config.max_per_key)?;

        Ok(RefreshLoop {
            collector,
            registry,
            source,
            host,
            health: self.health.unwrap_or_default(),
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new(self.node_name),
            config: self.config,
        })
    }
}

impl Default for RefreshLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
