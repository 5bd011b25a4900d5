//! Per-VM guest metrics lifecycle
//!
//! When a VM starts the manager prepares its exchange disk and connects its
//! guest channel. When it stops the channel is cancelled; the disk file
//! belongs to the VM's directory and is left in place.

use crate::channel::{
    ChannelConfig, GuestChannelServer, MetricsReporter, DEFAULT_BURST, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_MAX_CONNECT_ATTEMPTS, DEFAULT_REQUESTS_PER_SECOND,
};
use crate::collector::{VmEvent, VmRegistry};
use crate::exchange::MetricsExchangeDisk;
use crate::health::{components, HealthRegistry};
use crate::models::{MetricsDocument, VmInfo};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::report::{build_document, DomainStatsSource, HostStatsReader};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds a fresh report for one VM on every guest request
pub struct VmReporter {
    vm: VmInfo,
    source: Arc<dyn DomainStatsSource>,
    host: HostStatsReader,
}

impl VmReporter {
    pub fn new(vm: VmInfo, source: Arc<dyn DomainStatsSource>, host: HostStatsReader) -> Self {
        Self { vm, source, host }
    }
}

#[async_trait]
impl MetricsReporter for VmReporter {
    async fn report(&self) -> Result<MetricsDocument> {
        let host = self.host.read().await?;
        let stats = self
            .source
            .domain_stats(&self.vm)
            .await
            .with_context(|| format!("Failed to read statistics of {}", self.vm.key()))?;
        Ok(build_document(&host, &self.vm, &stats))
    }
}

/// Channel parameters shared by every VM
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub requests_per_second: f64,
    pub burst: u32,
    pub max_connect_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: DEFAULT_BURST,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

impl ManagerConfig {
    fn channel_config(&self, socket_path: &Path) -> ChannelConfig {
        ChannelConfig {
            socket_path: socket_path.to_path_buf(),
            requests_per_second: self.requests_per_second,
            burst: self.burst,
            max_connect_attempts: self.max_connect_attempts,
            initial_backoff: self.initial_backoff,
        }
    }
}

struct ChannelHandle {
    id: u64,
    cancel: CancellationToken,
}

pub struct GuestMetricsManager {
    registry: Arc<VmRegistry>,
    source: Arc<dyn DomainStatsSource>,
    host: HostStatsReader,
    health: HealthRegistry,
    config: ManagerConfig,
    channels: Arc<DashMap<String, ChannelHandle>>,
    next_channel_id: AtomicU64,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl GuestMetricsManager {
    pub fn new(
        registry: Arc<VmRegistry>,
        source: Arc<dyn DomainStatsSource>,
        host: HostStatsReader,
        health: HealthRegistry,
        config: ManagerConfig,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            source,
            host,
            health,
            config,
            channels: Arc::new(DashMap::new()),
            next_channel_id: AtomicU64::new(0),
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new(node_name),
        }
    }

    pub fn registry(&self) -> &Arc<VmRegistry> {
        &self.registry
    }

    /// Whether a channel server is running for the VM
    pub fn has_channel(&self, key: &str) -> bool {
        self.channels.contains_key(key)
    }

    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }

    /// Register a VM and set up its guest delivery
    ///
    /// Repeating a start with an unchanged descriptor is a no-op; a changed
    /// descriptor restarts delivery. The VM only becomes visible to refresh
    /// rounds once its disk exists and its channel is ready to run, so
    /// creation never races a refresh write on the same path.
    pub async fn start_vm(&self, vm: VmInfo) -> Result<()> {
        let key = vm.key();

        if let Some(previous) = self.registry.get(&key) {
            let channel_running = vm.guest_metrics.channel.is_none() || self.has_channel(&key);
            if previous == vm && channel_running {
                debug!(vm = %key, "VM already running");
                return Ok(());
            }
            self.stop_channel(&key);
            self.registry.unregister(&key);
        }

        if let Some(path) = &vm.guest_metrics.disk {
            self.create_disk(&key, path).await;
        }

        let server = match &vm.guest_metrics.channel {
            Some(path) => Some(
                self.channel_server(&vm, path)
                    .with_context(|| format!("Failed to start guest channel for {}", key))?,
            ),
            None => None,
        };

        self.registry.register(vm.clone());
        self.metrics.set_vms_monitored(self.registry.len() as i64);

        if let Some(server) = server {
            self.spawn_channel(&key, server);
        }

        self.logger.log_vm_started(
            &key,
            vm.pid,
            vm.guest_metrics.disk.is_some(),
            vm.guest_metrics.channel.is_some(),
        );
        Ok(())
    }

    async fn create_disk(&self, key: &str, path: &Path) {
        let disk = MetricsExchangeDisk::new(path);
        let created = tokio::task::spawn_blocking(move || disk.create()).await;

        match created {
            Ok(Ok(())) => {
                debug!(vm = %key, path = %path.display(), "Exchange disk ready");
            }
            Ok(Err(e)) => {
                self.logger
                    .log_exchange_write_failed(key, &path.display().to_string(), &e.to_string());
                self.health
                    .set_degraded(
                        components::EXCHANGE_DISK,
                        format!("Failed to create exchange disk for {}: {}", key, e),
                    )
                    .await;
            }
            Err(e) => warn!(vm = %key, error = %e, "Exchange disk creation task failed"),
        }
    }

    fn channel_server(&self, vm: &VmInfo, socket_path: &Path) -> Result<GuestChannelServer> {
        let reporter = Arc::new(VmReporter::new(
            vm.clone(),
            Arc::clone(&self.source),
            self.host.clone(),
        ));
        Ok(GuestChannelServer::new(
            self.config.channel_config(socket_path),
            reporter,
        )?)
    }

    fn spawn_channel(&self, key: &str, server: GuestChannelServer) {
        let key = key.to_string();
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.channels.insert(
            key.clone(),
            ChannelHandle {
                id,
                cancel: cancel.clone(),
            },
        );

        let channels = Arc::clone(&self.channels);
        let health = self.health.clone();
        let logger = self.logger.clone();
        let socket = server.socket_path().display().to_string();

        tokio::spawn(async move {
            let result = server.run(cancel).await;
            channels.remove_if(&key, |_, handle| handle.id == id);

            match result {
                Ok(()) => logger.log_guest_channel(&key, &socket, None),
                Err(e) => {
                    logger.log_guest_channel(&key, &socket, Some(&e.to_string()));
                    health
                        .set_unhealthy(
                            components::GUEST_CHANNEL,
                            format!("Guest channel of {} failed: {}", key, e),
                        )
                        .await;
                }
            }
        });
    }

    fn stop_channel(&self, key: &str) {
        if let Some((_, handle)) = self.channels.remove(key) {
            handle.cancel.cancel();
        }
    }

    /// Forget a VM and stop its guest channel
    pub fn stop_vm(&self, key: &str) {
        self.stop_channel(key);

        if let Some(vm) = self.registry.unregister(key) {
            self.metrics.remove_vm(&vm.namespace, &vm.name);
            self.metrics.set_vms_monitored(self.registry.len() as i64);
            self.logger.log_vm_stopped(key);
        }
    }

    /// Cancel every channel server
    pub fn shutdown(&self) {
        let count = self.channels.len();
        for entry in self.channels.iter() {
            entry.cancel.cancel();
        }
        self.channels.clear();
        info!(channels = count, "Stopped guest channels");
    }

    /// Apply discovery events until the stream ends or shutdown is signalled
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<VmEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(VmEvent::Started(vm)) => {
                        if let Err(e) = self.start_vm(vm).await {
                            warn!(error = %e, "Failed to start guest metrics");
                        }
                    }
                    Some(VmEvent::Stopped(key)) => self.stop_vm(&key),
                    None => {
                        debug!("VM event stream closed");
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::DISK_SIZE;
    use crate::health::ComponentStatus;
    use crate::models::GuestMetricsConfig;
    use crate::report::ProcDomainStats;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        dir: TempDir,
        manager: GuestMetricsManager,
        health: HealthRegistry,
    }

    async fn fixture(config: ManagerConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        let pid_dir = proc_root.join("42");
        tokio::fs::create_dir_all(&pid_dir).await.unwrap();
        tokio::fs::write(proc_root.join("meminfo"), "MemTotal: 1000 kB\nMemFree: 500 kB\n")
            .await
            .unwrap();
        tokio::fs::write(proc_root.join("stat"), "cpu  1 1 1 1 0 0 0 0\ncpu0 1 1 1 1 0 0 0 0\n")
            .await
            .unwrap();
        tokio::fs::write(
            pid_dir.join("stat"),
            "42 (qemu) S 1 1 1 0 -1 0 0 0 0 0 10 10 0 0 20 0 1 0 1 0 0",
        )
        .await
        .unwrap();
        tokio::fs::write(pid_dir.join("status"), "VmRSS:\t 100 kB\n")
            .await
            .unwrap();

        let health = HealthRegistry::with_agent_components().await;
        let manager = GuestMetricsManager::new(
            Arc::new(VmRegistry::new()),
            Arc::new(ProcDomainStats::new(&proc_root)),
            HostStatsReader::new(&proc_root, "node-1"),
            health.clone(),
            config,
            "node-1",
        );

        Fixture {
            dir,
            manager,
            health,
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            requests_per_second: 100.0,
            burst: 5,
            max_connect_attempts: 2,
            initial_backoff: Duration::from_millis(10),
        }
    }

    fn vm(disk: Option<PathBuf>, channel: Option<PathBuf>) -> VmInfo {
        VmInfo {
            name: "fedora".to_string(),
            namespace: "default".to_string(),
            pid: 42,
            vcpus: 1,
            memory_kib: 2048,
            guest_metrics: GuestMetricsConfig { disk, channel },
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_start_creates_exchange_disk() {
        let fx = fixture(fast_config()).await;
        let path = fx.dir.path().join("metrics.img");

        fx.manager.start_vm(vm(Some(path.clone()), None)).await.unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), DISK_SIZE as u64);
        assert!(MetricsExchangeDisk::new(&path).read().unwrap().is_empty());
        assert!(fx.manager.registry().get("default/fedora").is_some());
        assert_eq!(fx.manager.active_channels(), 0);

        fx.manager.stop_vm("default/fedora");
        assert!(fx.manager.registry().is_empty());
        // the disk stays with the VM directory
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_vm_visible_only_after_disk_is_created() {
        let fx = fixture(fast_config()).await;
        let path = fx.dir.path().join("metrics.img");

        let registry = Arc::clone(fx.manager.registry());
        let disk_path = path.clone();
        let observer = tokio::spawn(async move {
            loop {
                if registry.get("default/fedora").is_some() {
                    return MetricsExchangeDisk::new(&disk_path)
                        .read()
                        .map(|doc| doc.is_empty())
                        .unwrap_or(false);
                }
                tokio::task::yield_now().await;
            }
        });

        fx.manager.start_vm(vm(Some(path), None)).await.unwrap();

        let disk_ready = tokio::time::timeout(WAIT, observer).await.unwrap().unwrap();
        assert!(disk_ready, "VM registered before its exchange disk existed");
    }

    #[tokio::test]
    async fn test_invalid_channel_config_leaves_vm_unregistered() {
        let fx = fixture(ManagerConfig {
            burst: 0,
            ..fast_config()
        })
        .await;
        let socket = fx.dir.path().join("channel.sock");

        assert!(fx.manager.start_vm(vm(None, Some(socket))).await.is_err());
        assert!(fx.manager.registry().is_empty());
        assert_eq!(fx.manager.active_channels(), 0);
    }

    #[tokio::test]
    async fn test_changed_descriptor_recreates_disk() {
        let fx = fixture(fast_config()).await;
        let first = fx.dir.path().join("first.img");
        let second = fx.dir.path().join("second.img");

        fx.manager.start_vm(vm(Some(first.clone()), None)).await.unwrap();
        fx.manager.start_vm(vm(Some(second.clone()), None)).await.unwrap();

        assert!(MetricsExchangeDisk::new(&second).read().unwrap().is_empty());
        let registered = fx.manager.registry().get("default/fedora").unwrap();
        assert_eq!(registered.guest_metrics.disk, Some(second));
        assert_eq!(fx.manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_serves_and_stops() {
        let fx = fixture(fast_config()).await;
        let socket = fx.dir.path().join("channel.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        fx.manager.start_vm(vm(None, Some(socket.clone()))).await.unwrap();
        let (mut guest, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(fx.manager.has_channel("default/fedora"));

        guest.write_all(b"GET /metrics/XML\n\n").await.unwrap();
        let mut response = Vec::new();
        let mut chunk = [0u8; 4096];
        while !response.ends_with(b"\n\n") {
            let n = tokio::time::timeout(WAIT, guest.read(&mut chunk))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            response.extend_from_slice(&chunk[..n]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("<metrics"));
        assert!(response.contains("<name>HostName</name>"));

        fx.manager.stop_vm("default/fedora");
        assert!(!fx.manager.has_channel("default/fedora"));

        let n = tokio::time::timeout(WAIT, guest.read(&mut chunk))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_repeated_start_is_idempotent() {
        let fx = fixture(fast_config()).await;
        let socket = fx.dir.path().join("channel.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let info = vm(None, Some(socket.clone()));

        fx.manager.start_vm(info.clone()).await.unwrap();
        fx.manager.start_vm(info).await.unwrap();

        let _first = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err(), "duplicate start opened a second connection");
        assert_eq!(fx.manager.active_channels(), 1);

        fx.manager.shutdown();
    }

    #[tokio::test]
    async fn test_failed_channel_is_reported() {
        let fx = fixture(fast_config()).await;
        let socket = fx.dir.path().join("missing.sock");

        fx.manager.start_vm(vm(None, Some(socket))).await.unwrap();

        wait_for(|| !fx.manager.has_channel("default/fedora")).await;
        for _ in 0..100 {
            let channel = fx.health.component(components::GUEST_CHANNEL).await.unwrap();
            if channel.status == ComponentStatus::Unhealthy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("guest channel failure not reported");
    }

    #[tokio::test]
    async fn test_run_applies_events() {
        let fx = fixture(fast_config()).await;
        let path = fx.dir.path().join("metrics.img");

        let (events_tx, events_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        events_tx
            .send(VmEvent::Started(vm(Some(path.clone()), None)))
            .await
            .unwrap();
        events_tx
            .send(VmEvent::Stopped("default/fedora".to_string()))
            .await
            .unwrap();

        let manager = Arc::new(fx.manager);
        let runner = Arc::clone(&manager);
        let handle = tokio::spawn(async move { runner.run(events_rx, shutdown_rx).await });

        wait_for(|| path.exists() && manager.registry().is_empty()).await;

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    }
}
