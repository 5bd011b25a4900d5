//! VM discovery and lifecycle tracking
//!
//! Every VM running on the node owns a directory `<namespace>_<name>` under
//! the VM state directory holding a `vm.json` descriptor. Filesystem
//! notifications on that directory drive VM start/stop events.

use crate::models::VmInfo;
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DESCRIPTOR_FILE: &str = "vm.json";

/// VM lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmEvent {
    /// A descriptor appeared or changed
    Started(VmInfo),
    /// A VM went away; carries its `namespace/name` key
    Stopped(String),
}

/// Registry of VMs running on the node
#[derive(Debug, Default)]
pub struct VmRegistry {
    vms: DashMap<String, VmInfo>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a VM; returns the descriptor it replaced, if any
    pub fn register(&self, info: VmInfo) -> Option<VmInfo> {
        let key = info.key();
        debug!(vm = %key, pid = info.pid, "Registering VM");
        self.vms.insert(key, info)
    }

    pub fn unregister(&self, key: &str) -> Option<VmInfo> {
        debug!(vm = %key, "Unregistering VM");
        self.vms.remove(key).map(|(_, info)| info)
    }

    pub fn get(&self, key: &str) -> Option<VmInfo> {
        self.vms.get(key).map(|entry| entry.clone())
    }

    /// Snapshot of every tracked VM, sorted by key
    pub fn list(&self) -> Vec<VmInfo> {
        let mut vms: Vec<VmInfo> = self.vms.iter().map(|entry| entry.value().clone()).collect();
        vms.sort_by_key(|vm| vm.key());
        vms
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }
}

/// Registry key for a VM directory name (`<namespace>_<name>`)
///
/// Namespaces cannot contain `_`, so the first one separates the parts.
pub fn key_from_dir_name(dir_name: &str) -> Option<String> {
    let (namespace, name) = dir_name.split_once('_')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(format!("{}/{}", namespace, name))
}

/// Load and validate one `vm.json`
///
/// The descriptor must name the same VM as its `<namespace>_<name>`
/// directory, otherwise stop events would target a different key.
pub async fn load_descriptor(path: &Path) -> Result<VmInfo> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read descriptor {}", path.display()))?;
    let info: VmInfo = serde_json::from_slice(&raw)
        .with_context(|| format!("Invalid descriptor {}", path.display()))?;

    if info.name.is_empty() || info.namespace.is_empty() {
        bail!("Descriptor {} lacks a name or namespace", path.display());
    }

    let dir_key = path
        .parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .and_then(key_from_dir_name);
    if dir_key.as_deref() != Some(info.key().as_str()) {
        bail!(
            "Descriptor {} names {} but its directory does not match",
            path.display(),
            info.key()
        );
    }
    Ok(info)
}

/// Initial discovery by scanning the VM state directory
pub async fn discover_existing_vms(vm_dir: &Path) -> Result<Vec<VmInfo>> {
    let mut vms = Vec::new();

    let mut entries = match tokio::fs::read_dir(vm_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %vm_dir.display(), "VM directory does not exist yet");
            return Ok(vms);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", vm_dir.display()));
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }

        let descriptor = entry.path().join(DESCRIPTOR_FILE);
        if !descriptor.exists() {
            continue;
        }

        match load_descriptor(&descriptor).await {
            Ok(info) => vms.push(info),
            Err(e) => warn!(error = %e, "Skipping VM with unreadable descriptor"),
        }
    }

    vms.sort_by_key(|vm| vm.key());
    info!(count = vms.len(), "Discovered existing VMs");
    Ok(vms)
}

/// Watches the VM state directory for descriptor changes
pub struct VmWatcher {
    vm_dir: PathBuf,
    event_tx: mpsc::Sender<VmEvent>,
}

impl VmWatcher {
    pub fn new(vm_dir: impl Into<PathBuf>, event_tx: mpsc::Sender<VmEvent>) -> Self {
        Self {
            vm_dir: vm_dir.into(),
            event_tx,
        }
    }

    /// Start watching; events stop when the handle is dropped
    pub async fn start(self) -> Result<WatcherHandle> {
        tokio::fs::create_dir_all(&self.vm_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.vm_dir.display()))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "Filesystem watch error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        watcher
            .watch(&self.vm_dir, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", self.vm_dir.display()))?;
        info!(path = %self.vm_dir.display(), "Watching VM directory");

        let vm_dir = self.vm_dir;
        let event_tx = self.event_tx;
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for vm_event in Self::translate(&event, &vm_dir).await {
                    if event_tx.send(vm_event).await.is_err() {
                        debug!("VM event receiver dropped");
                        return;
                    }
                }
            }
            debug!("Watcher channel closed");
        });

        Ok(WatcherHandle {
            _watcher: watcher,
            _task: task,
        })
    }

    /// Map one filesystem event onto VM events
    async fn translate(event: &Event, vm_dir: &Path) -> Vec<VmEvent> {
        let mut events = Vec::new();

        for path in &event.paths {
            let Some(vm_path) = Self::vm_directory(path, vm_dir) else {
                continue;
            };
            let is_descriptor = path.file_name().and_then(|n| n.to_str()) == Some(DESCRIPTOR_FILE);
            let is_vm_dir = path == &vm_path;

            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) if is_descriptor || is_vm_dir => {
                    let descriptor = vm_path.join(DESCRIPTOR_FILE);
                    if !descriptor.exists() {
                        continue;
                    }
                    // descriptors are often observed half written; the next event retries
                    match load_descriptor(&descriptor).await {
                        Ok(info) => events.push(VmEvent::Started(info)),
                        Err(e) => debug!(error = %e, "Descriptor not readable yet"),
                    }
                }
                EventKind::Remove(_) if is_descriptor || is_vm_dir => {
                    let key = vm_path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(key_from_dir_name);
                    if let Some(key) = key {
                        events.push(VmEvent::Stopped(key));
                    }
                }
                _ => {}
            }
        }

        events
    }

    /// The `<namespace>_<name>` directory a path belongs to
    fn vm_directory(path: &Path, vm_dir: &Path) -> Option<PathBuf> {
        let relative = path.strip_prefix(vm_dir).ok()?;
        let first = relative.components().next()?;
        Some(vm_dir.join(first.as_os_str()))
    }
}

/// Handle to a running watcher; stops watching when dropped
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    _task: tokio::task::JoinHandle<()>,
}
