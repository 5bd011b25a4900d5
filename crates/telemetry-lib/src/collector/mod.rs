//! Per-VM statistics collection
//!
//! This module provides the bounded fan-out collector that scrapes every
//! VM source once per round, the VM discovery layer, and the periodic
//! refresh loop tying both to the exchange disks.

mod busy_key;
mod discovery;
mod r#loop;


pub use busy_key::{BusyKeyCollector, CollectionOutcome};
pub use discovery::{
    discover_existing_vms, load_descriptor, VmEvent, VmRegistry, VmWatcher, WatcherHandle,
    DESCRIPTOR_FILE,
};
pub use r#loop::{RefreshConfig, RefreshLoop, RefreshLoopBuilder, RoundSummary};

pub use async_trait::async_trait;

/// Work performed for one target of a collection round
///
/// `scrape` runs on its own task and may outlive the round that launched
/// it. `complete` is called once per round after the collector stops
/// waiting, whether or not every scrape finished.
#[async_trait]
pub trait Scraper<T>: Send + Sync {
    async fn scrape(&self, key: &str, target: T);

    fn complete(&self) {}
}
