//! Admission-controlled fan-out over scrape sources
//!
//! Every source key may have at most `max_per_key` scrapes in flight. A key
//! whose previous scrapes are still running is skipped for the round instead
//! of paying the round timeout again, and rejoins once its outstanding
//! scrapes finish.

use super::Scraper;
use anyhow::{bail, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Result of one collection round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionOutcome {
    /// Keys that were at their concurrency cap and not scraped
    pub skipped: Vec<String>,
    /// True when every launched scrape finished before the timeout
    pub completed: bool,
    /// Targets dropped because another target mapped to the same key
    pub collisions: usize,
}

/// Bounded-concurrency collector keyed by scrape source
pub struct BusyKeyCollector {
    busy: Arc<DashMap<String, usize>>,
    max_per_key: usize,
}

impl BusyKeyCollector {
    pub fn new(max_per_key: usize) -> Result<Self> {
        if max_per_key == 0 {
            bail!("max_per_key must be at least 1");
        }

        Ok(Self {
            busy: Arc::new(DashMap::new()),
            max_per_key,
        })
    }

    pub fn max_per_key(&self) -> usize {
        self.max_per_key
    }

    /// Number of scrapes currently holding a key
    pub fn busy_count(&self, key: &str) -> usize {
        self.busy.get(key).map(|count| *count).unwrap_or(0)
    }

    fn try_reserve(&self, key: &str) -> Option<Reservation> {
        let mut count = self.busy.entry(key.to_string()).or_insert(0);
        if *count >= self.max_per_key {
            return None;
        }
        *count += 1;

        Some(Reservation {
            busy: Arc::clone(&self.busy),
            key: key.to_string(),
        })
    }

    /// Scrape every distinct key once, waiting at most `timeout`
    ///
    /// Scrapes still running at the timeout are left to finish in the
    /// background and release their key when they do. `scraper.complete()`
    /// runs exactly once before returning.
    pub async fn collect<T, S, F>(
        &self,
        targets: impl IntoIterator<Item = T>,
        key_of: F,
        scraper: Arc<S>,
        timeout: Duration,
    ) -> CollectionOutcome
    where
        T: Send + 'static,
        S: Scraper<T> + ?Sized + 'static,
        F: Fn(&T) -> Option<String>,
    {
        let mut by_key: HashMap<String, T> = HashMap::new();
        let mut collisions = 0;
        for target in targets {
            let Some(key) = key_of(&target) else {
                continue;
            };
            if by_key.insert(key.clone(), target).is_some() {
                collisions += 1;
                warn!(key = %key, "Multiple targets share a source key, scraping the last one");
            }
        }

        let mut skipped = Vec::new();
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        for (key, target) in by_key {
            let Some(reservation) = self.try_reserve(&key) else {
                debug!(key = %key, "Source busy, skipping");
                skipped.push(key);
                continue;
            };

            let scraper = Arc::clone(&scraper);
            let done = done_tx.clone();

            tokio::spawn(async move {
                // dropped in reverse order: key released before the round is signalled
                let _done = done;
                let _reservation = reservation;

                let scrape_key = key.clone();
                let scrape = tokio::spawn(async move {
                    scraper.scrape(&scrape_key, target).await;
                });

                if let Err(e) = scrape.await {
                    if e.is_panic() {
                        warn!(key = %key, "Scrape task panicked");
                    } else {
                        debug!(key = %key, error = %e, "Scrape task cancelled");
                    }
                }
            });
        }
        drop(done_tx);

        // recv() yields None once every task has dropped its sender
        let completed = tokio::time::timeout(timeout, done_rx.recv()).await.is_ok();
        if !completed {
            debug!(
                timeout_ms = timeout.as_millis() as u64,
                "Collection round timed out"
            );
        }

        scraper.complete();

        CollectionOutcome {
            skipped,
            completed,
            collisions,
        }
    }
}

/// Admission slot for one key, released on drop
struct Reservation {
    busy: Arc<DashMap<String, usize>>,
    key: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(mut count) = self.busy.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        self.busy.remove_if(&self.key, |_, count| *count == 0);
    }
}
