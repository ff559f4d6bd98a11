//! Per-target exporter cache.
//!
//! Maps a [`TargetId`] to a lazily constructed, long-lived exporter. The map
//! is sharded ([`DashMap`]) so cache hits only take a shard read lock, and each
//! key owns a slot whose [`OnceCell`] serialises construction per target:
//! concurrent first requests for the same target run the factory once and all
//! observe the same outcome, either the new [`ExporterEntry`] or the shared
//! construction error. Construction never holds a shard lock.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{OnceCell, watch};
use tracing::{debug, info};

use crate::exporter::ConstructionError;
use crate::target::TargetId;

/// A cached exporter together with its freshness timestamps.
pub struct ExporterEntry<E> {
    target: TargetId,
    exporter: E,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    // Nanoseconds between `created_at` and the latest hit.
    last_used_nanos: AtomicU64,
}

impl<E> ExporterEntry<E> {
    fn new(target: TargetId, exporter: E) -> Self {
        Self {
            target,
            exporter,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            last_used_nanos: AtomicU64::new(0),
        }
    }

    /// The target this entry serves.
    pub fn target(&self) -> &TargetId {
        &self.target
    }

    /// The cached exporter.
    pub fn exporter(&self) -> &E {
        &self.exporter
    }

    /// When the exporter was constructed. Never changes.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the entry was last returned by a cache hit.
    pub fn last_used_at(&self) -> Instant {
        self.created_at + self.since_creation()
    }

    /// Time since the last hit.
    pub fn idle(&self) -> Duration {
        self.last_used_at().elapsed()
    }

    fn since_creation(&self) -> Duration {
        Duration::from_nanos(self.last_used_nanos.load(Ordering::Relaxed))
    }

    // Advisory only: concurrent hits race, the latest instant wins.
    fn touch(&self) {
        let nanos = u64::try_from(self.created_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_used_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    /// A serialisable view of this entry.
    pub fn snapshot(&self) -> TargetSnapshot {
        let since_creation = self.since_creation();

        TargetSnapshot {
            target: self.target.clone(),
            created_at: self.created_wall,
            last_used_at: self.created_wall
                + TimeDelta::from_std(since_creation).unwrap_or_else(|_| TimeDelta::zero()),
            idle_secs: (self.created_at + since_creation).elapsed().as_secs_f64(),
        }
    }
}

impl<E> std::fmt::Debug for ExporterEntry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterEntry")
            .field("target", &self.target)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at())
            .finish_non_exhaustive()
    }
}

/// Diagnostic view of one cached target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub target: TargetId,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub idle_secs: f64,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Requests served by an existing exporter.
    pub hits: u64,
    /// Exporters constructed.
    pub constructions: u64,
    /// Factory invocations that failed.
    pub construction_failures: u64,
    /// Exporters removed by eviction or explicit removal.
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    constructions: AtomicU64,
    construction_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Eviction rules applied by [`ExporterCache::sweep`].
///
/// The default evicts nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Evict entries whose last hit is older than this.
    pub idle_timeout: Option<Duration>,
    /// Keep at most this many entries, least recently used go first.
    pub max_targets: Option<usize>,
}

impl EvictionPolicy {
    /// A policy that never evicts.
    pub fn never() -> Self {
        Self::default()
    }

    /// Whether this policy can ever evict an entry.
    pub fn is_noop(&self) -> bool {
        self.idle_timeout.is_none() && self.max_targets.is_none()
    }
}

/// One target's construction state.
struct Slot<E, Error> {
    entry: OnceCell<Arc<ExporterEntry<E>>>,
    // Set by a failed construction before its guard is released, so requests
    // queued on the same slot return this error instead of retrying.
    failure: OnceLock<Arc<Error>>,
}

impl<E, Error> Default for Slot<E, Error> {
    fn default() -> Self {
        Self {
            entry: OnceCell::new(),
            failure: OnceLock::new(),
        }
    }
}

/// Concurrency-safe registry of exporters keyed by target.
///
/// `Error` is the factory's error type; it is shared between every request
/// that waited on a failed construction.
pub struct ExporterCache<E, Error = ConstructionError> {
    slots: DashMap<TargetId, Arc<Slot<E, Error>>>,
    counters: Counters,
}

impl<E, Error> Default for ExporterCache<E, Error> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, Error> ExporterCache<E, Error> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Look up a constructed entry without touching it.
    ///
    /// Never waits on an in-flight construction.
    pub fn get(&self, target: &TargetId) -> Option<Arc<ExporterEntry<E>>> {
        self.slots
            .get(target)
            .and_then(|slot| slot.value().entry.get().cloned())
    }

    /// Return the entry for `target`, constructing it with `factory` if absent.
    ///
    /// A hit refreshes the entry's last-used time. On a miss the factory runs
    /// while only this target's slot is held; concurrent callers for the same
    /// target wait and receive the same entry, or the same error if the
    /// factory fails. A failed target is left absent so the next request
    /// retries construction.
    pub async fn get_or_create<F, Fut>(
        &self,
        target: &TargetId,
        factory: F,
    ) -> Result<Arc<ExporterEntry<E>>, Arc<Error>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<E, Error>>,
    {
        if let Some(entry) = self.get(target) {
            self.record_hit(&entry);
            return Ok(entry);
        }

        // Shard write lock is released at the end of this statement.
        let slot = self.slots.entry(target.clone()).or_default().value().clone();

        let constructed = AtomicBool::new(false);
        let built = &constructed;
        let current = &slot;
        let result = slot
            .entry
            .get_or_try_init(|| async move {
                if let Some(failure) = current.failure.get() {
                    return Err(Arc::clone(failure));
                }

                built.store(true, Ordering::Relaxed);
                match factory().await {
                    Ok(exporter) => Ok(Arc::new(ExporterEntry::new(target.clone(), exporter))),
                    Err(err) => {
                        let err = Arc::new(err);
                        let _ = current.failure.set(Arc::clone(&err));
                        self.discard_failed_slot(target, current);
                        Err(err)
                    }
                }
            })
            .await;

        match result {
            Ok(entry) => {
                let entry = Arc::clone(entry);
                if constructed.load(Ordering::Relaxed) {
                    self.counters.constructions.fetch_add(1, Ordering::Relaxed);
                    info!(target_id = %target, "Exporter constructed");
                } else {
                    self.record_hit(&entry);
                }
                Ok(entry)
            }
            Err(err) => Err(err),
        }
    }

    fn record_hit(&self, entry: &ExporterEntry<E>) {
        entry.touch();
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    // Requests arriving after this get a fresh slot and retry construction.
    fn discard_failed_slot(&self, target: &TargetId, slot: &Arc<Slot<E, Error>>) {
        self.counters
            .construction_failures
            .fetch_add(1, Ordering::Relaxed);
        self.slots
            .remove_if(target, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Number of targets with a constructed exporter.
    pub fn count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().entry.initialized())
            .count()
    }

    /// Snapshots of all constructed entries, ordered by target.
    pub fn entries(&self) -> Vec<TargetSnapshot> {
        let mut entries: Vec<TargetSnapshot> = self
            .slots
            .iter()
            .filter_map(|slot| slot.value().entry.get().map(|entry| entry.snapshot()))
            .collect();
        entries.sort_by(|a, b| a.target.cmp(&b.target));
        entries
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            constructions: self.counters.constructions.load(Ordering::Relaxed),
            construction_failures: self.counters.construction_failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Drop the exporter for `target`, if one is constructed.
    ///
    /// In-flight requests keep their handle; the exporter is released when
    /// the last of them finishes.
    pub fn remove(&self, target: &TargetId) -> Option<Arc<ExporterEntry<E>>> {
        let (_, slot) = self
            .slots
            .remove_if(target, |_, slot| slot.entry.initialized())?;
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        info!(target_id = %target, "Exporter removed");
        slot.entry.get().cloned()
    }

    /// Apply `policy` once and return how many exporters were evicted.
    ///
    /// Also drops construction slots abandoned by cancelled requests.
    pub fn sweep(&self, policy: &EvictionPolicy) -> usize {
        self.slots
            .retain(|_, slot| slot.entry.initialized() || Arc::strong_count(slot) > 1);

        let mut evicted = 0;

        if let Some(idle_timeout) = policy.idle_timeout {
            self.slots.retain(|target, slot| match slot.entry.get() {
                Some(entry) if entry.idle() > idle_timeout => {
                    debug!(target_id = %target, idle = ?entry.idle(), "Evicting idle exporter");
                    evicted += 1;
                    false
                }
                _ => true,
            });
        }

        if let Some(max_targets) = policy.max_targets {
            let mut live: Vec<(TargetId, Instant)> = self
                .slots
                .iter()
                .filter_map(|slot| {
                    slot.value()
                        .entry
                        .get()
                        .map(|entry| (slot.key().clone(), entry.last_used_at()))
                })
                .collect();

            if live.len() > max_targets {
                live.sort_by_key(|(_, last_used)| *last_used);
                let excess = live.len() - max_targets;

                for (target, seen) in live.into_iter().take(excess) {
                    // Skip entries hit since the snapshot was taken.
                    let removed = self.slots.remove_if(&target, |_, slot| {
                        slot.entry
                            .get()
                            .is_some_and(|entry| entry.last_used_at() <= seen)
                    });
                    if removed.is_some() {
                        debug!(target_id = %target, "Evicting least recently used exporter");
                        evicted += 1;
                    }
                }
            }
        }

        if evicted > 0 {
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, remaining = self.count(), "Evicted exporters");
        }

        evicted
    }
}

/// Create a shareable cache handle.
pub type SharedCache<E, Error = ConstructionError> = Arc<ExporterCache<E, Error>>;

/// Apply `policy` every `interval` until the shutdown signal is received.
pub async fn run_sweeper<E, Error>(
    cache: SharedCache<E, Error>,
    policy: EvictionPolicy,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cache.sweep(&policy);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Eviction sweeper stopped");
}
