//! Stale-aware query cache with request coalescing
//!
//! One `QueryCache<T>` holds the results of asynchronous producers keyed by
//! an opaque string. Fresh data is served without refetching, concurrent
//! requests for the same key share a single producer call, and a background
//! sweep evicts entries that have outlived the retention window.
//!
//! The decide-and-mark step of `execute` runs entirely under the per-key
//! DashMap guard with no await point inside, so "check if loading" and
//! "mark as loading" cannot interleave across callers.

use crate::config::QueryCacheConfig;
use crate::entry::{CacheEntry, FetchOutcome};
use crate::error::QueryError;
use crate::event::{EventBus, QueryEvent};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Point-in-time cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Entries currently resident
    pub entries: usize,
    /// Entries with a fetch in flight
    pub loading: usize,
    /// Calls answered from a fresh entry without invoking the producer
    pub hits: u64,
    /// Calls that invoked the producer (miss, stale, or forced)
    pub misses: u64,
    /// Calls that joined an in-flight fetch instead of starting one
    pub coalesced: u64,
    /// Entries removed by the eviction sweep
    pub evicted: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evicted: AtomicU64,
}

/// Clears the in-flight marker if the fetching future is dropped before it
/// settles, so joiners observe a closed channel instead of hanging and the
/// entry does not stay loading forever.
struct FetchGuard<T> {
    entries: Arc<DashMap<String, CacheEntry<T>>>,
    key: String,
    armed: bool,
}

impl<T> FetchGuard<T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for FetchGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(mut entry) = self.entries.get_mut(&self.key) {
                entry.in_flight = None;
            }
            debug!(key = %self.key, "Fetch abandoned, in-flight marker cleared");
        }
    }
}

/// Decision taken under the per-key entry guard
enum Plan<T> {
    /// Entry is fresh; serve it as-is
    Hit(T),
    /// A fetch is already in flight; await its shared outcome
    Join(broadcast::Receiver<FetchOutcome<T>>),
    /// We marked the entry loading; run the producer and settle it
    Fetch(broadcast::Sender<FetchOutcome<T>>),
}

/// Per-key cache of asynchronous fetch results
///
/// Wrap in `Arc` to share across tasks. Dropping the cache aborts its
/// eviction sweep; call [`shutdown`](Self::shutdown) for an orderly stop.
pub struct QueryCache<T> {
    config: QueryCacheConfig,
    entries: Arc<DashMap<String, CacheEntry<T>>>,
    events: EventBus,
    counters: Arc<Counters>,
    shutdown_tx: mpsc::Sender<()>,
    sweeper: JoinHandle<()>,
}

impl<T: Clone + Send + Sync + 'static> QueryCache<T> {
    /// Create a cache with default windows (30s stale, 5min retention)
    ///
    /// Must be called inside a tokio runtime; the eviction sweep is spawned
    /// immediately.
    pub fn new() -> Self {
        Self::with_config(QueryCacheConfig::default())
    }

    /// Create a cache with explicit configuration
    pub fn with_config(config: QueryCacheConfig) -> Self {
        let entries: Arc<DashMap<String, CacheEntry<T>>> = Arc::new(DashMap::new());
        let events = EventBus::new(config.event_capacity);
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&entries),
            events.clone(),
            Arc::clone(&counters),
            config.cache_time,
            shutdown_rx,
        ));

        debug!(
            stale_ms = config.stale_time.as_millis() as u64,
            cache_ms = config.cache_time.as_millis() as u64,
            "Query cache created"
        );

        Self {
            config,
            entries,
            events,
            counters,
            shutdown_tx,
            sweeper,
        }
    }

    /// Fetch-or-serve for `key`
    ///
    /// Serves the cached value when it is younger than `stale_time`, joins
    /// an in-flight fetch for the same key, and otherwise invokes `producer`
    /// exactly once. Producer failures propagate to the caller; the last
    /// good value for the key is retained.
    ///
    /// Dropping the returned future while the producer is running cancels
    /// the fetch: the entry's loading state is cleared and joined callers
    /// observe [`QueryError::Interrupted`].
    pub async fn execute<F, Fut>(&self, key: &str, producer: F) -> Result<T, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_with(key, producer, false).await
    }

    /// `execute` with the staleness check bypassed
    ///
    /// Always invokes the producer unless a fetch for the key is already in
    /// flight, in which case it joins that fetch.
    pub async fn refetch<F, Fut>(&self, key: &str, producer: F) -> Result<T, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_with(key, producer, true).await
    }

    /// Fetch-or-serve with an explicit `force` flag
    pub async fn execute_with<F, Fut>(
        &self,
        key: &str,
        producer: F,
        force: bool,
    ) -> Result<T, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if key.trim().is_empty() {
            return Err(QueryError::empty_key());
        }

        // No await between reading and writing entry state: the guard is
        // held for the whole decision.
        let plan = match self.entries.entry(key.to_owned()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if let Some(tx) = entry.in_flight.as_ref() {
                    Plan::Join(tx.subscribe())
                } else if !force && entry.is_fresh(self.config.stale_time) {
                    if let Some(value) = &entry.data {
                        Plan::Hit(value.clone())
                    } else {
                        // Fresh timestamp but no data: the previous fetch
                        // failed. Try again.
                        Plan::Fetch(entry.begin_fetch())
                    }
                } else {
                    Plan::Fetch(entry.begin_fetch())
                }
            }
            MapEntry::Vacant(vacant) => {
                let (entry, tx) = CacheEntry::starting();
                vacant.insert(entry);
                Plan::Fetch(tx)
            }
        };

        match plan {
            Plan::Hit(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!(%key, "Cache hit");
                Ok(value)
            }
            Plan::Join(mut rx) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "Joining in-flight fetch");
                match rx.recv().await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(QueryError::Interrupted {
                        key: key.to_string(),
                    }),
                }
            }
            Plan::Fetch(tx) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.events.publish(QueryEvent::FetchStarted(key.to_string()));

                let guard = FetchGuard {
                    entries: Arc::clone(&self.entries),
                    key: key.to_string(),
                    armed: true,
                };

                let outcome = match producer().await {
                    Ok(value) => Ok(value),
                    Err(err) => Err(QueryError::producer(key, err)),
                };

                guard.disarm();
                self.settle(key, &outcome);
                // Joiners subscribed while the guard showed in_flight, so
                // they cannot miss this send. No receivers is fine.
                let _ = tx.send(outcome.clone());
                outcome
            }
        }
    }

    /// Record a fetch outcome on the entry and notify subscribers
    fn settle(&self, key: &str, outcome: &FetchOutcome<T>) {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                match outcome {
                    Ok(value) => {
                        entry.data = Some(value.clone());
                        entry.error = None;
                    }
                    Err(err) => {
                        // Prior data survives a failed refresh
                        entry.error = Some(err.clone());
                    }
                }
                entry.in_flight = None;
            }
            None => {
                // Invalidated or cleared while the fetch was in flight;
                // the outcome still goes to the caller and any joiners.
                debug!(%key, "Entry removed mid-flight, outcome not cached");
            }
        }

        match outcome {
            Ok(_) => {
                debug!(%key, "Fetch settled");
                self.events.publish(QueryEvent::Updated(key.to_string()));
            }
            Err(err) => {
                warn!(%key, error = %err, "Fetch failed");
                self.events.publish(QueryEvent::FetchFailed(key.to_string()));
            }
        }
    }

    /// Peek at the cached value for `key` without fetching
    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.get(key).and_then(|entry| entry.data.clone())
    }

    /// True while a fetch for `key` is in flight
    pub fn is_loading(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.is_loading())
            .unwrap_or(false)
    }

    /// Last error recorded for `key`, if any
    pub fn last_error(&self, key: &str) -> Option<QueryError> {
        self.entries.get(key).and_then(|entry| entry.error.clone())
    }

    /// Drop the entry for `key`; returns true if one was resident
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.clear();
        debug!("Cache cleared");
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribe to cache events (fetch start/settle, evictions)
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.config
    }

    /// Snapshot of cache statistics
    pub fn stats(&self) -> CacheStats {
        let loading = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_loading())
            .count();

        CacheStats {
            entries: self.entries.len(),
            loading,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    /// Stop the eviction sweep
    ///
    /// The cache keeps answering after shutdown; entries simply stop being
    /// evicted.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl<T: Clone + Send + Sync + 'static> Default for QueryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for QueryCache<T> {
    fn drop(&mut self) {
        // The sweep task holds its own Arc to the entry map; abort it so a
        // dropped cache does not leave a ticking interval behind.
        self.sweeper.abort();
    }
}

/// Periodic eviction sweep
///
/// Ticks every `cache_time` and removes entries that have outlived it.
/// Entries with a fetch in flight are skipped. Advisory housekeeping only;
/// an evicted key behaves as a cache miss on next access.
async fn sweep_loop<T>(
    entries: Arc<DashMap<String, CacheEntry<T>>>,
    events: EventBus,
    counters: Arc<Counters>,
    cache_time: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) where
    T: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(cache_time);
    // The first tick completes immediately; nothing can be expired yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut removed: Vec<String> = Vec::new();
                entries.retain(|key, entry| {
                    let keep = entry.is_loading() || !entry.is_expired(cache_time);
                    if !keep {
                        removed.push(key.clone());
                    }
                    keep
                });

                if !removed.is_empty() {
                    counters.evicted.fetch_add(removed.len() as u64, Ordering::Relaxed);
                    debug!(count = removed.len(), "Evicted expired entries");
                    events.publish(QueryEvent::Evicted(removed));
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Eviction sweep shutting down");
                break;
            }
        }
    }
}
