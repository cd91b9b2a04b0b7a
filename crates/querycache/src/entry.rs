//! Per-key cache entry state
//!
//! An entry tracks the last good value, the last error, and the in-flight
//! fetch (if any) for one logical query key. `loading` is derived from the
//! presence of the in-flight broadcast sender, so it can never be left
//! dangling once a fetch settles.
//!
//! Uses tokio::time::Instant so elapsed-time logic follows the paused test
//! clock under `tokio::test(start_paused = true)`.

use crate::error::QueryError;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Outcome of a single fetch, shared between the caller that started it and
/// any callers that joined it
pub(crate) type FetchOutcome<T> = Result<T, QueryError>;

/// State for one logical query key
pub(crate) struct CacheEntry<T> {
    /// Last successfully fetched value; never cleared by a failed refresh
    pub data: Option<T>,

    /// Last failure, cleared on the next success
    pub error: Option<QueryError>,

    /// Start time of the most recent fetch attempt (advances monotonically)
    pub last_fetched_at: Instant,

    /// Sender for the in-flight fetch; joiners subscribe to it. `Some` iff a
    /// fetch is currently running for this key.
    pub in_flight: Option<broadcast::Sender<FetchOutcome<T>>>,
}

impl<T: Clone> CacheEntry<T> {
    /// Create an entry whose first fetch is starting right now
    pub fn starting() -> (Self, broadcast::Sender<FetchOutcome<T>>) {
        // Capacity 1: exactly one outcome is ever sent per channel
        let (tx, _) = broadcast::channel(1);
        let entry = Self {
            data: None,
            error: None,
            last_fetched_at: Instant::now(),
            in_flight: Some(tx.clone()),
        };
        (entry, tx)
    }

    /// Mark a new fetch attempt on an existing entry and return the sender
    /// joiners will subscribe to. Must not be called while one is in flight.
    pub fn begin_fetch(&mut self) -> broadcast::Sender<FetchOutcome<T>> {
        debug_assert!(self.in_flight.is_none());
        let (tx, _) = broadcast::channel(1);
        self.in_flight = Some(tx.clone());
        self.last_fetched_at = Instant::now();
        tx
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn age(&self) -> Duration {
        self.last_fetched_at.elapsed()
    }

    /// True while the entry is young enough to serve without refetching
    pub fn is_fresh(&self, stale_time: Duration) -> bool {
        self.age() < stale_time
    }

    /// True once the entry has outlived the retention window
    pub fn is_expired(&self, cache_time: Duration) -> bool {
        self.age() > cache_time
    }
}
