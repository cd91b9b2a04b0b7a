//! Cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`QueryCache`](crate::QueryCache) instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    /// Data younger than this is returned without refetching
    pub stale_time: Duration,

    /// Entries untouched for longer than this are evicted; also the sweep
    /// interval
    pub cache_time: Duration,

    /// Capacity of the broadcast channel behind the event bus
    pub event_capacity: usize,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(30),
            cache_time: Duration::from_secs(300),
            event_capacity: 256,
        }
    }
}
