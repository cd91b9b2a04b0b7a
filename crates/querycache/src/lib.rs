//! querycache - Stale-aware async query cache
//!
//! Per-key in-memory cache of asynchronous fetch results with staleness-based
//! reuse, in-flight request coalescing, and time-based eviction.
//!
//! - Data younger than `stale_time` is served without refetching
//! - Concurrent callers for the same key share one producer call and one
//!   outcome
//! - A failed refresh keeps the last good value and surfaces the error
//! - A background sweep evicts entries untouched for longer than `cache_time`
//!
//! ```no_run
//! use querycache::QueryCache;
//!
//! # async fn demo() -> Result<(), querycache::QueryError> {
//! let cache: QueryCache<Vec<String>> = QueryCache::new();
//!
//! let tasks = cache
//!     .execute("tasks:family-42", || async {
//!         // any async producer: database call, RPC, HTTP fetch
//!         Ok(vec!["dishes".to_string(), "laundry".to_string()])
//!     })
//!     .await?;
//! # let _ = tasks;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
mod entry;
pub mod error;
pub mod event;

pub use cache::{CacheStats, QueryCache};
pub use config::QueryCacheConfig;
pub use error::QueryError;
pub use event::{EventBus, QueryEvent};
