//! Error types for querycache
//!
//! Errors are cloneable so a single producer failure can be stored in the
//! cache entry, delivered to every coalesced caller, and returned to the
//! caller that started the fetch — all as the same object.

use std::sync::Arc;
use thiserror::Error;

/// Error type surfaced by cache operations
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// The caller supplied a degenerate key. Nothing is cached.
    #[error("invalid query key: {reason}")]
    InvalidKey { reason: &'static str },

    /// The producer for this key failed. The previously cached value (if
    /// any) is retained alongside this error.
    #[error("query `{key}` failed")]
    Producer {
        key: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The fetch that this caller joined was dropped before it settled
    /// (the originating caller abandoned its `execute` future mid-flight).
    #[error("query `{key}` was dropped before it settled")]
    Interrupted { key: String },
}

impl QueryError {
    pub(crate) fn empty_key() -> Self {
        Self::InvalidKey {
            reason: "key must not be empty or whitespace-only",
        }
    }

    pub(crate) fn producer(key: &str, source: anyhow::Error) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = source.into();
        Self::Producer {
            key: key.to_string(),
            source: Arc::from(boxed),
        }
    }

    /// Returns true if this is a producer failure (as opposed to misuse or
    /// an interrupted join).
    pub fn is_producer_failure(&self) -> bool {
        matches!(self, Self::Producer { .. })
    }
}
