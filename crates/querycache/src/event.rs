//! Event bus for querycache using tokio::broadcast
//!
//! Provides a publish-subscribe mechanism for cache state changes, so hosts
//! wanting live updates (UI redraw, SSE push) can observe the cache without
//! polling it.

use tokio::sync::broadcast;

/// Events emitted by the cache
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// A fetch started for this key (cache miss, stale entry, or forced
    /// refetch — coalesced joins do not emit this)
    FetchStarted(String),
    /// A fetch settled successfully and the entry now holds fresh data
    Updated(String),
    /// A fetch settled with an error; prior data for the key is retained
    FetchFailed(String),
    /// The eviction sweep removed these keys
    Evicted(Vec<String>),
}

/// Event bus for broadcasting cache events
///
/// Uses tokio::broadcast for multi-consumer support. Slow subscribers that
/// fall behind the channel capacity miss events; the cache itself never
/// blocks on them.
pub struct EventBus {
    sender: broadcast::Sender<QueryEvent>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: QueryEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.sender.subscribe()
    }

    /// Get current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
