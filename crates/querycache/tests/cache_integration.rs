//! Integration tests for the query cache
//!
//! Timing-sensitive tests run on the paused tokio clock (`start_paused`)
//! with explicit `time::advance`, so staleness and eviction windows are
//! exercised deterministically.

use querycache::{QueryCache, QueryCacheConfig, QueryError, QueryEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

async fn produce(value: u32) -> anyhow::Result<u32> {
    Ok(value)
}

async fn fail(message: &'static str) -> anyhow::Result<u32> {
    Err(anyhow::anyhow!(message))
}

/// Let spawned tasks make progress without moving the clock
async fn settle_tasks() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn short_windows() -> QueryCacheConfig {
    QueryCacheConfig {
        stale_time: Duration::from_millis(30),
        cache_time: Duration::from_millis(5000),
        event_capacity: 64,
    }
}

#[tokio::test(start_paused = true)]
async fn test_fresh_entry_served_without_refetch() {
    let cache = QueryCache::with_config(short_windows());

    let first = cache.execute("A", || produce(1)).await.unwrap();
    assert_eq!(first, 1);

    // Inside the stale window: the second producer must not run
    let second = cache.execute("A", || produce(2)).await.unwrap();
    assert_eq!(second, 1);

    tokio::time::advance(Duration::from_millis(40)).await;

    // Stale now: producer runs again
    let third = cache.execute("A", || produce(2)).await.unwrap();
    assert_eq!(third, 2);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_entry_ignores_failing_producer() {
    let cache = QueryCache::with_config(short_windows());

    cache.execute("A", || produce(7)).await.unwrap();

    // Fresh: the failing producer is never invoked
    let value = cache.execute("A", || fail("would explode")).await.unwrap();
    assert_eq!(value, 7);
    assert!(cache.last_error("A").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_refetch_bypasses_staleness() {
    let cache = QueryCache::with_config(short_windows());

    assert_eq!(cache.execute("A", || produce(1)).await.unwrap(), 1);
    // Immediately after a successful execute, refetch still runs
    assert_eq!(cache.refetch("A", || produce(9)).await.unwrap(), 9);
    assert_eq!(cache.get("A"), Some(9));
}

#[tokio::test(start_paused = true)]
async fn test_failure_preserves_prior_data() {
    let cache = QueryCache::with_config(short_windows());

    cache.execute("chores", || produce(7)).await.unwrap();

    let err = cache.refetch("chores", || fail("backend down")).await.unwrap_err();
    assert!(err.is_producer_failure());

    // Last good value survives, error is recorded, loading is back to false
    assert_eq!(cache.get("chores"), Some(7));
    assert!(cache.last_error("chores").is_some());
    assert!(!cache.is_loading("chores"));

    // Next success clears the recorded error
    cache.refetch("chores", || produce(8)).await.unwrap();
    assert!(cache.last_error("chores").is_none());
    assert_eq!(cache.get("chores"), Some(8));
}

#[tokio::test(start_paused = true)]
async fn test_coalesced_callers_share_one_producer_call() {
    let cache = Arc::new(QueryCache::<u32>::with_config(short_windows()));
    let calls = Arc::new(AtomicUsize::new(0));
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let first = {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            cache
                .execute("tasks", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release_rx.await.ok();
                    Ok(21)
                })
                .await
        })
    };

    settle_tasks().await;
    assert!(cache.is_loading("tasks"));

    let second = {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            cache
                .execute("tasks", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(99)
                })
                .await
        })
    };

    settle_tasks().await;
    release_tx.send(()).unwrap();

    // Both callers observe the outcome of the single shared fetch
    assert_eq!(first.await.unwrap().unwrap(), 21);
    assert_eq!(second.await.unwrap().unwrap(), 21);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().coalesced, 1);
}

#[tokio::test(start_paused = true)]
async fn test_joined_caller_observes_shared_failure() {
    let cache = Arc::new(QueryCache::<u32>::with_config(short_windows()));
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let first = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            cache
                .execute("rewards", move || async move {
                    release_rx.await.ok();
                    fail("permission denied").await
                })
                .await
        })
    };

    settle_tasks().await;

    let second = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.execute("rewards", || produce(1)).await })
    };

    settle_tasks().await;
    release_tx.send(()).unwrap();

    assert!(first.await.unwrap().unwrap_err().is_producer_failure());
    assert!(second.await.unwrap().unwrap_err().is_producer_failure());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_fetch_interrupts_joiners() {
    let cache = Arc::new(QueryCache::<u32>::with_config(short_windows()));
    let (_release_tx, release_rx) = oneshot::channel::<()>();

    let first = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            cache
                .execute("events", move || async move {
                    release_rx.await.ok();
                    Ok(1)
                })
                .await
        })
    };

    settle_tasks().await;

    let second = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.execute("events", || produce(2)).await })
    };

    settle_tasks().await;
    first.abort();
    settle_tasks().await;

    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, QueryError::Interrupted { key } if key == "events"));
    assert!(!cache.is_loading("events"));
}

#[tokio::test(start_paused = true)]
async fn test_eviction_removes_expired_entries() {
    let config = QueryCacheConfig {
        stale_time: Duration::from_millis(30),
        cache_time: Duration::from_millis(100),
        event_capacity: 64,
    };
    let cache = QueryCache::with_config(config);
    let mut events = cache.subscribe();

    cache.execute("old", || produce(1)).await.unwrap();

    // Let the sweep task start its interval before moving the clock
    settle_tasks().await;
    tokio::time::advance(Duration::from_millis(250)).await;
    settle_tasks().await;

    // Behaves as a fresh key on next access
    assert_eq!(cache.get("old"), None);
    assert!(cache.is_empty());
    assert_eq!(cache.stats().evicted, 1);

    let removed = loop {
        match events.recv().await.unwrap() {
            QueryEvent::Evicted(keys) => break keys,
            _ => continue,
        }
    };
    assert_eq!(removed, vec!["old".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_skips_loading_entries() {
    let config = QueryCacheConfig {
        stale_time: Duration::from_millis(30),
        cache_time: Duration::from_millis(100),
        event_capacity: 64,
    };
    let cache = Arc::new(QueryCache::<u32>::with_config(config));
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let pending = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            cache
                .execute("slow", move || async move {
                    release_rx.await.ok();
                    Ok(5)
                })
                .await
        })
    };

    settle_tasks().await;
    tokio::time::advance(Duration::from_millis(350)).await;
    settle_tasks().await;

    // Several sweeps have run; the in-flight entry is untouched
    assert!(cache.is_loading("slow"));
    assert_eq!(cache.len(), 1);

    release_tx.send(()).unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_eviction() {
    let config = QueryCacheConfig {
        stale_time: Duration::from_millis(30),
        cache_time: Duration::from_millis(100),
        event_capacity: 64,
    };
    let cache = QueryCache::with_config(config);

    cache.execute("stay", || produce(1)).await.unwrap();

    cache.shutdown().await;
    settle_tasks().await;

    tokio::time::advance(Duration::from_millis(1000)).await;
    settle_tasks().await;

    // Still resident: the cache answers, eviction is simply off
    assert_eq!(cache.get("stay"), Some(1));
    assert_eq!(cache.stats().evicted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_event_sequence_on_success_and_failure() {
    let cache = QueryCache::with_config(short_windows());
    let mut events = cache.subscribe();

    cache.execute("k", || produce(1)).await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), QueryEvent::FetchStarted(key) if key == "k"));
    assert!(matches!(events.recv().await.unwrap(), QueryEvent::Updated(key) if key == "k"));

    cache.refetch("k", || fail("boom")).await.unwrap_err();
    assert!(matches!(events.recv().await.unwrap(), QueryEvent::FetchStarted(key) if key == "k"));
    assert!(matches!(events.recv().await.unwrap(), QueryEvent::FetchFailed(key) if key == "k"));
}

#[tokio::test(start_paused = true)]
async fn test_keys_are_independent() {
    let cache = QueryCache::with_config(short_windows());

    cache.execute("a", || produce(1)).await.unwrap();
    cache.execute("b", || fail("b is down")).await.unwrap_err();

    assert_eq!(cache.get("a"), Some(1));
    assert_eq!(cache.get("b"), None);
    assert!(cache.last_error("a").is_none());
    assert!(cache.last_error("b").is_some());
    assert_eq!(cache.len(), 2);
}
