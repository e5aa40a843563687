//! Batched write queue tests: lock amortization, overflow, interval
//! flushing and cancellation.

use bridge_traits::{BridgeError, WriteJob};
use core_async::pool::BlockingPool;
use core_async::sync::CancellationToken;
use core_runtime::events::{CoreEvent, EventBus, StoreEvent};
use core_store::{ConcurrentStore, InMemoryStorage, LockManager, LockOptions, RetryPolicy, StorageBridge};
use core_sync::write_queue::{BatchWriteQueue, Offer, WriteQueueConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    storage: InMemoryStorage,
    store: ConcurrentStore,
    locks: Arc<LockManager>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let locks = Arc::new(
        LockManager::for_store(
            dir.path(),
            LockOptions {
                default_timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(5),
            },
        )
        .unwrap(),
    );
    let storage = InMemoryStorage::new();
    let pool = Arc::new(BlockingPool::new("queue-test", 2).unwrap());
    let bridge = StorageBridge::new(pool, Box::new(storage.clone()));
    let store = ConcurrentStore::new(locks.clone(), bridge, RetryPolicy::new(3, Duration::from_millis(1)));
    Fixture {
        _dir: dir,
        storage,
        store,
        locks,
    }
}

fn config(capacity: usize, batch_size: usize, flush_interval: Duration) -> WriteQueueConfig {
    WriteQueueConfig {
        capacity,
        batch_size,
        flush_interval,
    }
}

fn job(i: usize) -> WriteJob {
    WriteJob::upsert(format!("chunk-{}", i), "fn f() {}", "alpha", format!("src/f{}.rs", i % 5))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_lock_acquisitions_match_batch_count() {
    let fx = fixture();
    let events = EventBus::new(64);
    let mut subscriber = events.subscribe();
    let (producer, flusher) = BatchWriteQueue::new(
        config(1_000, 50, Duration::from_secs(5)),
        fx.store.clone(),
        "alpha",
    );

    for i in 0..120 {
        assert_eq!(producer.offer(job(i)), Offer::Accepted);
    }
    drop(producer);

    let report = flusher.with_events(events).run(CancellationToken::new()).await;

    // ceil(120 / 50)
    assert_eq!(report.batches, 3);
    assert_eq!(report.lock_acquisitions, 3);
    assert_eq!(fx.locks.stats().total_acquisitions, 3);
    assert_eq!(report.stored, 120);
    assert_eq!(fx.storage.len(), 120);
    assert!(!report.cancelled);

    let mut flushed = Vec::new();
    while let Ok(event) = subscriber.try_recv() {
        if let CoreEvent::Store(StoreEvent::BatchFlushed { stored, .. }) = event {
            flushed.push(stored);
        }
    }
    assert_eq!(flushed, vec![50, 50, 20]);
}

#[tokio::test]
async fn test_overflow_drops_without_blocking() {
    let fx = fixture();
    let (producer, flusher) = BatchWriteQueue::new(
        config(5, 50, Duration::from_millis(10)),
        fx.store.clone(),
        "alpha",
    );

    let offers: Vec<Offer> = (0..8).map(|i| producer.offer(job(i))).collect();
    assert_eq!(offers.iter().filter(|o| **o == Offer::Accepted).count(), 5);
    assert_eq!(producer.dropped(), 3);
    assert_eq!(producer.accepted(), 5);
    assert_eq!(producer.len(), 5);
    drop(producer);

    let report = flusher.run(CancellationToken::new()).await;
    assert_eq!(report.dropped, 3);
    assert_eq!(report.stored, 5);
}

#[tokio::test]
async fn test_flush_interval_flushes_partial_batch() {
    let fx = fixture();
    let (producer, flusher) = BatchWriteQueue::new(
        config(100, 50, Duration::from_millis(20)),
        fx.store.clone(),
        "alpha",
    );
    let flush = tokio::spawn(flusher.run(CancellationToken::new()));

    for i in 0..3 {
        producer.offer(job(i));
    }
    // Producer still open: only the interval can flush these
    let storage = fx.storage.clone();
    wait_until(move || storage.len() == 3).await;
    assert_eq!(fx.locks.stats().total_acquisitions, 1);

    drop(producer);
    let report = flush.await.unwrap();
    assert_eq!(report.batches, 1);
    assert_eq!(report.stored, 3);
}

#[tokio::test]
async fn test_item_failures_do_not_stop_the_batch() {
    let fx = fixture();
    fx.storage
        .fail_next(2, || BridgeError::InvalidInput("rejected".to_string()));
    let (producer, flusher) = BatchWriteQueue::new(
        config(100, 10, Duration::from_millis(10)),
        fx.store.clone(),
        "alpha",
    );
    for i in 0..10 {
        producer.offer(job(i));
    }
    drop(producer);

    let report = flusher.run(CancellationToken::new()).await;
    assert_eq!(report.failed, 2);
    assert_eq!(report.stored, 8);
    assert!(!report.is_path_clean("src/f0.rs"));
    assert!(!report.is_path_clean("src/f1.rs"));
    assert!(report.is_path_clean("src/f2.rs"));
}

#[tokio::test]
async fn test_cancel_finishes_in_flight_batch_and_abandons_rest() {
    let fx = fixture();
    fx.storage.set_latency(Duration::from_millis(10));
    let (producer, flusher) = BatchWriteQueue::new(
        config(100, 10, Duration::from_millis(10)),
        fx.store.clone(),
        "alpha",
    );
    for i in 0..50 {
        producer.offer(job(i));
    }

    let batches = Arc::new(AtomicU64::new(0));
    let observed = batches.clone();
    let flusher = flusher.on_batch(Arc::new(move |_| {
        observed.fetch_add(1, Ordering::SeqCst);
    }));

    let cancel = CancellationToken::new();
    let flush = tokio::spawn(flusher.run(cancel.clone()));

    let storage = fx.storage.clone();
    wait_until(move || storage.calls().puts >= 1).await;
    cancel.cancel();

    let report = flush.await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.stored, 10);
    assert_eq!(report.abandoned, 40);
    assert_eq!(batches.load(Ordering::SeqCst), 1);
    assert_eq!(report.abandoned_paths.len(), 5);

    // Producer sees the closed queue
    assert_eq!(producer.offer(job(99)), Offer::Dropped);
}

#[tokio::test]
async fn test_unbounded_flush_interval_flushes_on_close() {
    let fx = fixture();
    let (producer, flusher) = BatchWriteQueue::new(config(100, 50, Duration::MAX), fx.store.clone(), "alpha");
    for i in 0..3 {
        producer.offer(job(i));
    }
    drop(producer);

    let report = flusher.run(CancellationToken::new()).await;
    assert_eq!(report.batches, 1);
    assert_eq!(report.stored, 3);
    assert_eq!(fx.storage.len(), 3);
}
