//! Lock manager tests against real advisory file locks.
//!
//! Two `LockManager`s opened on the same store directory hold separate file
//! descriptions, so they exclude each other exactly like two processes do.
//! `test_lock_excludes_other_process` also checks a real second process by
//! re-running this test binary.

use core_store::lock::LOCK_FILE_NAME;
use core_store::{LockManager, LockOptions, StoreError};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Store directory handed to the child process
const CHILD_STORE_ENV: &str = "CORE_STORE_LOCK_CHILD_DIR";
const HELD_MARKER: &str = "child.held";
const RELEASE_MARKER: &str = "child.release";

fn options() -> LockOptions {
    LockOptions {
        default_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn test_lock_file_created_in_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store");
    let manager = LockManager::for_store(&store, options()).unwrap();

    let _handle = manager.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(store.join(LOCK_FILE_NAME).exists());
}

#[tokio::test]
async fn test_second_holder_times_out_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let first = LockManager::for_store(dir.path(), options()).unwrap();
    let second = LockManager::for_store(dir.path(), options()).unwrap();

    let handle = first.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(first.is_held());

    let err = second.acquire(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, StoreError::LockTimeout { .. }));
    assert_eq!(second.stats().failed_acquisitions, 1);

    first.release(handle);
    assert!(!first.is_held());

    let _second_handle = second.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(second.is_held());
    assert_eq!(second.stats().total_acquisitions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_holder_across_managers() {
    let dir = tempfile::tempdir().unwrap();
    let managers = [
        Arc::new(LockManager::for_store(dir.path(), options()).unwrap()),
        Arc::new(LockManager::for_store(dir.path(), options()).unwrap()),
    ];
    let inside = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..12 {
        let manager = managers[i % 2].clone();
        let inside = inside.clone();
        let violations = violations.clone();
        tasks.push(tokio::spawn(async move {
            let mut handle = manager.acquire(Duration::from_secs(10)).await.unwrap();
            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                violations.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            handle.release();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    let total: u64 = managers.iter().map(|m| m.stats().total_acquisitions).sum();
    assert_eq!(total, 12);
    assert!(managers.iter().all(|m| m.stats().active_holders == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waits_are_bounded_by_queue_position() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(LockManager::for_store(dir.path(), options()).unwrap());
    let hold = Duration::from_millis(20);
    let waiters = 4;

    let mut tasks = Vec::new();
    for _ in 0..waiters {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            let handle = manager.acquire(Duration::from_secs(5)).await.unwrap();
            let waited = handle.waited();
            tokio::time::sleep(hold).await;
            drop(handle);
            waited
        }));
    }

    let mut waits = Vec::new();
    for task in tasks {
        waits.push(task.await.unwrap());
    }

    // The slowest waiter queued behind at most (waiters - 1) holds
    let bound = hold * (waiters as u32 - 1) + Duration::from_secs(1);
    assert!(waits.iter().all(|w| *w <= bound), "{:?}", waits);
    assert_eq!(manager.stats().max_wait, *waits.iter().max().unwrap());
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_lock_usable() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(LockManager::for_store(dir.path(), options()).unwrap());

    let holder = manager.acquire(Duration::from_secs(1)).await.unwrap();

    // Abandon a waiter before its own timeout expires
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), manager.acquire(Duration::from_secs(5))).await;
    assert!(abandoned.is_err());

    drop(holder);

    let _handle = manager.acquire(Duration::from_millis(200)).await.unwrap();
    let stats = manager.stats();
    assert_eq!(stats.total_acquisitions, 2);
    assert_eq!(stats.active_holders, 1);
}

#[tokio::test]
async fn test_aborted_holder_releases_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(LockManager::for_store(dir.path(), options()).unwrap());

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let _handle = manager.acquire(Duration::from_secs(1)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
    };

    // Let the task take the lock
    while !manager.is_held() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    task.abort();
    let _ = task.await;

    let _handle = manager.acquire(Duration::from_millis(500)).await.unwrap();
    assert_eq!(manager.stats().active_holders, 1);
}

#[tokio::test]
async fn test_unbounded_timeout_acquires_free_lock() {
    let dir = tempfile::tempdir().unwrap();
    let manager = LockManager::for_store(dir.path(), options()).unwrap();

    let handle = manager.acquire(Duration::MAX).await.unwrap();
    assert_eq!(handle.timeout(), Duration::MAX);
    drop(handle);

    let _handle = manager.acquire(Duration::from_secs(u64::MAX)).await.unwrap();
    assert_eq!(manager.stats().total_acquisitions, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unbounded_timeout_waits_for_release() {
    let dir = tempfile::tempdir().unwrap();
    let first = LockManager::for_store(dir.path(), options()).unwrap();
    let second = Arc::new(LockManager::for_store(dir.path(), options()).unwrap());

    let holder = first.acquire(Duration::from_secs(1)).await.unwrap();
    let waiter = {
        let second = second.clone();
        tokio::spawn(async move { second.acquire(Duration::MAX).await.map(|h| h.waited()) })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    drop(holder);

    let waited = waiter.await.unwrap().unwrap();
    assert!(waited >= Duration::from_millis(50));
    assert_eq!(second.stats().failed_acquisitions, 0);
}

fn wait_for_file(path: &Path, limit: Duration) -> bool {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() > limit {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

/// Runs only inside the child spawned by `test_lock_excludes_other_process`:
/// holds the store lock until the parent drops the release marker.
#[tokio::test]
async fn child_holds_store_lock() {
    let Ok(store) = std::env::var(CHILD_STORE_ENV) else {
        return;
    };
    let store = Path::new(&store);
    let manager = LockManager::for_store(store, options()).unwrap();

    let handle = manager.acquire(Duration::from_secs(5)).await.unwrap();
    std::fs::write(store.join(HELD_MARKER), b"").unwrap();
    assert!(wait_for_file(&store.join(RELEASE_MARKER), Duration::from_secs(20)));
    drop(handle);
}

#[tokio::test]
async fn test_lock_excludes_other_process() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = Command::new(std::env::current_exe().unwrap())
        .args(["child_holds_store_lock", "--exact", "--test-threads=1"])
        .env(CHILD_STORE_ENV, dir.path())
        .spawn()
        .unwrap();

    assert!(wait_for_file(&dir.path().join(HELD_MARKER), Duration::from_secs(20)));

    let manager = LockManager::for_store(dir.path(), options()).unwrap();
    let err = manager.acquire(Duration::from_millis(150)).await.unwrap_err();
    assert!(err.is_lock_timeout());
    assert!(!manager.is_held());

    std::fs::write(dir.path().join(RELEASE_MARKER), b"").unwrap();
    assert!(child.wait().unwrap().success());

    let _handle = manager.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(manager.stats().total_acquisitions, 1);
    assert_eq!(manager.stats().failed_acquisitions, 1);
}
