//! Auto-sync tests: discovery to completed sync, concurrency bound, pause and
//! resume, busy repositories, restarts, stopping and the periodic scan.

use bridge_traits::{Chunker, WriteJob};
use core_async::pool::BlockingPool;
use core_runtime::config::{AutoSyncConfig, SyncEngineConfig};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use core_store::{ConcurrentStore, InMemoryStorage, LockManager, LockOptions, RetryPolicy, StorageBridge};
use core_sync::{
    AutoSyncManager, InMemoryRepositoryStateStore, LineWindowChunker, SyncCoordinator, SyncError,
    SyncStatus, SyncType,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Default chunker that takes a while per file
struct SlowChunker(Duration);

impl Chunker for SlowChunker {
    fn chunk(&self, content: &str, path: &str, repository: &str) -> bridge_traits::Result<Vec<WriteJob>> {
        std::thread::sleep(self.0);
        LineWindowChunker::default().chunk(content, path, repository)
    }
}

struct Harness {
    _store_dir: TempDir,
    scan_dir: TempDir,
    events: EventBus,
    coordinator: SyncCoordinator,
}

impl Harness {
    fn scan_root(&self) -> &Path {
        self.scan_dir.path()
    }

    fn auto_config(&self) -> AutoSyncConfig {
        let mut config = AutoSyncConfig::default().with_scan_paths([self.scan_root()]);
        config.sync_interval = Duration::from_millis(50);
        config.auto_watch = false;
        config
    }

    fn manager(&self, config: AutoSyncConfig) -> AutoSyncManager {
        AutoSyncManager::new(self.coordinator.clone(), config).unwrap()
    }
}

fn harness(chunker: Arc<dyn Chunker>) -> Harness {
    let store_dir = tempfile::tempdir().unwrap();
    let config = SyncEngineConfig::builder()
        .store_path(store_dir.path())
        .lock_timeout(Duration::from_secs(5))
        .lock_poll_interval(Duration::from_millis(5))
        .flush_interval(Duration::from_millis(5))
        .debounce_window(Duration::from_millis(50))
        .retry_base_delay(Duration::from_millis(1))
        .build()
        .unwrap();

    let storage = InMemoryStorage::new();
    let locks = Arc::new(LockManager::for_store(&config.store_path, LockOptions::from(&config)).unwrap());
    let pool = Arc::new(BlockingPool::new("auto-sync-test", config.worker_threads).unwrap());
    let store = ConcurrentStore::new(
        locks,
        StorageBridge::new(pool, Box::new(storage)),
        RetryPolicy::new(config.retry.max_attempts, config.retry.base_delay),
    )
    .with_lock_timeout(config.lock_timeout);
    let events = EventBus::new(4096);
    let coordinator = SyncCoordinator::new(
        config,
        store,
        chunker,
        Arc::new(InMemoryRepositoryStateStore::new()),
        events.clone(),
    );

    Harness {
        _store_dir: store_dir,
        scan_dir: tempfile::tempdir().unwrap(),
        events,
        coordinator,
    }
}

fn default_harness() -> Harness {
    harness(Arc::new(LineWindowChunker::default()))
}

/// A Rust project with `files` source files
fn rust_project(root: &Path, name: &str, files: usize) {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("src")).unwrap();
    std::fs::write(dir.join("Cargo.toml"), format!("[package]\nname = \"{}\"\n", name)).unwrap();
    for i in 0..files {
        std::fs::write(dir.join("src").join(format!("m{}.rs", i)), format!("fn m{}() {{}}\n", i)).unwrap();
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Discovery to sync
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discovered_repositories_sync_within_concurrency_limit() {
    let h = harness(Arc::new(SlowChunker(Duration::from_millis(20))));
    for name in ["alpha", "beta", "gamma", "delta"] {
        rust_project(h.scan_root(), name, 3);
    }
    let mut config = h.auto_config();
    config.max_concurrent_syncs = 2;
    config.auto_watch = true;
    let mut events = h.events.subscribe();

    let manager = h.manager(config);
    assert!(manager.start().unwrap());
    assert!(manager.is_running());
    wait_for(|| manager.status().synced == 4).await;

    let status = manager.status();
    assert_eq!(status.queued, 0);
    assert_eq!(status.active, 0);
    assert_eq!(status.failures, 0);
    assert!(status.last_scan.is_some());

    for name in ["alpha", "beta", "gamma", "delta"] {
        let progress = h.coordinator.get_status(name);
        assert_eq!(progress.status, SyncStatus::Completed);
        assert_eq!(progress.sync_type, Some(SyncType::Full));
        let summary = h.coordinator.repository_summary(name).await.unwrap().unwrap();
        // Cargo.toml is not an indexed extension
        assert_eq!(summary.files_tracked, 3);
    }
    assert_eq!(
        h.coordinator.watched_repositories(),
        vec!["alpha", "beta", "delta", "gamma"]
    );

    let mut running = 0i32;
    let mut peak = 0i32;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::Sync(SyncEvent::Started { .. }) => running += 1,
            CoreEvent::Sync(
                SyncEvent::Completed { .. } | SyncEvent::Failed { .. } | SyncEvent::Cancelled { .. },
            ) => running -= 1,
            _ => {}
        }
        peak = peak.max(running);
    }
    assert!((1..=2).contains(&peak), "peak concurrency {}", peak);

    // Nothing new on a rescan
    let summary = manager.trigger_scan().await.unwrap();
    assert_eq!(summary.discovered, 4);
    assert_eq!(summary.queued_new, 0);
    assert_eq!(summary.synced, 4);

    manager.stop().await;
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_previously_synced_repository_is_not_queued() {
    let h = default_harness();
    rust_project(h.scan_root(), "alpha", 3);
    rust_project(h.scan_root(), "beta", 3);

    let report = h
        .coordinator
        .start_sync(h.scan_root().join("alpha"), "alpha", true)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.status(), SyncStatus::Completed);

    // Not started, so nothing drains the queue
    let manager = h.manager(h.auto_config());
    let summary = manager.trigger_scan().await.unwrap();
    assert_eq!(summary.discovered, 2);
    assert_eq!(summary.queued_new, 1);
    assert_eq!(summary.queued, 1);
    assert_eq!(summary.synced, 1);

    // A second scan does not queue beta twice
    assert_eq!(manager.trigger_scan().await.unwrap().queued_new, 0);
    h.coordinator.shutdown().await;
}

// ============================================================================
// Control
// ============================================================================

#[tokio::test]
async fn test_paused_manager_holds_queue_until_resumed() {
    let h = default_harness();
    rust_project(h.scan_root(), "alpha", 3);
    rust_project(h.scan_root(), "beta", 3);

    let manager = h.manager(h.auto_config());
    manager.pause();
    assert!(manager.start().unwrap());
    wait_for(|| manager.status().last_scan.is_some()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = manager.status();
    assert!(status.paused);
    assert_eq!(status.queued, 2);
    assert_eq!(status.active, 0);
    assert_eq!(status.synced, 0);
    assert_eq!(h.coordinator.get_status("alpha").status, SyncStatus::Idle);

    manager.resume();
    assert!(!manager.is_paused());
    wait_for(|| manager.status().synced == 2).await;

    manager.stop().await;
    h.coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_repository_is_retried_after_interval() {
    let h = harness(Arc::new(SlowChunker(Duration::from_millis(20))));
    rust_project(h.scan_root(), "alpha", 20);

    let manual = h
        .coordinator
        .start_sync(h.scan_root().join("alpha"), "alpha", true)
        .await
        .unwrap();
    let manual_job = manual.job_id();

    let manager = h.manager(h.auto_config());
    manager.start().unwrap();
    wait_for(|| manager.status().synced == 1).await;

    assert_eq!(manual.wait().await.unwrap().status(), SyncStatus::Completed);
    let progress = h.coordinator.get_status("alpha");
    assert_ne!(progress.job_id, Some(manual_job));
    assert_eq!(progress.sync_type, Some(SyncType::Full));
    assert_eq!(progress.status, SyncStatus::Completed);
    assert_eq!(manager.status().failures, 0);

    manager.stop().await;
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_disabled_pathless_and_invalid_configs() {
    let h = default_harness();

    let mut disabled = h.auto_config();
    disabled.enabled = false;
    let manager = h.manager(disabled);
    assert!(!manager.start().unwrap());
    assert!(!manager.is_running());
    assert!(!manager.status().enabled);

    let pathless = AutoSyncConfig::default();
    assert!(!h.manager(pathless).start().unwrap());

    let mut invalid = h.auto_config();
    invalid.max_concurrent_syncs = 0;
    assert!(matches!(
        AutoSyncManager::new(h.coordinator.clone(), invalid),
        Err(SyncError::Config(_))
    ));
    h.coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_cancels_active_sync() {
    let h = harness(Arc::new(SlowChunker(Duration::from_millis(50))));
    rust_project(h.scan_root(), "alpha", 40);

    let manager = h.manager(h.auto_config());
    manager.start().unwrap();
    wait_for(|| h.coordinator.is_sync_active("alpha")).await;

    manager.stop().await;
    let status = manager.status();
    assert!(!status.running);
    assert_eq!(status.active, 0);
    assert_eq!(status.synced, 0);
    assert_eq!(h.coordinator.get_status("alpha").status, SyncStatus::Cancelled);

    assert!(matches!(manager.trigger_scan().await, Err(SyncError::ShutDown)));
    assert!(matches!(manager.start(), Err(SyncError::ShutDown)));
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_coordinator_shutdown_stops_manager() {
    let h = default_harness();
    rust_project(h.scan_root(), "alpha", 3);

    let manager = h.manager(h.auto_config());
    manager.start().unwrap();
    h.coordinator.shutdown().await;

    assert!(!manager.is_running());
    assert!(matches!(manager.trigger_scan().await, Err(SyncError::ShutDown)));
}

// ============================================================================
// Periodic scan
// ============================================================================

/// Let spawned and blocking work run without moving the paused clock
async fn settle(attempts: usize, mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..attempts {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
        tokio::task::yield_now().await;
    }
    condition()
}

#[tokio::test(start_paused = true)]
async fn test_periodic_scan_follows_interval_and_pause() {
    let h = default_harness();
    let mut config = h.auto_config();
    config.sync_on_startup = false;
    config.scan_interval = Duration::from_secs(60);

    let manager = h.manager(config);
    manager.start().unwrap();
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(!settle(200, || manager.status().last_scan.is_some()).await);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(settle(5_000, || manager.status().last_scan.is_some()).await);
    let first = manager.status().last_scan;

    // Skipped while paused
    manager.pause();
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle(200, || false).await;
    assert_eq!(manager.status().last_scan, first);

    manager.resume();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(settle(5_000, || manager.status().last_scan != first).await);

    manager.stop().await;
    h.coordinator.shutdown().await;
}
