use bridge_traits::{Metadata, QueryFilter};
use core_runtime::config::{AutoSyncConfig, SyncEngineConfig};
use core_runtime::events::{CoreEvent, SyncEvent};
use core_service::{CoreDependencies, CoreError, MemoryService};
use core_store::{InMemoryStorage, StoreError};
use core_sync::{SyncError, SyncStatus};
use futures::future::join_all;
use std::time::Duration;
use tempfile::TempDir;

fn config(store: &TempDir) -> SyncEngineConfig {
    SyncEngineConfig::builder()
        .store_path(store.path())
        .lock_timeout(Duration::from_secs(2))
        .lock_poll_interval(Duration::from_millis(5))
        .flush_interval(Duration::from_millis(5))
        .retry_base_delay(Duration::from_millis(1))
        .worker_threads(2)
        .build()
        .unwrap()
}

async fn service(store: &TempDir, storage: &InMemoryStorage) -> MemoryService {
    MemoryService::new(config(store), CoreDependencies::new(Box::new(storage.clone())))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_foreground_operations() {
    let store = tempfile::tempdir().unwrap();
    let storage = InMemoryStorage::new();
    let service = service(&store, &storage).await;

    let mut metadata = Metadata::new();
    metadata.insert("topic".into(), serde_json::json!("rust"));
    service.store("note-1", "ownership rules", metadata).await.unwrap();

    assert_eq!(service.retrieve("note-1").await.unwrap().payload, "ownership rules");
    let found = service
        .search(QueryFilter::new().with_field("topic", "rust"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    service.delete("note-1").await.unwrap();
    let err = service.retrieve("note-1").await.unwrap_err();
    assert!(matches!(err, CoreError::Store(StoreError::NotFound(_))));
    assert!(!err.is_transient());

    assert_eq!(service.get_lock_stats().total_acquisitions, 5);
    service.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let store = tempfile::tempdir().unwrap();
    let mut config = config(&store);
    config.batch_size = 0;

    let err = MemoryService::new(config, CoreDependencies::new(Box::new(InMemoryStorage::new())))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Config(_)));
}

#[tokio::test]
async fn test_sync_through_service_with_sqlite_state() {
    let store = tempfile::tempdir().unwrap();
    let repo = tempfile::tempdir().unwrap();
    std::fs::write(repo.path().join("main.rs"), "fn main() {}\n").unwrap();
    std::fs::write(repo.path().join("notes.md"), "# notes\n").unwrap();

    let mut config = config(&store);
    config.state_database_path = Some(store.path().join("state.db"));
    let storage = InMemoryStorage::new();
    let service = MemoryService::new(config.clone(), CoreDependencies::new(Box::new(storage.clone())))
        .await
        .unwrap();
    let mut events = service.subscribe_events();

    let report = service
        .start_sync(repo.path(), "alpha", true)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.status(), SyncStatus::Completed);
    assert_eq!(storage.len(), 2);
    assert_eq!(service.get_status("alpha").status, SyncStatus::Completed);

    let started = events.recv().await.unwrap();
    assert!(matches!(started, CoreEvent::Sync(SyncEvent::Started { .. })));
    service.shutdown().await;

    // State survives a restart
    let restarted = MemoryService::new(config, CoreDependencies::new(Box::new(InMemoryStorage::new())))
        .await
        .unwrap();
    let summary = restarted.repository_summary("alpha").await.unwrap().unwrap();
    assert_eq!(summary.files_tracked, 2);
    assert_eq!(restarted.list_repositories().await.unwrap().len(), 1);
    restarted.shutdown().await;
}

#[tokio::test]
async fn test_sync_errors_surface_as_core_errors() {
    let store = tempfile::tempdir().unwrap();
    let service = service(&store, &InMemoryStorage::new()).await;

    let err = service
        .start_sync(store.path().join("missing"), "alpha", true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Sync(SyncError::InvalidRepositoryPath { .. })
    ));
    assert!(service.cancel("alpha").await.is_ok());
    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_services_share_one_store_lock() {
    let store = tempfile::tempdir().unwrap();
    let storage = InMemoryStorage::new();
    let first = service(&store, &storage).await;
    let second = service(&store, &storage).await;

    let tasks = (0..10).map(|i| {
        let service = if i % 2 == 0 { first.clone() } else { second.clone() };
        tokio::spawn(async move {
            service
                .store(&format!("note-{}", i), "shared", Metadata::new())
                .await
        })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(storage.len(), 10);
    assert_eq!(storage.peak_concurrent_calls(), 1);
    assert_eq!(
        first.get_lock_stats().total_acquisitions + second.get_lock_stats().total_acquisitions,
        10
    );

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_operations_fail_after_shutdown() {
    let store = tempfile::tempdir().unwrap();
    let service = service(&store, &InMemoryStorage::new()).await;
    service.shutdown().await;

    assert!(service.store("late", "x", Metadata::new()).await.is_err());
    assert!(matches!(
        service.start_sync(store.path(), "alpha", true).await,
        Err(CoreError::Sync(SyncError::ShutDown))
    ));
}

#[tokio::test]
async fn test_auto_sync_discovers_and_syncs() {
    let store = tempfile::tempdir().unwrap();
    let scan = tempfile::tempdir().unwrap();
    let project = scan.path().join("alpha");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("Cargo.toml"), "[package]\nname = \"alpha\"\n").unwrap();
    for name in ["lib.rs", "main.rs", "util.rs"] {
        std::fs::write(project.join(name), "fn f() {}\n").unwrap();
    }

    let storage = InMemoryStorage::new();
    let service = service(&store, &storage).await;
    assert!(service.auto_sync_status().is_none());

    let mut auto = AutoSyncConfig::default().with_scan_paths([scan.path()]);
    auto.auto_watch = false;
    let manager = service.start_auto_sync(auto).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while manager.status().synced < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(service.auto_sync_status().unwrap().synced, 1);
    assert_eq!(service.get_status("alpha").status, SyncStatus::Completed);
    assert_eq!(storage.len(), 3);

    service.shutdown().await;
    assert!(!manager.is_running());
    assert!(service.auto_sync_status().is_none());
}
