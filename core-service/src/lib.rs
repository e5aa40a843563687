//! Core service façade and bootstrap helpers.
//!
//! This crate wires the host-provided storage client and chunker into the
//! shared core: one blocking worker pool, one cross-process store lock, the
//! lock-guarded [`ConcurrentStore`] and the [`SyncCoordinator`]. Hosts talk to
//! [`MemoryService`] only.
//!
//! ```ignore
//! use core_service::{CoreDependencies, MemoryService};
//! use core_runtime::config::{AutoSyncConfig, SyncEngineConfig};
//!
//! let config = SyncEngineConfig::builder().store_path("/var/lib/memory").build()?;
//! let service = MemoryService::new(config, CoreDependencies::new(Box::new(client))).await?;
//!
//! let job = service.start_sync("/src/alpha", "alpha", true).await?;
//! println!("{:?}", service.get_status("alpha").status);
//! let report = job.wait().await?;
//!
//! // Discover and sync everything under AUTO_SYNC_PATHS
//! service.start_auto_sync(AutoSyncConfig::from_env()?).await?;
//!
//! service.shutdown().await;
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use bridge_traits::{Chunker, Metadata, QueryFilter, StorageClient, StoredRecord};
use core_async::pool::BlockingPool;
use core_async::task::spawn_blocking;
use core_runtime::config::{AutoSyncConfig, SyncEngineConfig};
use core_runtime::events::{EventBus, EventStream};
use core_store::{ConcurrentStore, LockManager, LockOptions, LockStats, RetryPolicy, StorageBridge};
use core_sync::{
    AutoSyncManager, AutoSyncStatus, InMemoryRepositoryStateStore, LineWindowChunker, RepositoryStateStore, RepositorySummary,
    SqliteRepositoryStateStore, SyncCoordinator, SyncJobHandle, SyncProgress,
};
use tracing::{info, instrument, warn};

/// Capacity of the service event bus
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Name of the storage worker pool (also the thread name prefix)
pub const STORAGE_POOL_NAME: &str = "storage-bridge";

/// Aggregated handle to the collaborators the core requires.
pub struct CoreDependencies {
    pub storage_client: Box<dyn StorageClient>,
    pub chunker: Arc<dyn Chunker>,
    /// Overrides the store chosen from the configuration
    pub state_store: Option<Arc<dyn RepositoryStateStore>>,
}

impl CoreDependencies {
    /// Dependencies with the default line-window chunker.
    pub fn new(storage_client: Box<dyn StorageClient>) -> Self {
        Self {
            storage_client,
            chunker: Arc::new(LineWindowChunker::default()),
            state_store: None,
        }
    }

    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn RepositoryStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }
}

struct Inner {
    config: SyncEngineConfig,
    pool: Arc<BlockingPool>,
    store: ConcurrentStore,
    coordinator: SyncCoordinator,
    events: EventBus,
    auto_sync: Mutex<Option<AutoSyncManager>>,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct MemoryService {
    inner: Arc<Inner>,
}

impl MemoryService {
    /// Validate `config` and build every component.
    ///
    /// Repository state goes to `deps.state_store` if given, else to SQLite
    /// at `config.state_database_path`, else stays in memory.
    pub async fn new(config: SyncEngineConfig, deps: CoreDependencies) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(EVENT_BUS_CAPACITY);

        let locks = LockManager::for_store(&config.store_path, LockOptions::from(&config))?
            .with_events(events.clone());
        let pool = Arc::new(BlockingPool::new(STORAGE_POOL_NAME, config.worker_threads)?);
        let bridge = StorageBridge::new(Arc::clone(&pool), deps.storage_client);
        let store = ConcurrentStore::new(Arc::new(locks), bridge, RetryPolicy::from(config.retry))
            .with_lock_timeout(config.lock_timeout);

        let state_store: Arc<dyn RepositoryStateStore> = match (deps.state_store, &config.state_database_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SqliteRepositoryStateStore::open(path).await?),
            (None, None) => Arc::new(InMemoryRepositoryStateStore::new()),
        };

        let coordinator = SyncCoordinator::new(
            config.clone(),
            store.clone(),
            deps.chunker,
            state_store,
            events.clone(),
        );

        info!(
            "Memory service ready: store {}, {} storage workers",
            config.store_path.display(),
            config.worker_threads
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                store,
                coordinator,
                events,
                auto_sync: Mutex::new(None),
            }),
        })
    }

    /// Build from `MEMORY_SYNC_*` environment variables
    pub async fn from_env(deps: CoreDependencies) -> Result<Self> {
        Self::new(SyncEngineConfig::from_env()?, deps).await
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.inner.coordinator
    }

    /// Sync and store events published from now on
    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe())
    }

    // ------------------------------------------------------------------
    // Foreground operations
    // ------------------------------------------------------------------

    #[instrument(skip(self, payload, metadata))]
    pub async fn store(&self, id: &str, payload: &str, metadata: Metadata) -> Result<()> {
        Ok(self.inner.store.put(id, payload, metadata).await?)
    }

    pub async fn retrieve(&self, id: &str) -> Result<StoredRecord> {
        Ok(self.inner.store.get(id).await?)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        Ok(self.inner.store.delete(id).await?)
    }

    pub async fn search(&self, filter: QueryFilter) -> Result<Vec<StoredRecord>> {
        Ok(self.inner.store.query(filter).await?)
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    pub async fn start_sync(
        &self,
        repository_path: impl AsRef<Path>,
        repository_name: &str,
        incremental: bool,
    ) -> Result<SyncJobHandle> {
        Ok(self
            .inner
            .coordinator
            .start_sync(repository_path, repository_name, incremental)
            .await?)
    }

    pub fn get_status(&self, repository_name: &str) -> SyncProgress {
        self.inner.coordinator.get_status(repository_name)
    }

    pub async fn cancel(&self, repository_name: &str) -> Result<()> {
        Ok(self.inner.coordinator.cancel(repository_name).await?)
    }

    pub fn get_lock_stats(&self) -> LockStats {
        self.inner.store.lock_stats()
    }

    pub fn watch_repository(&self, repository_path: impl AsRef<Path>, repository_name: &str) -> Result<()> {
        Ok(self
            .inner
            .coordinator
            .watch_repository(repository_path, repository_name)?)
    }

    pub fn unwatch_repository(&self, repository_name: &str) -> bool {
        self.inner.coordinator.unwatch_repository(repository_name)
    }

    pub async fn repository_summary(&self, repository_name: &str) -> Result<Option<RepositorySummary>> {
        Ok(self.inner.coordinator.repository_summary(repository_name).await?)
    }

    pub async fn list_repositories(&self) -> Result<Vec<RepositorySummary>> {
        Ok(self.inner.coordinator.list_repositories().await?)
    }

    // ------------------------------------------------------------------
    // Auto-sync
    // ------------------------------------------------------------------

    /// Start discovering and syncing repositories under `config.scan_paths`.
    ///
    /// Replaces (and stops) a previously started manager. The returned
    /// manager is idle if `config` is disabled or has no scan paths.
    #[instrument(skip(self, config))]
    pub async fn start_auto_sync(&self, config: AutoSyncConfig) -> Result<AutoSyncManager> {
        let manager = AutoSyncManager::new(self.inner.coordinator.clone(), config)?;
        let previous = self.auto_sync().replace(manager.clone());
        if let Some(previous) = previous {
            previous.stop().await;
        }
        manager.start()?;
        Ok(manager)
    }

    pub fn auto_sync_status(&self) -> Option<AutoSyncStatus> {
        self.auto_sync().as_ref().map(AutoSyncManager::status)
    }

    fn auto_sync(&self) -> std::sync::MutexGuard<'_, Option<AutoSyncManager>> {
        self.inner
            .auto_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop auto-sync, all jobs and watchers, then the storage workers.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let auto_sync = self.auto_sync().take();
        if let Some(manager) = auto_sync {
            manager.stop().await;
        }
        self.inner.coordinator.shutdown().await;

        let pool = Arc::clone(&self.inner.pool);
        if let Err(e) = spawn_blocking(move || pool.shutdown()).await {
            warn!("Storage pool shutdown failed: {}", e);
        }
        info!("Memory service stopped");
    }
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("store_path", &self.inner.config.store_path)
            .field("coordinator", &self.inner.coordinator)
            .finish()
    }
}
