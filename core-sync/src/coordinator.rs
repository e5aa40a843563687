//! # Sync Coordinator
//!
//! Entry point for starting, observing and cancelling repository syncs.
//!
//! ## Overview
//!
//! The `SyncCoordinator` owns:
//! - the [`JobRegistry`] that guarantees one active job per repository name
//!   and serves status snapshots
//! - the [`SyncEngine`] that runs each job
//! - the file watchers that turn settled edits into incremental syncs
//! - a `TaskTracker` holding every job, write queue flusher and watcher task
//!
//! Nothing is spawned outside the tracker. [`SyncCoordinator::shutdown`]
//! cancels every job and watcher, closes the tracker and waits for it to
//! drain.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::SyncCoordinator;
//!
//! let coordinator = SyncCoordinator::new(config, store, chunker, state_store, events);
//!
//! // Start an incremental sync
//! let handle = coordinator.start_sync("/src/alpha", "alpha", true).await?;
//!
//! // Check status
//! let status = coordinator.get_status("alpha");
//! println!("Progress: {}%", status.percent());
//!
//! // Cancel if needed, then wait for the final report
//! coordinator.cancel("alpha").await?;
//! let report = handle.wait().await?;
//! ```

use async_trait::async_trait;
use bridge_traits::Chunker;
use core_async::sync::{watch, CancellationToken};
use core_async::task::{JoinHandle, TaskTracker};
use core_runtime::config::SyncEngineConfig;
use core_runtime::events::EventBus;
use core_store::{ConcurrentStore, LockStats};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, instrument};

use crate::engine::{SyncEngine, SyncReport};
use crate::job::{SyncJobId, SyncProgress, SyncType};
use crate::registry::{JobRegistry, RepositoryRegistry};
use crate::repository::{RepositoryStateStore, RepositorySummary};
use crate::watcher::{RepositoryWatcher, SyncTrigger, TriggerOutcome};
use crate::{Result, SyncError};

const MAX_REPOSITORY_NAME_LEN: usize = 255;

struct Inner {
    config: SyncEngineConfig,
    engine: SyncEngine,
    jobs: JobRegistry,
    watchers: Mutex<HashMap<String, RepositoryWatcher>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Starts and tracks sync jobs
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncEngineConfig,
        store: ConcurrentStore,
        chunker: Arc<dyn Chunker>,
        state_store: Arc<dyn RepositoryStateStore>,
        events: EventBus,
    ) -> Self {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let engine = SyncEngine::new(
            &config,
            store,
            chunker,
            RepositoryRegistry::new(state_store),
            events,
            tracker.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                jobs: JobRegistry::with_parent(shutdown.clone()),
                watchers: Mutex::new(HashMap::new()),
                tracker,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.inner.config
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Start syncing the directory at `path` under `name`.
    ///
    /// The job runs in the background; the returned handle follows it.
    ///
    /// # Errors
    ///
    /// - `InvalidRepositoryName` / `InvalidRepositoryPath` if the arguments are unusable
    /// - `SyncAlreadyInProgress` if a job for `name` is still active
    /// - `ShutDown` after [`shutdown`](Self::shutdown)
    #[instrument(skip(self, path), fields(repository = %name))]
    pub async fn start_sync(
        &self,
        path: impl AsRef<Path>,
        name: &str,
        incremental: bool,
    ) -> Result<SyncJobHandle> {
        validate_name(name)?;
        let root = resolve_root(path.as_ref())?;
        if self.inner.shutdown.is_cancelled() {
            return Err(SyncError::ShutDown);
        }

        let slot = self
            .inner
            .jobs
            .begin(name, SyncType::from_incremental(incremental))?;
        let job_id = slot.job_id();
        let progress = slot.subscribe();

        let inner = Arc::clone(&self.inner);
        let join = self
            .inner
            .tracker
            .spawn(async move { inner.engine.run(slot, root).await });

        info!(
            "Started {} sync for {} with job {}",
            SyncType::from_incremental(incremental),
            name,
            job_id
        );
        Ok(SyncJobHandle {
            job_id,
            repository: name.to_string(),
            progress,
            join,
        })
    }

    /// Latest progress snapshot of `name` (`Idle` if it never ran)
    pub fn get_status(&self, name: &str) -> SyncProgress {
        self.inner.jobs.status(name)
    }

    /// Follow progress of `name` across jobs
    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<SyncProgress>> {
        self.inner.jobs.subscribe(name)
    }

    /// Request cooperative cancellation of the active job for `name`.
    ///
    /// Succeeds whether or not a job was running.
    #[instrument(skip(self), fields(repository = %name))]
    pub async fn cancel(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if !self.inner.jobs.cancel(name) {
            debug!("No active sync for {} to cancel", name);
        }
        Ok(())
    }

    pub fn is_sync_active(&self, name: &str) -> bool {
        self.inner.jobs.status(name).is_active()
    }

    /// Snapshots of every repository that has had a job
    pub fn list_jobs(&self) -> Vec<SyncProgress> {
        self.inner.jobs.list()
    }

    pub fn get_lock_stats(&self) -> LockStats {
        self.inner.engine.store().lock_stats()
    }

    // ========================================================================
    // Repositories
    // ========================================================================

    /// Files tracked, total chunks and last sync time of `name`
    pub async fn repository_summary(&self, name: &str) -> Result<Option<RepositorySummary>> {
        self.inner.engine.repositories().summary(name).await
    }

    pub async fn list_repositories(&self) -> Result<Vec<RepositorySummary>> {
        self.inner.engine.repositories().list().await
    }

    /// Drop the stored state of `name`; its next sync starts from scratch.
    ///
    /// # Errors
    ///
    /// `SyncAlreadyInProgress` while a job for `name` is active.
    pub async fn forget_repository(&self, name: &str) -> Result<bool> {
        if self.is_sync_active(name) {
            return Err(SyncError::SyncAlreadyInProgress {
                repository: name.to_string(),
            });
        }
        self.inner.engine.repositories().forget(name).await
    }

    // ========================================================================
    // Watching
    // ========================================================================

    /// Re-sync `name` incrementally whenever files under `path` settle.
    ///
    /// Replaces an existing watch for the same name.
    #[instrument(skip(self, path), fields(repository = %name))]
    pub fn watch_repository(&self, path: impl AsRef<Path>, name: &str) -> Result<()> {
        validate_name(name)?;
        let root = resolve_root(path.as_ref())?;
        if self.inner.shutdown.is_cancelled() {
            return Err(SyncError::ShutDown);
        }

        let watcher = RepositoryWatcher::start(
            name,
            root,
            self.inner.engine.filter().clone(),
            self.inner.config.debounce_window,
            CoordinatorTrigger {
                inner: Arc::downgrade(&self.inner),
            },
            &self.inner.tracker,
            &self.inner.shutdown,
        )?;

        if let Some(previous) = self.watchers().insert(name.to_string(), watcher) {
            debug!("Replaced watcher for {} at {}", name, previous.root().display());
        }
        Ok(())
    }

    /// Stop watching `name`; returns whether it was watched
    pub fn unwatch_repository(&self, name: &str) -> bool {
        self.watchers().remove(name).is_some()
    }

    pub fn watched_repositories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.watchers().keys().cloned().collect();
        names.sort();
        names
    }

    fn watchers(&self) -> std::sync::MutexGuard<'_, HashMap<String, RepositoryWatcher>> {
        self.inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Cancel all jobs and watchers and wait for every tracked task to end
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let cancelled = self.inner.jobs.cancel_all();
        self.inner.shutdown.cancel();
        self.watchers().clear();

        self.inner.tracker.close();
        info!(
            "Shutting down sync coordinator: {} active jobs cancelled, waiting for {} tasks",
            cancelled,
            self.inner.tracker.len()
        );
        self.inner.tracker.wait().await;
        info!("Sync coordinator stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Tracker that [`shutdown`](Self::shutdown) drains
    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    /// Cancelled by [`shutdown`](Self::shutdown)
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("jobs", &self.inner.jobs)
            .field("tasks", &self.inner.tracker.len())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SyncError::InvalidRepositoryName("name is empty".to_string()));
    }
    if name.len() > MAX_REPOSITORY_NAME_LEN {
        return Err(SyncError::InvalidRepositoryName(format!(
            "name is longer than {} bytes",
            MAX_REPOSITORY_NAME_LEN
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(SyncError::InvalidRepositoryName(
            "name contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Absolute path of an existing directory
fn resolve_root(path: &Path) -> Result<PathBuf> {
    let invalid = |reason: String| SyncError::InvalidRepositoryPath {
        path: path.display().to_string(),
        reason,
    };
    let root = std::fs::canonicalize(path).map_err(|e| invalid(e.to_string()))?;
    if !root.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    Ok(root)
}

// ============================================================================
// Job Handle
// ============================================================================

/// Follows one started job
pub struct SyncJobHandle {
    job_id: SyncJobId,
    repository: String,
    progress: watch::Receiver<SyncProgress>,
    join: JoinHandle<SyncReport>,
}

impl SyncJobHandle {
    pub fn job_id(&self) -> SyncJobId {
        self.job_id
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Current snapshot
    pub fn progress(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    /// Wait for the job to end.
    ///
    /// # Errors
    ///
    /// `TaskFailed` if the job task panicked or was aborted.
    pub async fn wait(self) -> Result<SyncReport> {
        self.join
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SyncJobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncJobHandle")
            .field("job_id", &self.job_id)
            .field("repository", &self.repository)
            .finish()
    }
}

// ============================================================================
// Watch Trigger
// ============================================================================

struct CoordinatorTrigger {
    inner: Weak<Inner>,
}

#[async_trait]
impl SyncTrigger for CoordinatorTrigger {
    async fn trigger(&self, repository: &str, root: &Path) -> TriggerOutcome {
        let Some(inner) = self.inner.upgrade() else {
            return TriggerOutcome::Closed;
        };
        let coordinator = SyncCoordinator { inner };

        match coordinator.start_sync(root, repository, true).await {
            // The job stays on the tracker after the handle is dropped
            Ok(_handle) => TriggerOutcome::Started,
            Err(SyncError::SyncAlreadyInProgress { .. }) => TriggerOutcome::Busy,
            Err(SyncError::ShutDown) => TriggerOutcome::Closed,
            Err(e) => TriggerOutcome::Rejected(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("alpha").is_ok());
        assert!(validate_name("my repo/with-slash").is_ok());
        assert!(matches!(validate_name("  "), Err(SyncError::InvalidRepositoryName(_))));
        assert!(validate_name("bad\nname").is_err());
        assert!(validate_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_resolve_root_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.rs");
        std::fs::write(&file, "x").unwrap();

        assert!(resolve_root(dir.path()).unwrap().is_absolute());
        assert!(matches!(
            resolve_root(&file),
            Err(SyncError::InvalidRepositoryPath { .. })
        ));
        assert!(resolve_root(&dir.path().join("missing")).is_err());
    }
}
