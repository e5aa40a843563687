//! # Registries
//!
//! Explicit owners for sync status and repository state.
//!
//! ## Job Registry
//!
//! [`JobRegistry`] maps a repository name to its live sync entry: a `watch`
//! channel carrying the latest [`SyncProgress`] and the job's
//! `CancellationToken`. The running job is the only writer (through its
//! [`JobSlot`]); readers clone the latest snapshot without waiting on the
//! writer. Entries outlive their job, so the last snapshot stays readable
//! until the next job for the same repository starts.
//!
//! [`JobRegistry::begin`] checks and claims a repository in one step, so two
//! callers racing to start the same repository cannot both succeed.
//!
//! ## Repository Registry
//!
//! [`RepositoryRegistry`] wraps the configured [`RepositoryStateStore`] and
//! is passed to the components that need repository state.

use core_async::sync::{watch, CancellationToken};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::job::{SyncJobId, SyncProgress, SyncType};
use crate::repository::{RepositoryState, RepositoryStateStore, RepositorySummary};
use crate::{Result, SyncError};

// ============================================================================
// Job Registry
// ============================================================================

struct JobEntry {
    job_id: SyncJobId,
    progress: Arc<watch::Sender<SyncProgress>>,
    cancel: CancellationToken,
}

/// Live status of every repository that has had a job
pub struct JobRegistry {
    entries: Mutex<HashMap<String, JobEntry>>,
    root: CancellationToken,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_parent(CancellationToken::new())
    }

    /// Job tokens are children of `parent`, so cancelling it cancels every job
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            root: parent,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `repository` for a new job and move it to `Scanning`.
    ///
    /// # Errors
    ///
    /// `SyncAlreadyInProgress` if a job for `repository` is still active.
    pub fn begin(&self, repository: &str, sync_type: SyncType) -> Result<JobSlot> {
        let mut entries = self.entries();

        if let Some(entry) = entries.get(repository) {
            if entry.progress.borrow().is_active() {
                return Err(SyncError::SyncAlreadyInProgress {
                    repository: repository.to_string(),
                });
            }
        }

        let job_id = SyncJobId::new();
        let cancel = self.root.child_token();
        let progress = match entries.remove(repository) {
            Some(entry) => entry.progress,
            None => Arc::new(watch::Sender::new(SyncProgress::idle(repository))),
        };

        let mut started = Ok(());
        progress.send_modify(|p| started = p.begin(job_id, sync_type));
        started?;

        entries.insert(
            repository.to_string(),
            JobEntry {
                job_id,
                progress: Arc::clone(&progress),
                cancel: cancel.clone(),
            },
        );

        debug!("Registered {} sync job {} for {}", sync_type, job_id, repository);
        Ok(JobSlot {
            job_id,
            repository: repository.to_string(),
            progress,
            cancel,
        })
    }

    /// Latest snapshot; `Idle` for a repository with no job
    pub fn status(&self, repository: &str) -> SyncProgress {
        self.entries()
            .get(repository)
            .map(|entry| entry.progress.borrow().clone())
            .unwrap_or_else(|| SyncProgress::idle(repository))
    }

    /// Follow the progress of `repository`, across jobs
    pub fn subscribe(&self, repository: &str) -> Option<watch::Receiver<SyncProgress>> {
        self.entries()
            .get(repository)
            .map(|entry| entry.progress.subscribe())
    }

    /// Request cooperative cancellation. Returns whether an active job was
    /// signalled.
    pub fn cancel(&self, repository: &str) -> bool {
        let entries = self.entries();
        match entries.get(repository) {
            Some(entry) if entry.progress.borrow().is_active() => {
                info!("Cancelling sync job {} for {}", entry.job_id, repository);
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every active job; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries();
        let mut count = 0;
        for entry in entries.values() {
            if entry.progress.borrow().is_active() {
                entry.cancel.cancel();
                count += 1;
            }
        }
        count
    }

    /// Snapshots of every known repository, ordered by name
    pub fn list(&self) -> Vec<SyncProgress> {
        let mut all: Vec<_> = self
            .entries()
            .values()
            .map(|entry| entry.progress.borrow().clone())
            .collect();
        all.sort_by(|a, b| a.repository.cmp(&b.repository));
        all
    }

    pub fn active_count(&self) -> usize {
        self.entries()
            .values()
            .filter(|entry| entry.progress.borrow().is_active())
            .count()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("repositories", &self.entries().len())
            .field("active", &self.active_count())
            .finish()
    }
}

/// Write access to one job's progress, held by the running job
pub struct JobSlot {
    job_id: SyncJobId,
    repository: String,
    progress: Arc<watch::Sender<SyncProgress>>,
    cancel: CancellationToken,
}

impl JobSlot {
    pub fn job_id(&self) -> SyncJobId {
        self.job_id
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mutate the live snapshot; readers see the change immediately
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncProgress),
    {
        self.progress.send_modify(f);
    }

    /// Like [`update`](Self::update) for fallible state transitions
    pub fn transition<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut SyncProgress) -> Result<()>,
    {
        let mut result = Ok(());
        self.progress.send_modify(|p| result = f(p));
        result
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    /// Handle for sharing with tasks that only update progress
    pub fn updater(&self) -> ProgressUpdater {
        ProgressUpdater {
            progress: Arc::clone(&self.progress),
        }
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        // A job that ends without reaching a terminal state must not keep the
        // repository claimed
        self.progress.send_if_modified(|p| {
            if !p.is_active() {
                return false;
            }
            p.fail("sync job ended without reporting an outcome").is_ok()
        });
    }
}

impl std::fmt::Debug for JobSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSlot")
            .field("job_id", &self.job_id)
            .field("repository", &self.repository)
            .finish()
    }
}

/// Cloneable progress writer without the state transitions
#[derive(Clone)]
pub struct ProgressUpdater {
    progress: Arc<watch::Sender<SyncProgress>>,
}

impl ProgressUpdater {
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncProgress),
    {
        self.progress.send_modify(f);
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }
}

// ============================================================================
// Repository Registry
// ============================================================================

/// Access to persisted repository state
#[derive(Clone)]
pub struct RepositoryRegistry {
    store: Arc<dyn RepositoryStateStore>,
}

impl RepositoryRegistry {
    pub fn new(store: Arc<dyn RepositoryStateStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, name: &str) -> Result<Option<RepositoryState>> {
        self.store.load(name).await
    }

    pub async fn save(&self, state: &RepositoryState) -> Result<()> {
        self.store.save(state).await
    }

    /// Files tracked, total chunks and last sync time of `name`
    pub async fn summary(&self, name: &str) -> Result<Option<RepositorySummary>> {
        Ok(self.store.load(name).await?.map(|state| state.summary()))
    }

    pub async fn list(&self) -> Result<Vec<RepositorySummary>> {
        self.store.list().await
    }

    pub async fn forget(&self, name: &str) -> Result<bool> {
        self.store.remove(name).await
    }
}

impl std::fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryRegistry").finish_non_exhaustive()
    }
}
