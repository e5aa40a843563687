//! # Auto Sync
//!
//! Discovers repositories under configured scan paths and syncs them in the
//! background.
//!
//! ## Overview
//!
//! An [`AutoSyncManager`] runs two loops on the coordinator's task tracker:
//!
//! - the **scan loop** runs [`RepositoryScanner`] every `scan_interval` and
//!   queues repositories that have never completed a sync, most important
//!   first (priority language, then smaller, then recently modified)
//! - the **sync loop** takes queued repositories and runs a full sync for
//!   each, at most `max_concurrent_syncs` at a time
//!
//! A repository whose sync is already running elsewhere, or whose sync
//! fails, goes back on the queue after `sync_interval`. After a successful
//! first sync with at least 90% of files processed cleanly the repository is
//! watched for edits when `auto_watch` is set.
//!
//! Pausing stops new syncs and periodic scans; running syncs finish.
//! Shutting down the coordinator stops the manager.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_runtime::config::AutoSyncConfig;
//! use core_sync::AutoSyncManager;
//!
//! let config = AutoSyncConfig::from_env()?;
//! let manager = AutoSyncManager::new(coordinator.clone(), config)?;
//! manager.start()?;
//!
//! let summary = manager.trigger_scan().await?;
//! println!("{} repositories queued", summary.queued);
//!
//! manager.pause();
//! println!("{:?}", manager.status());
//! manager.stop().await;
//! ```

use chrono::{DateTime, Utc};
use core_async::sync::{CancellationToken, Notify, OwnedSemaphorePermit, Semaphore};
use core_async::task::{spawn_blocking, TaskTracker};
use core_async::time::sleep;
use core_runtime::config::AutoSyncConfig;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

use crate::auto_discovery::{DiscoveredRepository, RepositoryScanner};
use crate::coordinator::SyncCoordinator;
use crate::engine::SyncReport;
use crate::job::SyncProgress;
use crate::{Result, SyncError};

/// Share of cleanly processed files needed before a repository is watched
pub const AUTO_WATCH_SUCCESS_RATE: f64 = 0.9;

/// Snapshot returned by [`AutoSyncManager::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoSyncStatus {
    pub enabled: bool,
    pub running: bool,
    pub paused: bool,
    pub scan_paths: Vec<PathBuf>,
    pub queued: usize,
    pub active: usize,
    pub synced: usize,
    /// Failed or rejected sync attempts
    pub failures: u64,
    pub last_scan: Option<DateTime<Utc>>,
    pub max_concurrent_syncs: usize,
}

/// Result of one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Repositories found under the scan paths
    pub discovered: usize,
    /// Added to the queue by this scan
    pub queued_new: usize,
    pub queued: usize,
    pub active: usize,
    pub synced: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<DiscoveredRepository>,
    /// Path to repository name
    active: BTreeMap<PathBuf, String>,
    synced: BTreeSet<PathBuf>,
    failures: u64,
    last_scan: Option<DateTime<Utc>>,
}

impl QueueState {
    fn tracks(&self, repository: &DiscoveredRepository) -> bool {
        self.synced.contains(&repository.path)
            || self.active.contains_key(&repository.path)
            || self.queue.iter().any(|q| q.path == repository.path)
    }
}

enum Attempt {
    Synced(SyncReport),
    Busy,
    Failed(String),
    Cancelled,
    Rejected(String),
}

struct Inner {
    config: AutoSyncConfig,
    coordinator: SyncCoordinator,
    scanner: RepositoryScanner,
    permits: Arc<Semaphore>,
    wake: Notify,
    state: Mutex<QueueState>,
    paused: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Background discovery and sync of repositories under scan paths
#[derive(Clone)]
pub struct AutoSyncManager {
    inner: Arc<Inner>,
}

impl AutoSyncManager {
    /// # Errors
    ///
    /// `SyncError::Config` if `config` does not validate.
    pub fn new(coordinator: SyncCoordinator, config: AutoSyncConfig) -> Result<Self> {
        config.validate()?;
        let cancel = coordinator.shutdown_token().child_token();

        Ok(Self {
            inner: Arc::new(Inner {
                scanner: RepositoryScanner::new(&config),
                permits: Arc::new(Semaphore::new(config.max_concurrent_syncs)),
                wake: Notify::new(),
                state: Mutex::new(QueueState::default()),
                paused: AtomicBool::new(false),
                started: AtomicBool::new(false),
                cancel,
                tasks: TaskTracker::new(),
                config,
                coordinator,
            }),
        })
    }

    pub fn config(&self) -> &AutoSyncConfig {
        &self.inner.config
    }

    /// Spawn the scan and sync loops.
    ///
    /// Returns `false` without spawning anything when auto-sync is disabled
    /// or has no scan paths. Calling it again while running is a no-op.
    ///
    /// # Errors
    ///
    /// `ShutDown` after [`stop`](Self::stop) or coordinator shutdown.
    pub fn start(&self) -> Result<bool> {
        let inner = &self.inner;
        if !inner.config.enabled {
            info!("Auto-sync is disabled");
            return Ok(false);
        }
        if inner.config.scan_paths.is_empty() {
            warn!("Auto-sync has no scan paths configured");
            return Ok(false);
        }
        if inner.cancel.is_cancelled() {
            return Err(SyncError::ShutDown);
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }

        let tracker = inner.coordinator.tracker();
        tracker.spawn(inner.tasks.track_future(Arc::clone(inner).scan_loop()));
        tracker.spawn(inner.tasks.track_future(Arc::clone(inner).sync_loop()));

        info!(
            "Auto-sync started: {} scan paths, {} concurrent syncs, scanning every {:?}",
            inner.config.scan_paths.len(),
            inner.config.max_concurrent_syncs,
            inner.config.scan_interval
        );
        Ok(true)
    }

    /// Scan now and queue what is new.
    ///
    /// # Errors
    ///
    /// - `ShutDown` once the manager is stopped
    /// - `State` if the repository state store cannot be read
    pub async fn trigger_scan(&self) -> Result<ScanSummary> {
        self.inner.scan().await
    }

    /// Stop starting syncs and skip periodic scans
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("Auto-sync paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Auto-sync resumed");
            self.inner.wake.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.cancel.is_cancelled()
    }

    pub fn status(&self) -> AutoSyncStatus {
        let state = self.inner.state();
        AutoSyncStatus {
            enabled: self.inner.config.enabled,
            running: self.is_running(),
            paused: self.is_paused(),
            scan_paths: self.inner.config.scan_paths.clone(),
            queued: state.queue.len(),
            active: state.active.len(),
            synced: state.synced.len(),
            failures: state.failures,
            last_scan: state.last_scan,
            max_concurrent_syncs: self.inner.config.max_concurrent_syncs,
        }
    }

    /// Cancel running syncs and wait for the manager's tasks to end.
    ///
    /// The manager cannot be restarted afterwards.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let active: Vec<String> = self.inner.state().active.values().cloned().collect();
        for name in &active {
            if let Err(e) = self.inner.coordinator.cancel(name).await {
                debug!("Cannot cancel auto-sync of {}: {}", name, e);
            }
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Auto-sync stopped, {} active syncs cancelled", active.len());
    }
}

impl std::fmt::Debug for AutoSyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSyncManager")
            .field("status", &self.status())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Scanning
    // ========================================================================

    async fn scan_loop(self: Arc<Self>) {
        if self.config.sync_on_startup {
            self.scan_logged().await;
        }

        loop {
            core_async::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.config.scan_interval) => {}
            }
            if self.paused.load(Ordering::SeqCst) {
                debug!("Auto-sync paused, skipping scan");
                continue;
            }
            self.scan_logged().await;
        }
        debug!("Auto-sync scan loop stopped");
    }

    async fn scan_logged(&self) {
        if let Err(e) = self.scan().await {
            warn!("Repository scan failed: {}", e);
        }
    }

    async fn scan(&self) -> Result<ScanSummary> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::ShutDown);
        }

        let scanner = self.scanner.clone();
        let discovered = spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))?;
        let total = discovered.len();

        let mut fresh = Vec::new();
        for repository in discovered {
            if self.state().tracks(&repository) {
                continue;
            }
            if self.synced_before(&repository).await? {
                self.state().synced.insert(repository.path.clone());
                continue;
            }
            fresh.push(repository);
        }
        prioritize(&self.config, &mut fresh, Utc::now());

        let mut queued_new = 0;
        for repository in fresh {
            if self.enqueue(repository) {
                queued_new += 1;
            }
        }

        let mut state = self.state();
        state.last_scan = Some(Utc::now());
        let summary = ScanSummary {
            discovered: total,
            queued_new,
            queued: state.queue.len(),
            active: state.active.len(),
            synced: state.synced.len(),
        };
        drop(state);

        info!(
            "Scan found {} repositories, {} newly queued ({} queued, {} active, {} synced)",
            summary.discovered, summary.queued_new, summary.queued, summary.active, summary.synced
        );
        Ok(summary)
    }

    /// A completed sync of this name is on record
    async fn synced_before(&self, repository: &DiscoveredRepository) -> Result<bool> {
        let summary = self.coordinator.repository_summary(&repository.name).await?;
        Ok(summary.is_some_and(|s| s.last_sync_time.is_some()))
    }

    fn enqueue(&self, repository: DiscoveredRepository) -> bool {
        let mut state = self.state();
        if state.tracks(&repository) {
            return false;
        }
        state.queue.push_back(repository);
        drop(state);
        self.wake.notify_one();
        true
    }

    // ========================================================================
    // Syncing
    // ========================================================================

    async fn sync_loop(self: Arc<Self>) {
        loop {
            let permit = core_async::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let Some(repository) = self.next_repository().await else {
                break;
            };

            let worker = Arc::clone(&self);
            self.coordinator
                .tracker()
                .spawn(self.tasks.track_future(worker.sync_one(repository, permit)));
        }
        debug!("Auto-sync loop stopped");
    }

    /// Wait for a queued repository while not paused; `None` once stopped
    async fn next_repository(&self) -> Option<DiscoveredRepository> {
        loop {
            if !self.paused.load(Ordering::SeqCst) {
                let mut state = self.state();
                if let Some(repository) = state.queue.pop_front() {
                    state
                        .active
                        .insert(repository.path.clone(), repository.name.clone());
                    return Some(repository);
                }
            }

            core_async::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn sync_one(self: Arc<Self>, repository: DiscoveredRepository, permit: OwnedSemaphorePermit) {
        let attempt = self.attempt(&repository).await;
        drop(permit);
        self.state().active.remove(&repository.path);

        match attempt {
            Attempt::Synced(report) => {
                self.state().synced.insert(repository.path.clone());
                info!(
                    "Auto-synced {}: {} files, {} chunks",
                    repository.name, report.progress.files_processed, report.progress.chunks_created
                );
                self.watch_if_healthy(&repository, &report.progress);
            }
            Attempt::Busy => {
                debug!(
                    "Sync of {} already running, retrying in {:?}",
                    repository.name, self.config.sync_interval
                );
                self.retry_later(repository).await;
            }
            Attempt::Failed(message) => {
                self.state().failures += 1;
                warn!(
                    "Auto-sync of {} failed, retrying in {:?}: {}",
                    repository.name, self.config.sync_interval, message
                );
                self.retry_later(repository).await;
            }
            Attempt::Cancelled => debug!("Auto-sync of {} cancelled", repository.name),
            Attempt::Rejected(message) => {
                self.state().failures += 1;
                warn!("Dropping {} from auto-sync: {}", repository.name, message);
            }
        }
    }

    async fn attempt(&self, repository: &DiscoveredRepository) -> Attempt {
        if self.cancel.is_cancelled() {
            return Attempt::Cancelled;
        }
        let handle = match self
            .coordinator
            .start_sync(&repository.path, &repository.name, false)
            .await
        {
            Ok(handle) => handle,
            Err(SyncError::SyncAlreadyInProgress { .. }) => return Attempt::Busy,
            Err(SyncError::ShutDown) => return Attempt::Cancelled,
            Err(e) => return Attempt::Rejected(e.to_string()),
        };

        let mut wait = pin!(handle.wait());
        let finished = core_async::select! {
            biased;
            outcome = &mut wait => Some(outcome),
            _ = self.cancel.cancelled() => None,
        };
        let outcome = match finished {
            Some(outcome) => outcome,
            None => {
                if let Err(e) = self.coordinator.cancel(&repository.name).await {
                    debug!("Cannot cancel auto-sync of {}: {}", repository.name, e);
                }
                wait.await
            }
        };

        match outcome.and_then(SyncReport::into_completed) {
            Ok(report) => Attempt::Synced(report),
            Err(SyncError::Cancelled) => Attempt::Cancelled,
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }

    async fn retry_later(&self, repository: DiscoveredRepository) {
        core_async::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = sleep(self.config.sync_interval) => {
                self.enqueue(repository);
            }
        }
    }

    fn watch_if_healthy(&self, repository: &DiscoveredRepository, progress: &SyncProgress) {
        if !self.config.auto_watch {
            return;
        }
        let rate = success_rate(progress);
        if rate < AUTO_WATCH_SUCCESS_RATE {
            debug!(
                "Not watching {}: only {:.0}% of files synced cleanly",
                repository.name,
                rate * 100.0
            );
            return;
        }
        match self
            .coordinator
            .watch_repository(&repository.path, &repository.name)
        {
            Ok(()) => info!("Watching {} for changes", repository.name),
            Err(e) => warn!("Cannot watch {}: {}", repository.name, e),
        }
    }
}

/// Order repositories for syncing: priority language first, then smaller
/// (anything above the size threshold last), then most recently modified.
pub fn prioritize(
    config: &AutoSyncConfig,
    repositories: &mut [DiscoveredRepository],
    now: DateTime<Utc>,
) {
    repositories.sort_by_key(|r| {
        let rank = config
            .language_rank(r.language.as_deref())
            .unwrap_or(usize::MAX);
        let size = if r.size > config.size_threshold {
            u64::MAX
        } else {
            r.size
        };
        let age_days = r
            .last_modified
            .map_or(i64::MAX, |modified| (now - modified).num_days().max(0));
        (rank, size, age_days)
    });
}

/// Share of processed files that did not fail (1.0 for an empty run)
pub fn success_rate(progress: &SyncProgress) -> f64 {
    let processed = progress.files_processed;
    if processed == 0 {
        return 1.0;
    }
    processed.saturating_sub(progress.stats.files_failed) as f64 / processed as f64
}
