//! # File Watching
//!
//! Turns filesystem change notifications into incremental sync triggers.
//!
//! ## Overview
//!
//! [`Debouncer`] is the pure part: it remembers the last event per path and
//! reports a path as due once it has been quiet for the debounce window. A
//! burst of saves to one file (editor autosave, branch checkout) therefore
//! produces a single trigger. It takes the current instant as an argument so
//! it can be tested without a clock.
//!
//! [`RepositoryWatcher`] is the side-effecting part: a `notify` recommended
//! watcher forwards events for indexable files into a channel, and a task on
//! the owner's `TaskTracker` feeds them through a [`Debouncer`] and calls a
//! [`SyncTrigger`] whenever something becomes due. When the trigger reports
//! that a job is already running, the due paths are re-armed for another
//! window.
//!
//! Dropping the watcher, calling [`RepositoryWatcher::stop`], or cancelling
//! the parent token ends the task.

use async_trait::async_trait;
use core_async::sync::{mpsc, CancellationToken};
use core_async::task::TaskTracker;
use core_async::time::{sleep_until, Duration, Instant};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::discovery::{relative_path, DiscoveryFilter};
use crate::Result;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Deleted,
}

/// A change to one repository file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWatchEvent {
    /// Repository-relative path
    pub path: String,
    pub kind: WatchEventKind,
    pub at: Instant,
}

impl FileWatchEvent {
    pub fn new(path: impl Into<String>, kind: WatchEventKind, at: Instant) -> Self {
        Self {
            path: path.into(),
            kind,
            at,
        }
    }
}

fn kind_of(kind: &EventKind) -> Option<WatchEventKind> {
    match kind {
        EventKind::Create(_) => Some(WatchEventKind::Created),
        EventKind::Modify(_) => Some(WatchEventKind::Modified),
        EventKind::Remove(_) => Some(WatchEventKind::Deleted),
        _ => None,
    }
}

// ============================================================================
// Debouncer
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: WatchEventKind,
    last_seen: Instant,
}

/// Coalesces events per path until the path has been quiet for `window`
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    pending: BTreeMap<String, Pending>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Note an event; a later event for the same path restarts its window
    pub fn record(&mut self, event: FileWatchEvent) {
        let entry = self.pending.entry(event.path).or_insert(Pending {
            kind: event.kind,
            last_seen: event.at,
        });
        entry.kind = event.kind;
        entry.last_seen = entry.last_seen.max(event.at);
    }

    /// When the earliest pending path becomes due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|p| p.last_seen.checked_add(self.window))
            .min()
    }

    /// Remove and return every path quiet since `now - window`, in path order
    pub fn take_due(&mut self, now: Instant) -> Vec<(String, WatchEventKind)> {
        let window = self.window;
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.last_seen.checked_add(window).is_some_and(|due| due <= now))
            .map(|(path, _)| path.clone())
            .collect();

        due.into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|p| (path, p.kind)))
            .collect()
    }

    /// Put `paths` back as if they had just changed at `now`
    pub fn rearm(&mut self, paths: Vec<(String, WatchEventKind)>, now: Instant) {
        for (path, kind) in paths {
            self.record(FileWatchEvent::new(path, kind, now));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// Trigger
// ============================================================================

/// Result of asking for a re-sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// A job for the repository is already active
    Busy,
    /// The sync could not start for another reason
    Rejected(String),
    /// The owner is gone; the watcher should stop
    Closed,
}

/// Starts an incremental sync when watched files settle
#[async_trait]
pub trait SyncTrigger: Send + Sync + 'static {
    async fn trigger(&self, repository: &str, root: &Path) -> TriggerOutcome;
}

// ============================================================================
// Repository Watcher
// ============================================================================

/// Live watch over one repository directory
pub struct RepositoryWatcher {
    repository: String,
    root: PathBuf,
    cancel: CancellationToken,
    _watcher: RecommendedWatcher,
}

impl RepositoryWatcher {
    /// Watch `root` recursively and spawn the debounce task on `tracker`.
    ///
    /// # Errors
    ///
    /// `SyncError::Watch` if the platform watcher cannot be created or the
    /// root cannot be watched.
    pub fn start<T: SyncTrigger>(
        repository: impl Into<String>,
        root: impl Into<PathBuf>,
        filter: DiscoveryFilter,
        window: Duration,
        trigger: T,
        tracker: &TaskTracker,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let repository = repository.into();
        let root: PathBuf = root.into();
        let (sender, receiver) = mpsc::unbounded_channel();

        let watch_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!("File watcher error under {}: {}", watch_root.display(), err);
                    return;
                }
            };
            let Some(kind) = kind_of(&event.kind) else {
                return;
            };
            let at = Instant::now();
            for path in &event.paths {
                let Some(relative) = indexable_relative(&watch_root, path, &filter) else {
                    continue;
                };
                // Receiver gone means the watcher is shutting down
                if sender.send(FileWatchEvent::new(relative, kind, at)).is_err() {
                    return;
                }
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let cancel = parent.child_token();
        tracker.spawn(debounce_loop(
            repository.clone(),
            root.clone(),
            Debouncer::new(window),
            receiver,
            trigger,
            cancel.clone(),
        ));

        info!("Watching {} at {}", repository, root.display());
        Ok(Self {
            repository,
            root,
            cancel,
            _watcher: watcher,
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop the debounce task; pending events are discarded
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RepositoryWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for RepositoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryWatcher")
            .field("repository", &self.repository)
            .field("root", &self.root)
            .finish()
    }
}

fn indexable_relative(root: &Path, path: &Path, filter: &DiscoveryFilter) -> Option<String> {
    if !path.starts_with(root) {
        return None;
    }
    let name = path.file_name()?.to_string_lossy();
    if !filter.is_indexable_name(&name) {
        return None;
    }
    let relative = relative_path(root, path);
    if filter.is_excluded_path(&relative) {
        return None;
    }
    Some(relative)
}

async fn debounce_loop<T: SyncTrigger>(
    repository: String,
    root: PathBuf,
    mut debouncer: Debouncer,
    mut events: mpsc::UnboundedReceiver<FileWatchEvent>,
    trigger: T,
    cancel: CancellationToken,
) {
    loop {
        let deadline = debouncer.next_deadline();
        // Placeholder when nothing is pending; the branch is disabled then
        let wake_at = deadline.unwrap_or_else(Instant::now);

        core_async::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => debouncer.record(event),
                None => break,
            },
            _ = sleep_until(wake_at), if deadline.is_some() => {
                let due = debouncer.take_due(Instant::now());
                if due.is_empty() {
                    continue;
                }
                debug!("{} changed paths settled in {}", due.len(), repository);

                match trigger.trigger(&repository, &root).await {
                    TriggerOutcome::Started => {
                        info!("Triggered incremental sync of {} for {} changed paths", repository, due.len());
                    }
                    TriggerOutcome::Busy => {
                        debug!("Sync of {} already running, re-arming", repository);
                        debouncer.rearm(due, Instant::now());
                    }
                    TriggerOutcome::Rejected(reason) => {
                        warn!("Watcher could not start sync of {}: {}", repository, reason);
                    }
                    TriggerOutcome::Closed => break,
                }
            }
        }
    }
    debug!("Watcher task for {} stopped", repository);
}
