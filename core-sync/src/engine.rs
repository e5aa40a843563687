//! # Repository Sync Engine
//!
//! Runs one sync job from discovery to the committed repository state.
//!
//! ## Overview
//!
//! [`SyncEngine::run`] drives a claimed [`JobSlot`] through the job state
//! machine:
//!
//! 1. **Scanning**: load the stored [`RepositoryState`] and walk the
//!    repository on a blocking thread, checking for cancellation per entry.
//! 2. **Processing**: for each discovered file, in walk order, read and hash
//!    it and classify it against the stored hash:
//!    - *New* / *Modified*: chunk it and offer the chunks to the write queue.
//!      Chunk ids that a modified file no longer produces are tombstoned.
//!    - *Unchanged*: skipped without chunking on incremental runs; re-chunked
//!      on full runs.
//!    - *Deleted* (stored but not discovered): all recorded chunk ids are
//!      tombstoned. Deletion detection is skipped when part of the tree could
//!      not be listed.
//! 3. **Commit**: wait for the queue flusher, then record every file whose
//!    write jobs were all accepted and stored. A file with a dropped, failed
//!    or abandoned item keeps its previous record and is retried next run.
//!
//! Cancellation is checked at the top of the file loop; the flusher finishes
//! the batch it is writing and abandons the rest. Per-file failures are
//! recorded in the progress errors and never stop the job. Only an
//! unreadable repository root, or unusable repository state, fails it.

use bridge_traits::{Chunker, WriteJob};
use chrono::Utc;
use core_async::sync::CancellationToken;
use core_async::task::{spawn_blocking, TaskTracker};
use core_runtime::config::SyncEngineConfig;
use core_runtime::events::{CoreEvent, EventBus, StoreEvent, SyncEvent};
use core_store::{BatchOutcome, ConcurrentStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::discovery::{DiscoveredFile, Discovery, DiscoveryFilter, DiscoveryItem};
use crate::error::{Result, SyncError};
use crate::job::{SyncErrorEntry, SyncErrorKind, SyncProgress, SyncStatus};
use crate::registry::{JobSlot, ProgressUpdater, RepositoryRegistry};
use crate::repository::{content_hash, FileRecord, RepositoryState};
use crate::write_queue::{BatchWriteQueue, FlushReport, Offer, WriteQueueConfig, WriteQueueProducer};

// ============================================================================
// Report Types
// ============================================================================

/// Per-file classification of one job, in walk order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub new: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: Vec<String>,
    /// Unchanged files that a full run chunked again
    pub refreshed: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

impl ChangeSet {
    /// Files handed to the chunker
    pub fn processed(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .new
            .iter()
            .chain(&self.modified)
            .chain(&self.refreshed)
            .cloned()
            .collect();
        files.sort();
        files
    }
}

/// Final result of one job
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Terminal snapshot
    pub progress: SyncProgress,
    pub changes: ChangeSet,
    pub flush: FlushReport,
}

impl SyncReport {
    pub fn status(&self) -> SyncStatus {
        self.progress.status
    }

    /// The report if the job completed.
    ///
    /// # Errors
    ///
    /// - `SyncError::Cancelled` for a cancelled job
    /// - `SyncError::TaskFailed` with the fatal message for a failed job
    pub fn into_completed(self) -> Result<SyncReport> {
        match self.progress.status {
            SyncStatus::Cancelled => Err(SyncError::Cancelled),
            SyncStatus::Failed => {
                let message = self
                    .progress
                    .errors
                    .iter()
                    .rev()
                    .find(|e| e.kind == SyncErrorKind::Fatal)
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "sync failed".to_string());
                Err(SyncError::TaskFailed(message))
            }
            _ => Ok(self),
        }
    }
}

// ============================================================================
// File Processing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileChange {
    New,
    Modified,
    Unchanged,
    Refreshed,
}

struct ProcessedFile {
    change: FileChange,
    record: FileRecord,
    jobs: Vec<WriteJob>,
    chunks: u64,
}

struct FileFailure {
    message: String,
    root_gone: bool,
}

/// Read, hash, classify and (if needed) chunk one file. Blocking.
fn process_file(
    chunker: &dyn Chunker,
    file: &DiscoveredFile,
    root: &Path,
    previous: Option<FileRecord>,
    incremental: bool,
    repository: &str,
) -> std::result::Result<ProcessedFile, FileFailure> {
    let bytes = std::fs::read(&file.path).map_err(|err| FileFailure {
        message: format!("read failed: {}", err),
        root_gone: !root.is_dir(),
    })?;
    let hash = content_hash(&bytes);

    let unchanged = previous.as_ref().is_some_and(|p| p.hash == hash);
    if unchanged && incremental {
        if let Some(record) = previous {
            return Ok(ProcessedFile {
                change: FileChange::Unchanged,
                record,
                jobs: Vec::new(),
                chunks: 0,
            });
        }
    }

    let content = String::from_utf8(bytes).map_err(|_| FileFailure {
        message: "content is not valid UTF-8".to_string(),
        root_gone: false,
    })?;
    let mut jobs = chunker
        .chunk(&content, &file.relative, repository)
        .map_err(|err| FileFailure {
            message: err.to_string(),
            root_gone: false,
        })?;

    let chunk_ids: Vec<String> = jobs.iter().map(|job| job.id.clone()).collect();
    let chunks = jobs.len() as u64;

    let change = match &previous {
        None => FileChange::New,
        Some(_) if unchanged => FileChange::Refreshed,
        Some(_) => FileChange::Modified,
    };

    if let Some(previous) = &previous {
        let current: HashSet<&str> = chunk_ids.iter().map(String::as_str).collect();
        jobs.extend(
            previous
                .chunk_ids
                .iter()
                .filter(|id| !current.contains(id.as_str()))
                .map(|id| WriteJob::tombstone(id.clone(), repository, file.relative.clone())),
        );
    }

    Ok(ProcessedFile {
        change,
        record: FileRecord {
            hash,
            chunk_ids,
            size: file.size,
            synced_at: Utc::now(),
        },
        jobs,
        chunks,
    })
}

#[derive(Default)]
struct Scan {
    files: Vec<DiscoveredFile>,
    /// Paths present on disk but not processed (too large)
    skipped: Vec<String>,
    errors: Vec<(String, String)>,
    root_error: Option<String>,
    cancelled: bool,
}

fn walk_repository(discovery: Discovery, cancel: CancellationToken) -> Scan {
    let mut scan = Scan::default();
    for item in &discovery {
        if cancel.is_cancelled() {
            scan.cancelled = true;
            break;
        }
        match item {
            DiscoveryItem::File(file) => scan.files.push(file),
            DiscoveryItem::Skipped { relative, reason } => {
                debug!("Skipping {}: {:?}", relative, reason);
                scan.skipped.push(relative);
            }
            DiscoveryItem::Error { path, message } => scan.errors.push((path, message)),
            DiscoveryItem::RootError(message) => {
                scan.root_error = Some(message);
                break;
            }
        }
    }
    scan
}

// ============================================================================
// Engine
// ============================================================================

/// Everything a job needs, shared by all jobs of one coordinator
pub struct SyncEngine {
    filter: DiscoveryFilter,
    queue: WriteQueueConfig,
    store: ConcurrentStore,
    chunker: Arc<dyn Chunker>,
    repositories: RepositoryRegistry,
    events: EventBus,
    tracker: TaskTracker,
}

/// Terminal state a job is heading for
enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl SyncEngine {
    pub fn new(
        config: &SyncEngineConfig,
        store: ConcurrentStore,
        chunker: Arc<dyn Chunker>,
        repositories: RepositoryRegistry,
        events: EventBus,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            filter: DiscoveryFilter::from(config),
            queue: WriteQueueConfig::from(config),
            store,
            chunker,
            repositories,
            events,
            tracker,
        }
    }

    pub fn filter(&self) -> &DiscoveryFilter {
        &self.filter
    }

    pub fn repositories(&self) -> &RepositoryRegistry {
        &self.repositories
    }

    pub fn store(&self) -> &ConcurrentStore {
        &self.store
    }

    /// Run the job claimed by `slot` over the directory `root`
    #[instrument(skip(self, slot, root), fields(repository = %slot.repository(), job_id = %slot.job_id()))]
    pub async fn run(&self, slot: JobSlot, root: PathBuf) -> SyncReport {
        let repository = slot.repository().to_string();
        let incremental = slot
            .snapshot()
            .sync_type
            .is_some_and(|t| t.is_incremental());
        let cancel = slot.cancel_token().clone();
        let mut changes = ChangeSet::default();

        self.emit(SyncEvent::Started {
            job_id: slot.job_id().to_string(),
            repository: repository.clone(),
            incremental,
        });
        info!(
            "Starting {} sync of {} at {}",
            if incremental { "incremental" } else { "full" },
            repository,
            root.display()
        );

        // ---- Scanning ------------------------------------------------------

        let mut state = match self.repositories.load(&repository).await {
            Ok(Some(state)) => state,
            Ok(None) => RepositoryState::new(&repository, &root),
            Err(e) => {
                let message = format!("could not load repository state: {}", e);
                return self.finish(slot, Outcome::Failed(message), changes, FlushReport::default());
            }
        };
        state.root = root.clone();

        let discovery = Discovery::new(&root, self.filter.clone());
        let scan_cancel = cancel.clone();
        let scan = match spawn_blocking(move || walk_repository(discovery, scan_cancel)).await {
            Ok(scan) => scan,
            Err(e) => {
                let message = format!("discovery task failed: {}", e);
                return self.finish(slot, Outcome::Failed(message), changes, FlushReport::default());
            }
        };

        if scan.cancelled {
            return self.finish(slot, Outcome::Cancelled, changes, FlushReport::default());
        }
        if let Some(message) = scan.root_error {
            return self.finish(slot, Outcome::Failed(message), changes, FlushReport::default());
        }

        let discovery_complete = scan.errors.is_empty();
        slot.update(|p| {
            for (path, message) in &scan.errors {
                p.push_error(SyncErrorEntry::new(
                    SyncErrorKind::Discovery,
                    Some(path.clone()),
                    message.clone(),
                ));
            }
        });
        if !discovery_complete {
            warn!(
                "{} entries of {} could not be listed; deletions will not be detected this run",
                scan.errors.len(),
                repository
            );
        }

        if let Err(e) = slot.transition(|p| p.begin_processing(scan.files.len() as u64)) {
            return self.finish(slot, Outcome::Failed(e.to_string()), changes, FlushReport::default());
        }
        debug!("Discovered {} files in {}", scan.files.len(), repository);

        // ---- Processing ----------------------------------------------------

        let (producer, flusher) = BatchWriteQueue::new(self.queue, self.store.clone(), &repository);
        let flusher = flusher
            .with_events(self.events.clone())
            .on_batch(self.batch_observer(slot.updater(), slot.job_id().to_string()));
        let flush_task = self.tracker.spawn(flusher.run(cancel.clone()));

        let mut seen: HashSet<String> = scan.skipped.into_iter().collect();
        let mut commits: Vec<(String, FileRecord)> = Vec::new();
        let mut fatal: Option<String> = None;

        for file in &scan.files {
            if cancel.is_cancelled() {
                info!("Cancellation observed in {}, stopping file loop", repository);
                break;
            }
            seen.insert(file.relative.clone());

            let chunker = Arc::clone(&self.chunker);
            let previous = state.file(&file.relative).cloned();
            let task_file = file.clone();
            let task_root = root.clone();
            let task_repository = repository.clone();
            let processed = spawn_blocking(move || {
                process_file(
                    chunker.as_ref(),
                    &task_file,
                    &task_root,
                    previous,
                    incremental,
                    &task_repository,
                )
            })
            .await;

            match processed {
                Ok(Ok(processed)) => {
                    if let Some(record) = self.enqueue_file(&slot, &producer, &file.relative, processed, &mut changes) {
                        commits.push((file.relative.clone(), record));
                    }
                }
                Ok(Err(failure)) => {
                    warn!("Failed to process {}: {}", file.relative, failure.message);
                    changes.failed.push(file.relative.clone());
                    let error = SyncError::ChunkProcessing {
                        path: file.relative.clone(),
                        message: failure.message.clone(),
                    };
                    slot.update(|p| {
                        p.stats.files_failed += 1;
                        p.push_error(SyncErrorEntry::from_error(Some(file.relative.clone()), &error));
                    });
                    if failure.root_gone {
                        fatal = Some(format!("repository root {} is no longer accessible", root.display()));
                        break;
                    }
                }
                Err(e) => {
                    changes.failed.push(file.relative.clone());
                    let error = SyncError::ChunkProcessing {
                        path: file.relative.clone(),
                        message: format!("chunking task failed: {}", e),
                    };
                    slot.update(|p| {
                        p.stats.files_failed += 1;
                        p.push_error(SyncErrorEntry::from_error(Some(file.relative.clone()), &error));
                    });
                }
            }

            slot.update(|p| p.record_file_processed());
            self.emit_progress(&slot);
        }

        // ---- Deletions -----------------------------------------------------

        let mut removals: Vec<String> = Vec::new();
        if !cancel.is_cancelled() && fatal.is_none() && discovery_complete {
            let deleted: Vec<String> = state
                .files
                .keys()
                .filter(|path| !seen.contains(*path))
                .cloned()
                .collect();

            for path in deleted {
                let Some(record) = state.file(&path) else {
                    continue;
                };
                let jobs: Vec<WriteJob> = record
                    .chunk_ids
                    .iter()
                    .map(|id| WriteJob::tombstone(id.clone(), &repository, path.clone()))
                    .collect();
                let (accepted, dropped) = offer_all(&producer, jobs);

                debug!("Scheduling removal of {} ({} chunks)", path, accepted + dropped);
                changes.deleted.push(path.clone());
                slot.update(|p| {
                    p.stats.files_deleted += 1;
                    p.stats.chunks_enqueued += accepted;
                    record_drops(p, &path, dropped, self.queue.capacity);
                });
                if dropped == 0 {
                    removals.push(path);
                }
            }
        }

        drop(producer);
        let flush = match flush_task.await {
            Ok(report) => report,
            Err(e) => {
                error!("Write queue task for {} failed: {}", repository, e);
                let message = format!("write queue task failed: {}", e);
                return self.finish(slot, Outcome::Failed(message), changes, FlushReport::default());
            }
        };

        // ---- Commit --------------------------------------------------------

        let outcome = match fatal {
            Some(message) => Outcome::Failed(message),
            None if cancel.is_cancelled() || flush.cancelled => Outcome::Cancelled,
            None => Outcome::Completed,
        };

        let mut committed = 0;
        for (path, record) in commits {
            if flush.is_path_clean(&path) {
                state.upsert_file(path, record);
                committed += 1;
            }
        }
        for path in removals {
            if flush.is_path_clean(&path) {
                state.remove_file(&path);
            }
        }
        if matches!(outcome, Outcome::Completed) {
            state.record_sync(Utc::now());
        }

        if let Err(e) = self.repositories.save(&state).await {
            error!("Failed to save state of {}: {}", repository, e);
            slot.update(|p| {
                p.push_error(SyncErrorEntry::new(
                    SyncErrorKind::State,
                    None,
                    format!("could not save repository state: {}", e),
                ))
            });
        } else {
            debug!("Committed {} file records for {}", committed, repository);
        }

        self.finish(slot, outcome, changes, flush)
    }

    /// Offer one processed file; returns the record to commit if nothing was dropped
    fn enqueue_file(
        &self,
        slot: &JobSlot,
        producer: &WriteQueueProducer,
        path: &str,
        processed: ProcessedFile,
        changes: &mut ChangeSet,
    ) -> Option<FileRecord> {
        let ProcessedFile {
            change,
            record,
            jobs,
            chunks,
        } = processed;

        match change {
            FileChange::New => changes.new.push(path.to_string()),
            FileChange::Modified => changes.modified.push(path.to_string()),
            FileChange::Unchanged => changes.unchanged.push(path.to_string()),
            FileChange::Refreshed => changes.refreshed.push(path.to_string()),
        }

        let (accepted, dropped) = offer_all(producer, jobs);
        slot.update(|p| {
            match change {
                FileChange::New => p.stats.files_new += 1,
                FileChange::Modified => p.stats.files_modified += 1,
                FileChange::Unchanged | FileChange::Refreshed => p.stats.files_unchanged += 1,
            }
            p.chunks_created += chunks;
            p.stats.chunks_enqueued += accepted;
            record_drops(p, path, dropped, self.queue.capacity);
        });

        if dropped > 0 {
            self.events
                .emit(CoreEvent::Store(StoreEvent::ItemsDropped {
                    repository: slot.repository().to_string(),
                    count: dropped,
                }))
                .ok();
            return None;
        }
        if change == FileChange::Unchanged {
            // Record already stored as-is
            return None;
        }
        Some(record)
    }

    fn batch_observer(&self, updater: ProgressUpdater, job_id: String) -> crate::write_queue::BatchObserver {
        let events = self.events.clone();
        Arc::new(move |outcome: &BatchOutcome| {
            updater.update(|p| {
                p.stats.batches_flushed += 1;
                if outcome.lock_acquired {
                    p.stats.lock_acquisitions += 1;
                }
                p.stats.chunks_stored += outcome.stored() as u64;
                p.stats.chunks_failed += outcome.failed() as u64;
                for item in outcome.failures() {
                    if let Err(e) = &item.result {
                        p.push_error(SyncErrorEntry::new(
                            SyncErrorKind::Storage,
                            Some(item.source_path.clone()),
                            format!("{}: {}", item.id, e),
                        ));
                    }
                }
            });
            let snapshot = updater.snapshot();
            events
                .emit(CoreEvent::Sync(progress_event(&job_id, &snapshot)))
                .ok();
        })
    }

    fn finish(&self, slot: JobSlot, outcome: Outcome, changes: ChangeSet, flush: FlushReport) -> SyncReport {
        let job_id = slot.job_id().to_string();
        let repository = slot.repository().to_string();

        slot.update(|p| p.stats.chunks_abandoned = flush.abandoned);
        let transition = match &outcome {
            Outcome::Completed => slot.transition(|p| p.complete()),
            Outcome::Cancelled => slot.transition(|p| p.cancel()),
            Outcome::Failed(message) => slot.transition(|p| p.fail(message.clone())),
        };
        if let Err(e) = transition {
            warn!("Could not record outcome of sync job {}: {}", job_id, e);
        }

        let progress = slot.snapshot();
        let event = match outcome {
            Outcome::Completed => {
                info!(
                    "Sync of {} completed: {} files, {} chunks stored, {} failed, {} dropped",
                    repository,
                    progress.files_processed,
                    progress.stats.chunks_stored,
                    progress.stats.chunks_failed,
                    progress.dropped
                );
                SyncEvent::Completed {
                    job_id,
                    repository,
                    files_processed: progress.files_processed,
                    chunks_stored: progress.stats.chunks_stored,
                    chunks_failed: progress.stats.chunks_failed,
                    dropped: progress.dropped,
                    duration_ms: progress
                        .elapsed()
                        .map(|d| d.num_milliseconds().max(0) as u64)
                        .unwrap_or(0),
                }
            }
            Outcome::Cancelled => {
                info!(
                    "Sync of {} cancelled after {} files",
                    repository, progress.files_processed
                );
                SyncEvent::Cancelled {
                    job_id,
                    repository,
                    files_processed: progress.files_processed,
                }
            }
            Outcome::Failed(message) => {
                error!("Sync of {} failed: {}", repository, message);
                SyncEvent::Failed {
                    job_id,
                    repository,
                    message,
                    files_processed: progress.files_processed,
                }
            }
        };
        self.emit(event);

        SyncReport {
            progress,
            changes,
            flush,
        }
    }

    fn emit_progress(&self, slot: &JobSlot) {
        let snapshot = slot.snapshot();
        self.emit(progress_event(&slot.job_id().to_string(), &snapshot));
    }

    fn emit(&self, event: SyncEvent) {
        self.events.emit(CoreEvent::Sync(event)).ok();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

fn progress_event(job_id: &str, progress: &SyncProgress) -> SyncEvent {
    SyncEvent::Progress {
        job_id: job_id.to_string(),
        repository: progress.repository.clone(),
        files_processed: progress.files_processed,
        files_total: progress.files_total,
        percent: progress.percent(),
        phase: progress.phase().to_string(),
    }
}

fn offer_all(producer: &WriteQueueProducer, jobs: Vec<WriteJob>) -> (u64, u64) {
    let mut accepted = 0;
    let mut dropped = 0;
    for job in jobs {
        match producer.offer(job) {
            Offer::Accepted => accepted += 1,
            Offer::Dropped => dropped += 1,
        }
    }
    (accepted, dropped)
}

fn record_drops(progress: &mut SyncProgress, path: &str, dropped: u64, capacity: usize) {
    if dropped == 0 {
        return;
    }
    progress.dropped += dropped;
    let error = SyncError::QueueOverflow {
        repository: progress.repository.clone(),
        capacity,
    };
    let mut entry = SyncErrorEntry::from_error(Some(path.to_string()), &error);
    entry.message = format!("{}; {} write jobs dropped", entry.message, dropped);
    progress.push_error(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::LineWindowChunker;

    fn file_in(dir: &Path, relative: &str, content: &str) -> DiscoveredFile {
        let path = dir.join(relative);
        std::fs::write(&path, content).unwrap();
        DiscoveredFile {
            path,
            relative: relative.to_string(),
            size: content.len() as u64,
        }
    }

    #[test]
    fn test_new_file_is_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let file = file_in(dir.path(), "a.rs", "fn a() {}\n");
        let chunker = LineWindowChunker::default();

        let processed = process_file(&chunker, &file, dir.path(), None, true, "alpha").ok().unwrap();
        assert_eq!(processed.change, FileChange::New);
        assert_eq!(processed.chunks, 1);
        assert_eq!(processed.record.chunk_ids.len(), 1);
        assert_eq!(processed.record.hash, content_hash(b"fn a() {}\n"));
    }

    #[test]
    fn test_unchanged_file_skips_chunking_when_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let file = file_in(dir.path(), "a.rs", "fn a() {}\n");
        let chunker = LineWindowChunker::default();
        let first = process_file(&chunker, &file, dir.path(), None, true, "alpha").ok().unwrap();

        let again = process_file(&chunker, &file, dir.path(), Some(first.record.clone()), true, "alpha")
            .ok()
            .unwrap();
        assert_eq!(again.change, FileChange::Unchanged);
        assert!(again.jobs.is_empty());

        let full = process_file(&chunker, &file, dir.path(), Some(first.record), false, "alpha")
            .ok()
            .unwrap();
        assert_eq!(full.change, FileChange::Refreshed);
        assert_eq!(full.jobs.len(), 1);
    }

    #[test]
    fn test_modified_file_tombstones_stale_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let chunker = LineWindowChunker::default();
        let before = file_in(dir.path(), "a.rs", "fn a() {}\n");
        let first = process_file(&chunker, &before, dir.path(), None, true, "alpha").ok().unwrap();

        let after = file_in(dir.path(), "a.rs", "fn b() {}\n");
        let second = process_file(&chunker, &after, dir.path(), Some(first.record.clone()), true, "alpha")
            .ok()
            .unwrap();

        assert_eq!(second.change, FileChange::Modified);
        let tombstones: Vec<_> = second.jobs.iter().filter(|j| j.is_tombstone()).collect();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].id, first.record.chunk_ids[0]);
    }

    #[test]
    fn test_invalid_utf8_is_a_file_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.rs");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();
        let file = DiscoveredFile {
            path,
            relative: "bad.rs".into(),
            size: 3,
        };

        let failure = process_file(&LineWindowChunker::default(), &file, dir.path(), None, true, "alpha")
            .err()
            .unwrap();
        assert!(!failure.root_gone);
        assert!(failure.message.contains("UTF-8"));
    }

    #[test]
    fn test_change_set_processed_is_sorted() {
        let changes = ChangeSet {
            new: vec!["b.rs".into()],
            modified: vec!["a.rs".into()],
            unchanged: vec!["c.rs".into()],
            ..Default::default()
        };
        assert_eq!(changes.processed(), vec!["a.rs", "b.rs"]);
    }
}
