//! # Sync Job State Machine
//!
//! Lifecycle and progress of one repository sync job.
//!
//! ## Overview
//!
//! Every job moves through a fixed sequence of states. Transitions are
//! validated; an invalid one is an error rather than a silent overwrite.
//! [`SyncProgress`] is the snapshot readers see: it carries the status, the
//! file and chunk counters, the per-file error list and the per-job
//! statistics.
//!
//! ## State Machine
//!
//! ```text
//! Idle → Scanning → Processing → Completed
//!           │           │
//!           ├─→ Failed ←┤
//!           └─→ Cancelled ←┘
//! ```
//!
//! No transition skips a state: an empty repository still passes through
//! `Processing` before `Completed`.
//!
//! ## Usage
//!
//! ```rust
//! use core_sync::job::{SyncJobId, SyncProgress, SyncStatus, SyncType};
//!
//! let mut progress = SyncProgress::idle("alpha");
//! progress.begin(SyncJobId::new(), SyncType::Incremental).unwrap();
//! progress.begin_processing(3).unwrap();
//! progress.record_file_processed();
//! assert_eq!(progress.percent(), 33);
//!
//! progress.cancel().unwrap();
//! assert_eq!(progress.status, SyncStatus::Cancelled);
//! ```

use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Error entries kept per job; later ones are only counted
pub const MAX_ERROR_ENTRIES: usize = 500;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncJobId(Uuid);

impl SyncJobId {
    /// Create a new random sync job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a sync job ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidJobId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SyncJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SyncJobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// The current status of a repository sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No job has run, or the registry has no record of one
    Idle,
    /// Discovering candidate files
    Scanning,
    /// Classifying, chunking and storing files
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    /// Check if this status represents a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }

    /// Whether a job in this status blocks another job for the same repository
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Scanning | SyncStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Scanning => "scanning",
            SyncStatus::Processing => "processing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    /// Whether `self → to` is a legal transition
    pub fn can_transition_to(&self, to: SyncStatus) -> bool {
        matches!(
            (self, to),
            (SyncStatus::Idle, SyncStatus::Scanning)
                | (SyncStatus::Scanning, SyncStatus::Processing)
                | (SyncStatus::Scanning, SyncStatus::Failed)
                | (SyncStatus::Scanning, SyncStatus::Cancelled)
                | (SyncStatus::Processing, SyncStatus::Completed)
                | (SyncStatus::Processing, SyncStatus::Failed)
                | (SyncStatus::Processing, SyncStatus::Cancelled)
        )
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(SyncStatus::Idle),
            "scanning" => Ok(SyncStatus::Scanning),
            "processing" => Ok(SyncStatus::Processing),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "cancelled" => Ok(SyncStatus::Cancelled),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The type of sync being performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// Re-chunk every discovered file
    Full,
    /// Skip files whose content hash is unchanged
    Incremental,
}

impl SyncType {
    pub fn from_incremental(incremental: bool) -> Self {
        if incremental {
            SyncType::Incremental
        } else {
            SyncType::Full
        }
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self, SyncType::Incremental)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
        }
    }
}

impl FromStr for SyncType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(SyncType::Full),
            "incremental" => Ok(SyncType::Incremental),
            _ => Err(SyncError::InvalidSyncType(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Progress Types
// ============================================================================

/// What went wrong, for one entry of [`SyncProgress::errors`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// A file could not be read or chunked
    ChunkProcessing,
    /// Write jobs were rejected by a full queue
    QueueOverflow,
    /// Storing a chunk failed after retries
    Storage,
    /// A directory below the root could not be listed
    Discovery,
    /// Repository state could not be loaded or saved
    State,
    /// The job could not continue
    Fatal,
}

/// One recorded error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub kind: SyncErrorKind,
    /// Repository-relative path, when the error belongs to one file
    pub path: Option<String>,
    pub message: String,
}

impl SyncErrorEntry {
    pub fn new(kind: SyncErrorKind, path: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            message: message.into(),
        }
    }

    /// Entry for `error`, classified by [`SyncErrorKind::of`]
    pub fn from_error(path: Option<String>, error: &SyncError) -> Self {
        Self::new(SyncErrorKind::of(error), path, error.to_string())
    }
}

impl SyncErrorKind {
    /// Progress entry kind a job-level error is recorded under
    pub fn of(error: &SyncError) -> Self {
        match error {
            SyncError::ChunkProcessing { .. } => SyncErrorKind::ChunkProcessing,
            SyncError::QueueOverflow { .. } => SyncErrorKind::QueueOverflow,
            SyncError::Store(_) => SyncErrorKind::Storage,
            SyncError::State(_) => SyncErrorKind::State,
            _ => SyncErrorKind::Fatal,
        }
    }
}

/// Per-job statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub files_new: u64,
    pub files_modified: u64,
    pub files_unchanged: u64,
    pub files_deleted: u64,
    pub files_failed: u64,
    /// Write jobs accepted by the queue (chunks plus tombstones)
    pub chunks_enqueued: u64,
    pub chunks_stored: u64,
    pub chunks_failed: u64,
    /// Accepted items never flushed because the job was cancelled
    pub chunks_abandoned: u64,
    pub batches_flushed: u64,
    pub lock_acquisitions: u64,
}

impl SyncStats {
    /// Files that were chunked (new or modified)
    pub fn files_changed(&self) -> u64 {
        self.files_new + self.files_modified
    }
}

/// Snapshot of one repository's sync state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub repository: String,
    /// Job that produced this snapshot (`None` while idle)
    pub job_id: Option<SyncJobId>,
    pub sync_type: Option<SyncType>,
    pub status: SyncStatus,
    pub files_total: u64,
    pub files_processed: u64,
    /// Chunks produced by the chunker
    pub chunks_created: u64,
    /// Write jobs rejected by a full queue
    pub dropped: u64,
    pub errors: Vec<SyncErrorEntry>,
    /// Errors beyond [`MAX_ERROR_ENTRIES`]
    pub errors_omitted: u64,
    pub stats: SyncStats,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncProgress {
    /// Snapshot for a repository with no job
    pub fn idle(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            job_id: None,
            sync_type: None,
            status: SyncStatus::Idle,
            files_total: 0,
            files_processed: 0,
            chunks_created: 0,
            dropped: 0,
            errors: Vec::new(),
            errors_omitted: 0,
            stats: SyncStats::default(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Reset counters for a new job and move to `Scanning`.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` if a job is still active.
    pub fn begin(&mut self, job_id: SyncJobId, sync_type: SyncType) -> Result<()> {
        if self.status.is_active() {
            return Err(self.transition_error(SyncStatus::Scanning));
        }
        *self = Self::idle(std::mem::take(&mut self.repository));
        self.job_id = Some(job_id);
        self.sync_type = Some(sync_type);
        self.started_at = Some(Utc::now());
        self.transition(SyncStatus::Scanning)
    }

    /// Discovery finished with `files_total` candidates
    pub fn begin_processing(&mut self, files_total: u64) -> Result<()> {
        self.transition(SyncStatus::Processing)?;
        self.files_total = files_total;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.finish(SyncStatus::Completed)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.finish(SyncStatus::Failed)?;
        self.push_error(SyncErrorEntry::new(SyncErrorKind::Fatal, None, message));
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.finish(SyncStatus::Cancelled)
    }

    fn finish(&mut self, to: SyncStatus) -> Result<()> {
        self.transition(to)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, to: SyncStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(self.transition_error(to));
        }
        self.status = to;
        Ok(())
    }

    fn transition_error(&self, to: SyncStatus) -> SyncError {
        SyncError::InvalidStateTransition {
            from: self.status.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                to.as_str()
            ),
        }
    }

    pub fn record_file_processed(&mut self) {
        self.files_processed += 1;
    }

    /// Append an error, counting it once the list is full
    pub fn push_error(&mut self, entry: SyncErrorEntry) {
        if self.errors.len() < MAX_ERROR_ENTRIES {
            self.errors.push(entry);
        } else {
            self.errors_omitted += 1;
        }
    }

    /// Total number of errors, including omitted ones
    pub fn error_count(&self) -> u64 {
        self.errors.len() as u64 + self.errors_omitted
    }

    /// Progress percentage (0-100)
    pub fn percent(&self) -> u8 {
        if self.status == SyncStatus::Completed {
            return 100;
        }
        if self.files_total == 0 {
            return 0;
        }
        ((self.files_processed as f64 / self.files_total as f64) * 100.0).min(100.0) as u8
    }

    /// Time since the job started, up to its end if it has finished
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }

    /// Files per second over [`elapsed`](Self::elapsed)
    pub fn files_per_second(&self) -> f64 {
        match self.elapsed() {
            Some(elapsed) if elapsed.num_milliseconds() > 0 => {
                self.files_processed as f64 / (elapsed.num_milliseconds() as f64 / 1000.0)
            }
            _ => 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn phase(&self) -> &'static str {
        self.status.as_str()
    }
}

// ============================================================================
// Tests
// ============================================================================
