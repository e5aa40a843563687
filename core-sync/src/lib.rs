//! # Repository Sync Module
//!
//! Keeps a persistent chunk store in step with local source repositories.
//!
//! ## Overview
//!
//! This module manages the lifecycle of repository sync jobs, including:
//! - Discovering candidate files (extension allow-list, excluded directories, size ceiling)
//! - Classifying files as new, modified, unchanged or deleted by content hash
//! - Chunking changed files and batching the writes behind the store lock
//! - Persisting per-repository file hashes between runs
//! - Re-syncing watched repositories after edits settle
//! - Discovering repositories under scan paths and syncing them in the background
//!
//! ## Components
//!
//! - **Sync Job State Machine** (`job`): Job lifecycle with validated state transitions and progress snapshots
//! - **Discovery** (`discovery`): Restartable, ordered walk over a repository
//! - **Chunking** (`chunking`): Default line-window chunker
//! - **Batched Write Queue** (`write_queue`): Bounded, non-blocking queue flushed in lock-amortized batches
//! - **Repository State** (`repository`): File hashes and chunk ids per repository, in memory or SQLite
//! - **Registries** (`registry`): Live job status and repository state access
//! - **Sync Engine** (`engine`): Runs one job from discovery to commit
//! - **File Watching** (`watcher`): Debounced filesystem notifications
//! - **Sync Coordinator** (`coordinator`): Starts, tracks and cancels jobs
//! - **Repository Discovery** (`auto_discovery`): Finds repositories by project markers
//! - **Auto Sync** (`auto_sync`): Scan and sync loops with bounded concurrency

pub mod auto_discovery;
pub mod auto_sync;
pub mod chunking;
pub mod coordinator;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod job;
pub mod registry;
pub mod repository;
pub mod watcher;
pub mod write_queue;

pub use auto_discovery::{DiscoveredRepository, RepositoryKind, RepositoryScanner};
pub use auto_sync::{AutoSyncManager, AutoSyncStatus, ScanSummary};
pub use chunking::LineWindowChunker;
pub use coordinator::{SyncCoordinator, SyncJobHandle};
pub use discovery::{DiscoveredFile, Discovery, DiscoveryFilter, DiscoveryItem, SkipReason};
pub use engine::{ChangeSet, SyncEngine, SyncReport};
pub use error::{Result, SyncError};
pub use job::{
    SyncErrorEntry, SyncErrorKind, SyncJobId, SyncProgress, SyncStats, SyncStatus, SyncType,
};
pub use registry::{JobRegistry, JobSlot, ProgressUpdater, RepositoryRegistry};
pub use repository::{
    content_hash, FileRecord, InMemoryRepositoryStateStore, RepositoryState,
    RepositoryStateStore, RepositorySummary, SqliteRepositoryStateStore,
};
pub use watcher::{Debouncer, FileWatchEvent, RepositoryWatcher, SyncTrigger, TriggerOutcome, WatchEventKind};
pub use write_queue::{
    BatchObserver, BatchWriteQueue, FlushReport, Offer, QueueFlusher, WriteQueueConfig,
    WriteQueueProducer,
};
