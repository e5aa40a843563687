use core_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Sync already in progress for repository {repository}")]
    SyncAlreadyInProgress { repository: String },

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Failed to process {path}: {message}")]
    ChunkProcessing { path: String, message: String },

    #[error("Write queue for {repository} is full (capacity {capacity})")]
    QueueOverflow { repository: String, capacity: usize },

    #[error("Invalid repository path {path}: {reason}")]
    InvalidRepositoryPath { path: String, reason: String },

    #[error("Invalid repository name: {0}")]
    InvalidRepositoryName(String),

    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),

    #[error("Invalid sync status: {0}")]
    InvalidStatus(String),

    #[error("Invalid sync type: {0}")]
    InvalidSyncType(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Repository state error: {0}")]
    State(String),

    #[error("File watcher error: {0}")]
    Watch(String),

    #[error("Sync task failed: {0}")]
    TaskFailed(String),

    #[error("Sync engine is shut down")]
    ShutDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<core_runtime::Error> for SyncError {
    fn from(err: core_runtime::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::State(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::State(format!("serialization: {}", err))
    }
}

impl From<notify::Error> for SyncError {
    fn from(err: notify::Error) -> Self {
        SyncError::Watch(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
