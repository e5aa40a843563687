use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Worker pool error: {0}")]
    Pool(#[from] core_async::PoolError),

    #[error("Store error: {0}")]
    Store(#[from] core_store::StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),
}

impl CoreError {
    /// Whether the failed operation may succeed if repeated
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Store(e) | CoreError::Sync(core_sync::SyncError::Store(e)) => e.is_transient(),
            CoreError::Pool(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
