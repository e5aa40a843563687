use bridge_traits::BridgeError;
use core_async::pool::PoolError;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryError;

/// Store access errors
///
/// Cloneable so that a single lock failure can be attached to every item of
/// the batch it aborted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Timed out after {waited:?} waiting for the store lock (timeout {timeout:?})")]
    LockTimeout { waited: Duration, timeout: Duration },

    #[error("Lock backend error: {0}")]
    LockBackend(String),

    #[error("Storage temporarily unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<StoreError> },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store corruption: {0}")]
    Corruption(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] PoolError),

    #[error("I/O error: {0}")]
    Io(String),
}

impl StoreError {
    /// Default transient predicate for the retry policy.
    ///
    /// Lock timeouts, temporary unavailability and a saturated worker pool
    /// are retried; everything else is fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::LockTimeout { .. } | StoreError::StorageUnavailable(_) => true,
            StoreError::WorkerPool(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}

impl From<BridgeError> for StoreError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::NotFound(id) => StoreError::NotFound(id),
            BridgeError::Unavailable(msg) => StoreError::StorageUnavailable(msg),
            BridgeError::InvalidInput(msg) => StoreError::InvalidInput(msg),
            BridgeError::Corrupted(msg) => StoreError::Corruption(msg),
            BridgeError::OperationFailed(msg) => StoreError::Storage(msg),
            BridgeError::Io(e) => StoreError::from(e),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
                StoreError::StorageUnavailable(err.to_string())
            }
            _ => StoreError::Io(err.to_string()),
        }
    }
}

impl From<RetryError<StoreError>> for StoreError {
    fn from(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { attempts, last } => StoreError::RetryExhausted {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
