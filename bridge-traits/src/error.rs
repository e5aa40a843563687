use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage corrupted: {0}")]
    Corrupted(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the failure is expected to clear up if the call is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Unavailable(_) => true,
            BridgeError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
