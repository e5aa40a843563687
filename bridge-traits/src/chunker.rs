//! Content chunking contract
//!
//! Language-aware chunkers live outside the core. The sync engine only needs
//! a pure function from file content to write jobs.

use crate::error::Result;
use crate::storage::WriteJob;

/// Splits file content into storable units
///
/// Implementations must be deterministic: the same content, path and
/// repository must produce the same job ids, otherwise incremental sync
/// cannot tell which stored chunks became stale.
pub trait Chunker: Send + Sync {
    /// Chunk `content` read from repository-relative `path`
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::InvalidInput` when the content cannot be parsed.
    /// The error is isolated to this file by the caller.
    fn chunk(&self, content: &str, path: &str, repository: &str) -> Result<Vec<WriteJob>>;
}

impl<T: Chunker + ?Sized> Chunker for std::sync::Arc<T> {
    fn chunk(&self, content: &str, path: &str, repository: &str) -> Result<Vec<WriteJob>> {
        (**self).chunk(content, path, repository)
    }
}
