//! Storage Client Abstractions
//!
//! The persistent store is consumed as an opaque synchronous client. It is
//! not reentrant and not safe for unsynchronized concurrent use, which is why
//! every method takes `&mut self`: callers must own the client (or hold a
//! mutex around it) to call it at all.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// Free-form metadata attached to a stored record
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A record as returned by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub payload: String,
    pub metadata: Metadata,
}

/// Metadata filter for `StorageClient::query`
///
/// A record matches when every field in `equals` is present with the same
/// value and, if set, its id starts with `id_prefix`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub equals: Metadata,
    pub id_prefix: Option<String>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check a record against the filter (limit is not considered)
    pub fn matches(&self, record: &StoredRecord) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !record.id.starts_with(prefix.as_str()) {
                return false;
            }
        }

        self.equals
            .iter()
            .all(|(key, value)| record.metadata.get(key) == Some(value))
    }
}

/// Synchronous storage client
///
/// Implementations may block on I/O. The core calls them only from the
/// blocking worker pool and only while holding the store lock.
pub trait StorageClient: Send {
    /// Insert or replace a record
    fn put(&mut self, id: &str, payload: &str, metadata: &Metadata) -> Result<()>;

    /// Fetch a record, `None` when the id is unknown
    fn get(&mut self, id: &str) -> Result<Option<StoredRecord>>;

    /// Remove a record. Removing an unknown id is not an error.
    fn delete(&mut self, id: &str) -> Result<()>;

    /// Return every record matching the filter
    fn query(&mut self, filter: &QueryFilter) -> Result<Vec<StoredRecord>>;
}

impl<T: StorageClient + ?Sized> StorageClient for Box<T> {
    fn put(&mut self, id: &str, payload: &str, metadata: &Metadata) -> Result<()> {
        (**self).put(id, payload, metadata)
    }

    fn get(&mut self, id: &str) -> Result<Option<StoredRecord>> {
        (**self).get(id)
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        (**self).delete(id)
    }

    fn query(&mut self, filter: &QueryFilter) -> Result<Vec<StoredRecord>> {
        (**self).query(filter)
    }
}

/// What a write job does to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    /// Store the payload under the id
    Upsert,
    /// Remove the id (the source content went away)
    Tombstone,
}

/// One unit of content to persist
///
/// Produced by a [`Chunker`](crate::chunker::Chunker) (or by the sync engine
/// for tombstones) and consumed exactly once by the write queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteJob {
    pub id: String,
    pub payload: String,
    pub metadata: Metadata,
    /// Repository (job) name that owns this item
    pub repository: String,
    /// Repository-relative path of the file the item came from
    pub source_path: String,
    pub kind: WriteKind,
}

impl WriteJob {
    /// Create a job that stores `payload` under `id`
    pub fn upsert(
        id: impl Into<String>,
        payload: impl Into<String>,
        repository: impl Into<String>,
        source_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            repository: repository.into(),
            source_path: source_path.into(),
            kind: WriteKind::Upsert,
        }
    }

    /// Create a job that removes `id`
    pub fn tombstone(
        id: impl Into<String>,
        repository: impl Into<String>,
        source_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            payload: String::new(),
            metadata: Metadata::new(),
            repository: repository.into(),
            source_path: source_path.into(),
            kind: WriteKind::Tombstone,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == WriteKind::Tombstone
    }
}
