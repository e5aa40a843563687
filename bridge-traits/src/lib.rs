//! # Host Bridge Traits
//!
//! Contracts between the synchronization core and the collaborators it does
//! not own.
//!
//! ## Overview
//!
//! The core drives two external components:
//!
//! - [`StorageClient`](storage::StorageClient) - the persistent store. It is a
//!   plain synchronous client that must never be called from two threads at
//!   once. The core only reaches it through the blocking worker pool while
//!   holding the store lock.
//! - [`Chunker`](chunker::Chunker) - turns file content into the
//!   [`WriteJob`](storage::WriteJob)s the write queue batches.
//!
//! Both report failures as [`BridgeError`](error::BridgeError).
//!
//! ## Example
//!
//! ```ignore
//! use bridge_traits::storage::{Metadata, StorageClient, StoredRecord, QueryFilter};
//! use bridge_traits::error::Result;
//!
//! struct VectorStore { /* ... */ }
//!
//! impl StorageClient for VectorStore {
//!     fn put(&mut self, id: &str, payload: &str, metadata: &Metadata) -> Result<()> { todo!() }
//!     fn get(&mut self, id: &str) -> Result<Option<StoredRecord>> { todo!() }
//!     fn delete(&mut self, id: &str) -> Result<()> { todo!() }
//!     fn query(&mut self, filter: &QueryFilter) -> Result<Vec<StoredRecord>> { todo!() }
//! }
//! ```

pub mod chunker;
pub mod error;
pub mod storage;

pub use chunker::Chunker;
pub use error::{BridgeError, Result};
pub use storage::{Metadata, QueryFilter, StorageClient, StoredRecord, WriteJob, WriteKind};
