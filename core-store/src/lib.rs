//! # Core Store
//!
//! Safe shared access to the persistent store.
//!
//! ## Overview
//!
//! Many client processes and many tasks inside one process share a single
//! on-disk store whose client is synchronous and non-reentrant. This crate
//! provides the pieces that make that safe:
//!
//! - [`lock::LockManager`] - cross-process exclusive lock with timeout and
//!   statistics
//! - [`retry::RetryPolicy`] - exponential backoff for transient failures
//! - [`bridge::StorageBridge`] - runs client calls on the blocking worker
//!   pool, never on an executor thread
//! - [`store::ConcurrentStore`] - foreground operations and batch writes
//!   combining the three
//! - [`memory::InMemoryStorage`] - reference client for hosts and tests
//!
//! ## Usage
//!
//! ```ignore
//! use core_store::{ConcurrentStore, LockManager, LockOptions, RetryPolicy, StorageBridge};
//! use core_async::pool::BlockingPool;
//! use std::sync::Arc;
//!
//! let locks = Arc::new(LockManager::for_store(&store_dir, LockOptions::default())?);
//! let pool = Arc::new(BlockingPool::new("storage", 4)?);
//! let bridge = StorageBridge::new(pool, Box::new(my_client));
//! let store = ConcurrentStore::new(locks, bridge, RetryPolicy::default());
//!
//! store.put("note-1", "remember the milk", Default::default()).await?;
//! ```

pub mod bridge;
pub mod error;
pub mod lock;
pub mod memory;
pub mod retry;
pub mod store;

pub use bridge::StorageBridge;
pub use error::{Result, StoreError};
pub use lock::{FileLockBackend, LockBackend, LockHandle, LockManager, LockOptions, LockStats};
pub use memory::InMemoryStorage;
pub use retry::{Retried, RetryError, RetryPolicy};
pub use store::{BatchOutcome, ConcurrentStore, ItemOutcome};
