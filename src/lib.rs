//! Umbrella crate for the memory sync engine.
//!
//! Re-exports the workspace crates so hosts can depend on `memory-sync` alone.
//! Most hosts only need [`MemoryService`], [`CoreDependencies`] and
//! [`SyncEngineConfig`].

pub use bridge_traits;
pub use core_async;
pub use core_runtime;
pub use core_service;
pub use core_store;
pub use core_sync;

pub use core_runtime::config::{AutoSyncConfig, SyncEngineConfig};
pub use core_runtime::logging::{init_logging, LoggingConfig};
pub use core_service::{CoreDependencies, CoreError, MemoryService};
