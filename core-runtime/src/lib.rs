//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the sync engine:
//! - Logging and tracing infrastructure
//! - Engine configuration
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the store and sync crates
//! depend on. It establishes the logging conventions, the configuration
//! surface and the event broadcasting used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{AutoSyncConfig, RetrySettings, SyncEngineConfig, SyncEngineConfigBuilder};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, StoreEvent, SyncEvent};
