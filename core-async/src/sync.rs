//! Synchronization primitives.
//!
//! Async-aware primitives from `tokio::sync` plus the cooperative
//! cancellation token from `tokio-util`. None of the locks here block the
//! executor thread while waiting.
//!
//! # Examples
//!
//! ```rust
//! use core_async::sync::{CancellationToken, Mutex};
//!
//! async fn example() {
//!     let mutex = Mutex::new(42);
//!     *mutex.lock().await += 1;
//!
//!     let token = CancellationToken::new();
//!     let child = token.child_token();
//!     token.cancel();
//!     assert!(child.is_cancelled());
//! }
//! ```

pub use tokio::sync::{
    broadcast, mpsc, oneshot, watch, Mutex, MutexGuard, Notify, OwnedMutexGuard,
    OwnedSemaphorePermit, RwLock, Semaphore,
};

pub use tokio_util::sync::CancellationToken;
