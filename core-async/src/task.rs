//! Task spawning and supervision.
//!
//! Background work in the engine is never fire-and-forget: long-lived tasks
//! are spawned on a [`TaskTracker`] owned by whoever started them, so that
//! shutdown can close the tracker and wait for every task to finish.
//!
//! # Examples
//!
//! ```rust
//! use core_async::task::TaskTracker;
//!
//! async fn example() {
//!     let tracker = TaskTracker::new();
//!     tracker.spawn(async { 1 + 1 });
//!     tracker.close();
//!     tracker.wait().await;
//! }
//! ```

pub use tokio::task::{spawn_blocking, yield_now, JoinError, JoinHandle};
pub use tokio_util::task::TaskTracker;

/// Spawns a new asynchronous task on the Tokio runtime.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::task::spawn(future)
}

/// Result type for task operations.
pub type Result<T> = std::result::Result<T, JoinError>;
