//! Async runtime facade for the memory sync engine.
//!
//! Every `core-*` crate goes through this crate instead of naming tokio
//! directly, so the executor surface the engine relies on stays in one place.
//!
//! # Modules
//!
//! - `task`: Task spawning and supervised task sets
//! - `time`: Sleep, timeouts and clocks
//! - `sync`: Async-aware locks, channels and cancellation tokens
//! - `pool`: Fixed-size OS thread pool for synchronous, blocking calls
//!
//! # Examples
//!
//! ```rust
//! use core_async::pool::BlockingPool;
//!
//! # async fn example() -> Result<(), core_async::pool::PoolError> {
//! let pool = BlockingPool::new("storage", 2)?;
//! let answer = pool.submit(|| 6 * 7).await?;
//! assert_eq!(answer, 42);
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod sync;
pub mod task;
pub mod time;

// Re-export commonly used types at crate root for convenience
pub use pool::{BlockingPool, PoolError};
pub use task::spawn;
pub use time::{sleep, Duration, Instant};

/// Waits on multiple branches, returning when the first completes.
pub use tokio::select;
