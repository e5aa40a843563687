//! Time utilities.
//!
//! `Instant` is tokio's monotonic clock, so waits measured with it follow a
//! paused test clock. Wall-clock timestamps for persisted state come from
//! `chrono` in the crates that persist them.

pub use std::time::{Duration, SystemTime, UNIX_EPOCH};
pub use tokio::time::{interval, sleep, sleep_until, timeout, timeout_at, Instant, Interval, Sleep};

/// Error returned by [`timeout`] when the deadline elapses first.
pub use tokio::time::error::Elapsed;

/// Milliseconds since the Unix epoch, `0` if the system clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
