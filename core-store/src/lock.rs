//! # Store Lock Manager
//!
//! Cross-process mutual exclusion for the shared on-disk store.
//!
//! ## Overview
//!
//! Exclusion is layered:
//!
//! 1. **In-process gate**: a tokio mutex. Tasks in this process queue on it
//!    in FIFO order, so only one task at a time polls the OS lock.
//! 2. **OS lock**: a [`LockBackend`]. The default [`FileLockBackend`] takes
//!    an advisory exclusive lock on `<store>/.store.lock` through `fs2`
//!    (`flock` on unix, `LockFileEx` on windows). It is polled with a
//!    non-blocking attempt every `poll_interval` until it succeeds or the
//!    deadline passes.
//!
//! The timeout passed to [`LockManager::acquire`] covers both phases.
//!
//! A successful acquisition returns a [`LockHandle`]. The handle releases
//! the OS lock and the gate exactly once: on an explicit
//! [`release`](LockHandle::release), or on drop if that never happened
//! (early return, error, or the owning future being cancelled).
//!
//! ## Usage
//!
//! ```ignore
//! let locks = LockManager::for_store("/var/lib/memory/store", LockOptions::default())?;
//! let mut handle = locks.acquire(Duration::from_secs(30)).await?;
//! // ... exclusive access to the store ...
//! handle.release();
//! ```

use chrono::{DateTime, Utc};
use core_async::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use core_async::time::{sleep, timeout_at, Duration, Instant};
use core_runtime::config::SyncEngineConfig;
use core_runtime::events::{CoreEvent, EventBus, StoreEvent};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, instrument, warn};

use crate::error::{Result, StoreError};

/// Lock file created inside the store directory
pub const LOCK_FILE_NAME: &str = ".store.lock";

// ============================================================================
// Backend capability
// ============================================================================

/// OS-level exclusive lock primitive
///
/// Implementations must be non-blocking: `try_acquire` returns `Ok(false)`
/// immediately when another holder owns the lock.
pub trait LockBackend: Send + Sync {
    /// Attempt to take the lock without waiting.
    fn try_acquire(&self) -> io::Result<bool>;

    /// Release the lock. Releasing a lock that is not held is a no-op.
    fn release(&self) -> io::Result<()>;

    /// Whether this backend instance currently holds the lock
    fn is_held(&self) -> bool;
}

/// Advisory file lock backed by `fs2`
pub struct FileLockBackend {
    path: PathBuf,
    file: Mutex<Option<File>>,
    held: AtomicBool,
}

impl FileLockBackend {
    /// Lock on `path`. The file (and its parent directory) is created on
    /// first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
            held: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl LockBackend for FileLockBackend {
    fn try_acquire(&self) -> io::Result<bool> {
        let mut slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(self.open()?);
        }
        let Some(file) = slot.as_ref() else {
            return Ok(false);
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                self.held.store(true, Ordering::SeqCst);
                Ok(true)
            }
            Err(e) if is_contended(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn release(&self) -> io::Result<()> {
        let slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match slot.as_ref() {
            Some(file) => file.unlock(),
            None => Ok(()),
        }
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FileLockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockBackend")
            .field("path", &self.path)
            .field("held", &self.is_held())
            .finish()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Process-wide lock diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LockStats {
    pub total_acquisitions: u64,
    pub failed_acquisitions: u64,
    /// Sum of waits of successful acquisitions
    pub total_wait: Duration,
    pub max_wait: Duration,
    /// 0 or 1
    pub active_holders: u32,
    pub last_acquired_at: Option<DateTime<Utc>>,
}

impl LockStats {
    pub fn average_wait(&self) -> Duration {
        if self.total_acquisitions == 0 {
            return Duration::ZERO;
        }
        self.total_wait
            .checked_div(self.total_acquisitions.min(u32::MAX as u64) as u32)
            .unwrap_or(Duration::ZERO)
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Who holds the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub pid: u32,
    pub thread: String,
}

impl LockHolder {
    fn current() -> Self {
        let thread = std::thread::current();
        Self {
            pid: std::process::id(),
            thread: thread
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", thread.id())),
        }
    }
}

struct HeldLock {
    backend: Arc<dyn LockBackend>,
    stats: Arc<Mutex<LockStats>>,
    _gate: OwnedMutexGuard<()>,
}

/// One successful acquisition of the store lock
///
/// Exclusively owned by the acquirer. Released exactly once: explicitly via
/// [`release`](Self::release), or on drop.
#[must_use = "the store lock is released as soon as the handle is dropped"]
pub struct LockHandle {
    acquired_at: DateTime<Utc>,
    acquired_instant: Instant,
    holder: LockHolder,
    timeout: Duration,
    waited: Duration,
    held: Option<HeldLock>,
}

impl LockHandle {
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Timeout the acquisition was made with
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How long the acquirer waited
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// How long the lock has been held so far
    pub fn held_for(&self) -> Duration {
        self.acquired_instant.elapsed()
    }

    pub fn is_released(&self) -> bool {
        self.held.is_none()
    }

    /// Release the lock. Calling it again is a no-op.
    pub fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };

        if let Err(e) = held.backend.release() {
            warn!("Failed to release store lock: {}", e);
        }

        {
            let mut stats = held.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.active_holders = stats.active_holders.saturating_sub(1);
        }

        debug!("Store lock released after {:?}", self.held_for());
        // Gate guard drops last so the next in-process waiter sees a free OS lock
        drop(held);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("acquired_at", &self.acquired_at)
            .field("holder", &self.holder)
            .field("timeout", &self.timeout)
            .field("waited", &self.waited)
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Tunables for [`LockManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Used by callers that do not pass their own timeout
    pub default_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            default_timeout: core_runtime::config::DEFAULT_LOCK_TIMEOUT,
            poll_interval: core_runtime::config::DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}

impl From<&SyncEngineConfig> for LockOptions {
    fn from(config: &SyncEngineConfig) -> Self {
        Self {
            default_timeout: config.lock_timeout,
            poll_interval: config.lock_poll_interval,
        }
    }
}

/// Grants exclusive access to the store
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    gate: Arc<AsyncMutex<()>>,
    options: LockOptions,
    stats: Arc<Mutex<LockStats>>,
    events: Option<EventBus>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, options: LockOptions) -> Self {
        Self {
            backend,
            gate: Arc::new(AsyncMutex::new(())),
            options,
            stats: Arc::new(Mutex::new(LockStats::default())),
            events: None,
        }
    }

    /// File lock inside `store_path`, creating the directory if needed.
    pub fn for_store(store_path: impl AsRef<Path>, options: LockOptions) -> Result<Self> {
        let store_path = store_path.as_ref();
        fs::create_dir_all(store_path).map_err(|e| {
            StoreError::LockBackend(format!(
                "cannot create store directory {}: {}",
                store_path.display(),
                e
            ))
        })?;
        let backend = FileLockBackend::new(store_path.join(LOCK_FILE_NAME));
        Ok(Self::new(Arc::new(backend), options))
    }

    /// Publish lock timeouts on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn options(&self) -> LockOptions {
        self.options
    }

    /// Acquire with the configured default timeout
    pub async fn acquire_default(&self) -> Result<LockHandle> {
        self.acquire(self.options.default_timeout).await
    }

    /// Wait up to `timeout` for exclusive access.
    ///
    /// # Errors
    ///
    /// - `StoreError::LockTimeout` when the deadline passes first
    /// - `StoreError::LockBackend` when the OS lock cannot be attempted at all
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(&self, timeout_after: Duration) -> Result<LockHandle> {
        let start = Instant::now();
        // A timeout too large to represent means wait without a deadline
        let deadline = start.checked_add(timeout_after);

        let gate = match deadline {
            Some(deadline) => match timeout_at(deadline, Arc::clone(&self.gate).lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => return Err(self.record_timeout(start.elapsed(), timeout_after)),
            },
            None => Arc::clone(&self.gate).lock_owned().await,
        };

        loop {
            match self.backend.try_acquire() {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    self.record_failure();
                    return Err(StoreError::LockBackend(e.to_string()));
                }
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(gate);
                        return Err(self.record_timeout(start.elapsed(), timeout_after));
                    }
                    self.options.poll_interval.min(deadline - now)
                }
                None => self.options.poll_interval,
            };
            sleep(pause).await;
        }

        let waited = start.elapsed();
        let acquired_at = Utc::now();
        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.total_acquisitions += 1;
            stats.total_wait += waited;
            stats.max_wait = stats.max_wait.max(waited);
            stats.active_holders += 1;
            stats.last_acquired_at = Some(acquired_at);
        }

        debug!("Store lock acquired after {:?}", waited);

        Ok(LockHandle {
            acquired_at,
            acquired_instant: Instant::now(),
            holder: LockHolder::current(),
            timeout: timeout_after,
            waited,
            held: Some(HeldLock {
                backend: Arc::clone(&self.backend),
                stats: Arc::clone(&self.stats),
                _gate: gate,
            }),
        })
    }

    /// Release a handle (same as [`LockHandle::release`])
    pub fn release(&self, mut handle: LockHandle) {
        handle.release();
    }

    /// Whether this process currently holds the OS lock
    pub fn is_held(&self) -> bool {
        self.backend.is_held()
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> LockStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_failure(&self) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.failed_acquisitions += 1;
    }

    fn record_timeout(&self, waited: Duration, timeout_after: Duration) -> StoreError {
        self.record_failure();
        warn!(
            "Timed out after {:?} waiting for store lock (timeout {:?})",
            waited, timeout_after
        );
        if let Some(events) = &self.events {
            events
                .emit(CoreEvent::Store(StoreEvent::LockTimedOut {
                    waited_ms: waited.as_millis() as u64,
                    timeout_ms: timeout_after.as_millis() as u64,
                }))
                .ok();
        }
        StoreError::LockTimeout {
            waited,
            timeout: timeout_after,
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("options", &self.options)
            .field("held", &self.is_held())
            .finish()
    }
}
