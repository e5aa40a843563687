//! # Blocking Worker Pool
//!
//! A fixed set of named OS threads that run synchronous closures on behalf of
//! async callers.
//!
//! ## Overview
//!
//! Some collaborators (the storage client in particular) are synchronous and
//! may block on disk I/O for a long time. Calling them on an executor thread
//! stalls every other task scheduled there. [`BlockingPool::submit`] moves the
//! closure onto a dedicated worker and suspends the caller until the worker
//! sends the result back over a oneshot channel.
//!
//! Unlike `spawn_blocking`, the number of threads is fixed, so a burst of
//! submissions queues up instead of spawning hundreds of threads that all
//! contend on the same non-reentrant client.
//!
//! ## Ordering
//!
//! Jobs are dequeued in submission order, but with more than one worker two
//! jobs may run at the same time and finish in any order. Callers that need
//! ordering must serialize through one logical caller.
//!
//! ## Usage
//!
//! ```rust
//! use core_async::pool::BlockingPool;
//!
//! # async fn example() -> Result<(), core_async::pool::PoolError> {
//! let pool = BlockingPool::new("storage", 4)?;
//! let len = pool.submit(|| std::fs::read_dir(".").map(|d| d.count())).await?;
//! pool.shutdown();
//! # let _ = len;
//! # Ok(())
//! # }
//! ```

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Pending jobs allowed per worker before `submit` reports saturation.
const QUEUE_DEPTH_PER_WORKER: usize = 256;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool must have at least one worker")]
    NoWorkers,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("Worker pool '{0}' is shut down")]
    ShutDown(String),

    #[error("Worker pool '{0}' queue is full")]
    Saturated(String),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Worker dropped the job before replying")]
    WorkerLost,
}

impl PoolError {
    /// Saturation clears on its own once workers drain the queue.
    pub fn is_transient(&self) -> bool {
        matches!(self, PoolError::Saturated(_))
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Fixed-size pool of blocking worker threads
pub struct BlockingPool {
    name: String,
    size: usize,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl BlockingPool {
    /// Spawn `workers` threads named `<name>-<index>`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoWorkers` for a zero-sized pool and
    /// `PoolError::Spawn` if the OS refuses to create a thread.
    pub fn new(name: impl Into<String>, workers: usize) -> Result<Self> {
        let name = name.into();
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (sender, receiver) = crossbeam_channel::bounded::<Job>(workers * QUEUE_DEPTH_PER_WORKER);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let receiver = receiver.clone();
            let in_flight = Arc::clone(&in_flight);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(receiver, in_flight))
                .map_err(|e| PoolError::Spawn(e.to_string()))?;
            handles.push(handle);
        }

        info!("Started blocking pool '{}' with {} workers", name, workers);

        Ok(Self {
            name,
            size: workers,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            in_flight,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently executing on a worker
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `f` on a worker thread and await its result.
    ///
    /// A panic inside `f` is caught on the worker and returned as
    /// `PoolError::Panicked`; the worker keeps serving the queue.
    pub async fn submit<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            // The caller may have been cancelled; nobody is left to tell.
            let _ = tx.send(outcome);
        });

        self.enqueue(job)?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                error!("Job on pool '{}' panicked: {}", self.name, message);
                Err(PoolError::Panicked(message))
            }
            Err(_) => Err(PoolError::WorkerLost),
        }
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard
            .as_ref()
            .ok_or_else(|| PoolError::ShutDown(self.name.clone()))?;

        sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!("Blocking pool '{}' is saturated", self.name);
                PoolError::Saturated(self.name.clone())
            }
            TrySendError::Disconnected(_) => PoolError::ShutDown(self.name.clone()),
        })
    }

    /// Stop accepting work, let queued jobs finish and join every worker.
    ///
    /// Blocks the calling thread; async callers should run it through
    /// `spawn_blocking`. Calling it twice is a no-op.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread of pool '{}' exited abnormally", self.name);
            }
        }

        info!("Blocking pool '{}' shut down", self.name);
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        // Disconnect so detached workers exit once the queue is drained.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn worker_loop(receiver: Receiver<Job>, in_flight: Arc<AtomicUsize>) {
    while let Ok(job) = receiver.recv() {
        in_flight.fetch_add(1, Ordering::SeqCst);
        job();
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(
        "Worker {} exiting",
        thread::current().name().unwrap_or("unnamed")
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_workers_rejected() {
        assert_eq!(BlockingPool::new("empty", 0).unwrap_err(), PoolError::NoWorkers);
    }

    #[tokio::test]
    async fn test_submit_returns_value() {
        let pool = BlockingPool::new("test", 2).unwrap();
        let value = pool.submit(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_runs_on_named_worker_thread() {
        let pool = BlockingPool::new("named", 1).unwrap();
        let name = pool
            .submit(|| thread::current().name().map(str::to_string))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("named-0"));
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_panic_is_reported_and_worker_survives() {
        let pool = BlockingPool::new("panicky", 1).unwrap();

        let err = pool
            .submit(|| -> u32 { panic!("storage exploded") })
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::Panicked("storage exploded".to_string()));

        // Same single worker still serves jobs
        assert_eq!(pool.submit(|| 7).await.unwrap(), 7);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = BlockingPool::new("closed", 1).unwrap();
        pool.shutdown();
        assert!(pool.is_shut_down());

        let err = pool.submit(|| ()).await.unwrap_err();
        assert!(matches!(err, PoolError::ShutDown(_)));

        // Second shutdown is a no-op
        pool.shutdown();
    }

    #[test]
    fn test_transient_classification() {
        assert!(PoolError::Saturated("p".into()).is_transient());
        assert!(!PoolError::ShutDown("p".into()).is_transient());
        assert!(!PoolError::Panicked("boom".into()).is_transient());
    }
}
