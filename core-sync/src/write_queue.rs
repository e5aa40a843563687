//! # Batched Write Queue
//!
//! Decouples chunk production from lock-guarded chunk storage.
//!
//! ## Overview
//!
//! [`BatchWriteQueue::new`] returns two halves:
//!
//! - [`WriteQueueProducer`]: cloneable, [`offer`](WriteQueueProducer::offer)
//!   never waits. A full queue rejects the item and counts the drop.
//! - [`QueueFlusher`]: drains up to `batch_size` items, or whatever arrived
//!   within `flush_interval` of the first one, and writes them with
//!   [`ConcurrentStore::apply_batch`], which takes the store lock once per
//!   batch.
//!
//! The flusher stops when every producer is dropped and the queue is empty,
//! or when its cancellation token fires. Cancellation is checked before each
//! batch; a batch already being written always finishes. Items still queued
//! after cancellation are abandoned and listed in the [`FlushReport`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (producer, flusher) = BatchWriteQueue::new(WriteQueueConfig::from(&config), store, "alpha");
//! let flush = tracker.spawn(flusher.run(cancel.clone()));
//!
//! for job in chunker.chunk(&content, "src/lib.rs", "alpha")? {
//!     if producer.offer(job) == Offer::Dropped {
//!         // recorded against the job's progress
//!     }
//! }
//! drop(producer);
//! let report = flush.await?;
//! ```

use bridge_traits::WriteJob;
use core_async::sync::{mpsc, CancellationToken};
use core_async::time::{sleep_until, Duration, Instant};
use core_runtime::config::SyncEngineConfig;
use core_runtime::events::{CoreEvent, EventBus, StoreEvent};
use core_store::{BatchOutcome, ConcurrentStore};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of [`WriteQueueProducer::offer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Queue full or flusher gone; the item was discarded
    Dropped,
}

/// Queue sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteQueueConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl From<&SyncEngineConfig> for WriteQueueConfig {
    fn from(config: &SyncEngineConfig) -> Self {
        Self {
            capacity: config.queue_capacity,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
        }
    }
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            capacity: core_runtime::config::DEFAULT_QUEUE_CAPACITY,
            batch_size: core_runtime::config::DEFAULT_BATCH_SIZE,
            flush_interval: core_runtime::config::DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Called after every flushed batch
pub type BatchObserver = Arc<dyn Fn(&BatchOutcome) + Send + Sync>;

/// Constructor for the queue halves
pub struct BatchWriteQueue;

impl BatchWriteQueue {
    /// Create a queue owned by `repository`.
    ///
    /// A zero capacity or batch size is raised to 1.
    pub fn new(
        config: WriteQueueConfig,
        store: ConcurrentStore,
        repository: impl Into<String>,
    ) -> (WriteQueueProducer, QueueFlusher) {
        let capacity = config.capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let repository = repository.into();
        let counters = Arc::new(Counters::default());

        let producer = WriteQueueProducer {
            sender,
            capacity,
            repository: repository.clone(),
            counters: Arc::clone(&counters),
        };
        let flusher = QueueFlusher {
            receiver,
            store,
            repository,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            counters,
            observer: None,
            events: None,
        };
        (producer, flusher)
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
}

// ============================================================================
// Producer
// ============================================================================

/// Sending half of the queue
#[derive(Clone)]
pub struct WriteQueueProducer {
    sender: mpsc::Sender<WriteJob>,
    capacity: usize,
    repository: String,
    counters: Arc<Counters>,
}

impl WriteQueueProducer {
    /// Enqueue `job` without waiting
    pub fn offer(&self, job: WriteJob) -> Offer {
        match self.sender.try_send(job) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Offer::Accepted
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Write queue for {} full ({} items), dropped {} (total dropped {})",
                    self.repository, self.capacity, job.id, dropped
                );
                Offer::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Write queue for {} closed, dropped {}", self.repository, job.id);
                Offer::Dropped
            }
        }
    }

    /// Items currently waiting
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn accepted(&self) -> u64 {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WriteQueueProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueueProducer")
            .field("repository", &self.repository)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// Flusher
// ============================================================================

/// Totals of one flusher run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: u64,
    pub lock_acquisitions: u64,
    pub stored: u64,
    pub failed: u64,
    /// Items rejected by the full queue
    pub dropped: u64,
    /// Items left in the queue after cancellation
    pub abandoned: u64,
    /// Source paths with at least one failed item
    pub failed_paths: BTreeSet<String>,
    /// Source paths with at least one abandoned item
    pub abandoned_paths: BTreeSet<String>,
    pub cancelled: bool,
}

impl FlushReport {
    /// Whether every item from `path` reached the store
    pub fn is_path_clean(&self, path: &str) -> bool {
        !self.failed_paths.contains(path) && !self.abandoned_paths.contains(path)
    }

    fn absorb(&mut self, outcome: &BatchOutcome) {
        self.batches += 1;
        if outcome.lock_acquired {
            self.lock_acquisitions += 1;
        }
        for item in &outcome.items {
            if item.is_ok() {
                self.stored += 1;
            } else {
                self.failed += 1;
                self.failed_paths.insert(item.source_path.clone());
            }
        }
    }
}

/// Receiving half of the queue
pub struct QueueFlusher {
    receiver: mpsc::Receiver<WriteJob>,
    store: ConcurrentStore,
    repository: String,
    batch_size: usize,
    flush_interval: Duration,
    counters: Arc<Counters>,
    observer: Option<BatchObserver>,
    events: Option<EventBus>,
}

impl QueueFlusher {
    /// Call `observer` after every batch
    pub fn on_batch(mut self, observer: BatchObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Publish `BatchFlushed` events on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Drain and flush until the producers are gone or `cancel` fires
    #[instrument(skip(self, cancel), fields(repository = %self.repository))]
    pub async fn run(mut self, cancel: CancellationToken) -> FlushReport {
        let mut report = FlushReport::default();
        let mut batch: Vec<WriteJob> = Vec::with_capacity(self.batch_size);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let first = core_async::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = self.receiver.recv() => job,
            };
            let Some(first) = first else {
                break;
            };
            batch.push(first);

            let closed = self.fill(&mut batch, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }

            let outcome = self.store.apply_batch(std::mem::take(&mut batch)).await;
            self.publish(&outcome);
            report.absorb(&outcome);

            if closed {
                break;
            }
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            self.abandon(batch, &mut report);
        }

        report.dropped = self.counters.dropped.load(Ordering::Relaxed);
        info!(
            "Write queue for {} finished: {} batches, {} stored, {} failed, {} dropped, {} abandoned",
            self.repository,
            report.batches,
            report.stored,
            report.failed,
            report.dropped,
            report.abandoned
        );
        report
    }

    /// Add items to `batch` until it is full, the flush interval since the
    /// first item passes, or cancellation. Returns whether the queue closed.
    async fn fill(&mut self, batch: &mut Vec<WriteJob>, cancel: &CancellationToken) -> bool {
        // An interval too large to represent never fires
        let deadline = Instant::now().checked_add(self.flush_interval);
        while batch.len() < self.batch_size {
            // Take what is already queued before looking at the clock
            match self.receiver.try_recv() {
                Ok(job) => {
                    batch.push(job);
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            core_async::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => return false,
                job = self.receiver.recv() => match job {
                    Some(job) => batch.push(job),
                    None => return true,
                },
            }
        }
        false
    }

    fn abandon(&mut self, pending: Vec<WriteJob>, report: &mut FlushReport) {
        self.receiver.close();
        let mut count = 0;
        for job in pending {
            count += 1;
            report.abandoned_paths.insert(job.source_path);
        }
        while let Ok(job) = self.receiver.try_recv() {
            count += 1;
            report.abandoned_paths.insert(job.source_path);
        }
        report.abandoned += count;
        if count > 0 {
            warn!(
                "Abandoned {} queued items for {} after cancellation",
                count, self.repository
            );
        }
    }

    fn publish(&self, outcome: &BatchOutcome) {
        debug!(
            "Flushed batch for {}: {} stored, {} failed",
            self.repository,
            outcome.stored(),
            outcome.failed()
        );
        if let Some(observer) = &self.observer {
            observer(outcome);
        }
        if let Some(events) = &self.events {
            events
                .emit(CoreEvent::Store(StoreEvent::BatchFlushed {
                    repository: self.repository.clone(),
                    stored: outcome.stored() as u64,
                    failed: outcome.failed() as u64,
                    lock_wait_ms: outcome.lock_wait.as_millis() as u64,
                }))
                .ok();
        }
    }
}

impl std::fmt::Debug for QueueFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueFlusher")
            .field("repository", &self.repository)
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}
