//! # Concurrent Store
//!
//! Safe access to the shared store for foreground requests and for batch
//! flushes.
//!
//! ## Foreground path
//!
//! `put`, `get`, `delete` and `query` each run inside the retry policy. One
//! attempt is: acquire the store lock, make one bridge call, release. A lock
//! timeout or a temporarily unavailable store is retried; invalid input and
//! corruption are returned at once. After the last attempt the caller sees
//! `StoreError::RetryExhausted`. A foreground call therefore never waits
//! longer than `max_attempts * lock_timeout` plus backoff.
//!
//! ## Batch path
//!
//! [`ConcurrentStore::apply_batch`] takes the lock once (retried), writes
//! every item under that single hold with one retried bridge call each, then
//! releases. Item failures are reported per item and do not stop the batch.
//! If the lock cannot be taken at all, every item fails with the lock error.

use bridge_traits::{Metadata, QueryFilter, StorageClient, StoredRecord, WriteJob, WriteKind};
use core_async::time::{Duration, Instant};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::bridge::StorageBridge;
use crate::error::{Result, StoreError};
use crate::lock::{LockManager, LockStats};
use crate::retry::RetryPolicy;

/// Metadata keys added to every stored chunk
pub const META_REPOSITORY: &str = "repository";
pub const META_SOURCE_PATH: &str = "source_path";

/// Result of writing one queued item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub id: String,
    pub source_path: String,
    pub kind: WriteKind,
    /// Bridge calls made for this item (0 when the lock was never taken)
    pub attempts: u32,
    pub result: std::result::Result<(), StoreError>,
}

impl ItemOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Result of one [`ConcurrentStore::apply_batch`] call
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub items: Vec<ItemOutcome>,
    /// Whether the lock was taken for this batch
    pub lock_acquired: bool,
    /// Lock acquisition attempts made (successful or not)
    pub lock_attempts: u32,
    pub lock_wait: Duration,
}

impl BatchOutcome {
    pub fn stored(&self) -> usize {
        self.items.iter().filter(|i| i.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.stored()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| !i.is_ok())
    }

    fn all_failed(jobs: Vec<WriteJob>, error: StoreError, lock_attempts: u32, lock_wait: Duration) -> Self {
        let items = jobs
            .into_iter()
            .map(|job| ItemOutcome {
                id: job.id,
                source_path: job.source_path,
                kind: job.kind,
                attempts: 0,
                result: Err(error.clone()),
            })
            .collect();
        Self {
            items,
            lock_acquired: false,
            lock_attempts,
            lock_wait,
        }
    }
}

/// Lock-guarded, retried access to the storage client
#[derive(Clone)]
pub struct ConcurrentStore {
    locks: Arc<LockManager>,
    bridge: StorageBridge,
    retry: RetryPolicy,
    lock_timeout: Duration,
}

impl ConcurrentStore {
    pub fn new(locks: Arc<LockManager>, bridge: StorageBridge, retry: RetryPolicy) -> Self {
        let lock_timeout = locks.options().default_timeout;
        Self {
            locks,
            bridge,
            retry,
            lock_timeout,
        }
    }

    /// Override the per-attempt lock timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn lock_stats(&self) -> LockStats {
        self.locks.stats()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    // ========================================================================
    // Foreground operations
    // ========================================================================

    /// Store `payload` under `id`
    #[instrument(skip(self, payload, metadata), fields(id = %id))]
    pub async fn put(&self, id: &str, payload: &str, metadata: Metadata) -> Result<()> {
        validate_id(id)?;
        let id = id.to_string();
        let payload = payload.to_string();
        self.locked_call(move |client| client.put(&id, &payload, &metadata))
            .await
    }

    /// Fetch `id`
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` when no record has this id.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn get(&self, id: &str) -> Result<StoredRecord> {
        validate_id(id)?;
        let key = id.to_string();
        self.locked_call(move |client| client.get(&key))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Remove `id`; removing an unknown id succeeds
    #[instrument(skip(self), fields(id = %id))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let id = id.to_string();
        self.locked_call(move |client| client.delete(&id)).await
    }

    /// Records matching `filter`
    #[instrument(skip(self, filter))]
    pub async fn query(&self, filter: QueryFilter) -> Result<Vec<StoredRecord>> {
        self.locked_call(move |client| client.query(&filter)).await
    }

    async fn locked_call<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&mut dyn StorageClient) -> bridge_traits::Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let outcome = self
            .retry
            .run(
                |_attempt| {
                    let f = f.clone();
                    async move {
                        let mut handle = self.locks.acquire(self.lock_timeout).await?;
                        let result = self.bridge.call(f).await;
                        handle.release();
                        result
                    }
                },
                StoreError::is_transient,
            )
            .await;

        match outcome {
            Ok(retried) => {
                if retried.attempts > 1 {
                    debug!("Store call succeeded on attempt {}", retried.attempts);
                }
                Ok(retried.value)
            }
            Err(e) => {
                let err = StoreError::from(e);
                warn!("Store call failed: {}", err);
                Err(err)
            }
        }
    }

    // ========================================================================
    // Batch path
    // ========================================================================

    /// Write `jobs` under one lock hold.
    ///
    /// Never fails as a whole: every job gets an [`ItemOutcome`].
    #[instrument(skip(self, jobs), fields(items = jobs.len()))]
    pub async fn apply_batch(&self, jobs: Vec<WriteJob>) -> BatchOutcome {
        let started = Instant::now();
        let lock = self
            .retry
            .run(
                |_attempt| self.locks.acquire(self.lock_timeout),
                StoreError::is_transient,
            )
            .await;

        let (mut handle, lock_attempts) = match lock {
            Ok(retried) => (retried.value, retried.attempts),
            Err(e) => {
                let attempts = e.attempts();
                let err = StoreError::from(e);
                warn!("Batch of {} items could not take the store lock: {}", jobs.len(), err);
                return BatchOutcome::all_failed(jobs, err, attempts, started.elapsed());
            }
        };
        let lock_wait = started.elapsed();

        let mut items = Vec::with_capacity(jobs.len());
        for job in jobs {
            let outcome = self
                .retry
                .run(
                    |_attempt| {
                        let job = job.clone();
                        self.bridge.call(move |client| apply_job(client, &job))
                    },
                    StoreError::is_transient,
                )
                .await;

            let (attempts, result) = match outcome {
                Ok(retried) => (retried.attempts, Ok(())),
                Err(e) => {
                    let attempts = e.attempts();
                    let err = StoreError::from(e);
                    warn!("Failed to write {} from {}: {}", job.id, job.source_path, err);
                    (attempts, Err(err))
                }
            };

            items.push(ItemOutcome {
                id: job.id,
                source_path: job.source_path,
                kind: job.kind,
                attempts,
                result,
            });
        }

        handle.release();

        let outcome = BatchOutcome {
            items,
            lock_acquired: true,
            lock_attempts,
            lock_wait,
        };
        debug!(
            "Batch applied: {} stored, {} failed, lock wait {:?}",
            outcome.stored(),
            outcome.failed(),
            lock_wait
        );
        outcome
    }
}

impl std::fmt::Debug for ConcurrentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentStore")
            .field("retry", &self.retry)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(StoreError::InvalidInput("record id cannot be empty".to_string()));
    }
    Ok(())
}

fn apply_job(client: &mut dyn StorageClient, job: &WriteJob) -> bridge_traits::Result<()> {
    match job.kind {
        WriteKind::Tombstone => client.delete(&job.id),
        WriteKind::Upsert => {
            let mut metadata = job.metadata.clone();
            metadata
                .entry(META_REPOSITORY.to_string())
                .or_insert_with(|| job.repository.clone().into());
            metadata
                .entry(META_SOURCE_PATH.to_string())
                .or_insert_with(|| job.source_path.clone().into());
            client.put(&job.id, &job.payload, &metadata)
        }
    }
}
