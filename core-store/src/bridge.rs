//! Blocking-call bridge for the synchronous storage client.
//!
//! The client is shared as `Arc<Mutex<Box<dyn StorageClient>>>` and only
//! ever locked and called on a [`BlockingPool`] worker thread, never on an
//! executor thread. The std mutex makes overlapping calls from different
//! workers take turns; the store lock is what makes them take turns across
//! processes.

use bridge_traits::StorageClient;
use core_async::pool::BlockingPool;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Result, StoreError};

type SharedClient = Arc<Mutex<Box<dyn StorageClient>>>;

/// Runs storage client calls on the blocking pool
#[derive(Clone)]
pub struct StorageBridge {
    pool: Arc<BlockingPool>,
    client: SharedClient,
}

impl StorageBridge {
    pub fn new(pool: Arc<BlockingPool>, client: Box<dyn StorageClient>) -> Self {
        Self {
            pool,
            client: Arc::new(Mutex::new(client)),
        }
    }

    /// Run `f` against the client on a pool worker and await its result.
    ///
    /// Client errors are mapped to [`StoreError`]; a panic inside the client
    /// surfaces as `StoreError::WorkerPool`.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StorageClient) -> bridge_traits::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let client = Arc::clone(&self.client);
        let outcome = self
            .pool
            .submit(move || {
                let mut guard = client.lock().unwrap_or_else(PoisonError::into_inner);
                f(&mut **guard)
            })
            .await?;

        outcome.map_err(StoreError::from)
    }

    pub fn pool(&self) -> &Arc<BlockingPool> {
        &self.pool
    }
}

impl std::fmt::Debug for StorageBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBridge")
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStorage;
    use bridge_traits::{BridgeError, Metadata};

    fn bridge(storage: &InMemoryStorage) -> StorageBridge {
        let pool = Arc::new(BlockingPool::new("bridge-test", 2).unwrap());
        StorageBridge::new(pool, Box::new(storage.clone()))
    }

    #[tokio::test]
    async fn test_call_reaches_client_on_worker_thread() {
        let storage = InMemoryStorage::new();
        let bridge = bridge(&storage);

        let thread_name = bridge
            .call(|client| {
                client.put("a", "payload", &Metadata::new())?;
                Ok(std::thread::current().name().map(str::to_string))
            })
            .await
            .unwrap();

        assert!(thread_name.unwrap().starts_with("bridge-test-"));
        assert!(storage.contains("a"));
    }

    #[tokio::test]
    async fn test_client_errors_are_mapped() {
        let storage = InMemoryStorage::new();
        storage.fail_next(1, || BridgeError::Unavailable("compacting".into()));
        let bridge = bridge(&storage);

        let err = bridge
            .call(|client| client.put("a", "p", &Metadata::new()))
            .await
            .unwrap_err();

        assert_eq!(err, StoreError::StorageUnavailable("compacting".into()));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_panic_becomes_pool_error() {
        let storage = InMemoryStorage::new();
        let bridge = bridge(&storage);

        let err = bridge
            .call(|_client| -> bridge_traits::Result<()> { panic!("segfault in disguise") })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::WorkerPool(_)));

        // A poisoned client mutex is recovered on the next call
        bridge
            .call(|client| client.put("b", "p", &Metadata::new()))
            .await
            .unwrap();
        assert!(storage.contains("b"));
    }
}
