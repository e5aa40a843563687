//! In-memory storage client.
//!
//! A [`StorageClient`] backed by a `BTreeMap`. Clones share the same data, so
//! a test can hand one clone to the engine and inspect or script the other.
//! Besides plain storage it offers:
//!
//! - failure injection ([`InMemoryStorage::fail_next`])
//! - simulated latency ([`InMemoryStorage::set_latency`])
//! - call counters and a peak-overlap gauge, to check that calls never
//!   overlap on the non-reentrant client

use bridge_traits::{BridgeError, Metadata, QueryFilter, StorageClient, StoredRecord};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Number of calls per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub puts: usize,
    pub gets: usize,
    pub deletes: usize,
    pub queries: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.puts + self.gets + self.deletes + self.queries
    }
}

#[derive(Default)]
struct State {
    records: BTreeMap<String, StoredRecord>,
    failures: VecDeque<fn() -> BridgeError>,
    latency: Duration,
    calls: CallCounts,
}

/// Shared in-memory store
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
    active_calls: Arc<AtomicUsize>,
    peak_calls: Arc<AtomicUsize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` calls (of any kind) with `make()`
    pub fn fail_next(&self, count: usize, make: fn() -> BridgeError) {
        let mut state = self.state();
        state.failures.extend(std::iter::repeat(make).take(count));
    }

    /// Sleep this long inside every call
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state().records.contains_key(id)
    }

    pub fn record(&self, id: &str) -> Option<StoredRecord> {
        self.state().records.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.state().records.keys().cloned().collect()
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Highest number of calls that were inside the client at once
    pub fn peak_concurrent_calls(&self) -> usize {
        self.peak_calls.load(Ordering::SeqCst)
    }

    fn enter<T>(&self, count: impl FnOnce(&mut CallCounts), body: impl FnOnce(&mut State) -> T) -> Result<T, BridgeError> {
        let now = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_calls.fetch_max(now, Ordering::SeqCst);

        let (failure, latency) = {
            let mut state = self.state();
            count(&mut state.calls);
            (state.failures.pop_front(), state.latency)
        };

        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let result = match failure {
            Some(make) => Err(make()),
            None => Ok(body(&mut self.state())),
        };

        self.active_calls.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl StorageClient for InMemoryStorage {
    fn put(&mut self, id: &str, payload: &str, metadata: &Metadata) -> Result<(), BridgeError> {
        if id.is_empty() {
            return Err(BridgeError::InvalidInput("record id cannot be empty".to_string()));
        }
        let record = StoredRecord {
            id: id.to_string(),
            payload: payload.to_string(),
            metadata: metadata.clone(),
        };
        self.enter(
            |c| c.puts += 1,
            move |state| {
                state.records.insert(record.id.clone(), record);
            },
        )
    }

    fn get(&mut self, id: &str) -> Result<Option<StoredRecord>, BridgeError> {
        self.enter(|c| c.gets += 1, |state| state.records.get(id).cloned())
    }

    fn delete(&mut self, id: &str) -> Result<(), BridgeError> {
        self.enter(
            |c| c.deletes += 1,
            |state| {
                state.records.remove(id);
            },
        )
    }

    fn query(&mut self, filter: &QueryFilter) -> Result<Vec<StoredRecord>, BridgeError> {
        self.enter(
            |c| c.queries += 1,
            |state| {
                let matches = state.records.values().filter(|r| filter.matches(r)).cloned();
                match filter.limit {
                    Some(limit) => matches.take(limit).collect(),
                    None => matches.collect(),
                }
            },
        )
    }
}

impl std::fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("records", &self.len())
            .field("calls", &self.calls())
            .finish()
    }
}
