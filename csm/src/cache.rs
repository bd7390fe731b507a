use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::metrics::Metrics;

/// Bounded-by-bytes cache from log index to chunk payload.
///
/// Admission charges `len(bytes)` against a global byte budget; eviction is
/// FIFO by insertion order and increments a metric on every eviction.
/// Storage is a `BTreeMap` keyed by index so `remove_up_to`/`remove_above`
/// (used by commit/truncation) are range operations rather than full scans;
/// a side `VecDeque` records insertion order for eviction, since indices are
/// not guaranteed to be inserted in increasing order under all notification
/// sequences (e.g. after a truncation and re-write).
pub struct StateMachineDataCache {
    state: Mutex<CacheState>,
    byte_budget: u64,
    metrics: Arc<Metrics>,
}

struct CacheState {
    entries: BTreeMap<u64, Bytes>,
    insertion_order: VecDeque<u64>,
    total_bytes: u64,
}

impl StateMachineDataCache {
    pub fn new(byte_budget: u64, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: BTreeMap::new(),
                insertion_order: VecDeque::new(),
                total_bytes: 0,
            }),
            byte_budget,
            metrics,
        }
    }

    /// Inserts `(index -> payload)`, evicting the oldest entries (by
    /// insertion order) until the byte budget is satisfied again.
    pub fn insert(&self, index: u64, payload: Bytes) {
        let mut state = self.state.lock();

        if let Some(old) = state.entries.insert(index, payload.clone()) {
            state.total_bytes -= old.len() as u64;
        } else {
            state.insertion_order.push_back(index);
        }
        state.total_bytes += payload.len() as u64;

        while state.total_bytes > self.byte_budget {
            let Some(oldest) = state.insertion_order.pop_front() else {
                break;
            };
            // remove_up_to/remove_above purge insertion_order in lockstep
            // with entries, so the two never drift apart.
            let evicted = state
                .entries
                .remove(&oldest)
                .expect("insertion_order and entries must stay in sync");
            state.total_bytes -= evicted.len() as u64;
            self.metrics.cache_evictions.inc();
        }
    }

    pub fn get(&self, index: u64) -> Option<Bytes> {
        self.state.lock().entries.get(&index).cloned()
    }

    /// Drops all entries with key <= `idx`.
    pub fn remove_up_to(&self, idx: u64) {
        let mut state = self.state.lock();
        let tail = state.entries.split_off(&(idx + 1));
        let removed_bytes: u64 = state.entries.values().map(|b| b.len() as u64).sum();
        state.entries = tail;
        state.total_bytes -= removed_bytes;
        // Keep insertion_order free of keys no longer in entries, or a later
        // re-insert of one of those keys would leave it holding two entries
        // for the same index: the stale one and the fresh one, and eviction
        // would pop the stale record and delete the fresh data it points at.
        state.insertion_order.retain(|k| *k > idx);
    }

    /// Drops all entries with key > `idx` (used on log truncation).
    pub fn remove_above(&self, idx: u64) {
        let mut state = self.state.lock();
        let tail = state.entries.split_off(&(idx + 1));
        let removed_bytes: u64 = tail.values().map(|b| b.len() as u64).sum();
        state.total_bytes -= removed_bytes;
        // `state.entries` already holds only keys <= idx after split_off.
        state.insertion_order.retain(|k| *k <= idx);
    }

    /// Clears the cache entirely (leader step-down).
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.insertion_order.clear();
        state.total_bytes = 0;
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
