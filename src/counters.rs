//! Process-wide event counters.
//!
//! Counters are cheap relaxed atomics; they exist for observability and
//! tests, never for control flow. Per-transaction statistics (working-set
//! maxima, large-instance counts) live on the transaction itself, see
//! [`Transaction::txn_counters`](crate::Transaction::txn_counters).

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// A named, monotonically increasing event counter.
pub struct EventCounter {
    name: &'static str,
    value: CachePadded<AtomicU64>,
}

impl EventCounter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A write-set entry was not marked as an insert but the index had no
/// mapping for its key, forcing the insert path.
pub static EVT_DBTUPLE_WRITE_SEARCH_FAILED: EventCounter =
    EventCounter::new("dbtuple_write_search_failed");

/// An insert-path `insert_if_absent` lost the race to another thread.
pub static EVT_DBTUPLE_WRITE_INSERT_FAILED: EventCounter =
    EventCounter::new("dbtuple_write_insert_failed");

/// A published write did not fit its tuple's inline capacity and the index
/// mapping was swapped to a replacement tuple.
pub static EVT_DBTUPLE_LATEST_REPLACEMENT: EventCounter =
    EventCounter::new("dbtuple_latest_replacement");

/// Working-set lookups performed before consulting the shared index.
pub static EVT_LOCAL_SEARCH_LOOKUPS: EventCounter = EventCounter::new("local_search_lookups");

/// Working-set lookups answered by the write set.
pub static EVT_LOCAL_SEARCH_WRITE_SET_HITS: EventCounter =
    EventCounter::new("local_search_write_set_hits");

/// Working-set lookups answered by the absent set.
pub static EVT_LOCAL_SEARCH_ABSENT_SET_HITS: EventCounter =
    EventCounter::new("local_search_absent_set_hits");

/// All counters, for dumping.
pub fn all() -> [&'static EventCounter; 6] {
    [
        &EVT_DBTUPLE_WRITE_SEARCH_FAILED,
        &EVT_DBTUPLE_WRITE_INSERT_FAILED,
        &EVT_DBTUPLE_LATEST_REPLACEMENT,
        &EVT_LOCAL_SEARCH_LOOKUPS,
        &EVT_LOCAL_SEARCH_WRITE_SET_HITS,
        &EVT_LOCAL_SEARCH_ABSENT_SET_HITS,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotone() {
        let before = EVT_LOCAL_SEARCH_LOOKUPS.get();
        EVT_LOCAL_SEARCH_LOOKUPS.inc();
        EVT_LOCAL_SEARCH_LOOKUPS.inc();
        assert!(EVT_LOCAL_SEARCH_LOOKUPS.get() >= before + 2);
    }

    #[test]
    fn all_have_distinct_names() {
        let names: Vec<_> = all().iter().map(|c| c.name()).collect();
        let mut dedup = names.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(names.len(), dedup.len());
    }
}
