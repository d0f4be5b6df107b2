//! The engine: named tables and transaction construction.
//!
//! # Examples
//!
//! ```
//! use occmap::{Engine, TxnFlags};
//!
//! let engine = Engine::new();
//! let table = engine.open_table("kv");
//!
//! let mut txn = engine.begin(TxnFlags::NONE);
//! txn.put(&table, b"k", b"v").unwrap();
//! txn.commit().unwrap();
//!
//! let mut txn = engine.begin(TxnFlags::NONE);
//! assert_eq!(txn.get(&table, b"k").unwrap(), Some(b"v".to_vec()));
//! txn.commit().unwrap();
//! ```

use std::sync::Arc;

use dashmap::DashMap;

use crate::index::OrderedIndex;
use crate::protocol::{GcNotice, GcQueue, LatestOcc, SnapshotOcc, TidSource};
use crate::txn::{Transaction, TxnFlags};

/// A named ordered table: the index plus its write-shape hint.
pub struct Table {
    name: String,
    pub(crate) index: OrderedIndex,
    mostly_append: bool,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mostly-append tables allocate tuples without capacity slack.
    pub(crate) fn mostly_append(&self) -> bool {
        self.mostly_append
    }

    /// Approximate number of keys, including logically deleted ones whose
    /// tuples have not been reclaimed.
    pub fn approximate_len(&self) -> usize {
        self.index.len()
    }
}

/// The shared store: a registry of tables plus the tid and GC state every
/// transaction's protocol hangs off.
pub struct Engine {
    tables: DashMap<String, Arc<Table>>,
    tids: Arc<TidSource>,
    gc: Arc<GcQueue>,
    keep_history: bool,
}

impl Engine {
    /// An engine that preserves superseded versions, so snapshot
    /// transactions can coexist with latest-mode writers.
    pub fn new() -> Self {
        Self::with_history(true)
    }

    /// `keep_history = false` overwrites versions in place and supports
    /// only latest-mode transactions.
    pub fn with_history(keep_history: bool) -> Self {
        Self {
            tables: DashMap::new(),
            tids: Arc::new(TidSource::new()),
            gc: Arc::new(GcQueue::new()),
            keep_history,
        }
    }

    /// Opens (creating if needed) a table.
    pub fn open_table(&self, name: &str) -> Arc<Table> {
        self.open_table_with(name, false)
    }

    /// Opens a table with an explicit mostly-append hint. The hint is fixed
    /// at creation; reopening ignores it.
    pub fn open_table_with(&self, name: &str, mostly_append: bool) -> Arc<Table> {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Table {
                    name: name.to_string(),
                    index: OrderedIndex::new(),
                    mostly_append,
                })
            })
            .clone()
    }

    /// Begins a latest-mode transaction: reads validate against the latest
    /// versions at commit.
    pub fn begin(&self, flags: TxnFlags) -> Transaction<LatestOcc> {
        Transaction::new(
            LatestOcc::new(self.tids.clone(), self.gc.clone(), self.keep_history),
            flags,
        )
    }

    /// Begins a snapshot transaction serialized at the current retired-tid
    /// frontier. Requires history, see [`Engine::with_history`].
    pub fn begin_snapshot(&self, flags: TxnFlags) -> Transaction<SnapshotOcc> {
        assert!(
            self.keep_history,
            "snapshot transactions need version history"
        );
        Transaction::new(
            SnapshotOcc::new(self.tids.clone(), self.gc.clone(), self.keep_history),
            flags,
        )
    }

    /// Takes the pending spill notices (old version tails needing GC).
    pub fn drain_spills(&self) -> Vec<GcNotice> {
        self.gc.drain_spills()
    }

    /// Takes the pending logical-delete notices.
    pub fn drain_deletes(&self) -> Vec<GcNotice> {
        self.gc.drain_deletes()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
