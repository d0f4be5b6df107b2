//! The commit-protocol policy capability.
//!
//! A transaction is parameterized by a [`Protocol`] value that decides how
//! tids are generated and which versions are visible, and that receives the
//! post-commit GC signals. The engine ships two policies over one shared
//! [`TidSource`]: [`LatestOcc`], which validates reads against the latest
//! versions at commit, and [`SnapshotOcc`], which serializes the
//! transaction at the tid frontier observed when it began.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;

use crate::db::Table;
use crate::tuple::TupleRef;
use crate::{Tid, NIL_TID};

/// Commit-policy capability consulted by the transaction engine.
pub trait Protocol {
    /// The optional read timestamp. `None` means the read path validates
    /// against latest versions at commit time instead.
    fn consistent_snapshot_tid(&self) -> Option<Tid>;

    /// Whether a version written at `tid` is visible to this transaction.
    /// Called during reads and, conservatively, on locked write targets.
    fn can_read_tid(&mut self, tid: Tid) -> bool;

    /// Whether superseded versions must be preserved in the chain tail.
    fn wants_old_versions(&self) -> bool;

    /// Generates this transaction's commit tid: strictly greater than every
    /// version among the locked write targets and every tid this policy
    /// value observed, and monotone per writer.
    fn gen_commit_tid(&mut self, target_versions: &[Tid]) -> Tid;

    /// Retires a generated tid. Runs on commit and on abort alike; a
    /// reserved tid must be retired either way.
    fn on_tid_finish(&mut self, tid: Tid);

    /// An older version tail now needs GC attention.
    fn on_tuple_spill(&mut self, table: &Arc<Table>, key: &[u8], latest: TupleRef);

    /// A key was logically deleted and may be physically reclaimed after
    /// quiescence.
    fn on_logical_delete(&mut self, table: &Arc<Table>, key: &[u8], latest: TupleRef);
}

/// Shared tid allocation state: a global allocation counter plus the
/// gapless frontier of retired (finished) tids that snapshots read at.
///
/// A reserved tid stays outstanding until its transaction retires it
/// (commit or abort alike), and the frontier never advances past the
/// lowest outstanding tid. Without that, a higher unrelated tid retiring
/// first would let a fresh snapshot cut through a lower-tid commit that is
/// still publishing its writes.
pub struct TidSource {
    frontier: CachePadded<AtomicU64>,
    ledger: Mutex<TidLedger>,
}

struct TidLedger {
    last_allocated: Tid,
    /// Reserved tids whose transactions have not finished yet.
    outstanding: BTreeSet<Tid>,
}

impl TidSource {
    pub fn new() -> Self {
        Self {
            frontier: CachePadded::new(AtomicU64::new(NIL_TID)),
            ledger: Mutex::new(TidLedger {
                last_allocated: NIL_TID,
                outstanding: BTreeSet::new(),
            }),
        }
    }

    /// Allocates a tid strictly greater than both `floor` and every tid
    /// allocated so far, and marks it outstanding until retired.
    pub fn allocate(&self, floor: Tid) -> Tid {
        let mut ledger = self.ledger.lock().unwrap();
        let tid = ledger.last_allocated.max(floor) + 1;
        ledger.last_allocated = tid;
        ledger.outstanding.insert(tid);
        tid
    }

    /// Marks `tid` finished. The frontier advances to just below the
    /// lowest tid still outstanding, so retirement is gapless.
    pub fn retire(&self, tid: Tid) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.outstanding.remove(&tid);
        let frontier = match ledger.outstanding.first() {
            Some(&lowest) => lowest - 1,
            None => ledger.last_allocated,
        };
        self.frontier.store(frontier, Ordering::Release);
    }

    /// The newest tid whose effects, and those of every tid below it, are
    /// fully published; new snapshots read at this frontier.
    pub fn snapshot_frontier(&self) -> Tid {
        self.frontier.load(Ordering::Acquire)
    }
}

impl Default for TidSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A post-commit GC notice: which key of which table needs attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcNotice {
    pub table: String,
    pub key: Box<[u8]>,
}

/// Queue of GC notices produced by the protocol hooks.
///
/// Physical reclamation is the environment's job; the engine only reports.
/// A write that both spills and deletes produces both notices, in
/// unspecified relative order.
pub struct GcQueue {
    spills: Mutex<Vec<GcNotice>>,
    deletes: Mutex<Vec<GcNotice>>,
}

impl GcQueue {
    pub fn new() -> Self {
        Self {
            spills: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }

    fn push_spill(&self, notice: GcNotice) {
        self.spills.lock().unwrap().push(notice);
    }

    fn push_delete(&self, notice: GcNotice) {
        self.deletes.lock().unwrap().push(notice);
    }

    /// Takes all pending spill notices.
    pub fn drain_spills(&self) -> Vec<GcNotice> {
        std::mem::take(&mut *self.spills.lock().unwrap())
    }

    /// Takes all pending logical-delete notices.
    pub fn drain_deletes(&self) -> Vec<GcNotice> {
        std::mem::take(&mut *self.deletes.lock().unwrap())
    }
}

impl Default for GcQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest-at-validation policy: no snapshot, every tid readable, reads
/// validated against the latest versions during commit.
pub struct LatestOcc {
    shared: Arc<TidSource>,
    gc: Arc<GcQueue>,
    keep_history: bool,
    last_commit_tid: Tid,
    max_observed: Tid,
}

impl LatestOcc {
    pub fn new(shared: Arc<TidSource>, gc: Arc<GcQueue>, keep_history: bool) -> Self {
        Self {
            shared,
            gc,
            keep_history,
            last_commit_tid: NIL_TID,
            max_observed: NIL_TID,
        }
    }
}

impl Protocol for LatestOcc {
    fn consistent_snapshot_tid(&self) -> Option<Tid> {
        None
    }

    fn can_read_tid(&mut self, tid: Tid) -> bool {
        self.max_observed = self.max_observed.max(tid);
        true
    }

    fn wants_old_versions(&self) -> bool {
        self.keep_history
    }

    fn gen_commit_tid(&mut self, target_versions: &[Tid]) -> Tid {
        let floor = target_versions
            .iter()
            .copied()
            .fold(self.last_commit_tid.max(self.max_observed), Tid::max);
        let tid = self.shared.allocate(floor);
        self.last_commit_tid = tid;
        tid
    }

    fn on_tid_finish(&mut self, tid: Tid) {
        self.shared.retire(tid);
    }

    fn on_tuple_spill(&mut self, table: &Arc<Table>, key: &[u8], _latest: TupleRef) {
        self.gc.push_spill(GcNotice {
            table: table.name().to_string(),
            key: key.into(),
        });
    }

    fn on_logical_delete(&mut self, table: &Arc<Table>, key: &[u8], _latest: TupleRef) {
        self.gc.push_delete(GcNotice {
            table: table.name().to_string(),
            key: key.into(),
        });
    }
}

/// Snapshot policy: reads are answered as of the retired-tid frontier at
/// transaction begin, and writes conflict with anything newer.
pub struct SnapshotOcc {
    inner: LatestOcc,
    snapshot: Tid,
}

impl SnapshotOcc {
    pub fn new(shared: Arc<TidSource>, gc: Arc<GcQueue>, keep_history: bool) -> Self {
        let snapshot = shared.snapshot_frontier();
        Self {
            inner: LatestOcc::new(shared, gc, keep_history),
            snapshot,
        }
    }
}

impl Protocol for SnapshotOcc {
    fn consistent_snapshot_tid(&self) -> Option<Tid> {
        Some(self.snapshot)
    }

    fn can_read_tid(&mut self, tid: Tid) -> bool {
        self.inner.max_observed = self.inner.max_observed.max(tid);
        tid <= self.snapshot
    }

    fn wants_old_versions(&self) -> bool {
        self.inner.wants_old_versions()
    }

    fn gen_commit_tid(&mut self, target_versions: &[Tid]) -> Tid {
        let tid = self.inner.gen_commit_tid(target_versions);
        debug_assert!(tid > self.snapshot);
        tid
    }

    fn on_tid_finish(&mut self, tid: Tid) {
        self.inner.on_tid_finish(tid);
    }

    fn on_tuple_spill(&mut self, table: &Arc<Table>, key: &[u8], latest: TupleRef) {
        self.inner.on_tuple_spill(table, key, latest);
    }

    fn on_logical_delete(&mut self, table: &Arc<Table>, key: &[u8], latest: TupleRef) {
        self.inner.on_logical_delete(table, key, latest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_strictly_monotone_and_exceeds_floor() {
        let src = TidSource::new();
        let a = src.allocate(NIL_TID);
        let b = src.allocate(NIL_TID);
        assert!(b > a);
        let c = src.allocate(1000);
        assert!(c > 1000);
        let d = src.allocate(NIL_TID);
        assert!(d > c);
    }

    #[test]
    fn snapshot_frontier_follows_retirement() {
        let src = TidSource::new();
        assert_eq!(src.snapshot_frontier(), NIL_TID);
        let t = src.allocate(NIL_TID);
        src.retire(t);
        assert_eq!(src.snapshot_frontier(), t);
        // Retiring an older tid never moves the frontier backwards.
        src.retire(NIL_TID);
        assert_eq!(src.snapshot_frontier(), t);
    }

    #[test]
    fn frontier_waits_for_the_lowest_outstanding_tid() {
        let src = TidSource::new();
        let a = src.allocate(NIL_TID);
        let b = src.allocate(NIL_TID);
        assert_eq!(src.snapshot_frontier(), NIL_TID);
        // The higher tid finishing first must not open a hole over `a`:
        // a snapshot taken now would otherwise race `a`'s publication.
        src.retire(b);
        assert_eq!(src.snapshot_frontier(), a - 1);
        src.retire(a);
        assert_eq!(src.snapshot_frontier(), b);
    }

    #[test]
    fn commit_tid_exceeds_observed_versions() {
        let src = Arc::new(TidSource::new());
        let gc = Arc::new(GcQueue::new());
        let mut p = LatestOcc::new(src, gc, true);
        assert!(p.can_read_tid(41));
        let tid = p.gen_commit_tid(&[17, 39]);
        assert!(tid > 41);
        let next = p.gen_commit_tid(&[]);
        assert!(next > tid);
    }

    #[test]
    fn snapshot_policy_hides_newer_tids() {
        let src = Arc::new(TidSource::new());
        let gc = Arc::new(GcQueue::new());
        let t = src.allocate(NIL_TID);
        src.retire(t);
        let mut p = SnapshotOcc::new(src.clone(), gc, true);
        assert_eq!(p.consistent_snapshot_tid(), Some(t));
        assert!(p.can_read_tid(t));
        assert!(!p.can_read_tid(t + 1));
    }
}
