//! Transactions: working-set reads and scans, and the six-phase optimistic
//! commit protocol.
//!
//! A transaction is created inside an epoch region (pinned for its whole
//! lifetime), accumulates private working sets while reading and staging
//! writes, and does all shared-state mutation at commit: locate or insert
//! the write targets, lock them in address order, generate a commit tid,
//! validate every read and absence observation, publish, unlock. Any
//! validation failure aborts the whole transaction; a lock-set resource
//! releases still-held tuple locks on every exit path.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_epoch::{pin, Guard};
use log::{debug, trace};
use smallvec::SmallVec;

use crate::context::{AbsentKind, AbsentRecord, LeafId, ReadRecord, TableContext, WriteRecord};
use crate::counters;
use crate::db::Table;
use crate::error::{AbortReason, Error};
use crate::index::{LeafRef, OrderedIndex, ScanHandler};
use crate::protocol::Protocol;
use crate::range::KeyRange;
use crate::tuple::{StableRead, Tuple, TupleRef};
use crate::{Tid, NIL_TID};

/// Transaction behavior flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnFlags(u64);

impl TxnFlags {
    pub const NONE: TxnFlags = TxnFlags(0);
    /// The write set must stay empty; enforced by assertion.
    pub const READ_ONLY: TxnFlags = TxnFlags(1 << 0);
    /// Phantom protection via leaf version counters instead of absent-key
    /// ranges.
    pub const LOW_LEVEL_SCAN: TxnFlags = TxnFlags(1 << 1);

    pub fn contains(self, other: TxnFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TxnFlags {
    type Output = TxnFlags;
    fn bitor(self, rhs: TxnFlags) -> TxnFlags {
        TxnFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for TxnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = Vec::new();
        if self.contains(TxnFlags::READ_ONLY) {
            parts.push("READ_ONLY");
        }
        if self.contains(TxnFlags::LOW_LEVEL_SCAN) {
            parts.push("LOW_LEVEL_SCAN");
        }
        if parts.is_empty() {
            parts.push("NONE");
        }
        f.write_str(&parts.join(" | "))
    }
}

/// Lifecycle states. COMMITTED and ABORTED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Embryo,
    Active,
    Committed,
    Aborted,
}

/// One located-or-inserted write target during commit.
struct WriteTarget {
    tuple: TupleRef,
    table_idx: usize,
    key: Box<[u8]>,
    payload: Box<[u8]>,
    insert: bool,
    locked: bool,
}

/// Scoped owner of the commit-time tuple locks: whatever is still locked
/// when it goes out of scope gets unlocked, so every early exit from the
/// commit runs the same release path.
#[derive(Default)]
struct LockSet {
    targets: Vec<WriteTarget>,
}

impl Drop for LockSet {
    fn drop(&mut self) {
        for t in &mut self.targets {
            if t.locked {
                // SAFETY: the lock set is local to commit(), inside the
                // transaction's epoch region, so the tuples are live.
                unsafe { (*t.tuple.0).unlock() };
                t.locked = false;
            }
        }
    }
}

/// A single serializable transaction over an [`Engine`](crate::Engine)'s
/// tables, parameterized by its commit [`Protocol`].
///
/// One transaction runs per thread at a time; the epoch guard pinned at
/// construction keeps every observed tuple live until the transaction is
/// dropped. Dropping an ACTIVE transaction is a hard violation.
pub struct Transaction<P: Protocol> {
    state: TxnState,
    flags: TxnFlags,
    reason: Option<AbortReason>,
    proto: P,
    ctxs: Vec<(Arc<Table>, TableContext)>,
    guard: Guard,
}

impl<P: Protocol> Transaction<P> {
    pub(crate) fn new(proto: P, flags: TxnFlags) -> Self {
        Self {
            state: TxnState::Embryo,
            flags,
            reason: None,
            proto,
            ctxs: Vec::new(),
            guard: pin(),
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    /// The reason this transaction aborted, if it did.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.reason
    }

    fn ensure_active(&mut self) -> Result<(), Error> {
        match self.state {
            TxnState::Embryo => {
                self.state = TxnState::Active;
                Ok(())
            }
            TxnState::Active => Ok(()),
            TxnState::Committed => Err(Error::Unusable),
            TxnState::Aborted => Err(Error::Abort(
                self.reason.unwrap_or(AbortReason::UserRequested),
            )),
        }
    }

    fn context_index(&mut self, table: &Arc<Table>) -> usize {
        match self.ctxs.iter().position(|(t, _)| Arc::ptr_eq(t, table)) {
            Some(i) => i,
            None => {
                self.ctxs.push((table.clone(), TableContext::new()));
                self.ctxs.len() - 1
            }
        }
    }

    /// Point lookup. Sees the transaction's own staged writes first.
    pub fn get(&mut self, table: &Arc<Table>, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.ensure_active()?;
        let low = self.flags.contains(TxnFlags::LOW_LEVEL_SCAN);
        let ci = self.context_index(table);
        if let Some(hit) = self.ctxs[ci].1.local_search(key, low) {
            return Ok(hit);
        }

        if let Some(snap) = self.proto.consistent_snapshot_tid() {
            // Snapshot reads need no validation: the transaction serializes
            // at its snapshot and history below it is immutable.
            return Ok(match table.index.search(key) {
                Some(tref) => {
                    // SAFETY: observed inside our epoch region.
                    let tuple = unsafe { tref.get(&self.guard) };
                    match tuple.read_version_at(snap, &self.guard) {
                        Some((_, v)) if !v.is_empty() => Some(v),
                        _ => None,
                    }
                }
                None => None,
            });
        }

        loop {
            let tref = match table.index.search(key) {
                Some(tref) => tref,
                None => {
                    self.ctxs[ci].1.absent_set.insert_if_absent(
                        key.into(),
                        AbsentRecord {
                            kind: AbsentKind::Read,
                            tuple: None,
                        },
                    );
                    return Ok(None);
                }
            };
            // SAFETY: observed inside our epoch region.
            let tuple = unsafe { tref.get(&self.guard) };
            match tuple.stable_read(&self.guard) {
                // Superseded while we were looking; chase the new mapping.
                StableRead::NotLatest => continue,
                StableRead::Latest { tid, value } => {
                    if tid == NIL_TID || value.is_empty() {
                        self.ctxs[ci].1.absent_set.insert_if_absent(
                            key.into(),
                            AbsentRecord {
                                kind: AbsentKind::Read,
                                tuple: None,
                            },
                        );
                        return Ok(None);
                    }
                    if !self.proto.can_read_tid(tid) {
                        return Ok(None);
                    }
                    self.ctxs[ci].1.read_set.insert_if_absent(
                        tref,
                        ReadRecord {
                            t: tid,
                            holds_lock: false,
                        },
                    );
                    return Ok(Some(value));
                }
            }
        }
    }

    /// Stages an upsert of `key` to `value`.
    pub fn put(&mut self, table: &Arc<Table>, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.stage_write(table, key, value, false)
    }

    /// Stages a write of a key expected to be absent, letting commit skip
    /// the initial index search.
    pub fn insert(&mut self, table: &Arc<Table>, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.stage_write(table, key, value, true)
    }

    /// Stages a logical delete (an empty latest value).
    pub fn remove(&mut self, table: &Arc<Table>, key: &[u8]) -> Result<(), Error> {
        self.stage_write(table, key, b"", false)
    }

    fn stage_write(
        &mut self,
        table: &Arc<Table>,
        key: &[u8],
        payload: &[u8],
        insert: bool,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        assert!(
            !self.flags.contains(TxnFlags::READ_ONLY),
            "write staged on a read-only transaction"
        );
        let ci = self.context_index(table);
        let ws = &mut self.ctxs[ci].1.write_set;
        if let Some(rec) = ws.find_by_mut(|k| **k == *key) {
            rec.payload = payload.into();
            rec.insert |= insert;
        } else {
            ws.insert(
                key.into(),
                WriteRecord {
                    payload: payload.into(),
                    insert,
                },
            );
        }
        Ok(())
    }

    /// Ordered scan of `[lo, hi)` (`hi = None` scans to the end), invoking
    /// `emit` per visible key until it returns `false`.
    ///
    /// Scans read the shared index only; the transaction's own staged
    /// writes are not merged into the results. Phantom protection is
    /// recorded per the LOW_LEVEL_SCAN flag.
    pub fn scan<F>(
        &mut self,
        table: &Arc<Table>,
        lo: &[u8],
        hi: Option<&[u8]>,
        emit: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.ensure_active()?;
        let low = self.flags.contains(TxnFlags::LOW_LEVEL_SCAN);
        let ci = self.context_index(table);
        let snapshot = self.proto.consistent_snapshot_tid();
        let ctx = &mut self.ctxs[ci].1;

        let mut handler = TxnRangeScan {
            ctx,
            guard: &self.guard,
            index: &table.index,
            snapshot,
            low,
            cursor: lo.into(),
            stopped: false,
            emit,
        };
        table.index.search_range_call(lo, hi, &mut handler);
        let stopped = handler.stopped;
        let cursor = handler.cursor;

        if !low && snapshot.is_none() && !stopped {
            // Everything from the last hit to the end of the interval was
            // observed empty.
            let tail = match hi {
                Some(hi) => KeyRange::new(&cursor, hi),
                None => KeyRange::unbounded(&cursor),
            };
            self.ctxs[ci].1.add_absent_range(tail);
        }
        Ok(())
    }

    /// Aborts the transaction. Idempotent; fails only on a transaction
    /// that has already committed.
    pub fn abort(&mut self) -> Result<(), Error> {
        match self.state {
            TxnState::Embryo | TxnState::Active => {
                debug!("transaction aborted by user");
                self.state = TxnState::Aborted;
                self.reason = Some(AbortReason::UserRequested);
                self.clear_contexts();
                Ok(())
            }
            TxnState::Aborted => Ok(()),
            TxnState::Committed => Err(Error::Unusable),
        }
    }

    /// Runs the commit protocol.
    ///
    /// Committing an already COMMITTED transaction is a no-op returning
    /// success; committing an ABORTED one reports the stored reason. On a
    /// validation failure the transaction is aborted and the reason both
    /// returned and stored for [`Transaction::abort_reason`].
    pub fn commit(&mut self) -> Result<(), Error> {
        match self.state {
            TxnState::Embryo | TxnState::Active => {}
            TxnState::Committed => return Ok(()),
            TxnState::Aborted => {
                return Err(Error::Abort(
                    self.reason.unwrap_or(AbortReason::UserRequested),
                ))
            }
        }

        let mut lockset = LockSet::default();
        let mut commit_tid: Option<Tid> = None;
        match self.commit_inner(&mut lockset, &mut commit_tid) {
            Ok(()) => {
                debug_assert!(lockset.targets.iter().all(|t| !t.locked));
                self.state = TxnState::Committed;
                if let Some(tid) = commit_tid {
                    trace!("committed at tid {}", tid);
                    self.proto.on_tid_finish(tid);
                }
                self.clear_contexts();
                Ok(())
            }
            Err(reason) => {
                // The lock set releases anything still held as it drops.
                drop(lockset);
                debug!("commit aborted: {}", reason);
                self.state = TxnState::Aborted;
                self.reason = Some(reason);
                // A reserved tid must be retired even on abort.
                if let Some(tid) = commit_tid {
                    self.proto.on_tid_finish(tid);
                }
                self.clear_contexts();
                Err(Error::Abort(reason))
            }
        }
    }

    fn commit_inner(
        &mut self,
        lockset: &mut LockSet,
        commit_tid: &mut Option<Tid>,
    ) -> Result<(), AbortReason> {
        let low = self.flags.contains(TxnFlags::LOW_LEVEL_SCAN);
        let snapshot_tid = self.proto.consistent_snapshot_tid();

        // Phase 1: locate or insert the write targets.
        for ci in 0..self.ctxs.len() {
            debug_assert!(
                !self.flags.contains(TxnFlags::READ_ONLY) || self.ctxs[ci].1.write_set.is_empty()
            );
            let table = self.ctxs[ci].0.clone();
            let nwrites = self.ctxs[ci].1.write_set.len();
            for wi in 0..nwrites {
                let (key, payload, insert_hint) = {
                    let (k, w) = self.ctxs[ci].1.write_set.at(wi);
                    (k.clone(), w.payload.clone(), w.insert)
                };
                let mut try_insert = insert_hint;
                loop {
                    if !try_insert {
                        if let Some(tref) = table.index.search(&key) {
                            lockset.targets.push(WriteTarget {
                                tuple: tref,
                                table_idx: ci,
                                key: key.clone(),
                                payload: payload.clone(),
                                insert: false,
                                locked: false,
                            });
                            let ctx = &mut self.ctxs[ci].1;
                            // This tuple will hold our lock by validation.
                            if let Some(r) = ctx.read_set.get_mut(&tref) {
                                debug_assert!(!r.holds_lock);
                                r.holds_lock = true;
                            }
                            if !ctx.absent_set.is_empty() {
                                if let Some(a) = ctx.absent_set.find_by_mut(|k| **k == *key) {
                                    debug_assert_eq!(a.kind, AbsentKind::Read);
                                    a.kind = AbsentKind::Write;
                                    a.tuple = Some(tref);
                                }
                            }
                            break;
                        }
                        counters::EVT_DBTUPLE_WRITE_SEARCH_FAILED.inc();
                    }

                    let fresh = Tuple::alloc_first(table.mostly_append(), &payload);
                    // SAFETY: freshly allocated, not yet shared.
                    unsafe { fresh.get(&self.guard) }.lock(true);
                    match table.index.insert_if_absent(&key, fresh) {
                        Some((leaf, pre_version)) => {
                            lockset.targets.push(WriteTarget {
                                tuple: fresh,
                                table_idx: ci,
                                key: key.clone(),
                                payload: payload.clone(),
                                insert: true,
                                locked: true,
                            });
                            let ctx = &mut self.ctxs[ci].1;
                            if low {
                                // Our own insert accounts for exactly one
                                // bump of the observed leaf counter.
                                if let Some(observed) =
                                    ctx.node_scan.get_mut(&LeafId(leaf.clone()))
                                {
                                    if *observed != pre_version {
                                        return Err(AbortReason::WriteNodeInterference);
                                    }
                                    *observed = pre_version + 1;
                                }
                            }
                            if !ctx.absent_set.is_empty() {
                                if let Some(a) = ctx.absent_set.find_by_mut(|k| **k == *key) {
                                    debug_assert_eq!(a.kind, AbsentKind::Read);
                                    a.kind = AbsentKind::Insert;
                                    a.tuple = Some(fresh);
                                }
                            }
                            break;
                        }
                        None => {
                            // Lost the insert race: the tuple was never
                            // published, destroy it right away and retry
                            // from the search.
                            // SAFETY: only this thread ever saw `fresh`.
                            unsafe {
                                fresh.get(&self.guard).unlock();
                                Tuple::release_no_rcu(fresh);
                            }
                            counters::EVT_DBTUPLE_WRITE_INSERT_FAILED.inc();
                            try_insert = false;
                        }
                    }
                }
            }
        }

        // A snapshot transaction with no writes commits at its snapshot;
        // nothing to lock or validate.
        if snapshot_tid.is_some() && lockset.targets.is_empty() {
            return Ok(());
        }

        // Phase 2: lock the targets in address order.
        lockset.targets.sort_by_key(|t| t.tuple.addr());
        for t in lockset.targets.iter_mut() {
            if t.locked {
                continue;
            }
            // SAFETY: targets were observed inside our epoch region.
            let tuple = unsafe { t.tuple.get(&self.guard) };
            let word = tuple.lock(true);
            t.locked = true;
            if Tuple::is_deleting_word(word)
                || !Tuple::is_latest_word(word)
                || !self.proto.can_read_tid(tuple.version())
            {
                return Err(AbortReason::WriteNodeInterference);
            }
        }

        // Phase 3: commit tid, writers only.
        if !lockset.targets.is_empty() {
            let versions: SmallVec<[Tid; 16]> = lockset
                .targets
                .iter()
                // SAFETY: as above.
                .map(|t| unsafe { t.tuple.get(&self.guard) }.version())
                .collect();
            *commit_tid = Some(self.proto.gen_commit_tid(&versions));
        }

        // Phase 4: read validation.
        for (table, ctx) in &self.ctxs {
            for (tref, rec) in ctx.read_set.iter() {
                // SAFETY: as above.
                let tuple = unsafe { tref.get(&self.guard) };
                let still_ours = if rec.holds_lock {
                    tuple.is_latest_version(rec.t)
                } else {
                    tuple.stable_is_latest_version(rec.t)
                };
                if !still_ours {
                    return Err(AbortReason::ReadNodeInterference);
                }
            }

            for (key, rec) in ctx.absent_set.iter() {
                match rec.kind {
                    // The insert itself proved prior absence.
                    AbsentKind::Insert => continue,
                    AbsentKind::Write => {
                        let tref = rec.tuple.expect("write-promoted entry carries its tuple");
                        // SAFETY: as above; we hold this tuple's lock.
                        let tuple = unsafe { tref.get(&self.guard) };
                        if !tuple.latest_value_is_nil(&self.guard) {
                            return Err(AbortReason::ReadAbsenceInterference);
                        }
                    }
                    AbsentKind::Read => {
                        debug_assert!(rec.tuple.is_none());
                        if let Some(tref) = table.index.search(key) {
                            // SAFETY: as above.
                            let tuple = unsafe { tref.get(&self.guard) };
                            if !tuple.stable_latest_value_is_nil(&self.guard) {
                                return Err(AbortReason::ReadAbsenceInterference);
                            }
                        }
                    }
                }
            }

            if low {
                debug_assert!(ctx.absent_range_set.is_empty());
                for (leaf, observed) in ctx.node_scan.iter() {
                    if leaf.0.version() != *observed {
                        return Err(AbortReason::NodeScanReadVersionChanged);
                    }
                }
            } else {
                debug_assert!(ctx.node_scan.is_empty());
                for r in &ctx.absent_range_set {
                    let mut validator = AbsentRangeValidator {
                        ctx,
                        guard: &self.guard,
                        index: &table.index,
                        snapshot: snapshot_tid,
                        failed: false,
                    };
                    table
                        .index
                        .search_range_call(&r.a, r.b.as_deref(), &mut validator);
                    if validator.failed {
                        return Err(AbortReason::WriteNodeInterference);
                    }
                }
            }
        }

        // Phase 5: publish, still in sorted order.
        if let Some(tid) = *commit_tid {
            let keep_old = self.proto.wants_old_versions();
            for t in lockset.targets.iter_mut() {
                debug_assert!(t.locked);
                // SAFETY: as above.
                let tuple = unsafe { t.tuple.get(&self.guard) };
                if t.insert {
                    tuple.publish_insert(tid);
                    tuple.unlock();
                    t.locked = false;
                    continue;
                }
                let ret = tuple.write_record_at(keep_old, tid, &t.payload, &self.guard);
                let latest = match ret.replacement {
                    Some(repl) => {
                        // Swap the index mapping to the replacement tuple.
                        let old = self.ctxs[t.table_idx].0.index.insert(&t.key, repl);
                        debug_assert_eq!(old, Some(t.tuple));
                        counters::EVT_DBTUPLE_LATEST_REPLACEMENT.inc();
                        repl
                    }
                    None => t.tuple,
                };
                let table = self.ctxs[t.table_idx].0.clone();
                if ret.spilled {
                    self.proto.on_tuple_spill(&table, &t.key, latest);
                }
                if t.payload.is_empty() {
                    self.proto.on_logical_delete(&table, &t.key, latest);
                }
                tuple.unlock();
                t.locked = false;
                if let Some(repl) = ret.replacement {
                    // SAFETY: allocated locked by write_record_at.
                    unsafe { repl.get(&self.guard) }.unlock();
                }
            }
        }

        Ok(())
    }

    fn clear_contexts(&mut self) {
        for (_, ctx) in &mut self.ctxs {
            ctx.clear();
        }
    }

    /// Working-set statistics for space-class profiling: the number of
    /// table contexts, per-set maxima, and how many sets outgrew their
    /// inline storage.
    pub fn txn_counters(&self) -> BTreeMap<&'static str, u64> {
        let mut ret: BTreeMap<&'static str, u64> = BTreeMap::new();
        ret.insert("num_txn_contexts", self.ctxs.len() as u64);
        let mut maxed = |ret: &mut BTreeMap<&'static str, u64>, k: &'static str, v: u64| {
            let e = ret.entry(k).or_insert(0);
            *e = (*e).max(v);
        };
        for (_, ctx) in &self.ctxs {
            maxed(&mut ret, "max_read_set_size", ctx.read_set.len() as u64);
            maxed(&mut ret, "max_absent_set_size", ctx.absent_set.len() as u64);
            maxed(&mut ret, "max_write_set_size", ctx.write_set.len() as u64);
            maxed(&mut ret, "max_node_scan_size", ctx.node_scan.len() as u64);
            maxed(
                &mut ret,
                "max_absent_range_set_size",
                ctx.absent_range_set.len() as u64,
            );
            for (name, large) in [
                ("n_read_set_large_instances", ctx.read_set.is_large()),
                ("n_absent_set_large_instances", ctx.absent_set.is_large()),
                ("n_write_set_large_instances", ctx.write_set.is_large()),
                ("n_node_scan_large_instances", ctx.node_scan.is_large()),
            ] {
                if large {
                    *ret.entry(name).or_insert(0) += 1;
                }
            }
        }
        ret
    }

    /// Renders the transaction's state and working sets for debugging.
    pub fn dump_debug_info(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "transaction state={:?} flags={:?}",
            self.state, self.flags
        );
        if let Some(reason) = self.reason {
            let _ = writeln!(out, "  abort reason: {}", reason);
        }
        for (table, ctx) in &self.ctxs {
            let _ = writeln!(out, "  table {:?}:", table.name());
            let _ = writeln!(out, "    read set:");
            for (tref, rec) in ctx.read_set.iter() {
                let _ = writeln!(
                    out,
                    "      {:?} @ {} holds_lock={}",
                    tref, rec.t, rec.holds_lock
                );
            }
            let _ = writeln!(out, "    absent set:");
            for (key, rec) in ctx.absent_set.iter() {
                let _ = writeln!(out, "      {:?} : {:?}", key, rec.kind);
            }
            let _ = writeln!(out, "    write set:");
            for (key, rec) in ctx.write_set.iter() {
                if rec.payload.is_empty() {
                    let _ = writeln!(out, "      {:?} : remove", key);
                } else {
                    let _ = writeln!(out, "      {:?} @ {} bytes", key, rec.payload.len());
                }
            }
            let _ = writeln!(out, "    absent ranges:");
            for r in &ctx.absent_range_set {
                let _ = writeln!(out, "      {}", r);
            }
        }
        out
    }
}

impl<P: Protocol> Drop for Transaction<P> {
    fn drop(&mut self) {
        // Resolution means EMBRYO, COMMITTED, or ABORTED.
        if !std::thread::panicking() {
            debug_assert!(
                self.state != TxnState::Active,
                "active transaction dropped without commit or abort"
            );
        }
    }
}

/// Range-scan handler wiring index callbacks into the working sets.
struct TxnRangeScan<'a, F> {
    ctx: &'a mut TableContext,
    guard: &'a Guard,
    index: &'a OrderedIndex,
    snapshot: Option<Tid>,
    low: bool,
    /// Next key not yet covered by an emitted hit (absent-range mode).
    cursor: Box<[u8]>,
    stopped: bool,
    emit: F,
}

impl<F: FnMut(&[u8], &[u8]) -> bool> ScanHandler for TxnRangeScan<'_, F> {
    fn visit_leaf(&mut self, leaf: &LeafRef) -> bool {
        if self.low && self.snapshot.is_none() {
            self.ctx
                .node_scan
                .insert_if_absent(LeafId(leaf.clone()), leaf.version());
        }
        true
    }

    fn visit_entry(&mut self, key: &[u8], tref: TupleRef) -> bool {
        let mut tref = tref;
        let value = loop {
            // SAFETY: observed inside the transaction's epoch region.
            let tuple = unsafe { tref.get(self.guard) };
            if let Some(snap) = self.snapshot {
                break tuple
                    .read_version_at(snap, self.guard)
                    .map(|(_, v)| v)
                    .filter(|v| !v.is_empty());
            }
            match tuple.stable_read(self.guard) {
                StableRead::NotLatest => {
                    // Superseded mid-scan; chase the current mapping.
                    match self.index.search(key) {
                        Some(cur) => {
                            tref = cur;
                            continue;
                        }
                        None => break None,
                    }
                }
                StableRead::Latest { tid, value } => {
                    if tid == NIL_TID || value.is_empty() {
                        // Nil keys stay inside the absent interval (or the
                        // leaf version) and are revalidated from there.
                        break None;
                    }
                    self.ctx.read_set.insert_if_absent(
                        tref,
                        ReadRecord {
                            t: tid,
                            holds_lock: false,
                        },
                    );
                    break Some(value);
                }
            }
        };

        let value = match value {
            Some(v) => v,
            None => return true,
        };

        if !self.low && self.snapshot.is_none() {
            // The gap up to this hit was empty; the hit itself is guarded
            // by its read-set entry, so the next interval starts at the
            // key's successor.
            self.ctx
                .add_absent_range(KeyRange::new(&self.cursor, key));
            let mut succ = key.to_vec();
            succ.push(0);
            self.cursor = succ.into();
        }

        if !(self.emit)(key, &value) {
            self.stopped = true;
            return false;
        }
        true
    }
}

/// Commit-time revalidation of one absent range: fails on any key whose
/// latest version is visibly non-nil, skipping the transaction's own
/// staged writes (its Phase-1 inserts are already in the index).
struct AbsentRangeValidator<'a> {
    ctx: &'a TableContext,
    guard: &'a Guard,
    index: &'a OrderedIndex,
    snapshot: Option<Tid>,
    failed: bool,
}

impl ScanHandler for AbsentRangeValidator<'_> {
    fn visit_leaf(&mut self, _leaf: &LeafRef) -> bool {
        true
    }

    fn visit_entry(&mut self, key: &[u8], tref: TupleRef) -> bool {
        if self.ctx.write_set.find_by(|k| **k == *key).is_some() {
            return true;
        }
        let mut tref = tref;
        let live = loop {
            // SAFETY: observed inside the transaction's epoch region.
            let tuple = unsafe { tref.get(self.guard) };
            if let Some(snap) = self.snapshot {
                break matches!(
                    tuple.read_version_at(snap, self.guard),
                    Some((_, v)) if !v.is_empty()
                );
            }
            match tuple.stable_read(self.guard) {
                // Superseded under us; the current mapping decides.
                StableRead::NotLatest => match self.index.search(key) {
                    Some(cur) => {
                        tref = cur;
                        continue;
                    }
                    None => break false,
                },
                StableRead::Latest { tid, value } => {
                    break tid != NIL_TID && !value.is_empty();
                }
            }
        };
        if live {
            self.failed = true;
            return false;
        }
        true
    }
}
