//! Per-key version-chain tuples.
//!
//! A [`Tuple`] holds the latest value for one key plus a chain of frozen
//! older `(tid, value)` versions, newest first. All flags and the
//! stable-read sequence number live in one packed `AtomicU64` so optimistic
//! readers can take a consistent snapshot of the tuple's state without
//! locking: read the word, read the data, re-read the word, retry if it
//! moved. Writers set the `modifying` bit only around the actual mutation,
//! so readers spin only through the short publication window and not
//! through an entire commit.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;

use crate::{Tid, NIL_TID};

const LOCKED: u64 = 1 << 63;
const DELETING: u64 = 1 << 62;
const LATEST: u64 = 1 << 61;
const MODIFYING: u64 = 1 << 60;
const WRITER: u64 = 1 << 59;
const SEQ_MASK: u64 = WRITER - 1;
const FLAGS_KEPT_ON_UNLOCK: u64 = DELETING | LATEST;

/// Smallest inline capacity handed to tuples of non-append tables.
const MIN_INLINE_CAP: usize = 8;

/// Result of a stable (optimistic, lock-free) read of the latest version.
#[derive(Debug, PartialEq, Eq)]
pub enum StableRead {
    /// The tuple has been superseded; re-search the index for the key.
    NotLatest,
    /// A consistent snapshot of the latest version. An empty value (or a
    /// `NIL_TID` tid, meaning an uncommitted staged insert) reads as nil.
    Latest { tid: Tid, value: Vec<u8> },
}

/// What [`Tuple::write_record_at`] did.
pub struct WriteRecordRet {
    /// The prior version was pushed into the chain tail and now needs GC
    /// attention.
    pub spilled: bool,
    /// When the payload did not fit inline, the freshly allocated latest
    /// tuple (returned locked). The caller must atomically swap the index
    /// mapping from the old tuple to this one.
    pub replacement: Option<TupleRef>,
}

/// All versions of one key.
pub struct Tuple {
    /// Packed flags plus unlock sequence number; see module docs.
    hdr: AtomicU64,
    /// Tid of the version stored inline. `NIL_TID` until the first commit.
    version: AtomicU64,
    /// Inline capacity budget, fixed at allocation.
    cap: usize,
    /// The payload. Never null; an empty buffer denotes logical deletion.
    value: Atomic<Vec<u8>>,
    /// Next-older tuple in the chain. Mutated only under the lock.
    next: Atomic<Tuple>,
}

/// Address-identity handle to a shared tuple.
///
/// Valid only inside the epoch region of the transaction that observed it;
/// tuple addresses are process-local identities and must not cross process
/// boundaries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TupleRef(pub(crate) *const Tuple);

// SAFETY: tuples are internally synchronized (atomics plus the lock bit) and
// only reclaimed through the epoch scheme, so handles may move across the
// worker threads that share a table.
unsafe impl Send for TupleRef {}
unsafe impl Sync for TupleRef {}

impl TupleRef {
    /// # Safety
    ///
    /// The caller's epoch guard must date from before this handle was
    /// obtained, so the tuple cannot have been reclaimed.
    #[inline]
    pub(crate) unsafe fn get<'g>(&self, _guard: &'g Guard) -> &'g Tuple {
        &*self.0
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for TupleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TupleRef({:#x})", self.addr())
    }
}

impl Tuple {
    /// Allocates a fresh latest tuple with one version at `NIL_TID`.
    ///
    /// Mostly-append tables get no capacity slack; their keys are rarely
    /// rewritten, so over-allocating only wastes memory.
    pub fn alloc_first(mostly_append: bool, payload: &[u8]) -> TupleRef {
        let cap = if mostly_append {
            payload.len()
        } else {
            payload.len().max(MIN_INLINE_CAP).next_power_of_two()
        };
        let tuple = Box::new(Tuple {
            hdr: AtomicU64::new(LATEST),
            version: AtomicU64::new(NIL_TID),
            cap,
            value: Atomic::new(payload.to_vec()),
            next: Atomic::null(),
        });
        TupleRef(Box::into_raw(tuple))
    }

    /// A frozen chain record holding one superseded version. Immutable once
    /// linked.
    fn frozen(tid: Tid, payload: Vec<u8>) -> Owned<Tuple> {
        Owned::new(Tuple {
            hdr: AtomicU64::new(0),
            version: AtomicU64::new(tid),
            cap: payload.len(),
            value: Atomic::new(payload),
            next: Atomic::null(),
        })
    }

    /// Immediately destroys a tuple that was never published to the index.
    ///
    /// # Safety
    ///
    /// `tuple` must come from [`Tuple::alloc_first`] and must never have
    /// been made reachable by other threads.
    pub unsafe fn release_no_rcu(tuple: TupleRef) {
        drop(Box::from_raw(tuple.0 as *mut Tuple));
    }

    /// Bounded-spin acquire of the lock bit. Returns the version word as
    /// observed under the lock.
    pub fn lock(&self, for_write: bool) -> u64 {
        let backoff = Backoff::new();
        loop {
            let v = self.hdr.load(Ordering::Acquire);
            if v & LOCKED == 0 {
                let intent = if for_write { WRITER } else { 0 };
                let locked = v | LOCKED | intent;
                if self
                    .hdr
                    .compare_exchange_weak(v, locked, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return locked;
                }
            }
            backoff.snooze();
        }
    }

    /// Releases the lock, clearing `modifying` and write intent and bumping
    /// the sequence number so optimistic readers revalidate.
    pub fn unlock(&self) {
        let v = self.hdr.load(Ordering::Relaxed);
        debug_assert!(v & LOCKED != 0);
        let seq = (v & SEQ_MASK).wrapping_add(1) & SEQ_MASK;
        self.hdr.store((v & FLAGS_KEPT_ON_UNLOCK) | seq, Ordering::Release);
    }

    /// Marks an in-progress publication so concurrent optimistic readers
    /// retry instead of reading half-written state. Caller holds the lock.
    pub fn mark_modifying(&self) {
        self.hdr.fetch_or(MODIFYING, Ordering::AcqRel);
    }

    /// Marks the tuple as being physically deleted. Writers that find this
    /// set abort.
    pub fn mark_deleting(&self) {
        self.hdr.fetch_or(DELETING, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_latest(&self) -> bool {
        self.hdr.load(Ordering::Acquire) & LATEST != 0
    }

    #[inline]
    pub(crate) fn clear_latest(&self) {
        self.hdr.fetch_and(!LATEST, Ordering::AcqRel);
    }

    #[inline]
    pub fn version(&self) -> Tid {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_deleting_word(v: u64) -> bool {
        v & DELETING != 0
    }

    #[inline]
    pub fn is_latest_word(v: u64) -> bool {
        v & LATEST != 0
    }

    /// Spins past any publication window, returning a word readers may
    /// validate against with [`Tuple::check_version`].
    fn stable_version(&self) -> u64 {
        let backoff = Backoff::new();
        loop {
            let v = self.hdr.load(Ordering::Acquire);
            if v & MODIFYING == 0 {
                return v;
            }
            backoff.snooze();
        }
    }

    /// Whether the version word is unchanged since `v` was observed.
    #[inline]
    fn check_version(&self, v: u64) -> bool {
        fence(Ordering::Acquire);
        self.hdr.load(Ordering::Relaxed) == v
    }

    /// Under lock: is this the published latest version at `tid`?
    pub fn is_latest_version(&self, tid: Tid) -> bool {
        self.is_latest() && self.version() == tid
    }

    /// Optimistic counterpart of [`Tuple::is_latest_version`].
    pub fn stable_is_latest_version(&self, tid: Tid) -> bool {
        loop {
            let v = self.stable_version();
            let ok = Self::is_latest_word(v) && self.version() == tid;
            if self.check_version(v) {
                return ok;
            }
        }
    }

    /// Under lock: is the latest value nil (logically deleted or an
    /// uncommitted staged insert)?
    pub fn latest_value_is_nil(&self, guard: &Guard) -> bool {
        if self.version() == NIL_TID {
            return true;
        }
        let val = self.value.load(Ordering::Acquire, guard);
        // SAFETY: `value` is never null and the guard keeps it live.
        unsafe { val.deref().is_empty() }
    }

    /// Optimistic counterpart of [`Tuple::latest_value_is_nil`].
    pub fn stable_latest_value_is_nil(&self, guard: &Guard) -> bool {
        loop {
            let v = self.stable_version();
            let nil = self.latest_value_is_nil(guard);
            if self.check_version(v) {
                return nil;
            }
        }
    }

    /// Optimistic read of the latest version.
    pub fn stable_read(&self, guard: &Guard) -> StableRead {
        loop {
            let v = self.stable_version();
            if !Self::is_latest_word(v) {
                if self.check_version(v) {
                    return StableRead::NotLatest;
                }
                continue;
            }
            let tid = self.version();
            if tid == NIL_TID {
                if self.check_version(v) {
                    return StableRead::Latest {
                        tid: NIL_TID,
                        value: Vec::new(),
                    };
                }
                continue;
            }
            let val = self.value.load(Ordering::Acquire, guard);
            // SAFETY: `value` is never null; the guard keeps the buffer live
            // even if a writer swaps and retires it concurrently. The word
            // recheck below discards any torn observation.
            let bytes = unsafe { val.deref().clone() };
            if self.check_version(v) {
                return StableRead::Latest { tid, value: bytes };
            }
        }
    }

    /// Reads the newest version with tid at most `snapshot`, walking the
    /// chain when the inline version is too new. Returns `None` when no
    /// version is visible at the snapshot.
    pub fn read_version_at(&self, snapshot: Tid, guard: &Guard) -> Option<(Tid, Vec<u8>)> {
        loop {
            let v = self.stable_version();
            let tid = self.version();
            if tid != NIL_TID && tid <= snapshot {
                let val = self.value.load(Ordering::Acquire, guard);
                // SAFETY: as in `stable_read`.
                let bytes = unsafe { val.deref().clone() };
                if self.check_version(v) {
                    return Some((tid, bytes));
                }
                continue;
            }
            let next = self.next.load(Ordering::Acquire, guard);
            if !self.check_version(v) {
                continue;
            }
            // Frozen chain records are immutable; plain reads from here on.
            let mut cur = next;
            loop {
                // SAFETY: chain records are reclaimed only via the epoch
                // scheme; the guard keeps them live.
                let t = match unsafe { cur.as_ref() } {
                    Some(t) => t,
                    None => return None,
                };
                let ctid = t.version();
                if ctid <= snapshot {
                    let val = t.value.load(Ordering::Acquire, guard);
                    // SAFETY: as above.
                    let bytes = unsafe { val.deref().clone() };
                    return Some((ctid, bytes));
                }
                cur = t.next.load(Ordering::Acquire, guard);
            }
        }
    }

    /// Finalizes a Phase-1 staged insert: stamps the commit tid while the
    /// payload staged at allocation stays in place. Caller holds the lock.
    pub fn publish_insert(&self, commit_tid: Tid) {
        debug_assert!(self.hdr.load(Ordering::Relaxed) & LOCKED != 0);
        self.mark_modifying();
        self.version.store(commit_tid, Ordering::Release);
    }

    /// Publishes a new latest version. Caller holds the lock.
    ///
    /// When the payload fits the inline capacity the tuple is extended in
    /// place: if `keep_old` the prior version is frozen into the chain tail
    /// (`spilled`). Otherwise a replacement latest tuple is allocated with
    /// this one linked as its predecessor; the caller must swap the index
    /// mapping and unlock both.
    pub fn write_record_at(
        &self,
        keep_old: bool,
        commit_tid: Tid,
        payload: &[u8],
        guard: &Guard,
    ) -> WriteRecordRet {
        debug_assert!(self.hdr.load(Ordering::Relaxed) & LOCKED != 0);
        debug_assert!(self.is_latest());

        if payload.len() <= self.cap {
            let old_tid = self.version();
            self.mark_modifying();
            let spilled = if keep_old && old_tid != NIL_TID {
                // SAFETY: `value` is never null; we hold the lock, so no
                // other writer can swap it under us.
                let old_bytes = unsafe { self.value.load(Ordering::Acquire, guard).deref().clone() };
                let frozen = Self::frozen(old_tid, old_bytes);
                frozen
                    .next
                    .store(self.next.load(Ordering::Relaxed, guard), Ordering::Relaxed);
                self.next.store(frozen, Ordering::Release);
                true
            } else {
                false
            };
            let old = self
                .value
                .swap(Owned::new(payload.to_vec()), Ordering::AcqRel, guard);
            // SAFETY: the buffer was just unlinked; stable readers that
            // still hold it are protected by their own guards.
            unsafe { guard.defer_destroy(old) };
            self.version.store(commit_tid, Ordering::Release);
            WriteRecordRet {
                spilled,
                replacement: None,
            }
        } else {
            let cap = payload.len().max(MIN_INLINE_CAP).next_power_of_two();
            let repl = Box::new(Tuple {
                hdr: AtomicU64::new(LATEST | LOCKED | WRITER),
                version: AtomicU64::new(commit_tid),
                cap,
                value: Atomic::new(payload.to_vec()),
                next: Atomic::null(),
            });
            let repl_ref = TupleRef(Box::into_raw(repl));
            // SAFETY: freshly allocated, not yet shared.
            unsafe {
                (*repl_ref.0)
                    .next
                    .store(Shared::from(self as *const Tuple), Ordering::Release);
            }
            self.clear_latest();
            WriteRecordRet {
                spilled: true,
                replacement: Some(repl_ref),
            }
        }
    }
}

impl Drop for Tuple {
    fn drop(&mut self) {
        // SAFETY: exclusive access; nothing can observe the tuple once its
        // owner drops it.
        unsafe {
            let g = crossbeam_epoch::unprotected();
            let v = self.value.load(Ordering::Relaxed, g);
            if !v.is_null() {
                drop(v.into_owned());
            }
        }
    }
}

/// Frees a tuple and its whole chain of older versions, iteratively.
///
/// # Safety
///
/// The chain must be unreachable: no index mapping, no live transaction
/// region that could still observe any of its tuples.
pub(crate) unsafe fn free_chain(head: *mut Tuple) {
    let g = crossbeam_epoch::unprotected();
    let mut cur = head;
    while !cur.is_null() {
        let next = (*cur).next.load(Ordering::Relaxed, g).as_raw() as *mut Tuple;
        drop(Box::from_raw(cur));
        cur = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::pin;

    fn value_of(read: StableRead) -> Vec<u8> {
        match read {
            StableRead::Latest { value, .. } => value,
            other => panic!("unexpected read result: {:?}", other),
        }
    }

    #[test]
    fn staged_insert_reads_as_nil() {
        let guard = pin();
        let t = Tuple::alloc_first(false, b"staged");
        // SAFETY: freshly allocated, freed below.
        let tuple = unsafe { t.get(&guard) };
        assert!(tuple.is_latest());
        assert_eq!(
            tuple.stable_read(&guard),
            StableRead::Latest {
                tid: NIL_TID,
                value: Vec::new()
            }
        );
        assert!(tuple.stable_latest_value_is_nil(&guard));
        unsafe { Tuple::release_no_rcu(t) };
    }

    #[test]
    fn publish_then_read_round_trip() {
        let guard = pin();
        let t = Tuple::alloc_first(false, b"v1");
        let tuple = unsafe { t.get(&guard) };
        tuple.lock(true);
        tuple.publish_insert(7);
        tuple.unlock();
        assert!(tuple.is_latest_version(7));
        assert!(tuple.stable_is_latest_version(7));
        assert!(!tuple.stable_is_latest_version(6));
        assert_eq!(value_of(tuple.stable_read(&guard)), b"v1".to_vec());
        unsafe { free_chain(t.0 as *mut Tuple) };
    }

    #[test]
    fn in_place_write_spills_old_version() {
        let guard = pin();
        let t = Tuple::alloc_first(false, b"aa");
        let tuple = unsafe { t.get(&guard) };
        tuple.lock(true);
        tuple.publish_insert(3);
        tuple.unlock();

        tuple.lock(true);
        let ret = tuple.write_record_at(true, 9, b"bb", &guard);
        tuple.unlock();
        assert!(ret.spilled);
        assert!(ret.replacement.is_none());

        assert_eq!(value_of(tuple.stable_read(&guard)), b"bb".to_vec());
        assert_eq!(tuple.read_version_at(9, &guard), Some((9, b"bb".to_vec())));
        assert_eq!(tuple.read_version_at(5, &guard), Some((3, b"aa".to_vec())));
        assert_eq!(tuple.read_version_at(2, &guard), None);
        unsafe { free_chain(t.0 as *mut Tuple) };
    }

    #[test]
    fn oversized_write_allocates_replacement() {
        let guard = pin();
        let t = Tuple::alloc_first(true, b"tiny");
        let tuple = unsafe { t.get(&guard) };
        tuple.lock(true);
        tuple.publish_insert(4);
        tuple.unlock();

        tuple.lock(true);
        let big = vec![b'x'; 64];
        let ret = tuple.write_record_at(true, 8, &big, &guard);
        assert!(ret.spilled);
        let repl = ret.replacement.expect("payload cannot fit inline");
        let repl_tuple = unsafe { repl.get(&guard) };
        assert!(repl_tuple.is_latest());
        assert!(!tuple.is_latest());
        assert_eq!(tuple.stable_read(&guard), StableRead::NotLatest);
        tuple.unlock();
        repl_tuple.unlock();

        assert_eq!(value_of(repl_tuple.stable_read(&guard)), big);
        assert_eq!(repl_tuple.read_version_at(5, &guard), Some((4, b"tiny".to_vec())));
        unsafe { free_chain(repl.0 as *mut Tuple) };
    }

    #[test]
    fn skip_history_overwrites_in_place() {
        let guard = pin();
        let t = Tuple::alloc_first(false, b"a");
        let tuple = unsafe { t.get(&guard) };
        tuple.lock(true);
        tuple.publish_insert(2);
        tuple.unlock();

        tuple.lock(true);
        let ret = tuple.write_record_at(false, 6, b"b", &guard);
        tuple.unlock();
        assert!(!ret.spilled);
        assert!(ret.replacement.is_none());
        assert_eq!(tuple.read_version_at(3, &guard), None);
        unsafe { free_chain(t.0 as *mut Tuple) };
    }

    #[test]
    fn concurrent_stable_reads_see_whole_values() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let t = Tuple::alloc_first(false, &[b'a'; 32]);
        {
            let guard = pin();
            let tuple = unsafe { t.get(&guard) };
            tuple.lock(true);
            tuple.publish_insert(1);
            tuple.unlock();
        }
        let stop = Arc::new(AtomicBool::new(false));
        let reader_stop = stop.clone();
        let reader = std::thread::spawn(move || {
            let guard = pin();
            // SAFETY: the writer thread keeps the tuple alive until join.
            let tuple = unsafe { t.get(&guard) };
            while !reader_stop.load(Ordering::Relaxed) {
                if let StableRead::Latest { value, .. } = tuple.stable_read(&guard) {
                    assert!(value.iter().all(|&b| b == value[0]), "torn read");
                    assert_eq!(value.len(), 32);
                }
            }
        });
        {
            let guard = pin();
            let tuple = unsafe { t.get(&guard) };
            for i in 2..200u64 {
                let byte = b'a' + (i % 8) as u8;
                tuple.lock(true);
                let ret = tuple.write_record_at(false, i, &[byte; 32], &guard);
                assert!(ret.replacement.is_none());
                tuple.unlock();
            }
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        unsafe { free_chain(t.0 as *mut Tuple) };
    }
}
