//! The concurrent ordered index: byte-string keys to tuple pointers.
//!
//! A two-level structure: a spine of leaf pages sorted by separator key,
//! each leaf a sorted run of entries guarded by its own reader-writer lock.
//! Every leaf carries a monotone 64-bit version counter bumped whenever its
//! key set changes (insert, remove, split); transactions use those counters
//! for phantom protection. Lock order is always spine before leaf, and no
//! operation takes two leaf locks at once, so the index cannot deadlock
//! against the commit protocol's tuple locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::tuple::{self, Tuple, TupleRef};

/// Entries per leaf before a split. Splits bump the overflowing leaf's
/// version twice (insert plus split), conservatively aborting any
/// transaction that scanned it.
const LEAF_CAPACITY: usize = 32;

/// One leaf page.
pub struct LeafNode {
    version: AtomicU64,
    entries: RwLock<Vec<(Box<[u8]>, TupleRef)>>,
}

/// Shared handle to a leaf; identity is the allocation address.
pub type LeafRef = Arc<LeafNode>;

impl LeafNode {
    fn empty() -> LeafRef {
        Arc::new(LeafNode {
            version: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        })
    }

    /// The leaf's current version counter. 64 bits wide; wrap-around is not
    /// a practical concern at any achievable mutation rate.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// Callbacks for [`OrderedIndex::search_range_call`].
pub trait ScanHandler {
    /// Invoked once per visited leaf, before its entries. Return `false` to
    /// stop the scan.
    fn visit_leaf(&mut self, leaf: &LeafRef) -> bool;
    /// Invoked per in-range entry in key order. Return `false` to stop.
    fn visit_entry(&mut self, key: &[u8], tuple: TupleRef) -> bool;
}

/// A concurrent sorted map from keys to tuple pointers.
pub struct OrderedIndex {
    /// `(min_key, leaf)` pairs sorted by `min_key`; the first separator is
    /// empty so every key falls into some leaf.
    spine: RwLock<Vec<(Box<[u8]>, LeafRef)>>,
}

impl OrderedIndex {
    pub fn new() -> Self {
        Self {
            spine: RwLock::new(vec![(Box::default(), LeafNode::empty())]),
        }
    }

    /// Index of the leaf whose range covers `key`.
    fn locate(spine: &[(Box<[u8]>, LeafRef)], key: &[u8]) -> usize {
        spine.partition_point(|(min, _)| **min <= *key) - 1
    }

    /// Point lookup.
    pub fn search(&self, key: &[u8]) -> Option<TupleRef> {
        let spine = self.spine.read();
        let (_, leaf) = &spine[Self::locate(&spine, key)];
        let entries = leaf.entries.read();
        entries
            .binary_search_by(|(k, _)| (**k).cmp(key))
            .ok()
            .map(|i| entries[i].1)
    }

    /// Inserts only if the key is absent. On success returns the affected
    /// leaf and its version counter as observed just before the insert; on
    /// failure (key present) returns `None`.
    pub fn insert_if_absent(&self, key: &[u8], tuple: TupleRef) -> Option<(LeafRef, u64)> {
        let (leaf, pre, needs_split) = {
            let spine = self.spine.read();
            let (_, leaf) = &spine[Self::locate(&spine, key)];
            let mut entries = leaf.entries.write();
            match entries.binary_search_by(|(k, _)| (**k).cmp(key)) {
                Ok(_) => return None,
                Err(pos) => {
                    let pre = leaf.version();
                    entries.insert(pos, (key.into(), tuple));
                    leaf.version.store(pre + 1, Ordering::Release);
                    (leaf.clone(), pre, entries.len() > LEAF_CAPACITY)
                }
            }
        };
        if needs_split {
            self.split(&leaf);
        }
        Some((leaf, pre))
    }

    /// Unconditional insert-or-replace. Returns the previous mapping if the
    /// key existed. Replacing a value is not a structural change and does
    /// not bump the leaf version.
    pub fn insert(&self, key: &[u8], tuple: TupleRef) -> Option<TupleRef> {
        let (leaf, old, needs_split) = {
            let spine = self.spine.read();
            let (_, leaf) = &spine[Self::locate(&spine, key)];
            let mut entries = leaf.entries.write();
            match entries.binary_search_by(|(k, _)| (**k).cmp(key)) {
                Ok(i) => {
                    let old = std::mem::replace(&mut entries[i].1, tuple);
                    (leaf.clone(), Some(old), false)
                }
                Err(pos) => {
                    entries.insert(pos, (key.into(), tuple));
                    leaf.version.fetch_add(1, Ordering::AcqRel);
                    (leaf.clone(), None, entries.len() > LEAF_CAPACITY)
                }
            }
        };
        if needs_split {
            self.split(&leaf);
        }
        old
    }

    /// Unlinks a key, returning its mapping. Bumps the leaf version.
    pub fn remove(&self, key: &[u8]) -> Option<TupleRef> {
        let spine = self.spine.read();
        let (_, leaf) = &spine[Self::locate(&spine, key)];
        let mut entries = leaf.entries.write();
        match entries.binary_search_by(|(k, _)| (**k).cmp(key)) {
            Ok(i) => {
                let (_, old) = entries.remove(i);
                leaf.version.fetch_add(1, Ordering::AcqRel);
                Some(old)
            }
            Err(_) => None,
        }
    }

    /// Splits an overflowing leaf in half. Both halves end up with changed
    /// version counters.
    fn split(&self, leaf: &LeafRef) {
        let mut spine = self.spine.write();
        let pos = match spine.iter().position(|(_, l)| Arc::ptr_eq(l, leaf)) {
            Some(pos) => pos,
            // Already split by another thread.
            None => return,
        };
        let mut entries = leaf.entries.write();
        if entries.len() <= LEAF_CAPACITY {
            return;
        }
        let split_at = entries.len() / 2;
        let right_entries = entries.split_off(split_at);
        let right_min = right_entries[0].0.clone();
        let right = Arc::new(LeafNode {
            version: AtomicU64::new(1),
            entries: RwLock::new(right_entries),
        });
        leaf.version.fetch_add(1, Ordering::AcqRel);
        drop(entries);
        spine.insert(pos + 1, (right_min, right));
    }

    /// Invokes `handler` for each key in `[lo, hi)` (`hi = None` scans to
    /// the end), in key order. The handler sees each visited leaf before
    /// that leaf's entries.
    ///
    /// Each leaf's in-range entries are copied out under its read lock and
    /// the handler runs lock-free, so handlers may re-enter the index.
    pub fn search_range_call(&self, lo: &[u8], hi: Option<&[u8]>, handler: &mut dyn ScanHandler) {
        let leaves: Vec<LeafRef> = {
            let spine = self.spine.read();
            let start = Self::locate(&spine, lo);
            spine[start..].iter().map(|(_, l)| l.clone()).collect()
        };
        let mut batch: Vec<(Box<[u8]>, TupleRef)> = Vec::new();
        for leaf in leaves {
            if !handler.visit_leaf(&leaf) {
                return;
            }
            batch.clear();
            let mut past_hi = false;
            {
                let entries = leaf.entries.read();
                let from = entries.partition_point(|(k, _)| **k < *lo);
                for (k, t) in &entries[from..] {
                    if let Some(hi) = hi {
                        if **k >= *hi {
                            past_hi = true;
                            break;
                        }
                    }
                    batch.push((k.clone(), *t));
                }
            }
            for (k, t) in &batch {
                if !handler.visit_entry(k, *t) {
                    return;
                }
            }
            if past_hi {
                return;
            }
        }
    }

    /// Approximate number of keys.
    pub fn len(&self) -> usize {
        let spine = self.spine.read();
        spine.iter().map(|(_, l)| l.entries.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OrderedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OrderedIndex {
    fn drop(&mut self) {
        let spine = self.spine.get_mut();
        for (_, leaf) in spine.drain(..) {
            let mut entries = leaf.entries.write();
            for (_, tref) in entries.drain(..) {
                // SAFETY: dropping the index requires that no transaction
                // region can still observe its tuples.
                unsafe { tuple::free_chain(tref.0 as *mut Tuple) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::StableRead;
    use crossbeam_epoch::pin;

    fn key(i: usize) -> Vec<u8> {
        format!("k{:04}", i).into_bytes()
    }

    fn new_tuple(payload: &[u8]) -> TupleRef {
        let t = Tuple::alloc_first(false, payload);
        let guard = pin();
        // SAFETY: freshly allocated.
        let tuple = unsafe { t.get(&guard) };
        tuple.lock(true);
        tuple.publish_insert(1);
        tuple.unlock();
        t
    }

    struct Collect {
        keys: Vec<Vec<u8>>,
        leaves: usize,
    }

    impl ScanHandler for Collect {
        fn visit_leaf(&mut self, _leaf: &LeafRef) -> bool {
            self.leaves += 1;
            true
        }
        fn visit_entry(&mut self, key: &[u8], _tuple: TupleRef) -> bool {
            self.keys.push(key.to_vec());
            true
        }
    }

    #[test]
    fn insert_search_remove() {
        let index = OrderedIndex::new();
        let t = new_tuple(b"v");
        assert!(index.insert_if_absent(b"a", t).is_some());
        assert_eq!(index.search(b"a"), Some(t));
        assert_eq!(index.search(b"b"), None);
        let removed = index.remove(b"a").unwrap();
        assert_eq!(removed, t);
        assert_eq!(index.search(b"a"), None);
        // The index no longer owns the tuple.
        unsafe { tuple::free_chain(removed.0 as *mut Tuple) };
    }

    #[test]
    fn insert_if_absent_reports_pre_insert_version() {
        let index = OrderedIndex::new();
        let (leaf, pre) = index.insert_if_absent(b"a", new_tuple(b"1")).unwrap();
        assert_eq!(leaf.version(), pre + 1);
        let loser = Tuple::alloc_first(false, b"dup");
        assert!(index.insert_if_absent(b"a", loser).is_none());
        // The losing tuple was never published; release it directly.
        unsafe { Tuple::release_no_rcu(loser) };
    }

    #[test]
    fn replace_does_not_bump_version() {
        let index = OrderedIndex::new();
        let first = new_tuple(b"1");
        let (leaf, _) = index.insert_if_absent(b"a", first).unwrap();
        let v = leaf.version();
        let second = new_tuple(b"2");
        let old = index.insert(b"a", second);
        assert_eq!(old, Some(first));
        assert_eq!(leaf.version(), v);
        unsafe { tuple::free_chain(first.0 as *mut Tuple) };
    }

    #[test]
    fn splits_keep_order_and_coverage() {
        let index = OrderedIndex::new();
        let n = LEAF_CAPACITY * 4 + 7;
        for i in (0..n).rev() {
            assert!(index.insert_if_absent(&key(i), new_tuple(b"v")).is_some());
        }
        assert_eq!(index.len(), n);
        for i in 0..n {
            assert!(index.search(&key(i)).is_some(), "missing {}", i);
        }
        let mut c = Collect {
            keys: Vec::new(),
            leaves: 0,
        };
        index.search_range_call(b"", None, &mut c);
        assert_eq!(c.keys.len(), n);
        assert!(c.leaves > 1, "expected splits to have happened");
        assert!(c.keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn range_scan_respects_bounds() {
        let index = OrderedIndex::new();
        for i in 0..10 {
            index.insert_if_absent(&key(i), new_tuple(b"v")).unwrap();
        }
        let mut c = Collect {
            keys: Vec::new(),
            leaves: 0,
        };
        index.search_range_call(&key(3), Some(&key(7)), &mut c);
        assert_eq!(c.keys, (3..7).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn scan_sees_published_values() {
        let index = OrderedIndex::new();
        index.insert_if_absent(b"a", new_tuple(b"va")).unwrap();
        let guard = pin();
        let t = index.search(b"a").unwrap();
        // SAFETY: the index keeps the tuple alive.
        match unsafe { t.get(&guard) }.stable_read(&guard) {
            StableRead::Latest { value, .. } => assert_eq!(value, b"va"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
