//! Per-(transaction, table) working sets.
//!
//! Every table a transaction touches gets one [`TableContext`] holding its
//! read set, absent set, write set, node-scan set, and absent-range set.
//! The associative sets are inline-optimized: they live on the stack until
//! they outgrow their inline capacity, and whether a set spilled to the
//! heap is observable for space-class profiling.

use smallvec::SmallVec;

use crate::counters;
use crate::index::LeafRef;
use crate::range::{self, KeyRange};
use crate::tuple::TupleRef;
use crate::Tid;

/// Inline capacity of the working-set maps.
const INLINE: usize = 8;

/// An insertion-ordered associative container with inline storage.
///
/// Lookups are linear; working sets are small in the common case, and the
/// inline representation keeps them cache-resident. Growth past the inline
/// capacity is tracked, not prevented.
pub(crate) struct SmallMap<K, V> {
    entries: SmallVec<[(K, V); INLINE]>,
}

impl<K: PartialEq, V> SmallMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: SmallVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the map outgrew its inline storage.
    pub fn is_large(&self) -> bool {
        self.entries.spilled()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Inserts or replaces, returning a reference to the stored value.
    pub fn insert(&mut self, key: K, value: V) -> &mut V {
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
            self.entries[pos].1 = value;
            &mut self.entries[pos].1
        } else {
            self.entries.push((key, value));
            &mut self.entries.last_mut().unwrap().1
        }
    }

    /// Inserts only if absent; returns whether an insert happened.
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        if self.entries.iter().any(|(k, _)| *k == key) {
            return false;
        }
        self.entries.push((key, value));
        true
    }

    pub fn at(&self, i: usize) -> (&K, &V) {
        let (k, v) = &self.entries[i];
        (k, v)
    }

    /// Keyless lookup for callers holding a borrowed form of the key.
    pub fn find_by<F: FnMut(&K) -> bool>(&self, mut f: F) -> Option<&V> {
        self.entries.iter().find(|(k, _)| f(k)).map(|(_, v)| v)
    }

    pub fn find_by_mut<F: FnMut(&K) -> bool>(&mut self, mut f: F) -> Option<&mut V> {
        self.entries
            .iter_mut()
            .find(|(k, _)| f(k))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Read-set entry: the version the transaction observed as latest.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadRecord {
    /// Observed tid of the latest version.
    pub t: Tid,
    /// Set during commit when the tuple became a locked write target; the
    /// validation then uses the locked check instead of the stable one.
    pub holds_lock: bool,
}

/// How a key's absence was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbsentKind {
    /// Observed absent (or nil-latest) by a read.
    Read,
    /// Promoted during commit: the key now has a write target that must
    /// still be nil at validation.
    Write,
    /// Promoted during commit: this transaction inserted the key, which
    /// itself proves prior absence.
    Insert,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AbsentRecord {
    pub kind: AbsentKind,
    pub tuple: Option<TupleRef>,
}

/// Write-set entry: staged payload, empty meaning logical delete.
#[derive(Debug, Clone)]
pub(crate) struct WriteRecord {
    pub payload: Box<[u8]>,
    /// Hint that the key is expected absent, skipping the initial search.
    pub insert: bool,
}

/// Node-scan key: leaf identity is its allocation address.
pub(crate) struct LeafId(pub LeafRef);

impl PartialEq for LeafId {
    fn eq(&self, other: &Self) -> bool {
        std::sync::Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for LeafId {}

/// The per-table working sets of one transaction.
pub(crate) struct TableContext {
    pub read_set: SmallMap<TupleRef, ReadRecord>,
    pub absent_set: SmallMap<Box<[u8]>, AbsentRecord>,
    pub write_set: SmallMap<Box<[u8]>, WriteRecord>,
    /// Leaf version counters observed by scans (low-level-scan mode).
    pub node_scan: SmallMap<LeafId, u64>,
    /// Normalized empty intervals observed by scans (absent-range mode).
    pub absent_range_set: Vec<KeyRange>,
}

impl TableContext {
    pub fn new() -> Self {
        Self {
            read_set: SmallMap::new(),
            absent_set: SmallMap::new(),
            write_set: SmallMap::new(),
            node_scan: SmallMap::new(),
            absent_range_set: Vec::new(),
        }
    }

    /// Answers a point lookup from the working sets alone.
    ///
    /// Precedence: write set (its payload, empty meaning a pending delete),
    /// then absent set, then, outside low-level-scan mode, the absent
    /// ranges. `Some(None)` means "known absent or deleted"; `None` means
    /// the shared index must be consulted.
    pub fn local_search(&self, key: &[u8], low_level_scan: bool) -> Option<Option<Vec<u8>>> {
        counters::EVT_LOCAL_SEARCH_LOOKUPS.inc();

        if !self.write_set.is_empty() {
            if let Some(rec) = self.write_set.find_by(|k| **k == *key) {
                counters::EVT_LOCAL_SEARCH_WRITE_SET_HITS.inc();
                if rec.payload.is_empty() {
                    return Some(None);
                }
                return Some(Some(rec.payload.to_vec()));
            }
        }

        if !self.absent_set.is_empty() && self.absent_set.find_by(|k| **k == *key).is_some() {
            counters::EVT_LOCAL_SEARCH_ABSENT_SET_HITS.inc();
            return Some(None);
        }

        if !low_level_scan && self.key_in_absent_set(key) {
            return Some(None);
        }

        None
    }

    /// Binary search over the normalized absent-range list.
    pub fn key_in_absent_set(&self, key: &[u8]) -> bool {
        range::key_in_range_set(&self.absent_range_set, key)
    }

    /// Records an interval observed empty, merging into the normalized set.
    pub fn add_absent_range(&mut self, r: KeyRange) {
        range::merge_into(&mut self.absent_range_set, r);
    }

    pub fn clear(&mut self) {
        self.read_set.clear();
        self.absent_set.clear();
        self.write_set.clear();
        self.node_scan.clear();
        self.absent_range_set.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrec(payload: &[u8], insert: bool) -> WriteRecord {
        WriteRecord {
            payload: payload.into(),
            insert,
        }
    }

    #[test]
    fn local_search_prefers_write_set() {
        let mut ctx = TableContext::new();
        ctx.write_set.insert(b"k".to_vec().into(), wrec(b"v", false));
        ctx.absent_set.insert(
            b"k".to_vec().into(),
            AbsentRecord {
                kind: AbsentKind::Read,
                tuple: None,
            },
        );
        assert_eq!(ctx.local_search(b"k", false), Some(Some(b"v".to_vec())));
    }

    #[test]
    fn local_search_empty_payload_is_a_pending_delete() {
        let mut ctx = TableContext::new();
        ctx.write_set.insert(b"k".to_vec().into(), wrec(b"", false));
        assert_eq!(ctx.local_search(b"k", false), Some(None));
    }

    #[test]
    fn local_search_consults_absent_set_then_ranges() {
        let mut ctx = TableContext::new();
        ctx.absent_set.insert(
            b"gone".to_vec().into(),
            AbsentRecord {
                kind: AbsentKind::Read,
                tuple: None,
            },
        );
        ctx.add_absent_range(KeyRange::new(b"m", b"p"));

        assert_eq!(ctx.local_search(b"gone", false), Some(None));
        assert_eq!(ctx.local_search(b"n", false), Some(None));
        // Ranges are ignored in low-level-scan mode.
        assert_eq!(ctx.local_search(b"n", true), None);
        assert_eq!(ctx.local_search(b"zz", false), None);
    }

    #[test]
    fn small_map_tracks_spill() {
        let mut m: SmallMap<u32, u32> = SmallMap::new();
        for i in 0..INLINE as u32 {
            m.insert(i, i);
        }
        assert!(!m.is_large());
        m.insert(1000, 1000);
        assert!(m.is_large());
        assert_eq!(m.get(&1000), Some(&1000));
        assert_eq!(m.len(), INLINE + 1);
    }

    #[test]
    fn small_map_insert_replaces() {
        let mut m: SmallMap<u8, u8> = SmallMap::new();
        m.insert(1, 10);
        m.insert(1, 20);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&1), Some(&20));
        assert!(!m.insert_if_absent(1, 30));
        assert_eq!(m.get(&1), Some(&20));
    }
}
