//! Half-open key ranges and the normalized absent-range set.
//!
//! A transaction that scanned an interval and found it empty records the
//! interval here. The set is kept normalized at all times: sorted by start
//! key, disjoint, and with touching neighbors merged, so membership tests
//! are a single binary search and commit-time revalidation walks each range
//! exactly once.

/// A half-open key range `[a, b)`, or `[a, +inf)` when `b` is `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub a: Box<[u8]>,
    pub b: Option<Box<[u8]>>,
}

impl KeyRange {
    pub fn new(a: &[u8], b: &[u8]) -> Self {
        Self {
            a: a.into(),
            b: Some(b.into()),
        }
    }

    pub fn unbounded(a: &[u8]) -> Self {
        Self { a: a.into(), b: None }
    }

    /// `[a, a)` covers nothing.
    pub fn is_empty_range(&self) -> bool {
        match &self.b {
            Some(b) => *self.a == **b,
            None => false,
        }
    }

    /// Whether `other` lies entirely within `self`.
    pub fn contains(&self, other: &KeyRange) -> bool {
        if other.a < self.a {
            return false;
        }
        match (&self.b, &other.b) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(sb), Some(ob)) => ob <= sb,
        }
    }

    pub fn key_in_range(&self, k: &[u8]) -> bool {
        *self.a <= *k
            && match &self.b {
                Some(b) => *k < **b,
                None => true,
            }
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}, ", self.a)?;
        match &self.b {
            Some(b) => write!(f, "{:?})", b),
            None => write!(f, "+inf)"),
        }
    }
}

/// Checks the normalization invariant: sorted by start, disjoint, and no two
/// neighbors share a boundary (they would have been merged).
pub fn assert_valid_range_set(ranges: &[KeyRange]) {
    for w in ranges.windows(2) {
        let (prev, next) = (&w[0], &w[1]);
        let pb = prev
            .b
            .as_ref()
            .expect("only the last range may be unbounded");
        assert!(prev.a < next.a, "ranges out of order");
        assert!(**pb < *next.a, "ranges overlap or touch");
    }
    for r in ranges {
        assert!(!r.is_empty_range(), "empty range in set");
    }
}

/// Merges `range` into the normalized set `set`, preserving normalization.
///
/// The search locates the first existing range whose upper bound exceeds
/// `range.a`; everything the new range overlaps or touches from there on is
/// subsumed into a single emitted range.
pub fn merge_into(set: &mut Vec<KeyRange>, range: KeyRange) {
    if range.is_empty_range() {
        return;
    }

    // First range with b > range.a (an unbounded b always qualifies).
    let idx = set.partition_point(|r| match &r.b {
        Some(b) => **b <= *range.a,
        None => false,
    });

    if idx == set.len() {
        if let Some(last) = set.last_mut() {
            if last.b.as_deref() == Some(&*range.a) {
                last.b = range.b;
                debug_assert_valid(set);
                return;
            }
        }
        set.push(range);
        debug_assert_valid(set);
        return;
    }

    if set[idx].contains(&range) {
        return;
    }

    let merge_left = idx > 0 && set[idx - 1].b.as_deref() == Some(&*range.a);
    let left_key = if merge_left {
        set[idx - 1].a.clone()
    } else {
        set[idx].a.clone().min(range.a.clone())
    };
    let keep = if merge_left { idx - 1 } else { idx };

    let mut out: Vec<KeyRange> = Vec::with_capacity(set.len() + 1);
    out.extend_from_slice(&set[..keep]);

    match &range.b {
        Some(rb) => {
            let it = &set[idx];
            let it_subsumes = match &it.b {
                None => true,
                Some(ib) => ib >= rb,
            };
            if it_subsumes {
                if **rb < *it.a {
                    // New range ends strictly before `it` starts.
                    out.push(KeyRange {
                        a: left_key,
                        b: Some(rb.clone()),
                    });
                    out.extend_from_slice(&set[idx..]);
                } else {
                    // Overlaps or touches `it`; take its upper bound.
                    out.push(KeyRange {
                        a: left_key,
                        b: it.b.clone(),
                    });
                    out.extend_from_slice(&set[idx + 1..]);
                }
            } else {
                // Walk forward, subsuming every range the new upper bound
                // overlaps or touches.
                let mut j = idx + 1;
                while j < set.len() {
                    let r = &set[j];
                    let stop = *r.a >= **rb
                        || match &r.b {
                            None => true,
                            Some(b) => b >= rb,
                        };
                    if stop {
                        break;
                    }
                    j += 1;
                }
                if j == set.len() {
                    out.push(KeyRange {
                        a: left_key,
                        b: Some(rb.clone()),
                    });
                } else if *set[j].a <= **rb {
                    out.push(KeyRange {
                        a: left_key,
                        b: set[j].b.clone(),
                    });
                    out.extend_from_slice(&set[j + 1..]);
                } else {
                    out.push(KeyRange {
                        a: left_key,
                        b: Some(rb.clone()),
                    });
                    out.extend_from_slice(&set[j..]);
                }
            }
        }
        None => {
            // Unbounded above: everything from here on is subsumed.
            out.push(KeyRange { a: left_key, b: None });
        }
    }

    debug_assert_valid(&out);
    *set = out;
}

#[inline]
fn debug_assert_valid(set: &[KeyRange]) {
    if cfg!(debug_assertions) {
        assert_valid_range_set(set);
    }
}

/// Binary-searches a normalized set for a key.
pub fn key_in_range_set(set: &[KeyRange], k: &[u8]) -> bool {
    let idx = set.partition_point(|r| match &r.b {
        Some(b) => **b <= *k,
        None => false,
    });
    match set.get(idx) {
        Some(r) => r.key_in_range(k),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(a: &[u8], b: &[u8]) -> KeyRange {
        KeyRange::new(a, b)
    }

    #[test]
    fn empty_range_is_noop() {
        let mut set = vec![r(b"a", b"c")];
        merge_into(&mut set, r(b"m", b"m"));
        assert_eq!(set, vec![r(b"a", b"c")]);
    }

    #[test]
    fn disjoint_ranges_accumulate_sorted() {
        let mut set = Vec::new();
        merge_into(&mut set, r(b"m", b"p"));
        merge_into(&mut set, r(b"a", b"c"));
        merge_into(&mut set, r(b"x", b"z"));
        assert_eq!(set, vec![r(b"a", b"c"), r(b"m", b"p"), r(b"x", b"z")]);
    }

    #[test]
    fn touching_ranges_merge() {
        let mut set = vec![r(b"a", b"c")];
        merge_into(&mut set, r(b"c", b"f"));
        assert_eq!(set, vec![r(b"a", b"f")]);

        let mut set = vec![r(b"c", b"f")];
        merge_into(&mut set, r(b"a", b"c"));
        assert_eq!(set, vec![r(b"a", b"f")]);
    }

    #[test]
    fn contained_range_is_noop() {
        let mut set = vec![r(b"a", b"z")];
        merge_into(&mut set, r(b"c", b"f"));
        assert_eq!(set, vec![r(b"a", b"z")]);
    }

    #[test]
    fn overlap_subsumes_multiple() {
        let mut set = vec![r(b"a", b"c"), r(b"e", b"g"), r(b"i", b"k"), r(b"x", b"z")];
        merge_into(&mut set, r(b"b", b"j"));
        assert_eq!(set, vec![r(b"a", b"k"), r(b"x", b"z")]);
    }

    #[test]
    fn unbounded_drops_tail() {
        let mut set = vec![r(b"a", b"c"), r(b"e", b"g"), r(b"i", b"k")];
        merge_into(&mut set, KeyRange::unbounded(b"f"));
        assert_eq!(set, vec![r(b"a", b"c"), KeyRange::unbounded(b"e")]);
    }

    #[test]
    fn unbounded_tail_absorbs_everything_after() {
        let mut set = vec![KeyRange::unbounded(b"m")];
        merge_into(&mut set, r(b"p", b"q"));
        assert_eq!(set, vec![KeyRange::unbounded(b"m")]);
    }

    #[test]
    fn gap_before_next_range_stays_split() {
        let mut set = vec![r(b"m", b"p")];
        merge_into(&mut set, r(b"a", b"c"));
        assert_eq!(set, vec![r(b"a", b"c"), r(b"m", b"p")]);
    }

    #[test]
    fn membership_binary_search_matches_linear() {
        let set = vec![r(b"b", b"d"), r(b"f", b"h"), KeyRange::unbounded(b"m")];
        assert_valid_range_set(&set);
        for k in [&b"a"[..], b"b", b"c", b"d", b"e", b"f", b"g", b"h", b"l", b"m", b"zz"] {
            let linear = set.iter().any(|r| r.key_in_range(k));
            assert_eq!(key_in_range_set(&set, k), linear, "key {:?}", k);
        }
    }

    #[test]
    fn contains_and_key_in_range() {
        let outer = r(b"b", b"y");
        assert!(outer.contains(&r(b"b", b"y")));
        assert!(outer.contains(&r(b"c", b"d")));
        assert!(!outer.contains(&r(b"a", b"d")));
        assert!(!outer.contains(&r(b"c", b"z")));
        assert!(!outer.contains(&KeyRange::unbounded(b"c")));
        assert!(KeyRange::unbounded(b"b").contains(&KeyRange::unbounded(b"c")));

        assert!(outer.key_in_range(b"b"));
        assert!(outer.key_in_range(b"x"));
        assert!(!outer.key_in_range(b"y"));
        assert!(!outer.key_in_range(b"a"));
    }
}
