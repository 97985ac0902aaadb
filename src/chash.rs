//! Chained counting hash over a chunk arena.
//!
//! Aggregation buckets are allocated from fixed-size chunks that are only
//! released at teardown, so entry references stay valid for the lifetime of
//! the table and iteration in insertion order is a linear arena walk. The
//! caller supplies hash values; the table only masks them into its bucket
//! range. Sorting builds a permutation over the arena and leaves the entries
//! in place; any insert invalidates it.

use std::cmp::Ordering;

const EMPTY: u32 = u32::MAX;

/// Comparand for sorting aggregation entries.
///
/// `U40` compares a 32-bit value first and an 8-bit tiebreaker second,
/// lexicographically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SortVal {
    U8(u8),
    U16(u16),
    U32(u32),
    U40(u32, u8),
    U64(u64),
    F64(f64),
}

impl SortVal {
    pub fn compare(self, other: SortVal) -> Ordering {
        match (self, other) {
            (SortVal::U8(a), SortVal::U8(b)) => a.cmp(&b),
            (SortVal::U16(a), SortVal::U16(b)) => a.cmp(&b),
            (SortVal::U32(a), SortVal::U32(b)) => a.cmp(&b),
            (SortVal::U40(a, at), SortVal::U40(b, bt)) => a.cmp(&b).then(at.cmp(&bt)),
            (SortVal::U64(a), SortVal::U64(b)) => a.cmp(&b),
            (SortVal::F64(a), SortVal::F64(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone)]
struct Rec<K, V> {
    next: u32,
    key: K,
    val: V,
}

#[derive(Debug, Clone)]
struct SortOrder {
    order: Vec<u32>,
    descending: bool,
}

/// Chained hash keyed by a fixed-width key, valued by per-entry counters.
#[derive(Debug, Clone)]
pub struct CountingHash<K, V> {
    h_mask: u32,
    buckets: Vec<u32>,
    chunks: Vec<Vec<Rec<K, V>>>,
    per_chunk: usize,
    entries: usize,
    sorted: Option<SortOrder>,
}

impl<K: PartialEq + Copy, V> CountingHash<K, V> {
    /// Allocate a table with `h_size` buckets (a power of two) drawing
    /// entries from chunks of `per_chunk` records.
    pub fn new(h_size: usize, per_chunk: usize) -> CountingHash<K, V> {
        debug_assert!(h_size.is_power_of_two());
        debug_assert!(per_chunk > 0);
        CountingHash {
            h_mask: (h_size - 1) as u32,
            buckets: vec![EMPTY; h_size],
            chunks: Vec::new(),
            per_chunk,
            entries: 0,
            sorted: None,
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn h_size(&self) -> usize {
        self.buckets.len()
    }

    fn rec(&self, idx: u32) -> &Rec<K, V> {
        let idx = idx as usize;
        &self.chunks[idx / self.per_chunk][idx % self.per_chunk]
    }

    fn rec_mut(&mut self, idx: u32) -> &mut Rec<K, V> {
        let idx = idx as usize;
        &mut self.chunks[idx / self.per_chunk][idx % self.per_chunk]
    }

    fn find_in_bucket(&self, bucket: usize, key: &K) -> Option<u32> {
        let mut cur = self.buckets[bucket];
        while cur != EMPTY {
            let rec = self.rec(cur);
            if rec.key == *key {
                return Some(cur);
            }
            cur = rec.next;
        }
        None
    }

    fn alloc_rec(&mut self, rec: Rec<K, V>) -> u32 {
        if self
            .chunks
            .last()
            .is_none_or(|chunk| chunk.len() >= self.per_chunk)
        {
            self.chunks.push(Vec::with_capacity(self.per_chunk));
        }
        let num_chunks = self.chunks.len();
        let chunk = self.chunks.last_mut().unwrap();
        let idx = (num_chunks - 1) * self.per_chunk + chunk.len();
        chunk.push(rec);
        idx as u32
    }

    /// Look up an entry without inserting. `hash` is masked into the bucket
    /// range by the table.
    pub fn lookup(&self, key: &K, hash: u32) -> Option<&V> {
        let bucket = (hash & self.h_mask) as usize;
        self.find_in_bucket(bucket, key).map(|idx| &self.rec(idx).val)
    }

    /// Return the entry for `key`, allocating it from the arena when absent.
    ///
    /// A new entry is prepended to its bucket chain and clears any sort
    /// order.
    pub fn update(&mut self, key: K, hash: u32, init: impl FnOnce() -> V) -> &mut V {
        let bucket = (hash & self.h_mask) as usize;
        let idx = match self.find_in_bucket(bucket, &key) {
            Some(idx) => idx,
            None => {
                self.sorted = None;
                let idx = self.alloc_rec(Rec {
                    next: self.buckets[bucket],
                    key,
                    val: init(),
                });
                self.buckets[bucket] = idx;
                self.entries += 1;
                idx
            }
        };
        &mut self.rec_mut(idx).val
    }

    /// Visit every entry in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.chunks
            .iter()
            .flatten()
            .map(|rec| (&rec.key, &rec.val))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.chunks
            .iter_mut()
            .flatten()
            .map(|rec| (&rec.key, &mut rec.val))
    }

    /// Build the sort permutation for the current entries.
    ///
    /// Entries compare by the comparand `f` extracts; `descending` fixes the
    /// direction [`CountingHash::iter_ordered`] walks.
    pub fn sort_by(&mut self, descending: bool, f: impl Fn(&K, &V) -> SortVal) {
        let mut order: Vec<u32> = (0..self.entries as u32).collect();
        order.sort_by(|&a, &b| {
            let ra = self.rec(a);
            let rb = self.rec(b);
            f(&ra.key, &ra.val).compare(f(&rb.key, &rb.val))
        });
        self.sorted = Some(SortOrder { order, descending });
    }

    /// Drop any sort order; iteration reverts to insertion order.
    pub fn clear_sort(&mut self) {
        self.sorted = None;
    }

    /// Visit entries in sorted order when a sort is in effect, else in
    /// insertion order.
    pub fn iter_ordered(&self) -> Box<dyn Iterator<Item = (&K, &V)> + '_> {
        match &self.sorted {
            Some(SortOrder { order, descending }) => {
                let walk = |idx: &u32| {
                    let rec = self.rec(*idx);
                    (&rec.key, &rec.val)
                };
                if *descending {
                    Box::new(order.iter().rev().map(walk))
                } else {
                    Box::new(order.iter().map(walk))
                }
            }
            None => Box::new(self.iter()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CountingHash<u32, u64> {
        CountingHash::new(16, 4)
    }

    #[test]
    fn update_allocates_once_per_key() {
        let mut t = table();
        for _ in 0..3 {
            *t.update(7, 7, || 0) += 1;
        }
        *t.update(9, 9, || 0) += 1;

        assert_eq!(t.entries(), 2);
        assert_eq!(t.lookup(&7, 7), Some(&3));
        assert_eq!(t.lookup(&9, 9), Some(&1));
        assert_eq!(t.lookup(&8, 8), None);
    }

    #[test]
    fn colliding_keys_chain_in_one_bucket() {
        let mut t = table();
        // all hash to bucket 3
        for key in [3u32, 19, 35, 51, 67] {
            *t.update(key, 3, || 0) += u64::from(key);
        }
        assert_eq!(t.entries(), 5);
        for key in [3u32, 19, 35, 51, 67] {
            assert_eq!(t.lookup(&key, 3), Some(&u64::from(key)));
        }
    }

    #[test]
    fn iteration_follows_insertion_order_across_chunks() {
        let mut t = table();
        for key in 0..10u32 {
            t.update(key, key, || key as u64);
        }
        let keys: Vec<u32> = t.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (0..10).collect::<Vec<u32>>());
        assert!(t.chunks.len() > 1);
    }

    #[test]
    fn sort_ascending_and_descending() {
        let mut t = table();
        for (key, val) in [(1u32, 30u64), (2, 10), (3, 20)] {
            t.update(key, key, || val);
        }

        t.sort_by(false, |_, v| SortVal::U64(*v));
        let vals: Vec<u64> = t.iter_ordered().map(|(_, v)| *v).collect();
        assert_eq!(vals, vec![10, 20, 30]);

        t.sort_by(true, |_, v| SortVal::U64(*v));
        let vals: Vec<u64> = t.iter_ordered().map(|(_, v)| *v).collect();
        assert_eq!(vals, vec![30, 20, 10]);
    }

    #[test]
    fn insert_invalidates_sort() {
        let mut t = table();
        t.update(1, 1, || 5u64);
        t.sort_by(false, |_, v| SortVal::U64(*v));
        assert!(t.sorted.is_some());
        t.update(2, 2, || 1u64);
        assert!(t.sorted.is_none());
    }

    #[test]
    fn forty_bit_comparand_breaks_ties_on_low_byte() {
        let a = SortVal::U40(10, 2);
        let b = SortVal::U40(10, 3);
        let c = SortVal::U40(9, 200);
        assert_eq!(a.compare(b), Ordering::Less);
        assert_eq!(c.compare(a), Ordering::Less);
    }
}
