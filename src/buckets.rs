//! Dense bucket array for small integer key domains.
//!
//! When a report key fits a small domain (ports, protocol numbers, SNMP
//! interface indexes) the aggregate lives in a flat slot array indexed by the
//! key itself. Sorting is a permutation over the occupied slots, mirroring
//! the hash table's sort index; the slots never move.

use crate::chash::SortVal;

#[derive(Debug, Clone)]
struct SortOrder {
    order: Vec<u32>,
    descending: bool,
}

/// Fixed-domain bucket array.
#[derive(Debug, Clone)]
pub struct IndexTable<V> {
    slots: Vec<Option<V>>,
    active: usize,
    sorted: Option<SortOrder>,
}

impl<V> IndexTable<V> {
    pub fn new(domain: usize) -> IndexTable<V> {
        let mut slots = Vec::new();
        slots.resize_with(domain, || None);
        IndexTable {
            slots,
            active: 0,
            sorted: None,
        }
    }

    pub fn domain(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slot count.
    pub fn entries(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn get(&self, index: usize) -> Option<&V> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    /// Return the slot for `index`, occupying it when untouched.
    ///
    /// Out-of-domain indexes clamp to the last slot so wide inputs land in a
    /// catch-all bucket.
    pub fn entry_mut(&mut self, index: usize, init: impl FnOnce() -> V) -> &mut V {
        let index = index.min(self.slots.len() - 1);
        let slot = &mut self.slots[index];
        if slot.is_none() {
            *slot = Some(init());
            self.active += 1;
            self.sorted = None;
        }
        slot.as_mut().unwrap()
    }

    /// Visit occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &V)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut V)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (i, v)))
    }

    /// Build the sort permutation over occupied slots.
    pub fn sort_by(&mut self, descending: bool, f: impl Fn(usize, &V) -> SortVal) {
        let mut order: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| i as u32))
            .collect();
        order.sort_by(|&a, &b| {
            let va = self.slots[a as usize].as_ref().unwrap();
            let vb = self.slots[b as usize].as_ref().unwrap();
            f(a as usize, va).compare(f(b as usize, vb))
        });
        self.sorted = Some(SortOrder { order, descending });
    }

    /// Drop any sort order; iteration reverts to index order.
    pub fn clear_sort(&mut self) {
        self.sorted = None;
    }

    /// Visit occupied slots in sorted order when a sort is in effect, else in
    /// index order.
    pub fn iter_ordered(&self) -> Box<dyn Iterator<Item = (usize, &V)> + '_> {
        match &self.sorted {
            Some(SortOrder { order, descending }) => {
                let walk = |idx: &u32| {
                    let i = *idx as usize;
                    (i, self.slots[i].as_ref().unwrap())
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
