//! Per-segment open-addressed hash lookup.
//!
//! A power-of-two array of 64-bit slots, each packing
//! `(entry_pos << 32) | hash32`, where `hash32` is the low half of the
//! segment hash. Slot value 0 means empty; a segment hash whose low
//! half is 0 is stored as `0x8000_0000` so an occupied slot can never
//! be 0. Collisions are resolved by linear probing and removal uses
//! backward-shift deletion, so a probe chain is never broken.
//!
//! Slot stores are release-ordered and loads acquire-ordered: an entry
//! is fully written before the slot that publishes it.

use crate::bytes::ByteStore;
use crate::offheap::layout::Geometry;

/// Replacement for a zero low half; occupied slots must be non-zero.
const ZERO_HASH_SUBST: u32 = 0x8000_0000;

#[inline]
fn adjust_hash(segment_hash: u64) -> u32 {
    let h = segment_hash as u32;
    if h == 0 {
        ZERO_HASH_SUBST
    } else {
        h
    }
}

#[inline]
fn pack(hash32: u32, entry_pos: u32) -> u64 {
    ((entry_pos as u64) << 32) | hash32 as u64
}

/// View of one segment's lookup table. The caller holds the segment
/// lock (read for `search`, write for mutations).
#[derive(Clone, Copy)]
pub struct HashLookup<'a> {
    store: &'a ByteStore,
    geo: &'a Geometry,
    segment: usize,
}

impl<'a> HashLookup<'a> {
    pub fn new(store: &'a ByteStore, geo: &'a Geometry, segment: usize) -> HashLookup<'a> {
        HashLookup {
            store,
            geo,
            segment,
        }
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.geo.lookup_slots - 1
    }

    #[inline]
    fn load(&self, slot: u32) -> u64 {
        self.store.load_u64_acquire(self.geo.slot_off(self.segment, slot))
    }

    #[inline]
    fn publish(&self, slot: u32, word: u64) {
        self.store
            .store_u64_release(self.geo.slot_off(self.segment, slot), word);
    }

    /// Probe for every candidate whose stored hash matches, in probe
    /// order, stopping at the first empty slot.
    pub fn search(&self, segment_hash: u64) -> ProbeSearch<'a> {
        let hash32 = adjust_hash(segment_hash);
        ProbeSearch {
            lookup: *self,
            hash32,
            idx: hash32 & self.mask(),
            steps: 0,
            current_slot: 0,
            empty_slot: None,
        }
    }

    /// Point an existing slot at a relocated entry, keeping its hash
    /// bits. The caller identified `slot` through a search.
    pub fn replace_at(&self, slot: u32, entry_pos: u32) {
        let word = self.load(slot);
        debug_assert_ne!(word, 0);
        self.publish(slot, pack(word as u32, entry_pos));
    }

    /// Clear `slot` and backward-shift the tail of its probe chain.
    pub fn remove_at(&self, slot: u32) {
        let mask = self.mask();
        let mut empty = slot;
        let mut j = (empty + 1) & mask;
        loop {
            let word = self.load(j);
            if word == 0 {
                break;
            }
            // Move j's occupant back if its ideal slot is at or before
            // the hole (wrap-aware).
            let ideal = (word as u32) & mask;
            let moves = if empty <= j {
                ideal <= empty || ideal > j
            } else {
                ideal <= empty && ideal > j
            };
            if moves {
                self.publish(empty, word);
                empty = j;
            }
            j = (j + 1) & mask;
        }
        self.publish(empty, 0);
    }

    /// Zero every slot. Caller holds the write lock.
    pub fn clear(&self) {
        for slot in 0..self.geo.lookup_slots {
            self.publish(slot, 0);
        }
    }

    /// Entry positions of every occupied slot, in table order. Caller
    /// holds at least the read lock.
    pub fn occupied(&self) -> impl Iterator<Item = u32> + 'a {
        let this = *self;
        (0..self.geo.lookup_slots).filter_map(move |slot| {
            let word = this.load(slot);
            if word == 0 {
                None
            } else {
                Some((word >> 32) as u32)
            }
        })
    }
}

/// In-progress linear probe over a segment's lookup table.
pub struct ProbeSearch<'a> {
    lookup: HashLookup<'a>,
    hash32: u32,
    idx: u32,
    steps: u32,
    current_slot: u32,
    empty_slot: Option<u32>,
}

impl ProbeSearch<'_> {
    /// Next candidate entry position, or `None` at the first empty
    /// slot (or a full sweep of the table).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<u32> {
        let mask = self.lookup.mask();
        while self.steps <= mask {
            let slot = self.idx;
            self.idx = (self.idx + 1) & mask;
            self.steps += 1;
            let word = self.lookup.load(slot);
            if word == 0 {
                self.empty_slot = Some(slot);
                return None;
            }
            if word as u32 == self.hash32 {
                self.current_slot = slot;
                return Some((word >> 32) as u32);
            }
        }
        // Full table sweep without an empty slot: the sizer guarantees
        // spare capacity, so this only happens on a corrupt image.
        self.empty_slot = None;
        None
    }

    /// Slot of the candidate most recently returned by [`Self::next`].
    pub fn current_slot(&self) -> u32 {
        self.current_slot
    }

    /// Insert at the empty slot that ended this search. Caller holds
    /// the write lock and has exhausted `next()`.
    pub fn put_after_probe(&self, entry_pos: u32) {
        let slot = self
            .empty_slot
            .unwrap_or_else(|| panic!("lookup table full: map image corrupt"));
        self.lookup.publish(slot, pack(self.hash32, entry_pos));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offheap::layout::FileHeader;

    fn fixture() -> (ByteStore, Geometry) {
        let h = FileHeader {
            segment_count: 1,
            chunks_per_segment: 64,
            chunk_size: 32,
            entries_per_segment: 64,
            lookup_slots: 8,
            meta_data_bytes: 0,
            alignment: 1,
            replication_identifier: 0,
            replicas: 0,
        };
        let geo = Geometry::from_header(&h);
        let store = ByteStore::anonymous(geo.total_size() as usize).unwrap();
        (store, geo)
    }

    fn insert(lookup: &HashLookup<'_>, hash: u64, pos: u32) {
        let mut search = lookup.search(hash);
        while search.next().is_some() {}
        search.put_after_probe(pos);
    }

    fn find(lookup: &HashLookup<'_>, hash: u64, pos: u32) -> Option<u32> {
        let mut search = lookup.search(hash);
        while let Some(p) = search.next() {
            if p == pos {
                return Some(search.current_slot());
            }
        }
        None
    }

    #[test]
    fn insert_and_search() {
        let (store, geo) = fixture();
        let lookup = HashLookup::new(&store, &geo, 0);
        insert(&lookup, 42, 5);
        assert!(find(&lookup, 42, 5).is_some());
        assert!(find(&lookup, 43, 5).is_none());
    }

    #[test]
    fn collisions_probe_in_order() {
        let (store, geo) = fixture();
        let lookup = HashLookup::new(&store, &geo, 0);
        // Same low bits modulo 8, distinct hash32 values.
        insert(&lookup, 0x10, 1);
        insert(&lookup, 0x18, 2);
        insert(&lookup, 0x20, 3);
        assert!(find(&lookup, 0x10, 1).is_some());
        assert!(find(&lookup, 0x18, 2).is_some());
        assert!(find(&lookup, 0x20, 3).is_some());
    }

    #[test]
    fn same_hash_yields_every_candidate() {
        let (store, geo) = fixture();
        let lookup = HashLookup::new(&store, &geo, 0);
        insert(&lookup, 7, 1);
        insert(&lookup, 7, 2);
        let mut search = lookup.search(7);
        assert_eq!(search.next(), Some(1));
        assert_eq!(search.next(), Some(2));
        assert_eq!(search.next(), None);
    }

    #[test]
    fn zero_hash_is_storable() {
        let (store, geo) = fixture();
        let lookup = HashLookup::new(&store, &geo, 0);
        // Low 32 bits zero: must still produce a non-zero slot word.
        insert(&lookup, 0x1_0000_0000, 0);
        assert!(find(&lookup, 0x1_0000_0000, 0).is_some());
        let mut other = lookup.search(1);
        assert_eq!(other.next(), None);
    }

    #[test]
    fn backward_shift_keeps_chains_reachable() {
        let (store, geo) = fixture();
        let lookup = HashLookup::new(&store, &geo, 0);
        insert(&lookup, 0x10, 1); // slot 0
        insert(&lookup, 0x18, 2); // probes to slot 1
        insert(&lookup, 0x20, 3); // probes to slot 2
        let slot = find(&lookup, 0x10, 1).unwrap();
        lookup.remove_at(slot);
        assert!(find(&lookup, 0x18, 2).is_some());
        assert!(find(&lookup, 0x20, 3).is_some());
        assert!(find(&lookup, 0x10, 1).is_none());
    }

    #[test]
    fn probe_chain_wraps_around_the_table() {
        let (store, geo) = fixture();
        let lookup = HashLookup::new(&store, &geo, 0);
        // Ideal slot 7 (the last): the second insert wraps to slot 0.
        insert(&lookup, 0x0f, 1);
        insert(&lookup, 0x17, 2);
        assert!(find(&lookup, 0x17, 2).is_some());
        let slot = find(&lookup, 0x0f, 1).unwrap();
        lookup.remove_at(slot);
        assert!(find(&lookup, 0x17, 2).is_some());
    }

    #[test]
    fn replace_at_keeps_hash_bits() {
        let (store, geo) = fixture();
        let lookup = HashLookup::new(&store, &geo, 0);
        insert(&lookup, 42, 5);
        let slot = find(&lookup, 42, 5).unwrap();
        lookup.replace_at(slot, 9);
        assert!(find(&lookup, 42, 9).is_some());
        assert!(find(&lookup, 42, 5).is_none());
    }

    #[test]
    fn clear_then_occupied_is_empty() {
        let (store, geo) = fixture();
        let lookup = HashLookup::new(&store, &geo, 0);
        insert(&lookup, 1, 1);
        insert(&lookup, 2, 2);
        assert_eq!(lookup.occupied().count(), 2);
        lookup.clear();
        assert_eq!(lookup.occupied().count(), 0);
    }
}
