//! Cuckoo hash table of encoded cache records.
//!
//! Every node id hashes to two candidate slots:
//!
//! - `h1 = node & mask` spreads sequential node ids evenly
//! - `h2 = (node × 2654435769) >> (32 − bits) & mask` (Fibonacci hashing)
//!   decorrelates the second slot from the first
//!
//! A record always lives in one of its two slots, so lookup is at most two
//! slot reads. Insertion into two full candidates displaces an occupant to its
//! alternate slot, possibly displacing another, up to [`MAX_CUCKOO_KICKS`]
//! moves. The displacement chain is planned before anything moves: if no
//! chain ends at an empty slot the table is left untouched and the insert
//! fails, and the caller carries on without cache state for that packet.
//!
//! The slot array is allocated once at construction, sized to the next power
//! of two at or above the requested capacity so indices are masked instead of
//! reduced modulo.

use super::entry::{decode_node, CacheEntry, EncodedEntry, EMPTY_SLOT, ENTRY_SIZE};
use crate::packet::NodeId;

/// Longest displacement chain tried before an insert gives up.
pub const MAX_CUCKOO_KICKS: usize = 16;

/// Largest supported slot count.
pub const MAX_TABLE_SLOTS: usize = 1 << 15;

/// 2^32 / φ, odd, so multiplication permutes the 32-bit space.
const FIBONACCI_MULTIPLIER: u32 = 2_654_435_769;

/// Slots visited by a planned displacement chain, start slot first.
struct KickPath {
    slots: [usize; MAX_CUCKOO_KICKS + 1],
    len: usize,
}

impl KickPath {
    fn starting_at(slot: usize) -> Self {
        let mut slots = [0; MAX_CUCKOO_KICKS + 1];
        slots[0] = slot;
        Self { slots, len: 1 }
    }

    fn last(&self) -> usize {
        self.slots[self.len - 1]
    }

    fn contains(&self, slot: usize) -> bool {
        self.slots[..self.len].contains(&slot)
    }

    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn push(&mut self, slot: usize) {
        self.slots[self.len] = slot;
        self.len += 1;
    }
}

/// Fixed-capacity cuckoo hash table keyed by node id.
pub struct CuckooTable {
    slots: Box<[EncodedEntry]>,
    mask: u32,
    hash_bits: u32,
    live: usize,
}

impl CuckooTable {
    /// Allocate a table with room for at least `nominal` records.
    ///
    /// The request is clamped to 2..=[`MAX_TABLE_SLOTS`].
    pub fn with_capacity(nominal: usize) -> Self {
        let size = nominal.clamp(2, MAX_TABLE_SLOTS).next_power_of_two();
        Self {
            slots: vec![EMPTY_SLOT; size].into_boxed_slice(),
            mask: (size - 1) as u32,
            hash_bits: size.trailing_zeros(),
            live: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bytes held by the slot array.
    pub fn memory_bytes(&self) -> usize {
        self.slots.len() * ENTRY_SIZE
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Primary slot for `node`.
    pub fn hash1(&self, node: NodeId) -> usize {
        (node & self.mask) as usize
    }

    /// Secondary slot for `node`.
    pub fn hash2(&self, node: NodeId) -> usize {
        ((node.wrapping_mul(FIBONACCI_MULTIPLIER) >> (32 - self.hash_bits)) & self.mask) as usize
    }

    fn node_at(&self, slot: usize) -> NodeId {
        decode_node(&self.slots[slot])
    }

    fn alternate(&self, node: NodeId, slot: usize) -> usize {
        let primary = self.hash1(node);
        if slot == primary {
            self.hash2(node)
        } else {
            primary
        }
    }

    /// Slot holding `node`, if it is cached.
    pub fn find(&self, node: NodeId) -> Option<usize> {
        if node == 0 {
            return None;
        }
        [self.hash1(node), self.hash2(node)]
            .into_iter()
            .find(|&slot| self.node_at(slot) == node)
    }

    /// Slot holding `node`, creating a zeroed record if needed.
    ///
    /// Returns the slot and whether the record was just created, or `None`
    /// when `node` is `0` or no displacement chain could make room.
    pub fn find_or_create(&mut self, node: NodeId) -> Option<(usize, bool)> {
        if node == 0 {
            return None;
        }
        if let Some(slot) = self.find(node) {
            return Some((slot, false));
        }

        let h1 = self.hash1(node);
        let h2 = self.hash2(node);

        for slot in [h1, h2] {
            if self.node_at(slot) == 0 {
                self.occupy(slot, node);
                return Some((slot, true));
            }
        }

        for start in [h1, h2] {
            if let Some(path) = self.plan_displacement(start) {
                self.shift_along(&path);
                self.occupy(start, node);
                return Some((start, true));
            }
        }

        None
    }

    /// Find a chain of moves from `start` ending at an empty slot.
    fn plan_displacement(&self, start: usize) -> Option<KickPath> {
        let mut path = KickPath::starting_at(start);
        loop {
            let current = path.last();
            let next = self.alternate(self.node_at(current), current);
            if path.contains(next) {
                return None;
            }
            path.push(next);
            if self.node_at(next) == 0 {
                return Some(path);
            }
            if path.is_full() {
                return None;
            }
        }
    }

    /// Move each occupant on the path one step along, freeing the start slot.
    fn shift_along(&mut self, path: &KickPath) {
        for i in (0..path.len - 1).rev() {
            self.slots[path.slots[i + 1]] = self.slots[path.slots[i]];
        }
        self.slots[path.slots[0]] = EMPTY_SLOT;
    }

    fn occupy(&mut self, slot: usize, node: NodeId) {
        self.slots[slot] = CacheEntry::vacant(node).encode();
        self.live += 1;
    }

    /// Decoded copy of the record in `slot`.
    pub fn get(&self, slot: usize) -> CacheEntry {
        CacheEntry::decode(&self.slots[slot])
    }

    /// Write back a record previously read from `slot`.
    ///
    /// The node id must be unchanged; records only move through insertion.
    pub fn set(&mut self, slot: usize, entry: &CacheEntry) {
        debug_assert_eq!(self.node_at(slot), entry.node);
        self.slots[slot] = entry.encode();
    }

    /// Read, modify and write back the record in `slot`.
    pub fn update<R>(&mut self, slot: usize, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
        let mut entry = self.get(slot);
        let result = f(&mut entry);
        self.set(slot, &entry);
        result
    }

    /// Visit every live record; records for which `keep` returns false are freed.
    ///
    /// Returns `(kept, freed)`.
    pub fn sweep(&mut self, mut keep: impl FnMut(&mut CacheEntry) -> bool) -> (usize, usize) {
        let mut kept = 0;
        let mut freed = 0;
        for raw in self.slots.iter_mut() {
            if decode_node(raw) == 0 {
                continue;
            }
            let mut entry = CacheEntry::decode(raw);
            if keep(&mut entry) {
                *raw = entry.encode();
                kept += 1;
            } else {
                *raw = EMPTY_SLOT;
                freed += 1;
            }
        }
        self.live -= freed;
        (kept, freed)
    }

    /// Free every slot.
    pub fn clear(&mut self) {
        self.slots.fill(EMPTY_SLOT);
        self.live = 0;
    }
}
