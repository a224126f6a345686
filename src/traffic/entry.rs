//! Fixed-size per-node cache record.
//!
//! Every node the cache tracks costs exactly [`ENTRY_SIZE`] bytes. The table
//! stores records in their encoded form and policies work on a decoded copy
//! that is written back after the update.
//!
//! # Layout
//!
//! | bytes  | field                         |
//! |--------|-------------------------------|
//! | 0..4   | `node` (LE)                   |
//! | 4      | `pos_fingerprint`             |
//! | 5      | `rate_count`                  |
//! | 6      | `unknown_count`               |
//! | 7      | `pos_time` (0 = no position)  |
//! | 8      | `rate_time`                   |
//! | 9      | `unknown_time`                |

use crate::packet::NodeId;

/// Encoded size of one cache record.
pub const ENTRY_SIZE: usize = 10;

/// Encoded cache record.
pub type EncodedEntry = [u8; ENTRY_SIZE];

/// Encoded form of an empty slot.
pub const EMPTY_SLOT: EncodedEntry = [0; ENTRY_SIZE];

const NODE: usize = 0;
const POS_FINGERPRINT: usize = 4;
const RATE_COUNT: usize = 5;
const UNKNOWN_COUNT: usize = 6;
const POS_TIME: usize = 7;
const RATE_TIME: usize = 8;
const UNKNOWN_TIME: usize = 9;

/// Traffic state remembered for one originating node.
///
/// Timestamps are 8-bit ticks relative to the cache epoch; see
/// [`CacheEpoch`](super::CacheEpoch).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheEntry {
    /// Node this record belongs to, `0` for an empty slot.
    pub node: NodeId,
    /// Lossy token of the last reported position.
    pub pos_fingerprint: u8,
    /// Packets seen in the current rate window (saturating).
    pub rate_count: u8,
    /// Undecodable packets seen in the current window (saturating).
    pub unknown_count: u8,
    /// When the last position was accepted, as ticks + 1; 0 when none is
    /// on record.
    pub pos_time: u8,
    /// Start of the current rate window.
    pub rate_time: u8,
    /// Start of the current unknown-packet window.
    pub unknown_time: u8,
}

impl CacheEntry {
    /// Fresh record for `node` with all counters and timestamps zeroed.
    pub fn vacant(node: NodeId) -> Self {
        Self {
            node,
            ..Self::default()
        }
    }

    /// Whether this record marks an empty slot.
    pub fn is_empty(&self) -> bool {
        self.node == 0
    }

    /// Encode into the fixed table layout.
    pub fn encode(&self) -> EncodedEntry {
        let mut out = EMPTY_SLOT;
        out[NODE..NODE + 4].copy_from_slice(&self.node.to_le_bytes());
        out[POS_FINGERPRINT] = self.pos_fingerprint;
        out[RATE_COUNT] = self.rate_count;
        out[UNKNOWN_COUNT] = self.unknown_count;
        out[POS_TIME] = self.pos_time;
        out[RATE_TIME] = self.rate_time;
        out[UNKNOWN_TIME] = self.unknown_time;
        out
    }

    /// Decode from the fixed table layout.
    pub fn decode(raw: &EncodedEntry) -> Self {
        Self {
            node: decode_node(raw),
            pos_fingerprint: raw[POS_FINGERPRINT],
            rate_count: raw[RATE_COUNT],
            unknown_count: raw[UNKNOWN_COUNT],
            pos_time: raw[POS_TIME],
            rate_time: raw[RATE_TIME],
            unknown_time: raw[UNKNOWN_TIME],
        }
    }

    /// Count one more packet in the rate window, clamping at 255.
    pub fn bump_rate(&mut self) {
        self.rate_count = self.rate_count.saturating_add(1);
    }

    /// Count one more undecodable packet, clamping at 255.
    pub fn bump_unknown(&mut self) {
        self.unknown_count = self.unknown_count.saturating_add(1);
    }

    /// Forget position state.
    pub fn clear_position(&mut self) {
        self.pos_fingerprint = 0;
        self.pos_time = 0;
    }

    /// Forget rate-limit state.
    pub fn clear_rate(&mut self) {
        self.rate_count = 0;
        self.rate_time = 0;
    }

    /// Forget unknown-packet state.
    pub fn clear_unknown(&mut self) {
        self.unknown_count = 0;
        self.unknown_time = 0;
    }
}

/// Read only the node id of an encoded record.
///
/// Hash probing only needs the key, so it skips decoding the rest.
#[inline]
pub fn decode_node(raw: &EncodedEntry) -> NodeId {
    NodeId::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_field_by_field() {
        let entry = CacheEntry {
            node: 0x1122_3344,
            pos_fingerprint: 0xAB,
            rate_count: 1,
            unknown_count: 2,
            pos_time: 3,
            rate_time: 4,
            unknown_time: 5,
        };
        let raw = entry.encode();
        assert_eq!(raw, [0x44, 0x33, 0x22, 0x11, 0xAB, 1, 2, 3, 4, 5]);
        assert_eq!(CacheEntry::decode(&raw), entry);
        assert_eq!(decode_node(&raw), 0x1122_3344);
    }

    #[test]
    fn test_empty_slot_decodes_as_empty() {
        let entry = CacheEntry::decode(&EMPTY_SLOT);
        assert!(entry.is_empty());
        assert_eq!(entry, CacheEntry::default());
    }

    #[test]
    fn test_vacant_has_only_node() {
        let entry = CacheEntry::vacant(42);
        assert!(!entry.is_empty());
        assert_eq!(entry.encode()[4..], [0u8; 6]);
    }

    #[test]
    fn test_counters_saturate() {
        let mut entry = CacheEntry::vacant(7);
        entry.rate_count = 254;
        entry.bump_rate();
        entry.bump_rate();
        assert_eq!(entry.rate_count, 255);

        entry.unknown_count = 255;
        entry.bump_unknown();
        assert_eq!(entry.unknown_count, 255);
    }

    #[test]
    fn test_clear_helpers_touch_only_their_fields() {
        let mut entry = CacheEntry {
            node: 9,
            pos_fingerprint: 1,
            rate_count: 2,
            unknown_count: 3,
            pos_time: 4,
            rate_time: 5,
            unknown_time: 6,
        };
        entry.clear_rate();
        assert_eq!((entry.rate_count, entry.rate_time), (0, 0));
        assert_eq!((entry.pos_fingerprint, entry.pos_time), (1, 4));
        assert_eq!((entry.unknown_count, entry.unknown_time), (3, 6));

        entry.clear_position();
        entry.clear_unknown();
        assert_eq!(entry, CacheEntry::vacant(9));
    }
}
