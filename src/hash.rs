//! Key hashing and segment routing.
//!
//! xxHash-64 (seed 0) is part of the persisted file format: a file
//! written by one process is probed with the same hash by every other.

use xxhash_rust::xxh64::xxh64;

/// 64-bit hash of the serialized key bytes.
#[inline]
pub fn hash64(key_bytes: &[u8]) -> u64 {
    xxh64(key_bytes, 0)
}

/// A key hash split into its routing and lookup parts.
#[derive(Clone, Copy, Debug)]
pub struct SplitHash {
    /// Index of the segment that owns the key.
    pub segment: usize,
    /// `hash64(key) >> log2(segment_count)`, the part stored in the
    /// segment's lookup slots.
    pub segment_hash: u64,
}

/// Route a hash to a segment. `segment_count` must be a power of two.
#[inline]
pub fn split(hash: u64, segment_count: u32) -> SplitHash {
    debug_assert!(segment_count.is_power_of_two());
    let log2 = segment_count.trailing_zeros();
    SplitHash {
        segment: (hash & (segment_count as u64 - 1)) as usize,
        segment_hash: hash >> log2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_routes_within_bounds() {
        for i in 0..1000u64 {
            let h = hash64(&i.to_le_bytes());
            let s = split(h, 16);
            assert!(s.segment < 16);
            assert_eq!(s.segment_hash, h >> 4);
        }
    }

    #[test]
    fn single_segment_keeps_full_hash() {
        let h = hash64(b"key");
        let s = split(h, 1);
        assert_eq!(s.segment, 0);
        assert_eq!(s.segment_hash, h);
    }

    #[test]
    fn hash_is_stable() {
        // Pinned: the hash is part of the file format.
        assert_eq!(hash64(b""), xxh64(b"", 0));
        assert_ne!(hash64(b"a"), hash64(b"b"));
    }
}
