//! Per-segment chunk allocator.
//!
//! One bit per chunk, 1 = free. Variable-sized entries take a run of
//! consecutive chunks; allocation scans for the first fitting run
//! starting at a rotating cursor (stored in the segment's control
//! block) to spread fragmentation, falling back to a full linear scan
//! from chunk zero. All access happens under the segment write lock.

use crate::bytes::ByteStore;
use crate::offheap::layout::Geometry;

#[derive(Clone, Copy)]
pub struct FreeBits<'a> {
    store: &'a ByteStore,
    geo: &'a Geometry,
    segment: usize,
}

impl<'a> FreeBits<'a> {
    pub fn new(store: &'a ByteStore, geo: &'a Geometry, segment: usize) -> FreeBits<'a> {
        FreeBits {
            store,
            geo,
            segment,
        }
    }

    /// Mark every chunk free and reset the scan cursor. Used at region
    /// initialization and by `clear()`.
    pub fn reset_all_free(&self) {
        for word in 0..self.geo.chunks_per_segment / 64 {
            self.store
                .write_u64(self.geo.freebits_word_off(self.segment, word), u64::MAX);
        }
        self.store
            .write_u64(self.geo.alloc_cursor_off(self.segment), 0);
    }

    #[inline]
    pub fn is_free(&self, chunk: u32) -> bool {
        let word = self
            .store
            .read_u64(self.geo.freebits_word_off(self.segment, chunk / 64));
        word & (1 << (chunk % 64)) != 0
    }

    #[inline]
    fn set_bit(&self, chunk: u32, free: bool) {
        let off = self.geo.freebits_word_off(self.segment, chunk / 64);
        let word = self.store.read_u64(off);
        let mask = 1u64 << (chunk % 64);
        self.store
            .write_u64(off, if free { word | mask } else { word & !mask });
    }

    /// Claim the first run of `n_chunks` consecutive free chunks.
    /// Returns the starting chunk, or `None` when the segment is full.
    pub fn allocate(&self, n_chunks: u32) -> Option<u32> {
        let chunks = self.geo.chunks_per_segment;
        if n_chunks == 0 || n_chunks > chunks {
            return None;
        }
        let cursor_off = self.geo.alloc_cursor_off(self.segment);
        let start = (self.store.read_u64(cursor_off) as u32) % chunks;

        let found = self
            .scan(start, chunks, n_chunks)
            .or_else(|| self.scan(0, chunks, n_chunks))?;
        for chunk in found..found + n_chunks {
            self.set_bit(chunk, false);
        }
        self.store
            .write_u64(cursor_off, ((found + n_chunks) % chunks) as u64);
        Some(found)
    }

    fn scan(&self, from: u32, to: u32, n_chunks: u32) -> Option<u32> {
        let mut run = 0u32;
        let mut run_start = 0u32;
        let mut chunk = from;
        while chunk < to {
            // Skip fully-occupied words in one step.
            if run == 0 && chunk % 64 == 0 {
                let word = self
                    .store
                    .read_u64(self.geo.freebits_word_off(self.segment, chunk / 64));
                if word == 0 {
                    chunk += 64;
                    continue;
                }
            }
            if self.is_free(chunk) {
                if run == 0 {
                    run_start = chunk;
                }
                run += 1;
                if run == n_chunks {
                    return Some(run_start);
                }
            } else {
                run = 0;
            }
            chunk += 1;
        }
        None
    }

    /// Return a previously allocated run.
    pub fn free(&self, pos: u32, n_chunks: u32) {
        for chunk in pos..pos + n_chunks {
            debug_assert!(!self.is_free(chunk), "double free of chunk {chunk}");
            self.set_bit(chunk, true);
        }
    }

    #[cfg(test)]
    pub fn count_free(&self) -> u32 {
        (0..self.geo.chunks_per_segment / 64)
            .map(|w| {
                self.store
                    .read_u64(self.geo.freebits_word_off(self.segment, w))
                    .count_ones()
            })
            .sum()
    }
}
