//! Per-segment reader/writer lock.
//!
//! The lock state is a single 64-bit word inside the segment's control
//! block, updated by compare-and-swap, so it works across every handle
//! mapping the same region (including other processes). Multi-reader,
//! single-writer; acquisition is bounded by a deadline and the caller
//! decides what a timeout means.
//!
//! Release happens in guard destructors, so the lock is dropped on
//! every exit path, panics included.

use std::time::{Duration, Instant};

use crate::bytes::ByteStore;

const WRITER: u64 = 1 << 63;
const READER_MASK: u64 = (1 << 31) - 1;

/// Spins this many times between deadline checks before yielding.
const SPINS_PER_ROUND: u32 = 64;

/// Handle to one segment's lock word.
#[derive(Clone, Copy)]
pub struct SegmentLock<'a> {
    store: &'a ByteStore,
    off: u64,
}

impl<'a> SegmentLock<'a> {
    pub fn new(store: &'a ByteStore, off: u64) -> SegmentLock<'a> {
        SegmentLock { store, off }
    }

    /// Acquire shared access. `None` on deadline expiry.
    pub fn read(&self, timeout: Duration) -> Option<ReadGuard<'a>> {
        let deadline = Instant::now() + timeout;
        loop {
            for _ in 0..SPINS_PER_ROUND {
                let word = self.store.load_u64_acquire(self.off);
                if word & WRITER == 0 && word & READER_MASK < READER_MASK {
                    if self.store.compare_and_swap_u64(self.off, word, word + 1) {
                        return Some(ReadGuard {
                            store: self.store,
                            off: self.off,
                        });
                    }
                    continue;
                }
                std::hint::spin_loop();
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }

    /// Acquire exclusive access. `None` on deadline expiry.
    pub fn write(&self, timeout: Duration) -> Option<WriteGuard<'a>> {
        let deadline = Instant::now() + timeout;
        loop {
            for _ in 0..SPINS_PER_ROUND {
                if self.store.compare_and_swap_u64(self.off, 0, WRITER) {
                    return Some(WriteGuard {
                        store: self.store,
                        off: self.off,
                    });
                }
                std::hint::spin_loop();
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }

    /// Reset the word to unlocked. Only valid while initializing or
    /// reopening a region single-threaded.
    pub fn force_reset(&self) {
        self.store.store_u64_release(self.off, 0);
    }
}

pub struct ReadGuard<'a> {
    store: &'a ByteStore,
    off: u64,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.store.fetch_sub_u64(self.off, 1);
    }
}

pub struct WriteGuard<'a> {
    store: &'a ByteStore,
    off: u64,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.store.store_u64_release(self.off, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const T: Duration = Duration::from_millis(200);

    fn store() -> Arc<ByteStore> {
        Arc::new(ByteStore::anonymous(64).unwrap())
    }

    #[test]
    fn readers_share() {
        let s = store();
        let lock = SegmentLock::new(&s, 0);
        let a = lock.read(T).unwrap();
        let b = lock.read(T).unwrap();
        drop(a);
        drop(b);
        assert_eq!(s.load_u64_acquire(0), 0);
    }

    #[test]
    fn writer_excludes_readers() {
        let s = store();
        let lock = SegmentLock::new(&s, 0);
        let w = lock.write(T).unwrap();
        assert!(lock.read(Duration::from_millis(20)).is_none());
        assert!(lock.write(Duration::from_millis(20)).is_none());
        drop(w);
        assert!(lock.read(T).is_some());
    }

    #[test]
    fn reader_blocks_writer_until_released() {
        let s = store();
        let lock = SegmentLock::new(&s, 0);
        let r = lock.read(T).unwrap();
        assert!(lock.write(Duration::from_millis(20)).is_none());
        drop(r);
        assert!(lock.write(T).is_some());
    }

    #[test]
    fn timeout_expires_under_contention() {
        let s = store();
        let s2 = Arc::clone(&s);
        let held = std::sync::mpsc::channel();
        let release = std::sync::mpsc::channel::<()>();
        let tx = held.0;
        let rx = release.1;
        let handle = std::thread::spawn(move || {
            let lock = SegmentLock::new(&s2, 0);
            let guard = lock.write(T).unwrap();
            tx.send(()).unwrap();
            rx.recv().unwrap();
            drop(guard);
        });
        held.1.recv().unwrap();
        let lock = SegmentLock::new(&s, 0);
        let started = Instant::now();
        assert!(lock.write(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        release.0.send(()).unwrap();
        handle.join().unwrap();
        assert!(lock.write(T).is_some());
    }

    #[test]
    fn guard_releases_on_panic() {
        let s = store();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let lock = SegmentLock::new(&s, 0);
            let _guard = lock.write(T).unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(s.load_u64_acquire(0), 0);
    }
}
