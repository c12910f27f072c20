//! Single-segment operations.
//!
//! A segment combines its lookup table, free-bit allocator, size and
//! modification counters, lock word and entry arena. Every public
//! operation acquires the segment lock (read or write) with the
//! configured deadline and releases it on all paths via guard drop.
//!
//! Entries are published by the release-store of a lookup slot after
//! their bytes are fully written; value replacement writes the new
//! bytes before the value size.

use std::time::Duration;

use crate::bytes::{stop_bit_len, ByteStore, Cursor};
use crate::error::{Error, Result};
use crate::event::{MapErrorListener, MapEventListener};
use crate::offheap::freebits::FreeBits;
use crate::offheap::layout::{align_up, Geometry};
use crate::offheap::lock::{ReadGuard, SegmentLock, WriteGuard};
use crate::offheap::lookup::{HashLookup, ProbeSearch};

/// Replication stamp carried by a mutation on a replicated map.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Stamp {
    pub identifier: u8,
    pub timestamp: u64,
    /// Remote stamps are subject to last-writer-wins filtering; local
    /// stamps always apply.
    pub remote: bool,
}

#[derive(Debug, Default)]
pub(crate) struct PutResult {
    /// Raw bytes of the previous value, when requested and present.
    pub previous: Option<Vec<u8>>,
    /// Whether a new (or revived) entry was created.
    pub added: bool,
    /// False when a remote stamp lost last-writer-wins.
    pub ignored: bool,
}

#[derive(Debug, Default)]
pub(crate) struct RemoveResult {
    pub removed: bool,
    pub previous: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub(crate) struct ReplaceResult {
    pub replaced: bool,
    pub previous: Option<Vec<u8>>,
}

/// Parsed offsets of an entry, all relative to the entry start.
struct EntryView {
    start: u64,
    key_pos: u64,
    key_len: u64,
    meta_pos: u64,
    value_size_pos: u64,
    value_pos: u64,
    value_len: u64,
    total_bytes: u64,
    identifier: u8,
    timestamp: u64,
    is_deleted: bool,
}

pub(crate) struct Segment<'a> {
    pub store: &'a ByteStore,
    pub geo: &'a Geometry,
    pub event: &'a dyn MapEventListener,
    pub error: &'a dyn MapErrorListener,
    pub lock_timeout: Duration,
    pub index: usize,
}

impl<'a> Segment<'a> {
    fn lock(&self) -> SegmentLock<'a> {
        SegmentLock::new(self.store, self.geo.lock_off(self.index))
    }

    fn lookup(&self) -> HashLookup<'a> {
        HashLookup::new(self.store, self.geo, self.index)
    }

    fn freebits(&self) -> FreeBits<'a> {
        FreeBits::new(self.store, self.geo, self.index)
    }

    fn write_locked(&self) -> Result<WriteGuard<'a>> {
        self.lock().write(self.lock_timeout).ok_or_else(|| {
            self.error.on_lock_timeout(self.index);
            Error::LockTimeout {
                segment: self.index,
            }
        })
    }

    fn read_locked(&self) -> Result<ReadGuard<'a>> {
        self.lock().read(self.lock_timeout).ok_or_else(|| {
            self.error.on_lock_timeout(self.index);
            Error::LockTimeout {
                segment: self.index,
            }
        })
    }

    pub fn size(&self) -> u64 {
        self.store
            .load_u64_relaxed(self.geo.size_counter_off(self.index))
    }

    fn add_size(&self, delta: i64) {
        if delta >= 0 {
            self.store
                .fetch_add_u64(self.geo.size_counter_off(self.index), delta as u64);
        } else {
            self.store
                .fetch_sub_u64(self.geo.size_counter_off(self.index), (-delta) as u64);
        }
    }

    pub fn mod_count(&self) -> u64 {
        self.store
            .load_u64_relaxed(self.geo.mod_counter_off(self.index))
    }

    fn bump_mod(&self) {
        self.store
            .fetch_add_u64(self.geo.mod_counter_off(self.index), 1);
    }

    /// Zero this segment's lookup, counters and free bits. Caller
    /// holds the write lock (or is initializing single-threaded).
    pub fn reset(&self) {
        self.lookup().clear();
        self.freebits().reset_all_free();
        self.store
            .write_u64(self.geo.size_counter_off(self.index), 0);
    }

    // --- entry parsing and writing ---

    fn parse_entry(&self, pos: u32) -> EntryView {
        let start = self.geo.entry_off(self.index, pos);
        let mut cur = Cursor::over_store(self.store, start, self.geo.arena_end(self.index));
        let (identifier, timestamp, is_deleted) = if self.geo.replicated {
            let id = cur.read_u8();
            let ts = cur.read_u64();
            let deleted = cur.read_u8() != 0;
            (id, ts, deleted)
        } else {
            (0, 0, false)
        };
        let key_len = cur.read_stop_bit();
        let key_pos = cur.position();
        cur.skip(key_len);
        let meta_pos = cur.position();
        cur.skip(self.geo.meta_data_bytes as u64);
        let value_size_pos = cur.position();
        let value_len = cur.read_stop_bit();
        let value_pos = align_up(cur.position(), self.geo.alignment as u64);
        EntryView {
            start,
            key_pos,
            key_len,
            meta_pos,
            value_size_pos,
            value_pos,
            value_len,
            total_bytes: value_pos + value_len,
            identifier,
            timestamp,
            is_deleted,
        }
    }

    fn key_matches(&self, view: &EntryView, key: &[u8]) -> bool {
        view.key_len == key.len() as u64
            && self.store.slice(view.start + view.key_pos, key.len()) == key
    }

    /// Probe for `key`, returning its chunk position and parsed view.
    /// Tombstones are returned too; callers decide their meaning.
    fn find(&self, search: &mut ProbeSearch<'a>, key: &[u8]) -> Option<(u32, EntryView)> {
        while let Some(pos) = search.next() {
            let view = self.parse_entry(pos);
            if self.key_matches(&view, key) {
                return Some((pos, view));
            }
        }
        None
    }

    /// Write a full entry into the chunk span at `pos`.
    fn write_entry(&self, pos: u32, key: &[u8], value: &[u8], stamp: Option<Stamp>) -> EntryView {
        let start = self.geo.entry_off(self.index, pos);
        let n_chunks = self.geo.in_chunks(self.geo.entry_bytes(key.len() as u64, value.len() as u64));
        let limit = start + n_chunks as u64 * self.geo.chunk_size as u64;
        let mut cur = Cursor::over_store(self.store, start, limit);
        let (identifier, timestamp) = match stamp {
            Some(s) => (s.identifier, s.timestamp),
            None => (0, 0),
        };
        if self.geo.replicated {
            cur.write_u8(identifier);
            cur.write_u64(timestamp);
            cur.write_u8(0); // live
        }
        cur.write_stop_bit(key.len() as u64);
        let key_pos = cur.position();
        cur.write_bytes(key);
        let meta_pos = cur.position();
        // meta-data bytes start zeroed; listeners own them afterwards
        for _ in 0..self.geo.meta_data_bytes {
            cur.write_u8(0);
        }
        let value_size_pos = cur.position();
        cur.write_stop_bit(value.len() as u64);
        let value_pos = align_up(cur.position(), self.geo.alignment as u64);
        cur.set_position(value_pos);
        cur.write_bytes(value);
        EntryView {
            start,
            key_pos,
            key_len: key.len() as u64,
            meta_pos,
            value_size_pos,
            value_pos,
            value_len: value.len() as u64,
            total_bytes: value_pos + value.len() as u64,
            identifier,
            timestamp,
            is_deleted: false,
        }
    }

    /// Replace the value of the entry at `pos` in place when the new
    /// span fits the old chunk count, else relocate. Returns the
    /// position and view of the resulting entry.
    fn replace_value(
        &self,
        pos: u32,
        view: &EntryView,
        slot: u32,
        key: &[u8],
        value: &[u8],
        stamp: Option<Stamp>,
    ) -> Result<(u32, EntryView)> {
        let old_chunks = self.geo.in_chunks(view.total_bytes);
        let new_total = self.geo.entry_bytes(key.len() as u64, value.len() as u64);
        let new_chunks = self.geo.in_chunks(new_total);

        if new_chunks <= old_chunks {
            // In place: value bytes first, the size prefix last.
            let new_value_pos = align_up(
                view.value_size_pos + stop_bit_len(value.len() as u64),
                self.geo.alignment as u64,
            );
            let limit = view.start + old_chunks as u64 * self.geo.chunk_size as u64;
            let mut cur = Cursor::over_store(self.store, view.start, limit);
            cur.set_position(new_value_pos);
            cur.write_bytes(value);
            cur.set_position(view.value_size_pos);
            cur.write_stop_bit(value.len() as u64);
            if let Some(s) = stamp {
                cur.set_position(0);
                cur.write_u8(s.identifier);
                cur.write_u64(s.timestamp);
                cur.write_u8(0);
            }
            if new_chunks < old_chunks {
                self.freebits().free(pos + new_chunks, old_chunks - new_chunks);
            }
            Ok((pos, self.parse_entry(pos)))
        } else {
            // Relocate: allocate and write the new image before the old
            // span is released, so a failed allocation leaves the entry
            // untouched.
            let new_pos = self.freebits().allocate(new_chunks).ok_or(Error::SegmentFull {
                segment: self.index,
            })?;
            let new_view = self.write_entry(new_pos, key, value, stamp);
            self.copy_meta(view, &new_view);
            self.lookup().replace_at(slot, new_pos);
            self.freebits().free(pos, old_chunks);
            Ok((new_pos, new_view))
        }
    }

    /// Carry the meta-data bytes across a relocation.
    fn copy_meta(&self, from: &EntryView, to: &EntryView) {
        let n = self.geo.meta_data_bytes as usize;
        if n > 0 {
            let mut buf = vec![0u8; n];
            self.store.read_exact(from.start + from.meta_pos, &mut buf);
            self.store.write_all(to.start + to.meta_pos, &buf);
        }
    }

    fn read_value_bytes(&self, view: &EntryView) -> Vec<u8> {
        let mut buf = vec![0u8; view.value_len as usize];
        self.store
            .read_exact(view.start + view.value_pos, &mut buf);
        buf
    }

    fn entry_cursor(&self, view: &EntryView) -> Cursor<'a> {
        Cursor::over_store(self.store, view.start, view.start + view.total_bytes)
    }

    fn on_put(&self, view: &EntryView, added: bool) {
        let mut cur = self.entry_cursor(view);
        self.event
            .on_put(&mut cur, view.meta_pos, view.key_pos, view.value_pos, added);
    }

    // --- operations ---

    /// Insert or update. `if_absent` turns this into put-if-absent;
    /// `want_previous` skips the previous-value read when false.
    pub fn put(
        &self,
        segment_hash: u64,
        key: &[u8],
        value: &[u8],
        want_previous: bool,
        if_absent: bool,
        stamp: Option<Stamp>,
    ) -> Result<PutResult> {
        let _guard = self.write_locked()?;
        let mut search = self.lookup().search(segment_hash);

        if let Some((pos, view)) = self.find(&mut search, key) {
            if let Some(s) = stamp {
                if s.remote && loses_lww(&view, s) {
                    return Ok(PutResult {
                        previous: None,
                        added: false,
                        ignored: true,
                    });
                }
            }
            let was_live = !view.is_deleted;
            if if_absent && was_live {
                return Ok(PutResult {
                    previous: Some(self.read_value_bytes(&view)),
                    added: false,
                    ignored: false,
                });
            }
            let previous = if want_previous && was_live {
                Some(self.read_value_bytes(&view))
            } else {
                None
            };
            let slot = search.current_slot();
            let (_, new_view) = self.replace_value(pos, &view, slot, key, value, stamp)?;
            if !was_live {
                self.add_size(1);
            }
            self.bump_mod();
            self.on_put(&new_view, !was_live);
            return Ok(PutResult {
                previous,
                added: !was_live,
                ignored: false,
            });
        }

        // No match: allocate, write, publish at the probe tail.
        let n_chunks = self
            .geo
            .in_chunks(self.geo.entry_bytes(key.len() as u64, value.len() as u64));
        let pos = self.freebits().allocate(n_chunks).ok_or(Error::SegmentFull {
            segment: self.index,
        })?;
        let view = self.write_entry(pos, key, value, stamp);
        search.put_after_probe(pos);
        self.add_size(1);
        self.bump_mod();
        self.on_put(&view, true);
        Ok(PutResult {
            previous: None,
            added: true,
            ignored: false,
        })
    }

    /// Look up `key` and decode its value under the read lock.
    pub fn get<R>(
        &self,
        segment_hash: u64,
        key: &[u8],
        read: impl FnOnce(&mut Cursor<'_>) -> R,
    ) -> Result<Option<R>> {
        let _guard = self.read_locked()?;
        let mut search = self.lookup().search(segment_hash);
        match self.find(&mut search, key) {
            Some((_, view)) if !view.is_deleted => {
                let mut cur = self.entry_cursor(&view);
                self.event
                    .on_get_found(&mut cur, view.meta_pos, view.key_pos, view.value_pos);
                cur.set_position(view.value_pos);
                Ok(Some(read(&mut cur)))
            }
            _ => {
                self.event.on_get_missing(key);
                Ok(None)
            }
        }
    }

    pub fn contains_key(&self, segment_hash: u64, key: &[u8]) -> Result<bool> {
        let _guard = self.read_locked()?;
        let mut search = self.lookup().search(segment_hash);
        Ok(matches!(self.find(&mut search, key), Some((_, v)) if !v.is_deleted))
    }

    /// Remove `key`. On a replicated map a stamp turns the entry into a
    /// tombstone instead of releasing its chunks.
    pub fn remove(
        &self,
        segment_hash: u64,
        key: &[u8],
        expected: Option<&[u8]>,
        want_previous: bool,
        stamp: Option<Stamp>,
    ) -> Result<RemoveResult> {
        let _guard = self.write_locked()?;
        let mut search = self.lookup().search(segment_hash);
        let (pos, view) = match self.find(&mut search, key) {
            Some(found) => found,
            None => return Ok(RemoveResult::default()),
        };
        if let Some(s) = stamp {
            if s.remote && loses_lww(&view, s) {
                return Ok(RemoveResult::default());
            }
        }
        if view.is_deleted {
            if let Some(s) = stamp {
                if s.remote {
                    // Newer remote remove refreshes the tombstone clock.
                    self.write_tombstone(&view, s);
                    self.bump_mod();
                }
            }
            return Ok(RemoveResult::default());
        }
        if let Some(expected) = expected {
            if view.value_len != expected.len() as u64
                || self.store.slice(view.start + view.value_pos, expected.len()) != expected
            {
                return Ok(RemoveResult::default());
            }
        }
        let previous = if want_previous {
            Some(self.read_value_bytes(&view))
        } else {
            None
        };
        let mut cur = self.entry_cursor(&view);
        self.event
            .on_remove(&mut cur, view.meta_pos, view.key_pos, view.value_pos);

        match stamp {
            Some(s) => self.write_tombstone(&view, s),
            None => {
                self.lookup().remove_at(search.current_slot());
                self.freebits()
                    .free(pos, self.geo.in_chunks(view.total_bytes));
            }
        }
        self.add_size(-1);
        self.bump_mod();
        Ok(RemoveResult {
            removed: true,
            previous,
        })
    }

    fn write_tombstone(&self, view: &EntryView, stamp: Stamp) {
        let mut cur = self.entry_cursor(view);
        cur.write_u8(stamp.identifier);
        cur.write_u64(stamp.timestamp);
        cur.write_u8(1);
    }

    /// Atomic get-then-put-if-matches. Never inserts on a miss.
    pub fn replace(
        &self,
        segment_hash: u64,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
        want_previous: bool,
        stamp: Option<Stamp>,
    ) -> Result<ReplaceResult> {
        let _guard = self.write_locked()?;
        let mut search = self.lookup().search(segment_hash);
        let (pos, view) = match self.find(&mut search, key) {
            Some(found) if !found.1.is_deleted => found,
            _ => return Ok(ReplaceResult::default()),
        };
        if let Some(expected) = expected {
            if view.value_len != expected.len() as u64
                || self.store.slice(view.start + view.value_pos, expected.len()) != expected
            {
                return Ok(ReplaceResult::default());
            }
        }
        let previous = if want_previous {
            Some(self.read_value_bytes(&view))
        } else {
            None
        };
        let slot = search.current_slot();
        let (_, new_view) = self.replace_value(pos, &view, slot, key, value, stamp)?;
        self.bump_mod();
        self.on_put(&new_view, false);
        Ok(ReplaceResult {
            replaced: true,
            previous,
        })
    }

    /// Decode every live entry under the read lock into `out`.
    pub fn collect_entries<R>(
        &self,
        mut decode: impl FnMut(&mut Cursor<'_>, &mut Cursor<'_>) -> R,
        out: &mut Vec<R>,
    ) -> Result<()> {
        let _guard = self.read_locked()?;
        for pos in self.lookup().occupied() {
            let view = self.parse_entry(pos);
            if view.is_deleted {
                continue;
            }
            let mut key_cur = self.entry_cursor(&view);
            key_cur.set_position(view.key_pos);
            let mut value_cur = self.entry_cursor(&view);
            value_cur.set_position(view.value_pos);
            out.push(decode(&mut key_cur, &mut value_cur));
        }
        Ok(())
    }

    /// Chunk position of `key`'s entry, for tests and diagnostics.
    pub fn entry_position(&self, segment_hash: u64, key: &[u8]) -> Result<Option<u32>> {
        let _guard = self.read_locked()?;
        let mut search = self.lookup().search(segment_hash);
        Ok(self.find(&mut search, key).map(|(pos, _)| pos))
    }

    /// Hand out this segment's write guard; `clear()` uses it to lock
    /// all segments in index order before zeroing them.
    pub fn write_guard(&self) -> Result<WriteGuard<'a>> {
        self.write_locked()
    }
}

/// Last-writer-wins: an incoming remote stamp loses to the stored one
/// when it is older, or same-aged with a lower identifier.
fn loses_lww(view: &EntryView, incoming: Stamp) -> bool {
    incoming.timestamp < view.timestamp
        || (incoming.timestamp == view.timestamp && incoming.identifier < view.identifier)
}
