//! The map façade: routes each operation to a segment by key hash and
//! owns the region, codecs, listeners and replication state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::bytes::{ByteStore, Cursor};
use crate::error::{Error, Result};
use crate::event::{MapErrorListener, MapEventListener};
use crate::hash::{hash64, split};
use crate::marshal::{BytesMarshaller, ValueFactory};
use crate::offheap::layout::{FileHeader, Geometry};
use crate::offheap::segment::{Segment, Stamp};
use crate::replicated::{Closeable, ModificationIterator, TimeProvider};

/// Modification-iterator registrations live on the handle, keyed by a
/// token so a returned [`Closeable`] can unregister exactly itself.
pub(crate) struct ReplicationState {
    pub identifier: u8,
    pub time_provider: Arc<dyn TimeProvider>,
    pub iterators: RwLock<Vec<IteratorRegistration>>,
    pub next_token: AtomicU64,
}

pub(crate) struct IteratorRegistration {
    pub token: u64,
    /// `None` observes every segment.
    pub segment: Option<u32>,
    pub iterator: Arc<dyn ModificationIterator>,
}

pub(crate) struct MapCore {
    pub store: ByteStore,
    pub geo: Geometry,
    pub header: FileHeader,
    pub event: Arc<dyn MapEventListener>,
    pub error: Arc<dyn MapErrorListener>,
    pub lock_timeout: Duration,
    pub put_returns_null: bool,
    pub remove_returns_null: bool,
    pub closed: AtomicBool,
    pub closeables: Mutex<Vec<Box<dyn Closeable>>>,
    pub replication: Option<ReplicationState>,
}

impl MapCore {
    pub fn segment(&self, index: usize) -> Segment<'_> {
        Segment {
            store: &self.store,
            geo: &self.geo,
            event: self.event.as_ref(),
            error: self.error.as_ref(),
            lock_timeout: self.lock_timeout,
            index,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::IllegalArgument("map is closed".into()));
        }
        Ok(())
    }

    /// Stamp for a locally originated mutation, when replicated.
    pub fn local_stamp(&self) -> Option<Stamp> {
        self.replication.as_ref().map(|r| Stamp {
            identifier: r.identifier,
            timestamp: r.time_provider.current_time(),
            remote: false,
        })
    }

    /// Fan a completed mutation in `segment` out to the registered
    /// modification iterators. Called after the segment lock dropped.
    pub fn notify_modification(&self, segment: usize) {
        if let Some(r) = &self.replication {
            let mod_count = self.segment(segment).mod_count();
            for reg in r.iterators.read().iter() {
                match reg.segment {
                    Some(s) if s as usize != segment => {}
                    _ => reg.iterator.on_modification(segment as u32, mod_count),
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for mut closeable in self.closeables.lock().drain(..) {
            closeable.close();
        }
        if let Err(e) = self.store.flush() {
            log::warn!("flush on close failed: {e}");
        }
    }
}

impl Drop for MapCore {
    fn drop(&mut self) {
        self.close();
    }
}

/// A concurrent key/value map whose entries live in a memory-mapped
/// (or anonymous) byte region. Handles are cheap to clone and share
/// one region.
///
/// Built by [`crate::MapBuilder`]. File-backed maps survive process
/// restarts; dropping the last handle unmaps but leaves the file on
/// disk.
pub struct SegmentedMap<K, V> {
    pub(crate) core: Arc<MapCore>,
    pub(crate) key_m: Arc<dyn BytesMarshaller<K>>,
    pub(crate) value_m: Arc<dyn BytesMarshaller<V>>,
    #[allow(dead_code)]
    pub(crate) value_factory: Option<Arc<dyn ValueFactory<V>>>,
}

impl<K, V> Clone for SegmentedMap<K, V> {
    fn clone(&self) -> Self {
        SegmentedMap {
            core: Arc::clone(&self.core),
            key_m: Arc::clone(&self.key_m),
            value_m: Arc::clone(&self.value_m),
            value_factory: self.value_factory.clone(),
        }
    }
}

impl<K, V> SegmentedMap<K, V> {
    fn key_bytes(&self, key: &K) -> Vec<u8> {
        let mut buf = Vec::new();
        self.key_m.write(&mut Cursor::over_vec(&mut buf), key);
        buf
    }

    fn value_bytes(&self, value: &V) -> Vec<u8> {
        let mut buf = Vec::new();
        self.value_m.write(&mut Cursor::over_vec(&mut buf), value);
        buf
    }

    fn decode_value(&self, bytes: &[u8]) -> V {
        self.value_m.read(&mut Cursor::over_slice(bytes))
    }

    fn route(&self, key_bytes: &[u8]) -> crate::hash::SplitHash {
        split(hash64(key_bytes), self.core.geo.segment_count)
    }

    /// Insert or update, returning the previous value unless the map
    /// was built with `put_returns_null`.
    pub fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let vb = self.value_bytes(value);
        let route = self.route(&kb);
        let result = self.core.segment(route.segment).put(
            route.segment_hash,
            &kb,
            &vb,
            !self.core.put_returns_null,
            false,
            self.core.local_stamp(),
        )?;
        self.core.notify_modification(route.segment);
        Ok(result.previous.map(|b| self.decode_value(&b)))
    }

    /// Insert only when the key is absent; returns the existing value
    /// otherwise.
    pub fn put_if_absent(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let vb = self.value_bytes(value);
        let route = self.route(&kb);
        let result = self.core.segment(route.segment).put(
            route.segment_hash,
            &kb,
            &vb,
            true,
            true,
            self.core.local_stamp(),
        )?;
        if result.added {
            self.core.notify_modification(route.segment);
        }
        Ok(result.previous.map(|b| self.decode_value(&b)))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let route = self.route(&kb);
        self.core
            .segment(route.segment)
            .get(route.segment_hash, &kb, |cur| self.value_m.read(cur))
    }

    /// Like [`Self::get`] but decodes into `reusable`, avoiding an
    /// allocation when the codec supports it.
    pub fn get_reusing(&self, key: &K, reusable: V) -> Result<Option<V>> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let route = self.route(&kb);
        self.core
            .segment(route.segment)
            .get(route.segment_hash, &kb, move |cur| {
                self.value_m.read_reusing(cur, reusable)
            })
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let route = self.route(&kb);
        self.core
            .segment(route.segment)
            .contains_key(route.segment_hash, &kb)
    }

    /// Remove the key, returning the previous value unless the map was
    /// built with `remove_returns_null`.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let route = self.route(&kb);
        let result = self.core.segment(route.segment).remove(
            route.segment_hash,
            &kb,
            None,
            !self.core.remove_returns_null,
            self.core.local_stamp(),
        )?;
        if result.removed {
            self.core.notify_modification(route.segment);
        }
        Ok(result.previous.map(|b| self.decode_value(&b)))
    }

    /// Remove only when the stored value equals `expected`.
    pub fn remove_if_equal(&self, key: &K, expected: &V) -> Result<bool> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let eb = self.value_bytes(expected);
        let route = self.route(&kb);
        let result = self.core.segment(route.segment).remove(
            route.segment_hash,
            &kb,
            Some(&eb),
            false,
            self.core.local_stamp(),
        )?;
        if result.removed {
            self.core.notify_modification(route.segment);
        }
        Ok(result.removed)
    }

    /// Update an existing key, returning the previous value; never
    /// inserts on a miss.
    pub fn replace(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let vb = self.value_bytes(value);
        let route = self.route(&kb);
        let result = self.core.segment(route.segment).replace(
            route.segment_hash,
            &kb,
            None,
            &vb,
            !self.core.put_returns_null,
            self.core.local_stamp(),
        )?;
        if result.replaced {
            self.core.notify_modification(route.segment);
        }
        Ok(result.previous.map(|b| self.decode_value(&b)))
    }

    /// Atomic compare-and-set: update only when the stored value
    /// equals `old`.
    pub fn replace_if_equal(&self, key: &K, old: &V, new: &V) -> Result<bool> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let ob = self.value_bytes(old);
        let nb = self.value_bytes(new);
        let route = self.route(&kb);
        let result = self.core.segment(route.segment).replace(
            route.segment_hash,
            &kb,
            Some(&ob),
            &nb,
            false,
            self.core.local_stamp(),
        )?;
        if result.replaced {
            self.core.notify_modification(route.segment);
        }
        Ok(result.replaced)
    }

    /// Live entries across all segments. An unlocked sum of per-segment
    /// counters: eventually consistent, never a global snapshot.
    pub fn len(&self) -> u64 {
        (0..self.core.geo.segment_count as usize)
            .map(|i| self.core.segment(i).size())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries in one segment.
    pub fn segment_len(&self, segment: usize) -> u64 {
        self.core.segment(segment).size()
    }

    pub fn segment_count(&self) -> u32 {
        self.core.geo.segment_count
    }

    /// Remove every entry. Acquires all segment locks in index order
    /// and releases them in reverse, so concurrent operations see
    /// either the old map or an empty one.
    pub fn clear(&self) -> Result<()> {
        self.core.check_open()?;
        let mut guards = Vec::with_capacity(self.core.geo.segment_count as usize);
        for i in 0..self.core.geo.segment_count as usize {
            guards.push(self.core.segment(i).write_guard()?);
        }
        for i in 0..self.core.geo.segment_count as usize {
            self.core.segment(i).reset();
        }
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
        Ok(())
    }

    /// Visit a decoded copy of every entry. Weakly consistent: one
    /// segment is read-locked at a time and `f` runs with no lock
    /// held, so entries mutated concurrently may or may not be seen.
    pub fn for_each<F: FnMut(K, V)>(&self, mut f: F) -> Result<()> {
        self.core.check_open()?;
        for i in 0..self.core.geo.segment_count as usize {
            let mut pairs = Vec::new();
            self.core.segment(i).collect_entries(
                |key_cur, value_cur| (self.key_m.read(key_cur), self.value_m.read(value_cur)),
                &mut pairs,
            )?;
            for (k, v) in pairs {
                f(k, v);
            }
        }
        Ok(())
    }

    /// Decoded copies of every key.
    pub fn keys(&self) -> Result<Vec<K>> {
        let mut out = Vec::new();
        self.for_each(|k, _| out.push(k))?;
        Ok(out)
    }

    /// Persist all mapped bytes to the backing file, if any.
    pub fn flush(&self) -> Result<()> {
        self.core.check_open()?;
        self.core.store.flush()?;
        Ok(())
    }

    /// Close the map: closes replicator handles, flushes, and marks
    /// every handle unusable. Dropping the last handle does the same.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    /// Chunk position of the key's entry within its segment; `None`
    /// when absent. Exposed for diagnostics and tests.
    pub fn entry_position(&self, key: &K) -> Result<Option<u32>> {
        self.core.check_open()?;
        let kb = self.key_bytes(key);
        let route = self.route(&kb);
        self.core
            .segment(route.segment)
            .entry_position(route.segment_hash, &kb)
    }
}
