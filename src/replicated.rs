//! Replication surface.
//!
//! The core never interprets a wire protocol: transports are external
//! collaborators that observe per-segment modifications through
//! registered iterators and feed remote mutations back in through
//! [`ReplicatedMap::apply_replicated_put`] and
//! [`ReplicatedMap::apply_replicated_remove`]. Conflicts resolve by
//! last-writer-wins on the entry timestamp, higher identifier winning
//! a tie; remote removes leave a tombstone until compacted.

use std::io;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bytes::Cursor;
use crate::error::Result;
use crate::hash::{hash64, split};
use crate::map::{IteratorRegistration, SegmentedMap};
use crate::offheap::segment::Stamp;

/// Source of entry timestamps. Swappable for deterministic tests and
/// for clusters with an external clock.
pub trait TimeProvider: Send + Sync {
    /// Milliseconds since the Unix epoch, or any monotonic cluster
    /// clock all nodes agree on.
    fn current_time(&self) -> u64;
}

/// Wall-clock milliseconds.
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn current_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A scoped resource released when the map closes (or earlier by the
/// owner). Replicator handles and iterator registrations are both
/// modeled this way.
pub trait Closeable: Send {
    fn close(&mut self);
}

/// Observes per-segment modifications; registered by a transport.
///
/// Notified after each completed mutation with the segment index and
/// its new modification count. Implementations typically wake a pump
/// that walks the segment for changed entries; they must not block.
pub trait ModificationIterator: Send + Sync {
    fn on_modification(&self, segment: u32, mod_count: u64);
}

/// What a transport gets to see of the map when it attaches.
pub trait ModificationSource {
    /// Register an iterator for one segment (or all, with `None`).
    /// The returned handle unregisters it.
    fn register(
        &self,
        segment: Option<u32>,
        iterator: Arc<dyn ModificationIterator>,
    ) -> Box<dyn Closeable>;

    fn segment_count(&self) -> u32;

    fn identifier(&self) -> u8;
}

/// Map parameters a transport may need to size its buffers.
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    pub identifier: u8,
    pub segment_count: u32,
    pub entries: u64,
    pub replicas: u32,
}

/// An external replication transport. All replicators attached to one
/// map must advertise the same identifier.
pub trait Replicator: Send + Sync {
    fn identifier(&self) -> u8;

    /// True for transports that do not guarantee delivery (UDP-style
    /// fan-out). A map served only by such a transport logs a warning.
    fn best_effort_only(&self) -> bool {
        false
    }

    /// A stable name per transport kind; attaching two replicators of
    /// the same kind to one map is refused.
    fn kind(&self) -> &'static str;

    /// Attach to the map. The returned handle is closed when the map
    /// closes.
    fn apply_to(
        &self,
        config: &ReplicationConfig,
        source: &dyn ModificationSource,
    ) -> io::Result<Box<dyn Closeable>>;
}

/// A [`SegmentedMap`] with per-entry `(identifier, timestamp, deleted)`
/// state and modification fan-out. All plain map operations are
/// available through deref.
pub struct ReplicatedMap<K, V> {
    pub(crate) map: SegmentedMap<K, V>,
}

impl<K, V> Deref for ReplicatedMap<K, V> {
    type Target = SegmentedMap<K, V>;

    fn deref(&self) -> &SegmentedMap<K, V> {
        &self.map
    }
}

impl<K, V> Clone for ReplicatedMap<K, V> {
    fn clone(&self) -> Self {
        ReplicatedMap {
            map: self.map.clone(),
        }
    }
}

impl<K, V> ReplicatedMap<K, V> {
    fn replication(&self) -> &crate::map::ReplicationState {
        // Builder only constructs this type with replication state.
        self.map
            .core
            .replication
            .as_ref()
            .unwrap_or_else(|| panic!("replicated map without replication state"))
    }

    /// This node's replication identifier.
    pub fn node_identifier(&self) -> u8 {
        self.replication().identifier
    }

    /// Modification count of one segment, advanced by every mutation.
    pub fn modification_count(&self, segment: usize) -> u64 {
        self.map.core.segment(segment).mod_count()
    }

    /// Apply a put received from another node. Returns false when the
    /// incoming stamp lost last-writer-wins and was ignored.
    pub fn apply_replicated_put(
        &self,
        key: &K,
        value: &V,
        identifier: u8,
        timestamp: u64,
    ) -> Result<bool> {
        let mut kb = Vec::new();
        self.map.key_m.write(&mut Cursor::over_vec(&mut kb), key);
        let mut vb = Vec::new();
        self.map.value_m.write(&mut Cursor::over_vec(&mut vb), value);
        let route = split(hash64(&kb), self.map.core.geo.segment_count);
        let result = self.map.core.segment(route.segment).put(
            route.segment_hash,
            &kb,
            &vb,
            false,
            false,
            Some(Stamp {
                identifier,
                timestamp,
                remote: true,
            }),
        )?;
        if !result.ignored {
            self.map.core.notify_modification(route.segment);
        }
        Ok(!result.ignored)
    }

    /// Apply a remove received from another node: tombstones the entry
    /// when the stamp wins. Returns false when it lost or missed.
    pub fn apply_replicated_remove(
        &self,
        key: &K,
        identifier: u8,
        timestamp: u64,
    ) -> Result<bool> {
        let mut kb = Vec::new();
        self.map.key_m.write(&mut Cursor::over_vec(&mut kb), key);
        let route = split(hash64(&kb), self.map.core.geo.segment_count);
        let result = self.map.core.segment(route.segment).remove(
            route.segment_hash,
            &kb,
            None,
            false,
            Some(Stamp {
                identifier,
                timestamp,
                remote: true,
            }),
        )?;
        if result.removed {
            self.map.core.notify_modification(route.segment);
        }
        Ok(result.removed)
    }
}

/// Unregisters one iterator registration on close (or drop).
struct Registration<K, V> {
    map: SegmentedMap<K, V>,
    token: u64,
    closed: bool,
}

impl<K, V> Registration<K, V> {
    fn unregister(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(r) = &self.map.core.replication {
            r.iterators.write().retain(|reg| reg.token != self.token);
        }
    }
}

impl<K, V> Closeable for Registration<K, V> {
    fn close(&mut self) {
        self.unregister();
    }
}

impl<K, V> Drop for Registration<K, V> {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl<K, V> ModificationSource for ReplicatedMap<K, V>
where
    K: 'static,
    V: 'static,
{
    fn register(
        &self,
        segment: Option<u32>,
        iterator: Arc<dyn ModificationIterator>,
    ) -> Box<dyn Closeable> {
        let r = self.replication();
        let token = r.next_token.fetch_add(1, Ordering::Relaxed);
        r.iterators.write().push(IteratorRegistration {
            token,
            segment,
            iterator,
        });
        Box::new(Registration {
            map: self.map.clone(),
            token,
            closed: false,
        })
    }

    fn segment_count(&self) -> u32 {
        self.map.core.geo.segment_count
    }

    fn identifier(&self) -> u8 {
        self.replication().identifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MapBuilder;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64};

    struct FixedTime(AtomicU64);

    impl FixedTime {
        fn set(&self, t: u64) {
            self.0.store(t, Ordering::SeqCst);
        }
    }

    impl TimeProvider for FixedTime {
        fn current_time(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn replicated(
        identifier: u8,
    ) -> (ReplicatedMap<String, String>, Arc<FixedTime>) {
        let clock = Arc::new(FixedTime(AtomicU64::new(100)));
        let map = MapBuilder::<String, String>::of()
            .entries(256)
            .replication_identifier(identifier)
            .time_provider(clock.clone())
            .create_replicated()
            .unwrap();
        (map, clock)
    }

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn older_remote_put_is_ignored() {
        let (map, _clock) = replicated(1);
        map.put(&s("k"), &s("local")).unwrap();
        assert!(!map.apply_replicated_put(&s("k"), &s("stale"), 2, 50).unwrap());
        assert_eq!(map.get(&s("k")).unwrap().as_deref(), Some("local"));
        assert!(map.apply_replicated_put(&s("k"), &s("newer"), 2, 200).unwrap());
        assert_eq!(map.get(&s("k")).unwrap().as_deref(), Some("newer"));
    }

    #[test]
    fn equal_timestamps_resolve_by_identifier() {
        let (map, _clock) = replicated(1);
        map.put(&s("k"), &s("local")).unwrap(); // id 1, ts 100
        assert!(map.apply_replicated_put(&s("k"), &s("peer"), 2, 100).unwrap());
        assert_eq!(map.get(&s("k")).unwrap().as_deref(), Some("peer"));
        // Now stored stamp is (id 2, ts 100); a lower id at the same
        // time loses.
        assert!(!map.apply_replicated_put(&s("k"), &s("late"), 1, 100).unwrap());
        assert_eq!(map.get(&s("k")).unwrap().as_deref(), Some("peer"));
    }

    #[test]
    fn local_remove_leaves_a_tombstone() {
        let (map, clock) = replicated(1);
        map.put(&s("k"), &s("v")).unwrap();
        clock.set(200);
        assert_eq!(map.remove(&s("k")).unwrap().as_deref(), Some("v"));
        assert_eq!(map.len(), 0);
        assert_eq!(map.get(&s("k")).unwrap(), None);
        assert!(!map.contains_key(&s("k")).unwrap());
        // An older remote put must not revive the entry.
        assert!(!map.apply_replicated_put(&s("k"), &s("ghost"), 2, 150).unwrap());
        assert_eq!(map.get(&s("k")).unwrap(), None);
        // A newer one does.
        assert!(map.apply_replicated_put(&s("k"), &s("back"), 2, 300).unwrap());
        assert_eq!(map.get(&s("k")).unwrap().as_deref(), Some("back"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remote_remove_tombstones_when_newer() {
        let (map, _clock) = replicated(1);
        map.put(&s("k"), &s("v")).unwrap(); // ts 100
        assert!(!map.apply_replicated_remove(&s("k"), 2, 50).unwrap());
        assert_eq!(map.get(&s("k")).unwrap().as_deref(), Some("v"));
        assert!(map.apply_replicated_remove(&s("k"), 2, 200).unwrap());
        assert_eq!(map.get(&s("k")).unwrap(), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn local_put_revives_a_tombstone() {
        let (map, clock) = replicated(1);
        map.put(&s("k"), &s("v1")).unwrap();
        clock.set(200);
        map.remove(&s("k")).unwrap();
        clock.set(300);
        assert_eq!(map.put(&s("k"), &s("v2")).unwrap(), None);
        assert_eq!(map.get(&s("k")).unwrap().as_deref(), Some("v2"));
        assert_eq!(map.len(), 1);
    }

    struct Recording(Mutex<Vec<(u32, u64)>>);

    impl ModificationIterator for Recording {
        fn on_modification(&self, segment: u32, mod_count: u64) {
            self.0.lock().push((segment, mod_count));
        }
    }

    #[test]
    fn mutations_advance_and_fan_out_modification_counts() {
        let (map, _clock) = replicated(1);
        let recorder = Arc::new(Recording(Mutex::new(Vec::new())));
        let mut handle = map.register(None, recorder.clone());

        map.put(&s("a"), &s("1")).unwrap();
        map.put(&s("a"), &s("2")).unwrap();
        map.remove(&s("a")).unwrap();
        let events = recorder.0.lock().clone();
        assert_eq!(events.len(), 3);
        // Counts are per segment and strictly increasing.
        let seg = events[0].0;
        assert!(events.iter().all(|(sg, _)| *sg == seg));
        assert!(events.windows(2).all(|w| w[0].1 < w[1].1));
        assert_eq!(map.modification_count(seg as usize), events[2].1);

        handle.close();
        map.put(&s("b"), &s("1")).unwrap();
        assert_eq!(recorder.0.lock().len(), 3);
    }

    struct FakeTransport {
        id: u8,
        kind: &'static str,
        best_effort: bool,
        attached: AtomicBool,
        closed: Arc<AtomicBool>,
    }

    struct FakeHandle(Arc<AtomicBool>);

    impl Closeable for FakeHandle {
        fn close(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Replicator for FakeTransport {
        fn identifier(&self) -> u8 {
            self.id
        }

        fn best_effort_only(&self) -> bool {
            self.best_effort
        }

        fn kind(&self) -> &'static str {
            self.kind
        }

        fn apply_to(
            &self,
            config: &ReplicationConfig,
            source: &dyn ModificationSource,
        ) -> io::Result<Box<dyn Closeable>> {
            assert_eq!(config.identifier, self.id);
            assert_eq!(source.identifier(), self.id);
            assert!(source.segment_count() > 0);
            self.attached.store(true, Ordering::SeqCst);
            Ok(Box::new(FakeHandle(self.closed.clone())))
        }
    }

    #[test]
    fn replicators_attach_and_close_with_the_map() {
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(FakeTransport {
            id: 7,
            kind: "fake-tcp",
            best_effort: false,
            attached: AtomicBool::new(false),
            closed: closed.clone(),
        });
        let map = MapBuilder::<String, String>::of()
            .entries(256)
            .add_replicator(transport.clone())
            .create_replicated()
            .unwrap();
        assert!(transport.attached.load(Ordering::SeqCst));
        assert_eq!(map.node_identifier(), 7);
        map.put(&s("k"), &s("v")).unwrap();
        map.close();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn mismatched_replicator_identifiers_are_rejected() {
        let mk = |id, kind| {
            Arc::new(FakeTransport {
                id,
                kind,
                best_effort: false,
                attached: AtomicBool::new(false),
                closed: Arc::new(AtomicBool::new(false)),
            })
        };
        let result = MapBuilder::<String, String>::of()
            .entries(256)
            .add_replicator(mk(1, "fake-tcp"))
            .add_replicator(mk(2, "fake-udp"))
            .create_replicated();
        assert!(matches!(result, Err(Error::IllegalArgument(_))));

        let result = MapBuilder::<String, String>::of()
            .entries(256)
            .add_replicator(mk(1, "fake-tcp"))
            .add_replicator(mk(1, "fake-tcp"))
            .create_replicated();
        assert!(matches!(result, Err(Error::IllegalArgument(_))));
    }

    #[test]
    fn replicated_entries_survive_reopen() {
        let path = std::env::temp_dir().join(format!("segmap-repl-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let builder = || {
            MapBuilder::<String, String>::of()
                .entries(256)
                .replication_identifier(3)
        };
        {
            let map = builder().create_replicated_file(&path).unwrap();
            map.put(&s("k"), &s("v")).unwrap();
            map.close();
        }
        {
            let map = builder().create_replicated_file(&path).unwrap();
            assert_eq!(map.get(&s("k")).unwrap().as_deref(), Some("v"));
            assert_eq!(map.node_identifier(), 3);
        }
        let _ = std::fs::remove_file(&path);
    }
}
