//! Map construction.
//!
//! The builder derives the segment geometry from user parameters,
//! creates anonymous or file-backed maps, and reattaches to existing
//! files after validating their header field for field.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::bytes::ByteStore;
use crate::error::{Error, Result};
use crate::event::{LoggingErrorListener, MapErrorListener, MapEventListener, NopEventListener};
use crate::map::{MapCore, ReplicationState, SegmentedMap};
use crate::marshal::{BytesMarshaller, DefaultMarshaller, ValueFactory};
use crate::offheap::layout::{Alignment, FileHeader, Geometry};
use crate::offheap::lock::SegmentLock;
use crate::replicated::{
    ReplicatedMap, ReplicationConfig, Replicator, SystemTimeProvider, TimeProvider,
};

/// Builds [`SegmentedMap`]s and [`ReplicatedMap`]s.
///
/// Every option has a default; `entries` and `entry_size` drive the
/// sizing. The derived geometry is visible through [`Self::segments`],
/// [`Self::entries_per_segment`] and friends before anything is
/// allocated.
pub struct MapBuilder<K, V> {
    entries: u64,
    entry_size: u32,
    alignment: Alignment,
    actual_segments: Option<u32>,
    min_segments: Option<u32>,
    actual_entries_per_segment: Option<u32>,
    replicas: u32,
    meta_data_bytes: u32,
    lock_time_out: Duration,
    put_returns_null: bool,
    remove_returns_null: bool,
    large_segments: bool,
    transactional: bool,
    replication_identifier: Option<u8>,
    time_provider: Arc<dyn TimeProvider>,
    key_marshaller: Arc<dyn BytesMarshaller<K>>,
    value_marshaller: Arc<dyn BytesMarshaller<V>>,
    value_factory: Option<Arc<dyn ValueFactory<V>>>,
    error_listener: Arc<dyn MapErrorListener>,
    event_listener: Arc<dyn MapEventListener>,
    replicators: Vec<Arc<dyn Replicator>>,
}

impl<K, V> Clone for MapBuilder<K, V> {
    fn clone(&self) -> Self {
        MapBuilder {
            entries: self.entries,
            entry_size: self.entry_size,
            alignment: self.alignment,
            actual_segments: self.actual_segments,
            min_segments: self.min_segments,
            actual_entries_per_segment: self.actual_entries_per_segment,
            replicas: self.replicas,
            meta_data_bytes: self.meta_data_bytes,
            lock_time_out: self.lock_time_out,
            put_returns_null: self.put_returns_null,
            remove_returns_null: self.remove_returns_null,
            large_segments: self.large_segments,
            transactional: self.transactional,
            replication_identifier: self.replication_identifier,
            time_provider: Arc::clone(&self.time_provider),
            key_marshaller: Arc::clone(&self.key_marshaller),
            value_marshaller: Arc::clone(&self.value_marshaller),
            value_factory: self.value_factory.clone(),
            error_listener: Arc::clone(&self.error_listener),
            event_listener: Arc::clone(&self.event_listener),
            replicators: self.replicators.clone(),
        }
    }
}

impl<K: DefaultMarshaller, V: DefaultMarshaller> MapBuilder<K, V> {
    /// Builder with the default codecs for `K` and `V`.
    pub fn of() -> MapBuilder<K, V> {
        Self::with_marshallers(K::default_marshaller(), V::default_marshaller())
    }
}

impl<K, V> MapBuilder<K, V> {
    /// Builder with explicit codecs.
    pub fn with_marshallers(
        key_marshaller: Arc<dyn BytesMarshaller<K>>,
        value_marshaller: Arc<dyn BytesMarshaller<V>>,
    ) -> MapBuilder<K, V> {
        MapBuilder {
            entries: 1 << 20,
            entry_size: 256,
            alignment: Alignment::OfFourBytes,
            actual_segments: None,
            min_segments: None,
            actual_entries_per_segment: None,
            replicas: 0,
            meta_data_bytes: 0,
            lock_time_out: Duration::from_secs(2),
            put_returns_null: false,
            remove_returns_null: false,
            large_segments: false,
            transactional: false,
            replication_identifier: None,
            time_provider: Arc::new(SystemTimeProvider),
            key_marshaller,
            value_marshaller,
            value_factory: None,
            error_listener: Arc::new(LoggingErrorListener),
            event_listener: Arc::new(NopEventListener),
            replicators: Vec::new(),
        }
    }

    // --- options ---

    /// Target total live entries. Default 2^20.
    pub fn entries(mut self, entries: u64) -> Self {
        self.entries = entries;
        self
    }

    /// Expected bytes per entry; aligned up by the configured alignment
    /// to yield the chunk size. Default 256.
    pub fn entry_size(mut self, entry_size: u32) -> Self {
        self.entry_size = entry_size;
        self
    }

    /// Alignment of entry starts and of values within entries.
    /// Default 4 bytes.
    pub fn entry_and_value_alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    /// Override the computed segment count (must be a power of two).
    pub fn actual_segments(mut self, segments: u32) -> Self {
        self.actual_segments = Some(segments);
        self
    }

    /// Lower bound on the computed segment count.
    pub fn min_segments(mut self, min: u32) -> Self {
        self.min_segments = Some(min);
        self
    }

    /// Override the computed entries per segment.
    pub fn actual_entries_per_segment(mut self, n: u32) -> Self {
        self.actual_entries_per_segment = Some(n);
        self
    }

    /// Reserved capacity multiplier, surfaced to the replicated
    /// variant only; does not change sizing.
    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Bytes reserved per entry for listeners, 0–255.
    pub fn meta_data_bytes(mut self, bytes: u32) -> Self {
        self.meta_data_bytes = bytes;
        self
    }

    /// Segment lock acquisition deadline. Default 2 seconds.
    pub fn lock_time_out(mut self, timeout: Duration) -> Self {
        self.lock_time_out = timeout;
        self
    }

    /// When set, `put` skips reading the previous value and returns
    /// `None`: cheaper when the caller does not use it.
    pub fn put_returns_null(mut self, yes: bool) -> Self {
        self.put_returns_null = yes;
        self
    }

    /// When set, `remove` skips reading the removed value.
    pub fn remove_returns_null(mut self, yes: bool) -> Self {
        self.remove_returns_null = yes;
        self
    }

    /// Skip the small-segment sizing branch. Auto-enabled above 2^35
    /// entries.
    pub fn large_segments(mut self, yes: bool) -> Self {
        self.large_segments = yes;
        self
    }

    /// Reserved: accepted for configuration compatibility, not
    /// implemented. Has no effect on the built map.
    pub fn transactional(mut self, yes: bool) -> Self {
        self.transactional = yes;
        self
    }

    /// This node's replication identifier (1–255). Required to create
    /// a replicated map with no transports attached; otherwise taken
    /// from the replicators.
    pub fn replication_identifier(mut self, identifier: u8) -> Self {
        self.replication_identifier = Some(identifier);
        self
    }

    /// Source of entry timestamps for the replicated variant.
    pub fn time_provider(mut self, provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = provider;
        self
    }

    pub fn key_marshaller(mut self, m: Arc<dyn BytesMarshaller<K>>) -> Self {
        self.key_marshaller = m;
        self
    }

    pub fn value_marshaller(mut self, m: Arc<dyn BytesMarshaller<V>>) -> Self {
        self.value_marshaller = m;
        self
    }

    /// Instance source for reuse-on-read codecs. Only valid with a
    /// marshaller that consults it.
    pub fn value_factory(mut self, f: Arc<dyn ValueFactory<V>>) -> Self {
        self.value_factory = Some(f);
        self
    }

    pub fn error_listener(mut self, l: Arc<dyn MapErrorListener>) -> Self {
        self.error_listener = l;
        self
    }

    pub fn event_listener(mut self, l: Arc<dyn MapEventListener>) -> Self {
        self.event_listener = l;
        self
    }

    /// Attach a replication transport. All transports on one map must
    /// advertise the same identifier, one per transport kind.
    pub fn add_replicator(mut self, r: Arc<dyn Replicator>) -> Self {
        self.replicators.push(r);
        self
    }

    // --- derived sizing ---

    pub fn aligned_entry_size(&self) -> u32 {
        self.alignment.align_size(self.entry_size)
    }

    /// Configured or computed minimum segment count: the smallest
    /// power of two `s` with `s^3 >= 2 * aligned_entry_size`, within
    /// [4, 65536].
    pub fn min_segment_count(&self) -> u32 {
        match self.min_segments {
            Some(m) if m >= 1 => m,
            _ => {
                let target = self.aligned_entry_size() as u64 * 2;
                let mut s = 4u32;
                while s < 1 << 16 {
                    if (s as u64).pow(3) >= target {
                        return s;
                    }
                    s <<= 1;
                }
                1 << 16
            }
        }
    }

    pub fn is_large_segments(&self) -> bool {
        self.entries > 1 << 35 || self.large_segments
    }

    /// Derived segment count (power of two).
    pub fn segments(&self) -> u32 {
        if let Some(s) = self.actual_segments {
            return s;
        }
        let min_segments = self.min_segment_count() as u64;
        if !self.is_large_segments() && self.entries > min_segments << 15 {
            let segments = next_power_of_two(self.entries >> 15, 128);
            if segments < 1 << 20 {
                return segments as u32;
            }
        }
        // keep segments 16-bit sized where possible
        next_power_of_two(((self.entries >> 30) + 1).max(min_segments), 1) as u32
    }

    /// Derived entries per segment: `entries * 2 / segments`, rounded
    /// up to a multiple of 64.
    pub fn entries_per_segment(&self) -> u32 {
        if let Some(n) = self.actual_entries_per_segment {
            if n > 0 {
                return n;
            }
        }
        let per = (self.entries * 2 / self.segments() as u64).max(1);
        ((per + 63) & !63) as u32
    }

    fn lookup_slots(&self) -> u32 {
        // 2x entries keeps the load factor at or under one half, well
        // under the 2/3 the probe loop assumes.
        (self.entries_per_segment() as u64 * 2).next_power_of_two() as u32
    }

    fn make_header(&self, replication_identifier: u32) -> FileHeader {
        let eps = self.entries_per_segment();
        FileHeader {
            segment_count: self.segments(),
            chunks_per_segment: eps,
            chunk_size: self.aligned_entry_size(),
            entries_per_segment: eps,
            lookup_slots: self.lookup_slots(),
            meta_data_bytes: self.meta_data_bytes,
            alignment: self.alignment.bytes(),
            replication_identifier,
            replicas: self.replicas,
        }
    }

    // --- validation ---

    fn validate(&self) -> Result<()> {
        if self.entries == 0 {
            return Err(Error::IllegalArgument("entries must be at least 1".into()));
        }
        if self.entry_size == 0 {
            return Err(Error::IllegalArgument(
                "entry_size must be at least 1".into(),
            ));
        }
        if self.meta_data_bytes > 255 {
            return Err(Error::IllegalArgument(format!(
                "meta_data_bytes must be in [0, 255], was {}",
                self.meta_data_bytes
            )));
        }
        if let Some(s) = self.actual_segments {
            if s == 0 || !s.is_power_of_two() {
                return Err(Error::IllegalArgument(format!(
                    "actual_segments must be a power of two, was {s}"
                )));
            }
        }
        if let Some(n) = self.actual_entries_per_segment {
            if n == 0 || n % 64 != 0 {
                return Err(Error::IllegalArgument(format!(
                    "actual_entries_per_segment must be a positive multiple of 64, was {n}"
                )));
            }
        }
        if self.value_factory.is_some() && !self.value_marshaller.uses_factory() {
            return Err(Error::IllegalArgument(
                "value_factory configured but the value marshaller does not use one; \
                 set them together"
                    .into(),
            ));
        }
        if let Some(first) = self.replicators.first() {
            for r in &self.replicators[1..] {
                if r.identifier() != first.identifier() {
                    return Err(Error::IllegalArgument(
                        "identifiers of all replicators of the map should be the same".into(),
                    ));
                }
            }
            let mut kinds: Vec<&str> = self.replicators.iter().map(|r| r.kind()).collect();
            kinds.sort_unstable();
            kinds.dedup();
            if kinds.len() != self.replicators.len() {
                return Err(Error::IllegalArgument(
                    "a replicator of the same kind is already attached to the map".into(),
                ));
            }
            if let Some(explicit) = self.replication_identifier {
                if explicit != first.identifier() {
                    return Err(Error::IllegalArgument(
                        "replication_identifier conflicts with the replicators'".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn resolve_identifier(&self) -> Result<u8> {
        let id = match self.replicators.first() {
            Some(r) => r.identifier(),
            None => self.replication_identifier.ok_or_else(|| {
                Error::IllegalArgument(
                    "a replicated map needs a replication_identifier or a replicator".into(),
                )
            })?,
        };
        if id == 0 {
            return Err(Error::IllegalArgument(
                "replication identifier 0 is reserved for unreplicated maps".into(),
            ));
        }
        Ok(id)
    }

    // --- construction ---

    /// Create an anonymous (in-memory, non-persistent) map.
    pub fn create(&self) -> Result<SegmentedMap<K, V>> {
        self.validate()?;
        if !self.replicators.is_empty() || self.replication_identifier.is_some() {
            return Err(Error::IllegalArgument(
                "replication is configured: use create_replicated()".into(),
            ));
        }
        let header = self.make_header(0);
        let geo = Geometry::from_header(&header);
        let store = ByteStore::anonymous(geo.total_size() as usize)?;
        Ok(self.finish(store, header, geo, true, None))
    }

    /// Create or reopen a file-backed map. An existing non-empty file
    /// is validated against this builder's derived header and mapped;
    /// otherwise the file is initialized from scratch.
    pub fn create_file(&self, path: &Path) -> Result<SegmentedMap<K, V>> {
        self.validate()?;
        if !self.replicators.is_empty() || self.replication_identifier.is_some() {
            return Err(Error::IllegalArgument(
                "replication is configured: use create_replicated_file()".into(),
            ));
        }
        let header = self.make_header(0);
        let (store, geo, fresh) = self.open_or_create(path, &header)?;
        Ok(self.finish(store, header, geo, fresh, None))
    }

    /// Create an anonymous replicated map and attach the configured
    /// transports.
    pub fn create_replicated(&self) -> Result<ReplicatedMap<K, V>>
    where
        K: 'static,
        V: 'static,
    {
        self.validate()?;
        let identifier = self.resolve_identifier()?;
        let header = self.make_header(identifier as u32);
        let geo = Geometry::from_header(&header);
        let store = ByteStore::anonymous(geo.total_size() as usize)?;
        let map = self.finish(store, header, geo, true, Some(identifier));
        self.establish_replication(ReplicatedMap { map })
    }

    /// Create or reopen a file-backed replicated map.
    pub fn create_replicated_file(&self, path: &Path) -> Result<ReplicatedMap<K, V>>
    where
        K: 'static,
        V: 'static,
    {
        self.validate()?;
        let identifier = self.resolve_identifier()?;
        let header = self.make_header(identifier as u32);
        let (store, geo, fresh) = self.open_or_create(path, &header)?;
        let map = self.finish(store, header, geo, fresh, Some(identifier));
        self.establish_replication(ReplicatedMap { map })
    }

    fn open_or_create(
        &self,
        path: &Path,
        expected: &FileHeader,
    ) -> Result<(ByteStore, Geometry, bool)> {
        let geo = Geometry::from_header(expected);
        for _attempt in 0..10 {
            let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if len > 0 {
                let store = ByteStore::map_file(path)?;
                let found = FileHeader::read_from(&store)?;
                if &found != expected {
                    return Err(Error::CorruptHeader(format!(
                        "persisted parameters differ from the builder's: \
                         found {found:?}, expected {expected:?}"
                    )));
                }
                if (store.len() as u64) < geo.total_size() {
                    return Err(Error::CorruptHeader(format!(
                        "file is {} bytes, geometry needs {}",
                        store.len(),
                        geo.total_size()
                    )));
                }
                log::debug!("reopened map file {} ({} bytes)", path.display(), store.len());
                return Ok((store, geo, false));
            }
            if !path.exists() {
                break;
            }
            // Another creator holds an empty file; give it a moment.
            std::thread::sleep(Duration::from_millis(100));
        }
        let store = ByteStore::create_file(path, geo.total_size() as usize)?;
        log::debug!(
            "created map file {} ({} bytes, {} segments)",
            path.display(),
            geo.total_size(),
            geo.segment_count
        );
        Ok((store, geo, true))
    }

    fn finish(
        &self,
        store: ByteStore,
        header: FileHeader,
        geo: Geometry,
        fresh: bool,
        identifier: Option<u8>,
    ) -> SegmentedMap<K, V> {
        let replication = identifier.map(|identifier| ReplicationState {
            identifier,
            time_provider: Arc::clone(&self.time_provider),
            iterators: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(1),
        });
        let core = Arc::new(MapCore {
            store,
            geo,
            header,
            event: Arc::clone(&self.event_listener),
            error: Arc::clone(&self.error_listener),
            lock_timeout: self.lock_time_out,
            put_returns_null: self.put_returns_null,
            remove_returns_null: self.remove_returns_null,
            closed: AtomicBool::new(false),
            closeables: Mutex::new(Vec::new()),
            replication,
        });
        if fresh {
            header_init(&core);
        } else {
            // Reopen is single-threaded: clear lock words a crashed
            // writer may have left behind.
            for i in 0..core.geo.segment_count as usize {
                SegmentLock::new(&core.store, core.geo.lock_off(i)).force_reset();
            }
        }
        SegmentedMap {
            core,
            key_m: Arc::clone(&self.key_marshaller),
            value_m: Arc::clone(&self.value_marshaller),
            value_factory: self.value_factory.clone(),
        }
    }

    fn establish_replication(&self, map: ReplicatedMap<K, V>) -> Result<ReplicatedMap<K, V>>
    where
        K: 'static,
        V: 'static,
    {
        let config = ReplicationConfig {
            identifier: map.node_identifier(),
            segment_count: map.segment_count(),
            entries: self.entries,
            replicas: self.replicas,
        };
        if self.replicators.len() == 1 && self.replicators[0].best_effort_only() {
            log::warn!(
                "missing guaranteed replication: the only attached replicator is best-effort \
                 (it does not enforce or guarantee delivery); pair it with a \
                 guaranteed-delivery transport"
            );
        }
        for replicator in &self.replicators {
            let handle = replicator.apply_to(&config, &map)?;
            map.map.core.closeables.lock().push(handle);
        }
        Ok(map)
    }
}

/// Smallest power of two at or above `max(v, min)`.
fn next_power_of_two(v: u64, min: u64) -> u64 {
    v.max(min).next_power_of_two()
}

fn header_init(core: &MapCore) {
    core.header.write_to(&core.store);
    for i in 0..core.geo.segment_count as usize {
        core.segment(i).reset();
        SegmentLock::new(&core.store, core.geo.lock_off(i)).force_reset();
    }
    if core.store.is_file_backed() {
        if let Err(e) = core.store.flush() {
            log::warn!("initial flush failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> MapBuilder<String, String> {
        MapBuilder::of()
    }

    #[test]
    fn default_sizing_matches_the_format() {
        let b = builder();
        assert_eq!(b.aligned_entry_size(), 256);
        // smallest s in [4, 65536) with s^3 >= 512
        assert_eq!(b.min_segment_count(), 8);
        // 2^20 entries > 8 << 15, so segments = next_pow2(2^20 >> 15, 128)
        assert_eq!(b.segments(), 128);
        assert_eq!(b.entries_per_segment(), (1 << 20) * 2 / 128);
        assert_eq!(b.entries_per_segment() % 64, 0);
    }

    #[test]
    fn small_maps_fall_back_to_min_segments() {
        let b = builder().entries(1024);
        assert_eq!(b.segments(), 8);
        assert_eq!(b.entries_per_segment(), 256);
    }

    #[test]
    fn entry_size_is_aligned_up() {
        let b = builder().entry_size(30);
        assert_eq!(b.aligned_entry_size(), 32);
        let b = builder()
            .entry_size(30)
            .entry_and_value_alignment(Alignment::None);
        assert_eq!(b.aligned_entry_size(), 30);
        let b = builder()
            .entry_size(30)
            .entry_and_value_alignment(Alignment::OfEightBytes);
        assert_eq!(b.aligned_entry_size(), 32);
    }

    #[test]
    fn overrides_win() {
        let b = builder().actual_segments(4).actual_entries_per_segment(128);
        assert_eq!(b.segments(), 4);
        assert_eq!(b.entries_per_segment(), 128);
    }

    #[test]
    fn large_segments_skips_the_small_branch() {
        let entries = 1u64 << 21;
        let small = builder().entries(entries);
        assert_eq!(small.segments(), 128);
        let large = builder().entries(entries).large_segments(true);
        // falls through to next_pow2(max((entries >> 30) + 1, min))
        assert_eq!(large.segments(), 8);
    }

    #[test]
    fn misconfiguration_is_rejected_before_allocation() {
        assert!(matches!(
            builder().meta_data_bytes(256).create(),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            builder().actual_segments(3).create(),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            builder().entries(0).create(),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            builder().actual_entries_per_segment(63).create(),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn factory_without_factory_codec_is_rejected() {
        let b = builder().value_factory(Arc::new(crate::marshal::DefaultValueFactory));
        assert!(matches!(b.create(), Err(Error::IllegalArgument(_))));
    }

    #[test]
    fn replicated_create_needs_an_identifier() {
        let b: MapBuilder<String, String> = MapBuilder::of();
        assert!(matches!(
            b.create_replicated(),
            Err(Error::IllegalArgument(_))
        ));
    }

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("segmap-{tag}-{}", std::process::id()))
    }

    #[test]
    fn reopen_sees_the_same_entries() {
        let path = temp_path("reopen");
        let _ = std::fs::remove_file(&path);
        let b = builder().entries(4096).actual_segments(8);
        {
            let map = b.create_file(&path).unwrap();
            for i in 0..1000 {
                map.put(&format!("key-{i}"), &format!("value-{i}")).unwrap();
            }
            assert_eq!(map.len(), 1000);
            map.close();
        }
        {
            let map = b.create_file(&path).unwrap();
            assert_eq!(map.len(), 1000);
            for i in 0..1000 {
                assert_eq!(
                    map.get(&format!("key-{i}")).unwrap().as_deref(),
                    Some(format!("value-{i}").as_str())
                );
            }
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn mismatched_parameters_refuse_to_open() {
        let path = temp_path("mismatch");
        let _ = std::fs::remove_file(&path);
        {
            let map = builder().entries(4096).create_file(&path).unwrap();
            map.put(&"k".to_string(), &"v".to_string()).unwrap();
        }
        let reopened = builder().entries(8192).create_file(&path);
        assert!(matches!(reopened, Err(Error::CorruptHeader(_))));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn garbage_file_refuses_to_open() {
        let path = temp_path("garbage");
        std::fs::write(&path, vec![0xABu8; 4096]).unwrap();
        assert!(matches!(
            builder().create_file(&path),
            Err(Error::CorruptHeader(_))
        ));
        let _ = std::fs::remove_file(&path);
    }
}
