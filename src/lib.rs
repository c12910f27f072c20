//! An embeddable, off-heap, persistent hash map.
//!
//! The whole data region — header, per-segment hash-lookup tables,
//! free-bit allocators and entry arenas — lives in one memory-mapped
//! (or anonymous) byte region, partitioned into independently locked
//! segments. Readers and writers address entries by computed offsets,
//! with no per-operation heap allocation on the hot path. File-backed
//! maps survive process restarts and may be shared between processes;
//! an optional replicated variant stamps entries for last-writer-wins
//! reconciliation over pluggable transports.
//!
//! ```no_run
//! use segmap::MapBuilder;
//!
//! let map = MapBuilder::<String, String>::of()
//!     .entries(1 << 16)
//!     .create()
//!     .unwrap();
//! map.put(&"a".to_string(), &"aye".to_string()).unwrap();
//! assert_eq!(map.get(&"a".to_string()).unwrap().as_deref(), Some("aye"));
//! ```

mod builder;
mod bytes;
mod error;
mod event;
mod hash;
mod map;
mod marshal;
mod offheap;
mod replicated;

pub use builder::MapBuilder;
pub use bytes::{ByteStore, Cursor};
pub use error::{Error, Result};
pub use event::{LoggingErrorListener, MapErrorListener, MapEventListener, NopEventListener};
pub use map::SegmentedMap;
pub use marshal::{
    Byteable, ByteableMarshaller, BytesMarshaller, BytesVecMarshaller, BytesWritable,
    DefaultMarshaller, DefaultValueFactory, F64Marshaller, I32Marshaller, I64Marshaller,
    SerdeMarshaller, StringMarshaller, ValueFactory, WritableMarshaller,
};
pub use offheap::layout::Alignment;
pub use replicated::{
    Closeable, ModificationIterator, ModificationSource, ReplicatedMap, ReplicationConfig,
    Replicator, SystemTimeProvider, TimeProvider,
};
