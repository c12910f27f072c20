//! Key/value codecs.
//!
//! The codec for each side of the map is chosen explicitly at build
//! time: fixed-width numerics, length-prefixed UTF-8 strings, raw byte
//! vectors, byteable-by-layout structs, self-serializing types, or a
//! serde/bincode fallback for anything else.

use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bytes::Cursor;

/// Translates a value to and from a byte cursor.
///
/// `write` must advance the cursor by exactly the number of bytes
/// written; `read` consumes the same encoding. `read_reusing` lets the
/// map hand back a previously allocated instance on the read path.
pub trait BytesMarshaller<T>: Send + Sync {
    fn write(&self, cur: &mut Cursor<'_>, v: &T);
    fn read(&self, cur: &mut Cursor<'_>) -> T;

    fn read_reusing(&self, cur: &mut Cursor<'_>, reusable: T) -> T {
        let _ = reusable;
        self.read(cur)
    }

    /// Whether this marshaller constructs instances through a
    /// [`ValueFactory`]. The builder rejects a configured factory when
    /// the marshaller would never consult it.
    fn uses_factory(&self) -> bool {
        false
    }
}

/// Supplies fresh (or pooled) value instances for reuse-on-read flows.
pub trait ValueFactory<T>: Send + Sync {
    fn create(&self) -> T;
}

/// Zeroes a fresh instance via `Default`.
pub struct DefaultValueFactory;

impl<T: Default> ValueFactory<T> for DefaultValueFactory {
    fn create(&self) -> T {
        T::default()
    }
}

/// Types with a default codec, used by the builder when none is
/// configured explicitly.
pub trait DefaultMarshaller: Sized {
    fn default_marshaller() -> Arc<dyn BytesMarshaller<Self>>;
}

// --- string ---

/// Stop-bit byte length followed by UTF-8 bytes.
pub struct StringMarshaller;

impl BytesMarshaller<String> for StringMarshaller {
    fn write(&self, cur: &mut Cursor<'_>, v: &String) {
        cur.write_utf(v);
    }

    fn read(&self, cur: &mut Cursor<'_>) -> String {
        cur.read_utf()
    }

    fn read_reusing(&self, cur: &mut Cursor<'_>, mut reusable: String) -> String {
        cur.read_utf_reusing(&mut reusable);
        reusable
    }
}

impl DefaultMarshaller for String {
    fn default_marshaller() -> Arc<dyn BytesMarshaller<Self>> {
        Arc::new(StringMarshaller)
    }
}

// --- fixed-width numerics ---

pub struct I32Marshaller;

impl BytesMarshaller<i32> for I32Marshaller {
    fn write(&self, cur: &mut Cursor<'_>, v: &i32) {
        cur.write_i32(*v);
    }

    fn read(&self, cur: &mut Cursor<'_>) -> i32 {
        cur.read_i32()
    }
}

impl DefaultMarshaller for i32 {
    fn default_marshaller() -> Arc<dyn BytesMarshaller<Self>> {
        Arc::new(I32Marshaller)
    }
}

pub struct I64Marshaller;

impl BytesMarshaller<i64> for I64Marshaller {
    fn write(&self, cur: &mut Cursor<'_>, v: &i64) {
        cur.write_i64(*v);
    }

    fn read(&self, cur: &mut Cursor<'_>) -> i64 {
        cur.read_i64()
    }
}

impl DefaultMarshaller for i64 {
    fn default_marshaller() -> Arc<dyn BytesMarshaller<Self>> {
        Arc::new(I64Marshaller)
    }
}

pub struct F64Marshaller;

impl BytesMarshaller<f64> for F64Marshaller {
    fn write(&self, cur: &mut Cursor<'_>, v: &f64) {
        cur.write_f64(*v);
    }

    fn read(&self, cur: &mut Cursor<'_>) -> f64 {
        cur.read_f64()
    }
}

impl DefaultMarshaller for f64 {
    fn default_marshaller() -> Arc<dyn BytesMarshaller<Self>> {
        Arc::new(F64Marshaller)
    }
}

// --- raw bytes ---

/// Stop-bit length followed by the raw bytes.
pub struct BytesVecMarshaller;

impl BytesMarshaller<Vec<u8>> for BytesVecMarshaller {
    fn write(&self, cur: &mut Cursor<'_>, v: &Vec<u8>) {
        cur.write_stop_bit(v.len() as u64);
        cur.write_bytes(v);
    }

    fn read(&self, cur: &mut Cursor<'_>) -> Vec<u8> {
        let len = cur.read_stop_bit() as usize;
        let mut buf = vec![0u8; len];
        cur.read_bytes(&mut buf);
        buf
    }

    fn read_reusing(&self, cur: &mut Cursor<'_>, mut reusable: Vec<u8>) -> Vec<u8> {
        let len = cur.read_stop_bit() as usize;
        reusable.clear();
        reusable.resize(len, 0);
        cur.read_bytes(&mut reusable);
        reusable
    }
}

impl DefaultMarshaller for Vec<u8> {
    fn default_marshaller() -> Arc<dyn BytesMarshaller<Self>> {
        Arc::new(BytesVecMarshaller)
    }
}

// --- byteable-by-layout ---

/// Types whose on-disk image equals their in-memory image.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with no padding, and every bit
/// pattern of `size_of::<Self>()` bytes must be a valid value. The
/// encoding is the raw little-endian memory image, so such types are
/// only portable between hosts of the same endianness and layout.
pub unsafe trait Byteable: Copy + Send + Sync + 'static {}

/// Reads and writes a [`Byteable`] as its raw memory image.
pub struct ByteableMarshaller<T: Byteable> {
    factory: Option<Arc<dyn ValueFactory<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Byteable> ByteableMarshaller<T> {
    pub fn new() -> Self {
        ByteableMarshaller {
            factory: None,
            _marker: PhantomData,
        }
    }

    pub fn with_factory(factory: Arc<dyn ValueFactory<T>>) -> Self {
        ByteableMarshaller {
            factory: Some(factory),
            _marker: PhantomData,
        }
    }
}

impl<T: Byteable> Default for ByteableMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Byteable> BytesMarshaller<T> for ByteableMarshaller<T> {
    fn write(&self, cur: &mut Cursor<'_>, v: &T) {
        let bytes =
            unsafe { std::slice::from_raw_parts(v as *const T as *const u8, mem::size_of::<T>()) };
        cur.write_bytes(bytes);
    }

    fn read(&self, cur: &mut Cursor<'_>) -> T {
        match &self.factory {
            Some(f) => self.read_reusing(cur, f.create()),
            None => {
                let mut out = mem::MaybeUninit::<T>::zeroed();
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(
                        out.as_mut_ptr() as *mut u8,
                        mem::size_of::<T>(),
                    )
                };
                cur.read_bytes(bytes);
                // Safety: Byteable guarantees every bit pattern is valid.
                unsafe { out.assume_init() }
            }
        }
    }

    fn read_reusing(&self, cur: &mut Cursor<'_>, mut reusable: T) -> T {
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(&mut reusable as *mut T as *mut u8, mem::size_of::<T>())
        };
        cur.read_bytes(bytes);
        reusable
    }

    fn uses_factory(&self) -> bool {
        true
    }
}

// --- self-serializing ---

/// Types that define their own cursor encoding.
pub trait BytesWritable: Sized {
    fn write_bytes(&self, cur: &mut Cursor<'_>);
    fn read_bytes(cur: &mut Cursor<'_>) -> Self;

    fn read_bytes_reusing(cur: &mut Cursor<'_>, reusable: Self) -> Self {
        let _ = reusable;
        Self::read_bytes(cur)
    }
}

pub struct WritableMarshaller<T: BytesWritable> {
    factory: Option<Arc<dyn ValueFactory<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: BytesWritable> WritableMarshaller<T> {
    pub fn new() -> Self {
        WritableMarshaller {
            factory: None,
            _marker: PhantomData,
        }
    }

    pub fn with_factory(factory: Arc<dyn ValueFactory<T>>) -> Self {
        WritableMarshaller {
            factory: Some(factory),
            _marker: PhantomData,
        }
    }
}

impl<T: BytesWritable> Default for WritableMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: BytesWritable + Send + Sync> BytesMarshaller<T> for WritableMarshaller<T> {
    fn write(&self, cur: &mut Cursor<'_>, v: &T) {
        v.write_bytes(cur);
    }

    fn read(&self, cur: &mut Cursor<'_>) -> T {
        match &self.factory {
            Some(f) => T::read_bytes_reusing(cur, f.create()),
            None => T::read_bytes(cur),
        }
    }

    fn read_reusing(&self, cur: &mut Cursor<'_>, reusable: T) -> T {
        T::read_bytes_reusing(cur, reusable)
    }

    fn uses_factory(&self) -> bool {
        true
    }
}

// --- generic serde fallback ---

/// Stop-bit payload length followed by a bincode body. The catch-all
/// for types without a dedicated codec.
pub struct SerdeMarshaller<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeMarshaller<T> {
    pub fn new() -> Self {
        SerdeMarshaller {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync> BytesMarshaller<T> for SerdeMarshaller<T> {
    fn write(&self, cur: &mut Cursor<'_>, v: &T) {
        let payload =
            bincode::serialize(v).unwrap_or_else(|e| panic!("value failed to serialize: {e}"));
        cur.write_stop_bit(payload.len() as u64);
        cur.write_bytes(&payload);
    }

    fn read(&self, cur: &mut Cursor<'_>) -> T {
        let len = cur.read_stop_bit() as usize;
        let mut buf = vec![0u8; len];
        cur.read_bytes(&mut buf);
        bincode::deserialize(&buf).unwrap_or_else(|e| panic!("value failed to deserialize: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: PartialEq + std::fmt::Debug>(m: &dyn BytesMarshaller<T>, v: T) {
        let mut buf = Vec::new();
        m.write(&mut Cursor::over_vec(&mut buf), &v);
        let got = m.read(&mut Cursor::over_slice(&buf));
        assert_eq!(got, v);
    }

    #[test]
    fn builtin_round_trips() {
        round_trip(&StringMarshaller, "hello".to_string());
        round_trip(&StringMarshaller, String::new());
        round_trip(&I32Marshaller, -7);
        round_trip(&I64Marshaller, i64::MIN);
        round_trip(&F64Marshaller, 2.5);
        round_trip(&BytesVecMarshaller, vec![1u8, 2, 3]);
        round_trip(&BytesVecMarshaller, Vec::new());
    }

    #[test]
    fn string_reuse_replaces_contents() {
        let mut buf = Vec::new();
        StringMarshaller.write(&mut Cursor::over_vec(&mut buf), &"fresh".to_string());
        let got = StringMarshaller.read_reusing(
            &mut Cursor::over_slice(&buf),
            "stale-and-longer".to_string(),
        );
        assert_eq!(got, "fresh");
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    #[repr(C)]
    struct Point {
        x: i32,
        y: i32,
    }

    unsafe impl Byteable for Point {}

    #[test]
    fn byteable_is_raw_image() {
        let m = ByteableMarshaller::<Point>::new();
        let mut buf = Vec::new();
        m.write(&mut Cursor::over_vec(&mut buf), &Point { x: 1, y: -2 });
        assert_eq!(buf.len(), 8);
        let got = m.read(&mut Cursor::over_slice(&buf));
        assert_eq!(got, Point { x: 1, y: -2 });
    }

    #[derive(Debug, PartialEq, Default)]
    struct Pair(u32, u32);

    impl BytesWritable for Pair {
        fn write_bytes(&self, cur: &mut Cursor<'_>) {
            cur.write_u32(self.0);
            cur.write_u32(self.1);
        }

        fn read_bytes(cur: &mut Cursor<'_>) -> Self {
            Pair(cur.read_u32(), cur.read_u32())
        }
    }

    #[test]
    fn writable_round_trip_with_factory() {
        let m = WritableMarshaller::with_factory(Arc::new(DefaultValueFactory));
        round_trip(&m, Pair(3, 4));
        assert!(m.uses_factory());
    }

    #[test]
    fn serde_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Rec {
            id: u64,
            tags: Vec<String>,
        }
        round_trip(
            &SerdeMarshaller::new(),
            Rec {
                id: 9,
                tags: vec!["a".into(), "b".into()],
            },
        );
    }
}
