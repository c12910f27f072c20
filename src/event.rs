//! Observability hooks.
//!
//! Event listeners are invoked while the owning segment's lock is held:
//! they may read and write the entry through the supplied cursor (the
//! meta-data bytes in particular) but must not re-enter the map.

use crate::bytes::Cursor;

/// Callbacks around map mutations and reads.
///
/// `entry` is a bounds-checked cursor over the whole entry; `meta_pos`,
/// `key_pos` and `value_pos` are positions within it.
#[allow(unused_variables)]
pub trait MapEventListener: Send + Sync {
    fn on_put(
        &self,
        entry: &mut Cursor<'_>,
        meta_pos: u64,
        key_pos: u64,
        value_pos: u64,
        added: bool,
    ) {
    }

    fn on_get_found(&self, entry: &mut Cursor<'_>, meta_pos: u64, key_pos: u64, value_pos: u64) {}

    fn on_get_missing(&self, key_bytes: &[u8]) {}

    fn on_remove(&self, entry: &mut Cursor<'_>, meta_pos: u64, key_pos: u64, value_pos: u64) {}
}

/// The default listener: does nothing.
pub struct NopEventListener;

impl MapEventListener for NopEventListener {}

/// Notified when a segment operation fails outside the normal result
/// path.
pub trait MapErrorListener: Send + Sync {
    fn on_lock_timeout(&self, segment: usize);
}

/// The default error listener: logs and moves on.
pub struct LoggingErrorListener;

impl MapErrorListener for LoggingErrorListener {
    fn on_lock_timeout(&self, segment: usize) {
        log::error!("lock acquisition timed out on segment {segment}");
    }
}
