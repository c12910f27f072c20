//! Off-heap core: region layout, per-segment locking, hash lookup,
//! chunk allocation and the single-segment operation protocol.
//!
//! Everything here addresses the map through absolute offsets into one
//! [`crate::bytes::ByteStore`]; nothing at this layer allocates per
//! operation besides previous-value copies the caller asked for.

pub mod freebits;
pub mod layout;
pub mod lock;
pub mod lookup;
pub(crate) mod segment;
