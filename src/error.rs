use std::io;

use thiserror::Error;

/// Errors surfaced by map operations and by the builder.
///
/// Out-of-bounds region access is deliberately *not* represented here:
/// it means the mapped image is corrupt and the store panics instead.
#[derive(Error, Debug)]
pub enum Error {
    /// A segment lock could not be acquired within the configured
    /// deadline. The error listener has already been notified.
    #[error("timed out acquiring lock on segment {segment}")]
    LockTimeout { segment: usize },

    /// The segment's arena has no run of free chunks large enough for
    /// the entry. The map never rehashes or grows; the caller may
    /// retry after removals.
    #[error("segment {segment} is full")]
    SegmentFull { segment: usize },

    /// An I/O failure from the backing file. Fatal to the operation;
    /// other segments remain usable.
    #[error("i/o error")]
    Io(#[from] io::Error),

    /// The persisted file header does not match this build of the map
    /// (bad magic, wrong version, or mismatched geometry).
    #[error("corrupt or mismatched map header: {0}")]
    CorruptHeader(String),

    /// Builder misconfiguration, detected before any allocation.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
