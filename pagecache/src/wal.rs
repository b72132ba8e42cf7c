//! The write-ahead log interface consumed by the cache.
//!
//! The cache never appends records to the log itself (beyond fuzzy checkpoint markers). It only
//! needs to know how far the log is durable, to force it to become durable before a page that
//! depends on it is written, and to discard records once no dirty page depends on them.

use crate::Error;
use std::fmt;

/// A position in the write-ahead log.
///
/// Positions are ordered by `segment` and then by `position` within the segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn {
    pub segment: u64,
    pub position: u64,
}

impl Lsn {
    /// Size of an encoded [Lsn] in bytes.
    pub const SIZE: usize = 16;

    pub const fn new(segment: u64, position: u64) -> Self {
        Self { segment, position }
    }

    /// Encode the LSN as big-endian `segment` followed by `position`.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&self.segment.to_be_bytes());
        buf[8..].copy_from_slice(&self.position.to_be_bytes());
        buf
    }

    /// Decode an LSN from the first [Lsn::SIZE] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [Lsn::SIZE].
    pub fn decode(buf: &[u8]) -> Self {
        let segment = u64::from_be_bytes(buf[..8].try_into().unwrap());
        let position = u64::from_be_bytes(buf[8..Self::SIZE].try_into().unwrap());
        Self { segment, position }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.position)
    }
}

/// The operations of a write-ahead log that the cache depends on.
pub trait WriteAheadLog: Send + Sync + 'static {
    /// The position up to which the log is durable, or `None` if nothing was flushed yet.
    fn flushed_lsn(&self) -> Option<Lsn>;

    /// Make every appended record durable.
    fn flush(&self) -> Result<(), Error>;

    /// Append the marker that starts a fuzzy checkpoint covering records from `lsn` onward.
    fn log_fuzzy_checkpoint_start(&self, lsn: Lsn) -> Result<(), Error>;

    /// Append the marker that ends the current fuzzy checkpoint.
    fn log_fuzzy_checkpoint_end(&self) -> Result<(), Error>;

    /// Discard every record below `lsn`.
    fn cut_till(&self, lsn: Lsn) -> Result<(), Error>;
}
