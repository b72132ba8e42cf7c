//! Physical page format.
//!
//! Pages are framed by the cache when they are written to disk:
//!
//! - `[0..8)`: [MAGIC_NUMBER] (u64, big-endian)
//! - `[8..12)`: CRC32 (u32, big-endian) of `[12..page_size)`
//! - `[12..28)`: [Lsn] of the last log record applied to the page (written by the index layer)
//! - `[28..page_size)`: payload
//!
//! In memory, each page buffer carries [PADDING] extra bytes on either side of the page so that
//! adjacent buffers never share a word. Padding is never written to disk nor covered by the
//! checksum.

use crate::wal::Lsn;

/// Constant written at the start of every flushed page.
pub const MAGIC_NUMBER: u64 = 0xFACB03FE;

/// Bytes added before and after each in-memory page buffer.
pub const PADDING: usize = 8;

/// Offset of the magic number within a page.
pub const MAGIC_OFFSET: usize = 0;

/// Offset of the checksum within a page.
pub const CRC_OFFSET: usize = 8;

/// Offset of the page [Lsn] within a page.
pub const LSN_OFFSET: usize = 12;

/// Bytes at the start of a page that the checksum does not cover.
pub const SYSTEM_SIZE: usize = LSN_OFFSET;

/// Offset at which the payload owned by the index layer starts.
pub const PAYLOAD_OFFSET: usize = LSN_OFFSET + Lsn::SIZE;

/// Size of an in-memory page buffer for a given page size.
pub const fn buffer_size(page_size: usize) -> usize {
    page_size + 2 * PADDING
}

/// Compute the checksum of a page (excluding the magic number and the checksum itself).
pub fn checksum(page: &[u8]) -> u32 {
    crc32fast::hash(&page[SYSTEM_SIZE..])
}

/// Stamp the magic number and checksum into a page that is about to be written.
pub fn seal(page: &mut [u8]) {
    page[MAGIC_OFFSET..CRC_OFFSET].copy_from_slice(&MAGIC_NUMBER.to_be_bytes());
    let crc = checksum(page);
    page[CRC_OFFSET..SYSTEM_SIZE].copy_from_slice(&crc.to_be_bytes());
}

/// The outcome of checking a page read back from disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Check {
    pub magic_matches: bool,
    pub checksum_matches: bool,
}

impl Check {
    pub const fn is_valid(&self) -> bool {
        self.magic_matches && self.checksum_matches
    }
}

/// Check the magic number and checksum of a page.
pub fn check(page: &[u8]) -> Check {
    let magic = u64::from_be_bytes(page[MAGIC_OFFSET..CRC_OFFSET].try_into().unwrap());
    let stored = u32::from_be_bytes(page[CRC_OFFSET..SYSTEM_SIZE].try_into().unwrap());
    Check {
        magic_matches: magic == MAGIC_NUMBER,
        checksum_matches: stored == checksum(page),
    }
}

/// Read the [Lsn] stored in a page.
pub fn lsn(page: &[u8]) -> Lsn {
    Lsn::decode(&page[LSN_OFFSET..PAYLOAD_OFFSET])
}

/// Store an [Lsn] in a page.
pub fn set_lsn(page: &mut [u8], lsn: Lsn) {
    page[LSN_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&lsn.encode());
}
