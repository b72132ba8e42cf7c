//! Cache fixed-size disk pages in memory between an index layer and the file system.
//!
//! A [PageCache] is composed of two tiers:
//!
//! - a [read::ReadCache] that hands out pinned, referenced pages and evicts them with the
//!   [2Q](https://www.vldb.org/conf/1994/P439.PDF) policy (a probationary queue `a1in`, a ghost
//!   queue `a1out` that only remembers keys, and a hot queue `am`), which keeps one-off scans from
//!   flushing frequently used pages out of memory;
//! - a [write::WriteCache] that buffers dirty pages, performs all page I/O and flushes dirty pages
//!   in the background, never writing a page before the write-ahead log record that produced it
//!   is durable.
//!
//! # Page Format
//!
//! Each page is `page_size` bytes on disk. The first bytes of every page are reserved:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-----+---+---+-----+
//! | 0 | 1 |    ...    | 7 | 8 | 9 |10 |11 |12 |13 |  ...  | 27  |28 |29 | ... |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-----+---+---+-----+
//! |   Magic (u64)         |  CRC32 (u32)  |    Page LSN (2 x u64)   |  Payload  |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-----+---+---+-----+
//! ```
//!
//! The magic number and checksum are written by the cache when a page is flushed. The page LSN
//! (the position of the last write-ahead log record that modified the page) is written by the
//! index layer and is read by the cache to enforce write-ahead ordering. See [page].
//!
//! # Concurrency
//!
//! Loads and releases of different pages proceed in parallel: they only take the read side of the
//! cache-wide lock plus a striped per-page lock. Structural changes (adding, truncating or deleting
//! files) take the write side. Page contents are guarded by a lock on the [pointer::CachePointer]
//! itself, so contents can be read while cache bookkeeping for the page changes.
//!
//! # Status
//!
//! `commonware-pagecache` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use std::io::Error as IoError;
use thiserror::Error;

mod cache;
pub use cache::{Config, PageCache, Stats};
mod executor;
pub mod key;
pub use key::PageKey;
pub mod listener;
mod lock;
pub mod lru;
pub use lru::LruKind;
mod metrics;
pub mod page;
pub mod pointer;
pub mod read;
pub mod storage;
pub mod wal;
pub use wal::{Lsn, WriteAheadLog};
pub mod write;

/// Errors that can occur when interacting with the page cache.
#[derive(Debug, Error)]
pub enum Error {
    #[error("all cache entries are in use")]
    AllCacheEntriesInUse,
    #[error("{pinned} pinned pages exceed the limit of a cache of {pages} pages")]
    PinnedPagesLimit { pinned: usize, pages: usize },
    #[error("page in use: {0}")]
    PageInUse(PageKey),
    #[error("page missing: {0}")]
    PageMissing(PageKey),
    #[error("file missing: {0}")]
    FileMissing(String),
    #[error("file id missing: {0}")]
    FileIdMissing(u64),
    #[error("file id invalid: {0}")]
    FileIdInvalid(u64),
    #[error("file closed: {0}")]
    FileClosed(u64),
    #[error("file already exists: {0}")]
    FileExists(String),
    #[error("file {name} is bound to id {existing}, not {proposed}")]
    FileIdMismatch {
        name: String,
        existing: u64,
        proposed: u64,
    },
    #[error("file id {id} is bound to {existing}, not {proposed}")]
    FileNameMismatch {
        id: u64,
        existing: String,
        proposed: String,
    },
    #[error("file name invalid: {0}")]
    FileNameInvalid(String),
    #[error("file open failed: {0} error: {1}")]
    FileOpenFailed(String, IoError),
    #[error("file resize failed: {0} error: {1}")]
    FileResizeFailed(String, IoError),
    #[error("file sync failed: {0} error: {1}")]
    FileSyncFailed(String, IoError),
    #[error("file remove failed: {0} error: {1}")]
    FileRemoveFailed(String, IoError),
    #[error("file rename failed: {0} -> {1} error: {2}")]
    FileRenameFailed(String, String, IoError),
    #[error("read failed")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("file insufficient length")]
    InsufficientLength,
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("name-id map corrupt: {0}")]
    NameIdMapCorrupt(String),
    #[error("write-ahead log error: {0}")]
    Wal(String),
    #[error("executor closed")]
    Closed,
    #[error("background task panicked")]
    TaskPanicked,
    #[error("io error: {0}")]
    Io(#[from] IoError),
}
