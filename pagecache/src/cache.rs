use crate::{
    listener::{BackgroundErrorListener, Handle, LowDiskSpaceListener},
    lru::LruKind,
    page,
    read::{CacheEntry, ReadCache},
    storage::Storage,
    wal::WriteAheadLog,
    write::{VerificationError, WriteCache},
    Error,
};
use prometheus_client::registry::Registry;
use std::{
    num::NonZeroUsize,
    sync::Arc,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::info;

/// Configuration for a [PageCache].
#[derive(Clone, Debug)]
pub struct Config {
    /// Prefix of the names of the threads spawned by the cache.
    pub name: String,

    /// Size of a page on disk, header included.
    pub page_size: NonZeroUsize,

    /// Memory budget of the read cache, in bytes.
    pub read_cache_size: usize,

    /// Memory budget of pages buffered by the write cache, in bytes.
    pub write_cache_size: usize,

    /// Fewest pages the read cache holds, whatever its memory budget.
    pub min_cache_pages: usize,

    /// Delay between background flush passes (`None` disables them).
    pub flush_interval: Option<Duration>,

    /// Delay between fuzzy checkpoints (`None` disables them). Checkpoints only run with a
    /// write-ahead log.
    pub fuzzy_checkpoint_interval: Option<Duration>,

    /// Free space, in bytes, under which low disk space listeners are notified.
    pub free_space_limit: u64,

    /// Shortest delay between two free space checks triggered by file growth.
    pub free_space_check_interval: Duration,

    /// Age under which a recently modified dirty page is skipped by a background flush pass
    /// (unless the caches are nearly full).
    pub group_ttl: Duration,

    /// Whether to sync a file after each page written by a flush.
    pub sync_on_flush: bool,

    /// Implementation of the LRU lists of the read cache.
    pub lru: LruKind,

    /// Largest share of the read cache, in percent, that pinned pages may take (at most
    /// [crate::read::MAX_PINNED_PAGES_PERCENT]).
    pub pinned_pages_percent: usize,

    /// Resident pages above the read cache size past which eviction stops every other page
    /// operation until the cache fits again.
    pub cache_overflow: usize,

    /// Whether the keys held by the read cache are saved on close so that
    /// [PageCache::load_cache_state] can warm the cache up again.
    pub keep_cache_state: bool,
}

impl Config {
    /// Create a configuration with conventional defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            page_size: NonZeroUsize::new(64 * 1024).unwrap(),
            read_cache_size: 64 * 1024 * 1024,
            write_cache_size: 16 * 1024 * 1024,
            min_cache_pages: 16,
            flush_interval: Some(Duration::from_millis(25)),
            fuzzy_checkpoint_interval: Some(Duration::from_secs(300)),
            free_space_limit: 256 * 1024 * 1024,
            free_space_check_interval: Duration::from_secs(2),
            group_ttl: Duration::from_secs(10),
            sync_on_flush: false,
            lru: LruKind::Arena,
            pinned_pages_percent: 20,
            cache_overflow: 8 * thread::available_parallelism().map_or(1, |n| n.get()),
            keep_cache_state: false,
        }
    }

    /// Pages held by the read cache before evicting.
    pub fn read_pages(&self) -> usize {
        (self.read_cache_size / page::buffer_size(self.page_size.get())).max(self.min_cache_pages)
    }

    /// Pages referenced only by the write cache above which a store triggers a flush.
    pub fn write_pages(&self) -> usize {
        (self.write_cache_size / page::buffer_size(self.page_size.get())).max(1)
    }
}

/// A snapshot of cache activity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    pub am_pages: usize,
    pub a1in_pages: usize,
    pub a1out_pages: usize,
    pub pinned_pages: usize,
    pub hits: u64,
    pub misses: u64,
    /// Share of loads served from memory (`0` before any load).
    pub hit_ratio: f64,
    pub dirty_pages: usize,
    /// Dirty pages no longer referenced by the read cache.
    pub exclusive_pages: usize,
    pub write_cache_bytes: usize,
    /// Completion time of the last fuzzy checkpoint.
    pub last_checkpoint: Option<SystemTime>,
    pub last_flush_duration: Duration,
    pub last_flush_pages: usize,
}

/// A two-tier page cache: pages are loaded through a [ReadCache], which delegates misses and
/// modified pages to a [WriteCache].
pub struct PageCache<S: Storage> {
    read: ReadCache<S>,
    write: Arc<WriteCache<S>>,
}

impl<S: Storage> PageCache<S> {
    /// Open a cache over `storage`, registering metrics in `registry`.
    ///
    /// If a write-ahead log is provided, no page is written before the log is durable up to the
    /// [crate::Lsn] stored in the page header.
    pub fn new(
        storage: S,
        cfg: &Config,
        wal: Option<Arc<dyn WriteAheadLog>>,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        let write = Arc::new(WriteCache::new(
            storage,
            cfg,
            wal,
            registry.sub_registry_with_prefix("write"),
        )?);
        let read = ReadCache::new(
            write.clone(),
            cfg,
            registry.sub_registry_with_prefix("read"),
        );
        info!(
            name = %cfg.name,
            read_pages = read.max_size(),
            write_pages = cfg.write_pages(),
            "page cache opened"
        );
        Ok(Self { read, write })
    }

    pub fn read_cache(&self) -> &ReadCache<S> {
        &self.read
    }

    pub fn write_cache(&self) -> &WriteCache<S> {
        &self.write
    }

    /// Load a page, returning `None` if it is past the end of its file.
    ///
    /// The page must be handed back with [PageCache::release].
    pub fn load(
        &self,
        file_id: u64,
        page_index: u64,
        check_pinned: bool,
    ) -> Result<Option<Arc<CacheEntry>>, Error> {
        self.read.load(file_id, page_index, check_pinned)
    }

    /// Append a zeroed page to a file.
    pub fn allocate_new_page(&self, file_id: u64) -> Result<Arc<CacheEntry>, Error> {
        self.read.allocate_new_page(file_id)
    }

    pub fn release(&self, entry: &Arc<CacheEntry>) -> Result<(), Error> {
        self.read.release(entry)
    }

    /// Keep a loaded page out of eviction. Returns false if too many pages are pinned already.
    pub fn pin_page(&self, entry: &Arc<CacheEntry>) -> Result<bool, Error> {
        self.read.pin_page(entry)
    }

    /// Resize the read cache to `bytes`, evicting if it shrinks.
    pub fn change_maximum_amount_of_memory(&self, bytes: usize) -> Result<(), Error> {
        self.read.change_maximum_amount_of_memory(bytes)
    }

    /// Reload the pages held by the read cache when it was last closed (if
    /// [Config::keep_cache_state] is set). Files must be opened first: pages of closed files are
    /// skipped. Returns the number of pages loaded.
    pub fn load_cache_state(&self) -> Result<usize, Error> {
        self.read.load_cache_state()
    }

    pub fn book_file_id(&self, name: &str) -> u64 {
        self.write.book_file_id(name)
    }

    pub fn add_file(&self, name: &str) -> Result<u64, Error> {
        self.read.add_file(name)
    }

    pub fn add_file_with_id(&self, name: &str, file_id: u64) -> Result<(), Error> {
        self.read.add_file_with_id(name, file_id)
    }

    pub fn open_file(&self, name: &str) -> Result<u64, Error> {
        self.read.open_file(name)
    }

    pub fn open_file_by_id(&self, file_id: u64) -> Result<(), Error> {
        self.read.open_file_by_id(file_id)
    }

    pub fn open_file_with_id(&self, name: &str, file_id: u64) -> Result<(), Error> {
        self.read.open_file_with_id(name, file_id)
    }

    pub fn exists(&self, name: &str) -> Result<bool, Error> {
        self.write.exists(name)
    }

    pub fn exists_id(&self, file_id: u64) -> Result<bool, Error> {
        self.write.exists_id(file_id)
    }

    pub fn is_open(&self, file_id: u64) -> bool {
        self.write.is_open(file_id)
    }

    pub fn file_id(&self, name: &str) -> Option<u64> {
        self.write.file_id(name)
    }

    pub fn file_name(&self, file_id: u64) -> Option<String> {
        self.write.file_name(file_id)
    }

    pub fn filled_up_to(&self, file_id: u64) -> Result<u64, Error> {
        self.write.filled_up_to(file_id)
    }

    pub fn truncate_file(&self, file_id: u64) -> Result<(), Error> {
        self.read.truncate_file(file_id)
    }

    pub fn close_file(&self, file_id: u64, flush: bool) -> Result<(), Error> {
        self.read.close_file(file_id, flush)
    }

    pub fn delete_file(&self, file_id: u64) -> Result<(), Error> {
        self.read.delete_file(file_id)
    }

    pub fn rename_file(&self, file_id: u64, old: &str, new: &str) -> Result<(), Error> {
        self.read.rename_file(file_id, old, new)
    }

    /// Write every dirty page of a file and sync it.
    pub fn flush(&self, file_id: u64) -> Result<(), Error> {
        self.write.flush(file_id)
    }

    pub fn flush_all(&self) -> Result<(), Error> {
        self.write.flush_all()
    }

    pub fn make_fuzzy_checkpoint(&self) -> Result<(), Error> {
        self.write.make_fuzzy_checkpoint()
    }

    pub fn check_low_disk_space(&self) -> Result<bool, Error> {
        self.write.check_low_disk_space()
    }

    /// Flush everything and verify every page of every open file.
    pub fn check_stored_pages(&self) -> Result<Vec<VerificationError>, Error> {
        self.write.check_stored_pages()
    }

    pub fn add_low_disk_space_listener(&self, listener: Arc<dyn LowDiskSpaceListener>) -> Handle {
        self.write.add_low_disk_space_listener(listener)
    }

    pub fn remove_low_disk_space_listener(&self, handle: Handle) -> bool {
        self.write.remove_low_disk_space_listener(handle)
    }

    pub fn add_background_error_listener(
        &self,
        listener: Arc<dyn BackgroundErrorListener>,
    ) -> Handle {
        self.write.add_background_error_listener(listener)
    }

    pub fn remove_background_error_listener(&self, handle: Handle) -> bool {
        self.write.remove_background_error_listener(handle)
    }

    /// Drop every resident page (failing if one is in use).
    pub fn clear(&self) -> Result<(), Error> {
        self.read.clear()
    }

    /// Flush everything and close every file.
    pub fn close(&self) -> Result<(), Error> {
        self.read.close_storage()
    }

    /// Remove every file.
    pub fn delete(&self) -> Result<(), Error> {
        self.read.delete_storage()
    }

    pub fn stats(&self) -> Stats {
        let hits = self.read.hits();
        let misses = self.read.misses();
        let loads = hits + misses;
        let metrics = self.write.metrics();
        let last_checkpoint = match metrics.last_checkpoint.get() {
            0 => None,
            millis => Some(UNIX_EPOCH + Duration::from_millis(millis as u64)),
        };
        Stats {
            am_pages: self.read.am_pages(),
            a1in_pages: self.read.a1in_pages(),
            a1out_pages: self.read.a1out_pages(),
            pinned_pages: self.read.pinned_pages(),
            hits,
            misses,
            hit_ratio: if loads == 0 {
                0.0
            } else {
                hits as f64 / loads as f64
            },
            dirty_pages: self.write.dirty_pages(),
            exclusive_pages: self.write.exclusive_pages(),
            write_cache_bytes: self.write.write_cache_bytes(),
            last_checkpoint,
            last_flush_duration: Duration::from_millis(metrics.last_flush_duration.get() as u64),
            last_flush_pages: metrics.last_flush_pages.get() as usize,
        }
    }
}
