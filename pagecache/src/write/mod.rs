//! Buffer dirty pages and perform all page I/O.
//!
//! The [WriteCache] owns the files backing the cache and an ordered map of dirty pages. Pages are
//! handed over by the read cache with [WriteCache::store] and written to disk in the background, in
//! file order, starting where the previous pass stopped. No page is written before the
//! write-ahead log record that last modified it is durable.
//!
//! # Files
//!
//! Files are identified by a numeric id bound to their name in a persistent map (see [names]).
//! Ids are never reused for a different name: deleting a file keeps its id reserved so that a file
//! re-created under the same name gets the same id back.
//!
//! A file can be known (present in the map) but closed. Page operations on a closed file fail with
//! [Error::FileClosed].
//!
//! # Background Work
//!
//! Two single-threaded executors are owned by the cache:
//!
//! - the flush executor runs the periodic flush pass as well as explicit flushes and page removals
//!   requested by file operations, so that at most one thread writes pages at a time;
//! - the checkpoint executor runs fuzzy checkpoints (periodically if a write-ahead log and an
//!   interval are configured).
//!
//! Failures of periodic work are logged and reported to the registered
//! [crate::listener::BackgroundErrorListener]s.
//!
//! # Shutdown
//!
//! [WriteCache::close] flushes everything before stopping. Dropping a [WriteCache] without closing
//! it discards dirty pages (as a crash would): their content must then be recovered from the
//! write-ahead log.

use crate::{
    executor::{self, Executor, Tick},
    key::PageKey,
    listener::{self, BackgroundErrorListener, Handle, LowDiskSpaceListener},
    lock::{CacheLock, LockManager},
    metrics::WriteMetrics,
    page,
    pointer::{CachePointer, WritersListener},
    storage::{File, Storage},
    wal::WriteAheadLog,
    Config, Error,
};
use futures::channel::oneshot;
use prometheus_client::{metrics::gauge::Gauge, registry::Registry};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, trace};

mod checkpoint;
mod flush;
pub mod names;
use names::NameIdMap;
mod space;
use space::SpaceMonitor;
mod verify;
pub use verify::VerificationError;

/// Acknowledgement of a flush pass scheduled by [WriteCache::store].
pub type FlushAck = oneshot::Receiver<Result<(), Error>>;

/// A file known to the cache.
pub(crate) struct FileEntry<F> {
    name: Mutex<String>,
    handle: RwLock<Option<Arc<F>>>,

    // Pages the file logically holds (including allocated pages not yet written).
    filled: AtomicU64,

    // Bytes physically present in the file.
    physical: AtomicU64,

    // Held while pages are appended to the file.
    growth: Mutex<()>,
}

impl<F: File> FileEntry<F> {
    fn closed(name: String) -> Self {
        Self {
            name: Mutex::new(name),
            handle: RwLock::new(None),
            filled: AtomicU64::new(0),
            physical: AtomicU64::new(0),
            growth: Mutex::new(()),
        }
    }

    pub(crate) fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub(crate) fn handle(&self) -> Option<Arc<F>> {
        self.handle.read().unwrap().clone()
    }

    fn attach(&self, handle: F, page_size: usize) -> Result<(), Error> {
        let size = handle.size()?;
        self.physical.store(size, Ordering::Release);
        self.filled
            .store(size / page_size as u64, Ordering::Release);
        *self.handle.write().unwrap() = Some(Arc::new(handle));
        Ok(())
    }

    fn detach(&self) {
        self.handle.write().unwrap().take();
    }

    fn reset(&self) {
        self.filled.store(0, Ordering::Release);
        self.physical.store(0, Ordering::Release);
    }
}

/// A page with content that has not been written yet.
pub(crate) struct PageGroup {
    pointer: Mutex<Arc<CachePointer>>,

    // Set each time the page is stored, cleared when a flush pass defers the page.
    recency: AtomicBool,
    created: Instant,

    // The page was appended to its file and holds space reserved in the [SpaceMonitor].
    allocated: bool,
}

impl PageGroup {
    fn new(pointer: Arc<CachePointer>, allocated: bool) -> Self {
        Self {
            pointer: Mutex::new(pointer),
            recency: AtomicBool::new(true),
            created: Instant::now(),
            allocated,
        }
    }

    pub(crate) fn pointer(&self) -> Arc<CachePointer> {
        self.pointer.lock().unwrap().clone()
    }
}

/// Dirty pages that no reader references.
pub(crate) struct ExclusivePages {
    keys: Mutex<BTreeSet<PageKey>>,
    gauge: Gauge,
}

impl ExclusivePages {
    fn new(gauge: Gauge) -> Self {
        Self {
            keys: Mutex::new(BTreeSet::new()),
            gauge,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    /// Keys after `cursor` followed by keys up to and including it.
    pub(crate) fn ring(&self, cursor: Option<PageKey>) -> Vec<PageKey> {
        let keys = self.keys.lock().unwrap();
        match cursor {
            Some(cursor) => keys
                .range(cursor..)
                .filter(|key| **key != cursor)
                .chain(keys.range(..=cursor))
                .copied()
                .collect(),
            None => keys.iter().copied().collect(),
        }
    }
}

impl WritersListener for ExclusivePages {
    fn add_only_writers(&self, key: PageKey) {
        let mut keys = self.keys.lock().unwrap();
        keys.insert(key);
        self.gauge.set(keys.len() as i64);
    }

    fn remove_only_writers(&self, key: PageKey) {
        let mut keys = self.keys.lock().unwrap();
        keys.remove(&key);
        self.gauge.set(keys.len() as i64);
    }
}

/// State shared between the [WriteCache] and its background tasks.
pub(crate) struct Inner<S: Storage> {
    storage: S,
    page_size: usize,

    // Write side for file lifecycle changes, read side for page operations.
    files_lock: CacheLock,
    files: RwLock<HashMap<u64, Arc<FileEntry<S::File>>>>,
    names: Mutex<NameIdMap<S::File>>,

    dirty: RwLock<BTreeMap<PageKey, Arc<PageGroup>>>,
    exclusive: Arc<ExclusivePages>,
    page_locks: LockManager<PageKey>,
    cursor: Mutex<Option<PageKey>>,

    wal: Option<Arc<dyn WriteAheadLog>>,

    write_pages: usize,
    read_pages: usize,
    read_resident: AtomicUsize,
    group_ttl: Duration,
    sync_on_flush: bool,

    space: SpaceMonitor,
    metrics: WriteMetrics,
}

impl<S: Storage> Inner<S> {
    fn entry(&self, file_id: u64) -> Result<Arc<FileEntry<S::File>>, Error> {
        self.files
            .read()
            .unwrap()
            .get(&file_id)
            .cloned()
            .ok_or(Error::FileIdMissing(file_id))
    }

    fn open_entry(&self, file_id: u64) -> Result<(), Error> {
        let entry = self.entry(file_id)?;
        if entry.handle().is_some() {
            return Ok(());
        }
        let handle = self.storage.open(&entry.name(), false)?;
        entry.attach(handle, self.page_size)?;
        debug!(file_id, "file opened");
        Ok(())
    }

    fn create_file(
        &self,
        names: &mut NameIdMap<S::File>,
        name: &str,
        file_id: u64,
    ) -> Result<(), Error> {
        let id = i64::try_from(file_id).map_err(|_| Error::FileIdInvalid(file_id))?;
        let handle = self.storage.open(name, true)?;
        handle.sync()?;
        names.insert(name, id)?;
        let entry = FileEntry::closed(name.into());
        entry.attach(handle, self.page_size)?;
        self.files
            .write()
            .unwrap()
            .insert(file_id, Arc::new(entry));
        debug!(name, file_id, "file added");
        Ok(())
    }

    /// Extend a file through `key`, registering every appended page as dirty so that it reaches
    /// storage sealed even if nobody modifies it.
    fn allocate(&self, entry: &FileEntry<S::File>, key: PageKey) -> Result<(), Error> {
        let filled = key.page_index.checked_add(1).ok_or(Error::OffsetOverflow)?;
        filled
            .checked_mul(self.page_size as u64)
            .ok_or(Error::OffsetOverflow)?;
        let _growth = entry.growth.lock().unwrap();
        let previous = entry.filled.load(Ordering::Acquire);
        if filled <= previous {
            return Ok(());
        }

        let listener: Arc<dyn WritersListener> = self.exclusive.clone();
        let lsn = self.wal.as_ref().and_then(|wal| wal.flushed_lsn());
        for page_index in previous..filled {
            let key = PageKey::new(key.file_id, page_index);
            let _page = self.page_locks.exclusive(&key);
            let mut dirty = self.dirty.write().unwrap();
            if dirty.contains_key(&key) {
                continue;
            }
            let pointer = Arc::new(CachePointer::new(
                key,
                self.page_size,
                lsn,
                Some(listener.clone()),
            ));
            pointer.increment_writers();
            dirty.insert(key, Arc::new(PageGroup::new(pointer, true)));
            self.dirty_changed(dirty.len());
            self.space.allocate(&self.storage, self.page_size as u64);
        }

        // Readers only see the new length once every appended page is registered.
        entry.filled.store(filled, Ordering::Release);
        trace!(file_id = key.file_id, previous, filled, "file extended");
        Ok(())
    }

    fn dirty_changed(&self, len: usize) {
        self.metrics.dirty_pages.set(len as i64);
        self.metrics
            .write_cache_bytes
            .set((len * page::buffer_size(self.page_size)) as i64);
    }

    /// Open files, ordered by id.
    fn open_files(&self) -> Vec<(u64, Arc<FileEntry<S::File>>, Arc<S::File>)> {
        let files = self.files.read().unwrap();
        let mut open: Vec<_> = files
            .iter()
            .filter_map(|(id, entry)| entry.handle().map(|h| (*id, entry.clone(), h)))
            .collect();
        open.sort_by_key(|(id, _, _)| *id);
        open
    }
}

/// Create a periodic task that stops doing work once the cache is dropped.
fn periodic<S: Storage>(inner: &Arc<Inner<S>>, task: fn(&Inner<S>) -> Result<(), Error>) -> Tick {
    let inner = Arc::downgrade(inner);
    Box::new(move || match inner.upgrade() {
        Some(inner) => task(&inner),
        None => Ok(()),
    })
}

/// Write-back cache of dirty pages and owner of the files backing them.
pub struct WriteCache<S: Storage> {
    inner: Arc<Inner<S>>,
    flusher: Executor,
    checkpointer: Executor,
    low_disk: Arc<listener::Registry<dyn LowDiskSpaceListener>>,
    errors: Arc<listener::Registry<dyn BackgroundErrorListener>>,
    closed: AtomicBool,
}

impl<S: Storage> WriteCache<S> {
    /// Open the cache over `storage`, loading the name-id map and starting background work.
    ///
    /// Files recorded in the name-id map are known but closed until opened.
    pub fn new(
        storage: S,
        cfg: &Config,
        wal: Option<Arc<dyn WriteAheadLog>>,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        let page_size = cfg.page_size.get();
        assert!(
            page_size > page::PAYLOAD_OFFSET,
            "page size must exceed the page header"
        );
        let metrics = WriteMetrics::new(registry);

        let names = NameIdMap::open(&storage)?;
        let files = names
            .live_entries()
            .map(|(name, id)| (id, Arc::new(FileEntry::closed(name.into()))))
            .collect();

        let low_disk = Arc::new(listener::Registry::new());
        let errors = Arc::new(listener::Registry::new());
        let space = SpaceMonitor::new(
            cfg.name.clone(),
            cfg.free_space_limit,
            cfg.free_space_check_interval,
            low_disk.clone(),
            metrics.low_disk_space.clone(),
        );
        let exclusive = Arc::new(ExclusivePages::new(metrics.exclusive_pages.clone()));
        let inner = Arc::new(Inner {
            storage,
            page_size,
            files_lock: CacheLock::new(()),
            files: RwLock::new(files),
            names: Mutex::new(names),
            dirty: RwLock::new(BTreeMap::new()),
            exclusive,
            page_locks: LockManager::default(),
            cursor: Mutex::new(None),
            wal,
            write_pages: cfg.write_pages(),
            read_pages: cfg.read_pages(),
            read_resident: AtomicUsize::new(0),
            group_ttl: cfg.group_ttl,
            sync_on_flush: cfg.sync_on_flush,
            space,
            metrics,
        });

        let flusher = Executor::new(
            format!("{}-flush", cfg.name),
            cfg.flush_interval.map(|interval| {
                let tick = periodic(&inner, |inner| inner.flush_pass().map(|_| ()));
                (interval, tick)
            }),
            errors.clone(),
        )?;
        let checkpoint_interval = cfg
            .fuzzy_checkpoint_interval
            .filter(|_| inner.wal.is_some());
        let checkpointer = Executor::new(
            format!("{}-checkpoint", cfg.name),
            checkpoint_interval.map(|interval| (interval, periodic(&inner, Inner::fuzzy_checkpoint))),
            errors.clone(),
        )?;
        info!(
            files = inner.files.read().unwrap().len(),
            write_pages = inner.write_pages,
            "write cache opened"
        );

        Ok(Self {
            inner,
            flusher,
            checkpointer,
            low_disk,
            errors,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// The id that [WriteCache::add_file] would assign to `name`.
    pub fn book_file_id(&self, name: &str) -> u64 {
        let _files = self.inner.files_lock.read();
        self.inner.names.lock().unwrap().book(name)
    }

    /// Create a file and return its id.
    ///
    /// If a file with the same name was deleted before, its id is reused.
    pub fn add_file(&self, name: &str) -> Result<u64, Error> {
        self.ensure_open()?;
        let _files = self.inner.files_lock.write();
        let mut names = self.inner.names.lock().unwrap();
        if names.live(name).is_some() || self.inner.storage.exists(name)? {
            return Err(Error::FileExists(name.into()));
        }
        let file_id = names.book(name);
        self.inner.create_file(&mut names, name, file_id)?;
        Ok(file_id)
    }

    /// Create a file bound to a caller-chosen id.
    pub fn add_file_with_id(&self, name: &str, file_id: u64) -> Result<(), Error> {
        self.ensure_open()?;
        if file_id == 0 || i64::try_from(file_id).is_err() {
            return Err(Error::FileIdInvalid(file_id));
        }
        let _files = self.inner.files_lock.write();
        let mut names = self.inner.names.lock().unwrap();
        if let Some(existing) = names.live(name) {
            if existing == file_id {
                return Err(Error::FileExists(name.into()));
            }
            return Err(Error::FileIdMismatch {
                name: name.into(),
                existing,
                proposed: file_id,
            });
        }
        if let Some(entry) = self.inner.files.read().unwrap().get(&file_id) {
            return Err(Error::FileNameMismatch {
                id: file_id,
                existing: entry.name(),
                proposed: name.into(),
            });
        }
        if self.inner.storage.exists(name)? {
            return Err(Error::FileExists(name.into()));
        }
        names.observe(file_id);
        self.inner.create_file(&mut names, name, file_id)
    }

    /// Open a known file by name and return its id.
    pub fn open_file(&self, name: &str) -> Result<u64, Error> {
        self.ensure_open()?;
        let _files = self.inner.files_lock.write();
        let file_id = self
            .inner
            .names
            .lock()
            .unwrap()
            .live(name)
            .ok_or_else(|| Error::FileMissing(name.into()))?;
        self.inner.open_entry(file_id)?;
        Ok(file_id)
    }

    /// Open a known file by id.
    pub fn open_file_by_id(&self, file_id: u64) -> Result<(), Error> {
        self.ensure_open()?;
        let _files = self.inner.files_lock.write();
        self.inner.open_entry(file_id)
    }

    /// Open a known file, checking that it is bound to `file_id`.
    pub fn open_file_with_id(&self, name: &str, file_id: u64) -> Result<(), Error> {
        self.ensure_open()?;
        let _files = self.inner.files_lock.write();
        let existing = self
            .inner
            .names
            .lock()
            .unwrap()
            .live(name)
            .ok_or_else(|| Error::FileMissing(name.into()))?;
        if existing != file_id {
            return Err(Error::FileIdMismatch {
                name: name.into(),
                existing,
                proposed: file_id,
            });
        }
        self.inner.open_entry(file_id)
    }

    /// Returns true if `name` is bound to a live id or exists in storage.
    pub fn exists(&self, name: &str) -> Result<bool, Error> {
        let _files = self.inner.files_lock.read();
        if self.inner.names.lock().unwrap().live(name).is_some() {
            return Ok(true);
        }
        self.inner.storage.exists(name)
    }

    /// Returns true if `file_id` is known and its file exists in storage.
    pub fn exists_id(&self, file_id: u64) -> Result<bool, Error> {
        let _files = self.inner.files_lock.read();
        match self.inner.entry(file_id) {
            Ok(entry) => self.inner.storage.exists(&entry.name()),
            Err(_) => Ok(false),
        }
    }

    pub fn is_open(&self, file_id: u64) -> bool {
        self.inner
            .entry(file_id)
            .is_ok_and(|entry| entry.handle().is_some())
    }

    pub fn file_id(&self, name: &str) -> Option<u64> {
        self.inner.names.lock().unwrap().live(name)
    }

    pub fn file_name(&self, file_id: u64) -> Option<String> {
        self.inner.entry(file_id).ok().map(|entry| entry.name())
    }

    pub(crate) fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Live files, ordered by id.
    pub fn files(&self) -> Vec<(u64, String)> {
        let files = self.inner.files.read().unwrap();
        let mut files: Vec<_> = files
            .iter()
            .map(|(id, entry)| (*id, entry.name()))
            .collect();
        files.sort();
        files
    }

    /// Number of pages in a file, including allocated pages that were not written yet.
    pub fn filled_up_to(&self, file_id: u64) -> Result<u64, Error> {
        let entry = self.inner.entry(file_id)?;
        if entry.handle().is_none() {
            return Err(Error::FileClosed(file_id));
        }
        Ok(entry.filled.load(Ordering::Acquire))
    }

    /// Record that `pointer` holds the latest content of the page at `key`.
    ///
    /// If the page is already dirty its recency is refreshed. When more pages than the write budget
    /// are only referenced by this cache, a flush pass is scheduled and its acknowledgement is
    /// returned.
    pub fn store(&self, key: PageKey, pointer: &Arc<CachePointer>) -> Result<Option<FlushAck>, Error> {
        {
            let _files = self.inner.files_lock.read();
            let _page = self.inner.page_locks.exclusive(&key);
            let mut dirty = self.inner.dirty.write().unwrap();
            match dirty.get(&key) {
                Some(group) => {
                    group.recency.store(true, Ordering::Release);
                    let mut current = group.pointer.lock().unwrap();
                    if !Arc::ptr_eq(&current, pointer) {
                        pointer.increment_writers();
                        current.decrement_writers();
                        *current = pointer.clone();
                    }
                }
                None => {
                    pointer.increment_writers();
                    dirty.insert(key, Arc::new(PageGroup::new(pointer.clone(), false)));
                    self.inner.dirty_changed(dirty.len());
                }
            }
        }

        if self.inner.exclusive.len() <= self.inner.write_pages {
            return Ok(None);
        }
        let inner = self.inner.clone();
        let ack = self
            .flusher
            .submit(move || inner.flush_pass().map(|_| ()))?;
        Ok(Some(ack))
    }

    /// Return the content of the page at `key` with a reader reference taken on behalf of the
    /// caller.
    ///
    /// Dirty content is returned if present. Pages past the end of the file are reported as `None`
    /// unless `add_new_pages` is set, in which case the file is extended through `key` and every
    /// appended page is zeroed and kept dirty until it is written.
    pub fn load(&self, key: PageKey, add_new_pages: bool) -> Result<Option<Arc<CachePointer>>, Error> {
        let _files = self.inner.files_lock.read();
        let entry = self.inner.entry(key.file_id)?;
        let handle = entry.handle().ok_or(Error::FileClosed(key.file_id))?;
        if add_new_pages {
            self.inner.allocate(&entry, key)?;
        }
        let _page = self.inner.page_locks.shared(&key);

        let group = self.inner.dirty.read().unwrap().get(&key).cloned();
        if let Some(group) = group {
            let pointer = group.pointer();
            pointer.increment_readers();
            return Ok(Some(pointer));
        }

        if key.page_index >= entry.filled.load(Ordering::Acquire) {
            return Ok(None);
        }
        let page_size = self.inner.page_size;
        let listener: Arc<dyn WritersListener> = self.inner.exclusive.clone();
        let lsn = self.inner.wal.as_ref().and_then(|wal| wal.flushed_lsn());
        let pointer = CachePointer::new(key, page_size, lsn, Some(listener));
        let offset = key
            .page_index
            .checked_mul(page_size as u64)
            .ok_or(Error::OffsetOverflow)?;
        if offset + page_size as u64 <= entry.physical.load(Ordering::Acquire) {
            pointer.write(|buf| handle.read_at(buf, offset))?;
        }
        pointer.increment_readers();
        Ok(Some(Arc::new(pointer)))
    }

    /// Write every dirty page of a file and sync it.
    pub fn flush(&self, file_id: u64) -> Result<(), Error> {
        self.inner.entry(file_id)?;
        let inner = self.inner.clone();
        self.flusher.run(move || inner.flush_file(file_id))
    }

    /// Write every dirty page and sync every open file.
    pub fn flush_all(&self) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.flusher.run(move || inner.flush_all())
    }

    /// Drop the dirty pages of a file and shrink it to zero.
    pub fn truncate_file(&self, file_id: u64) -> Result<(), Error> {
        let _files = self.inner.files_lock.write();
        let entry = self.inner.entry(file_id)?;
        let handle = entry.handle().ok_or(Error::FileClosed(file_id))?;
        self.remove_pages(file_id)?;
        handle.resize(0)?;
        entry.reset();
        debug!(file_id, "file truncated");
        Ok(())
    }

    /// Close a file, writing its dirty pages first if `flush` is set (and dropping them otherwise).
    pub fn close_file(&self, file_id: u64, flush: bool) -> Result<(), Error> {
        let _files = self.inner.files_lock.write();
        let entry = self.inner.entry(file_id)?;
        if entry.handle().is_none() {
            return Ok(());
        }
        if flush {
            let inner = self.inner.clone();
            self.flusher.run(move || inner.flush_file(file_id))?;
        } else {
            self.remove_pages(file_id)?;
        }
        entry.detach();
        debug!(file_id, flush, "file closed");
        Ok(())
    }

    /// Remove a file and its dirty pages, keeping its id reserved for its name.
    pub fn delete_file(&self, file_id: u64) -> Result<(), Error> {
        let _files = self.inner.files_lock.write();
        let entry = self.inner.entry(file_id)?;
        if let Some(handle) = entry.handle() {
            self.remove_pages(file_id)?;
            handle.resize(0)?;
            entry.detach();
        }
        let name = entry.name();
        match self.inner.storage.remove(&name) {
            Ok(()) | Err(Error::FileMissing(_)) => {}
            Err(err) => return Err(err),
        }
        self.inner.files.write().unwrap().remove(&file_id);
        self.inner
            .names
            .lock()
            .unwrap()
            .insert(&name, -(file_id as i64))?;
        debug!(name, file_id, "file deleted");
        Ok(())
    }

    /// Rename the file bound to `file_id` from `old` to `new`.
    pub fn rename_file(&self, file_id: u64, old: &str, new: &str) -> Result<(), Error> {
        let _files = self.inner.files_lock.write();
        let entry = self.inner.entry(file_id)?;
        let current = entry.name();
        if current != old {
            return Err(Error::FileNameMismatch {
                id: file_id,
                existing: current,
                proposed: old.into(),
            });
        }
        let mut names = self.inner.names.lock().unwrap();
        if names.live(new).is_some() {
            return Err(Error::FileExists(new.into()));
        }
        self.inner.storage.rename(old, new)?;
        *entry.name.lock().unwrap() = new.into();
        names.insert(old, 0)?;
        names.insert(new, file_id as i64)?;
        debug!(old, new, file_id, "file renamed");
        Ok(())
    }

    fn remove_pages(&self, file_id: u64) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.flusher.run(move || {
            inner.remove_file_pages(file_id);
            Ok(())
        })
    }

    /// Flush everything, stop background work, close every file and compact the name-id map.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush_all()?;
        self.closed.store(true, Ordering::Release);
        self.flusher.shutdown();
        self.checkpointer.shutdown();

        let _files = self.inner.files_lock.write();
        for (_, entry, handle) in self.inner.open_files() {
            handle.sync()?;
            entry.detach();
        }
        self.inner
            .names
            .lock()
            .unwrap()
            .compact(&self.inner.storage)?;
        info!("write cache closed");
        Ok(())
    }

    /// Stop background work and remove every file, including the name-id map.
    pub fn delete(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        self.flusher.shutdown();
        self.checkpointer.shutdown();

        let _files = self.inner.files_lock.write();
        let entries: Vec<_> = self.inner.files.write().unwrap().drain().collect();
        for (file_id, entry) in entries {
            self.inner.remove_file_pages(file_id);
            entry.detach();
            match self.inner.storage.remove(&entry.name()) {
                Ok(()) | Err(Error::FileMissing(_)) => {}
                Err(err) => return Err(err),
            }
        }
        for name in [names::NAME_ID_MAP, names::NAME_ID_MAP_TEMP] {
            match self.inner.storage.remove(name) {
                Ok(()) | Err(Error::FileMissing(_)) => {}
                Err(err) => return Err(err),
            }
        }
        info!("write cache deleted");
        Ok(())
    }

    /// Run a fuzzy checkpoint now. Does nothing without a write-ahead log.
    pub fn make_fuzzy_checkpoint(&self) -> Result<(), Error> {
        let Some(wal) = &self.inner.wal else {
            return Ok(());
        };
        wal.flush()?;
        let inner = self.inner.clone();
        self.checkpointer.run(move || inner.fuzzy_checkpoint())
    }

    /// Check free space now, notifying listeners if it is low. Returns true if it is.
    pub fn check_low_disk_space(&self) -> Result<bool, Error> {
        self.inner.space.check(&self.inner.storage)
    }

    /// Flush everything, then verify the magic number and checksum of every page of every open
    /// file.
    pub fn check_stored_pages(&self) -> Result<Vec<VerificationError>, Error> {
        self.flush_all()?;
        Ok(self.inner.verify())
    }

    pub fn add_low_disk_space_listener(&self, listener: Arc<dyn LowDiskSpaceListener>) -> Handle {
        self.low_disk.register(listener)
    }

    pub fn remove_low_disk_space_listener(&self, handle: Handle) -> bool {
        self.low_disk.unregister(handle)
    }

    pub fn add_background_error_listener(
        &self,
        listener: Arc<dyn BackgroundErrorListener>,
    ) -> Handle {
        self.errors.register(listener)
    }

    pub fn remove_background_error_listener(&self, handle: Handle) -> bool {
        self.errors.unregister(handle)
    }

    pub fn dirty_pages(&self) -> usize {
        self.inner.dirty.read().unwrap().len()
    }

    pub fn exclusive_pages(&self) -> usize {
        self.inner.exclusive.len()
    }

    pub fn write_cache_bytes(&self) -> usize {
        self.dirty_pages() * page::buffer_size(self.inner.page_size)
    }

    /// Run one background flush pass now and return the number of pages written.
    pub fn flush_pass(&self) -> Result<usize, Error> {
        let inner = self.inner.clone();
        self.flusher.run(move || inner.flush_pass())
    }

    /// Report the number of pages resident in the read cache (used to size flush passes).
    pub(crate) fn set_read_resident(&self, pages: usize) {
        self.inner.read_resident.store(pages, Ordering::Relaxed);
    }

    pub(crate) fn metrics(&self) -> &WriteMetrics {
        &self.inner.metrics
    }
}

/// Wait for the acknowledgement returned by [WriteCache::store].
pub fn wait(ack: FlushAck) -> Result<(), Error> {
    executor::wait(ack)
}

#[cfg(test)]
mod tests {
    use super::{
        flush::{MAX_REGIONS_PER_FLUSH, MIN_PAGES_PER_FLUSH},
        *,
    };
    use crate::{
        storage::memory::Storage as MemoryStorage,
        wal::{mocks::MemoryLog, Lsn},
    };
    use commonware_macros::test_traced;
    use std::{num::NonZeroUsize, thread};

    const PAGE_SIZE: usize = 128;

    fn config() -> Config {
        let mut cfg = Config::new("test");
        cfg.page_size = NonZeroUsize::new(PAGE_SIZE).unwrap();
        cfg.write_cache_size = 64 * page::buffer_size(PAGE_SIZE);
        cfg.read_cache_size = 64 * page::buffer_size(PAGE_SIZE);
        cfg.flush_interval = None;
        cfg.fuzzy_checkpoint_interval = None;
        cfg.group_ttl = Duration::ZERO;
        cfg
    }

    fn open(
        storage: &MemoryStorage,
        cfg: &Config,
        wal: Option<Arc<MemoryLog>>,
    ) -> WriteCache<MemoryStorage> {
        let wal = wal.map(|wal| wal as Arc<dyn WriteAheadLog>);
        WriteCache::new(storage.clone(), cfg, wal, &mut Registry::default()).unwrap()
    }

    /// Load (allocating) a page, fill its payload with `byte`, store it and drop the reader.
    fn write_page(cache: &WriteCache<MemoryStorage>, key: PageKey, byte: u8, lsn: Option<Lsn>) {
        let pointer = cache.load(key, true).unwrap().unwrap();
        pointer.write(|page| {
            page[page::PAYLOAD_OFFSET..].fill(byte);
            if let Some(lsn) = lsn {
                page::set_lsn(page, lsn);
            }
        });
        cache.store(key, &pointer).unwrap();
        pointer.decrement_readers();
    }

    fn payload(cache: &WriteCache<MemoryStorage>, key: PageKey) -> Option<u8> {
        let pointer = cache.load(key, false).unwrap()?;
        let byte = pointer.read(|page| page[page::PAYLOAD_OFFSET]);
        pointer.decrement_readers();
        Some(byte)
    }

    #[test_traced]
    fn test_file_lifecycle() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        assert_eq!(cache.book_file_id("a"), 1);
        let a = cache.add_file("a").unwrap();
        let b = cache.add_file("b").unwrap();
        assert_eq!((a, b), (1, 2));
        assert!(matches!(cache.add_file("a"), Err(Error::FileExists(_))));
        assert!(cache.exists("a").unwrap());
        assert!(cache.exists_id(b).unwrap());
        assert!(cache.is_open(a));
        assert_eq!(cache.file_id("b"), Some(b));
        assert_eq!(cache.file_name(a).as_deref(), Some("a"));

        // Deleting tombstones the id, re-adding reuses it.
        cache.delete_file(a).unwrap();
        assert!(!cache.exists("a").unwrap());
        assert!(!cache.exists_id(a).unwrap());
        assert_eq!(cache.book_file_id("a"), a);
        assert_eq!(cache.book_file_id("c"), 3);
        assert_eq!(cache.add_file("a").unwrap(), a);

        // Rename keeps the id.
        cache.rename_file(b, "b", "renamed").unwrap();
        assert_eq!(cache.file_id("renamed"), Some(b));
        assert_eq!(cache.file_id("b"), None);
        assert!(storage.exists("renamed").unwrap());
        assert!(matches!(
            cache.rename_file(b, "b", "other"),
            Err(Error::FileNameMismatch { .. })
        ));
        cache.close().unwrap();

        // Bindings survive a restart, files start closed.
        let cache = open(&storage, &config(), None);
        assert_eq!(cache.files(), vec![(a, "a".into()), (b, "renamed".into())]);
        assert!(!cache.is_open(a));
        assert!(matches!(
            cache.load(PageKey::new(a, 0), false),
            Err(Error::FileClosed(_))
        ));
        assert_eq!(cache.open_file("renamed").unwrap(), b);
        cache.open_file_by_id(a).unwrap();
        assert!(cache.is_open(a));
        assert!(matches!(
            cache.open_file_with_id("a", b),
            Err(Error::FileIdMismatch { .. })
        ));
        assert!(matches!(cache.open_file("b"), Err(Error::FileMissing(_))));
        assert_eq!(cache.book_file_id("new"), 3);
    }

    #[test_traced]
    fn test_add_file_with_id() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        cache.add_file_with_id("x", 10).unwrap();
        assert!(matches!(
            cache.add_file_with_id("x", 10),
            Err(Error::FileExists(_))
        ));
        assert!(matches!(
            cache.add_file_with_id("x", 11),
            Err(Error::FileIdMismatch { existing: 10, .. })
        ));
        assert!(matches!(
            cache.add_file_with_id("y", 10),
            Err(Error::FileNameMismatch { id: 10, .. })
        ));
        assert!(matches!(
            cache.add_file_with_id("z", 0),
            Err(Error::FileIdInvalid(0))
        ));

        // Later ids never collide with chosen ones.
        assert_eq!(cache.add_file("y").unwrap(), 11);
    }

    #[test_traced]
    fn test_read_your_own_writes() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        assert_eq!(cache.filled_up_to(file).unwrap(), 0);
        assert!(cache.load(PageKey::new(file, 0), false).unwrap().is_none());

        write_page(&cache, PageKey::new(file, 0), 7, None);
        write_page(&cache, PageKey::new(file, 2), 9, None);
        assert_eq!(cache.filled_up_to(file).unwrap(), 3);

        // The page in between was appended too and is dirty until written.
        assert_eq!(cache.dirty_pages(), 3);
        assert_eq!(cache.exclusive_pages(), 3);
        assert_eq!(
            cache.write_cache_bytes(),
            3 * page::buffer_size(PAGE_SIZE)
        );

        // Nothing was written yet but dirty content is visible.
        assert_eq!(storage.writes("data"), 0);
        assert_eq!(payload(&cache, PageKey::new(file, 0)), Some(7));
        assert_eq!(payload(&cache, PageKey::new(file, 2)), Some(9));

        assert_eq!(payload(&cache, PageKey::new(file, 1)), Some(0));

        cache.flush(file).unwrap();
        assert_eq!(cache.dirty_pages(), 0);
        assert_eq!(cache.exclusive_pages(), 0);
        assert_eq!(storage.writes("data"), 3);
        assert_eq!(payload(&cache, PageKey::new(file, 2)), Some(9));
        assert_eq!(storage.reads("data"), 1);
    }

    #[test_traced]
    fn test_allocated_page_survives_reopen() {
        let storage = MemoryStorage::default();
        let cfg = config();
        let cache = open(&storage, &cfg, None);
        let file = cache.add_file("data").unwrap();

        // An appended page is dirty even if nobody writes to it.
        let pointer = cache.load(PageKey::new(file, 0), true).unwrap().unwrap();
        assert_eq!(pointer.writers(), 1);
        assert_eq!(cache.dirty_pages(), 1);
        assert_eq!(cache.exclusive_pages(), 0);
        pointer.decrement_readers();
        assert_eq!(cache.exclusive_pages(), 1);
        cache.close().unwrap();

        let cache = open(&storage, &cfg, None);
        cache.open_file("data").unwrap();
        assert_eq!(cache.filled_up_to(file).unwrap(), 1);
        assert_eq!(payload(&cache, PageKey::new(file, 0)), Some(0));
        assert!(cache.check_stored_pages().unwrap().is_empty());
    }

    #[test_traced]
    fn test_unmodified_allocated_page_is_sealed() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        let pointer = cache.load(PageKey::new(file, 0), true).unwrap().unwrap();
        pointer.decrement_readers();
        write_page(&cache, PageKey::new(file, 1), 4, None);

        assert!(cache.check_stored_pages().unwrap().is_empty());
        let contents = storage.contents("data").unwrap();
        assert_eq!(contents.len(), 2 * PAGE_SIZE);
        assert!(page::check(&contents[..PAGE_SIZE]).is_valid());
        assert_eq!(storage.writes("data"), 2);
    }

    #[test_traced]
    fn test_allocation_follows_written_pages() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        let bytes = PAGE_SIZE as i64;

        // Writing page 2 first appends pages 0 through 2.
        write_page(&cache, PageKey::new(file, 2), 9, None);
        assert_eq!(cache.dirty_pages(), 3);
        assert_eq!(cache.inner.space.allocated(), 3 * bytes);

        // Writing the last page extends the file past the others but only returns its own space.
        let key = PageKey::new(file, 2);
        let group = cache.inner.dirty.read().unwrap().get(&key).cloned().unwrap();
        assert!(cache.inner.flush_page(key, &group, true).unwrap());
        assert_eq!(storage.contents("data").unwrap().len(), 3 * PAGE_SIZE);
        assert_eq!(cache.inner.space.allocated(), 2 * bytes);

        cache.flush(file).unwrap();
        assert_eq!(cache.inner.space.allocated(), 0);

        // Overwriting a written page reserves nothing.
        write_page(&cache, PageKey::new(file, 0), 1, None);
        assert_eq!(cache.inner.space.allocated(), 0);

        // Dropped pages return their space too.
        write_page(&cache, PageKey::new(file, 4), 1, None);
        assert_eq!(cache.inner.space.allocated(), 2 * bytes);
        cache.truncate_file(file).unwrap();
        assert_eq!(cache.inner.space.allocated(), 0);
    }

    fn dirty_keys(cache: &WriteCache<MemoryStorage>) -> Vec<u64> {
        cache
            .inner
            .dirty
            .read()
            .unwrap()
            .keys()
            .map(|key| key.page_index)
            .collect()
    }

    fn cursor(cache: &WriteCache<MemoryStorage>) -> Option<PageKey> {
        *cache.inner.cursor.lock().unwrap()
    }

    #[test_traced]
    fn test_flush_pass_resumes_after_cursor() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        for index in 0..10 {
            write_page(&cache, PageKey::new(file, index), index as u8, None);
        }

        // An idle cache writes the minimum per pass, each pass continuing where the last stopped.
        assert_eq!(cache.flush_pass().unwrap(), MIN_PAGES_PER_FLUSH);
        assert_eq!(cursor(&cache), Some(PageKey::new(file, 3)));
        assert_eq!(dirty_keys(&cache), (4..10).collect::<Vec<_>>());
        assert_eq!(cache.flush_pass().unwrap(), MIN_PAGES_PER_FLUSH);
        assert_eq!(cursor(&cache), Some(PageKey::new(file, 7)));
        assert_eq!(cache.flush_pass().unwrap(), 2);
        assert_eq!(cursor(&cache), Some(PageKey::new(file, 9)));
        assert!(dirty_keys(&cache).is_empty());

        // Pages before the cursor are reached by wrapping around.
        write_page(&cache, PageKey::new(file, 0), 1, None);
        write_page(&cache, PageKey::new(file, 1), 1, None);
        assert_eq!(cache.flush_pass().unwrap(), 2);
        assert_eq!(cursor(&cache), Some(PageKey::new(file, 1)));
        assert_eq!(storage.writes("data"), 12);
    }

    #[test_traced]
    fn test_flush_pass_prefers_exclusive_pages() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        for index in 0..6 {
            write_page(&cache, PageKey::new(file, index), 1, None);
        }
        let readers: Vec<_> = (0..4)
            .map(|index| cache.load(PageKey::new(file, index), false).unwrap().unwrap())
            .collect();
        assert_eq!(cache.exclusive_pages(), 2);

        // Pages nobody reads go first, the rest of the pass takes dirty pages in order.
        assert_eq!(cache.flush_pass().unwrap(), MIN_PAGES_PER_FLUSH);
        assert_eq!(dirty_keys(&cache), vec![2, 3]);
        assert_eq!(cursor(&cache), Some(PageKey::new(file, 1)));
        for pointer in readers {
            pointer.decrement_readers();
        }
        assert_eq!(cache.exclusive_pages(), 2);
    }

    #[test_traced]
    fn test_flush_pass_stops_at_region_limit() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        for batch in [0..40, 40..80] {
            for index in batch {
                write_page(&cache, PageKey::new(file, index), 1, None);
            }
            cache.flush(file).unwrap();
        }
        assert_eq!(cursor(&cache), None);

        // Every other page is dirty, so each written page starts a new region.
        for index in (0..80).step_by(2) {
            write_page(&cache, PageKey::new(file, index), 2, None);
        }
        assert_eq!(cache.exclusive_pages(), 40);
        assert_eq!(cache.flush_pass().unwrap(), MAX_REGIONS_PER_FLUSH);
        assert_eq!(cache.dirty_pages(), 40 - MAX_REGIONS_PER_FLUSH);
        assert_eq!(cursor(&cache), Some(PageKey::new(file, 30)));
        assert_eq!(dirty_keys(&cache)[0], 32);
    }

    #[test_traced]
    fn test_flush_pass_defers_recent_pages() {
        let storage = MemoryStorage::default();
        let mut cfg = config();
        cfg.group_ttl = Duration::from_secs(3600);
        let cache = open(&storage, &cfg, None);
        let file = cache.add_file("data").unwrap();
        write_page(&cache, PageKey::new(file, 0), 1, None);
        write_page(&cache, PageKey::new(file, 1), 1, None);

        // Freshly stored pages are skipped once, then written by the next pass.
        assert_eq!(cache.flush_pass().unwrap(), 0);
        assert_eq!(cache.dirty_pages(), 2);

        // Storing a page again earns it another deferral.
        write_page(&cache, PageKey::new(file, 0), 2, None);
        assert_eq!(cache.flush_pass().unwrap(), 1);
        assert_eq!(dirty_keys(&cache), vec![0]);
        assert_eq!(cache.flush_pass().unwrap(), 1);
        assert_eq!(cache.dirty_pages(), 0);
        assert_eq!(payload(&cache, PageKey::new(file, 0)), Some(2));
    }

    #[test_traced]
    fn test_store_refreshes_dirty_page() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        let key = PageKey::new(file, 0);
        let pointer = cache.load(key, true).unwrap().unwrap();
        cache.store(key, &pointer).unwrap();
        assert_eq!(pointer.writers(), 1);

        // A second store of the same buffer takes no extra reference.
        cache.store(key, &pointer).unwrap();
        assert_eq!(pointer.writers(), 1);
        assert_eq!(cache.exclusive_pages(), 0);

        // Once the reader is gone, only the write cache references the page.
        pointer.decrement_readers();
        assert_eq!(cache.exclusive_pages(), 1);
        cache.flush_all().unwrap();
        assert!(pointer.is_released());
    }

    #[test_traced]
    fn test_wal_flushed_before_page() {
        let storage = MemoryStorage::default();
        let wal = Arc::new(MemoryLog::default());
        let cache = open(&storage, &config(), Some(wal.clone()));
        let file = cache.add_file("data").unwrap();
        let key = PageKey::new(file, 0);

        let lsn = wal.append(key, page::PAYLOAD_OFFSET, &[5]);
        write_page(&cache, key, 5, Some(lsn));
        assert_eq!(wal.flushed_lsn(), None);
        cache.flush(file).unwrap();
        assert!(wal.flushed_lsn().is_some_and(|flushed| flushed >= lsn));
        assert_eq!(wal.flushes(), 1);

        // A page whose record is already durable does not flush the log again.
        write_page(&cache, key, 6, Some(lsn));
        cache.flush(file).unwrap();
        assert_eq!(wal.flushes(), 1);

        // The pointer remembers what was flushed.
        let pointer = cache.load(key, false).unwrap().unwrap();
        assert_eq!(pointer.last_flushed_lsn(), wal.flushed_lsn());
        pointer.decrement_readers();
    }

    #[test_traced]
    fn test_flush_failure_keeps_page_dirty() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        write_page(&cache, PageKey::new(file, 0), 1, None);

        storage.fail_writes(true);
        assert!(matches!(cache.flush(file), Err(Error::WriteFailed)));
        assert_eq!(cache.dirty_pages(), 1);

        storage.fail_writes(false);
        cache.flush(file).unwrap();
        assert_eq!(cache.dirty_pages(), 0);
    }

    #[test_traced]
    fn test_truncate_and_close_file() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        write_page(&cache, PageKey::new(file, 0), 1, None);
        cache.flush(file).unwrap();
        write_page(&cache, PageKey::new(file, 1), 2, None);

        cache.truncate_file(file).unwrap();
        assert_eq!(cache.dirty_pages(), 0);
        assert_eq!(cache.filled_up_to(file).unwrap(), 0);
        assert_eq!(storage.contents("data").unwrap().len(), 0);

        // Closing without flushing drops dirty pages.
        write_page(&cache, PageKey::new(file, 0), 3, None);
        cache.close_file(file, false).unwrap();
        assert!(!cache.is_open(file));
        assert_eq!(cache.dirty_pages(), 0);
        assert!(matches!(cache.filled_up_to(file), Err(Error::FileClosed(_))));
        cache.open_file_by_id(file).unwrap();
        assert_eq!(cache.filled_up_to(file).unwrap(), 0);

        // Closing with a flush writes them.
        write_page(&cache, PageKey::new(file, 0), 4, None);
        cache.close_file(file, true).unwrap();
        cache.open_file_by_id(file).unwrap();
        assert_eq!(payload(&cache, PageKey::new(file, 0)), Some(4));
    }

    #[test_traced]
    fn test_close_persists_pages() {
        let storage = MemoryStorage::default();
        let cfg = config();
        let cache = open(&storage, &cfg, None);
        let file = cache.add_file("data").unwrap();
        for index in 0..8 {
            write_page(&cache, PageKey::new(file, index), index as u8 + 1, None);
        }
        cache.close().unwrap();
        assert!(matches!(cache.add_file("late"), Err(Error::Closed)));

        let cache = open(&storage, &cfg, None);
        assert_eq!(cache.open_file("data").unwrap(), file);
        assert_eq!(cache.filled_up_to(file).unwrap(), 8);
        for index in 0..8 {
            assert_eq!(
                payload(&cache, PageKey::new(file, index)),
                Some(index as u8 + 1)
            );
        }
        assert!(cache.check_stored_pages().unwrap().is_empty());
    }

    #[test_traced]
    fn test_drop_discards_dirty_pages() {
        let storage = MemoryStorage::default();
        let cfg = config();
        let cache = open(&storage, &cfg, None);
        let file = cache.add_file("data").unwrap();
        write_page(&cache, PageKey::new(file, 0), 1, None);
        drop(cache);

        let cache = open(&storage, &cfg, None);
        cache.open_file("data").unwrap();
        assert_eq!(cache.filled_up_to(file).unwrap(), 0);
    }

    #[test_traced]
    fn test_delete() {
        let storage = MemoryStorage::default();
        let cache = open(&storage, &config(), None);
        let file = cache.add_file("data").unwrap();
        write_page(&cache, PageKey::new(file, 0), 1, None);
        cache.delete().unwrap();
        assert!(!storage.exists("data").unwrap());
        assert!(!storage.exists(names::NAME_ID_MAP).unwrap());
        assert_eq!(cache.dirty_pages(), 0);
    }

    #[test_traced]
    fn test_store_over_budget_schedules_flush() {
        let storage = MemoryStorage::default();
        let mut cfg = config();
        cfg.write_cache_size = 4 * page::buffer_size(PAGE_SIZE);
        let cache = open(&storage, &cfg, None);
        let file = cache.add_file("data").unwrap();

        // Stores made while the budget holds schedule nothing.
        for index in 0..5 {
            write_page(&cache, PageKey::new(file, index), 1, None);
        }
        assert_eq!(cache.exclusive_pages(), 5);

        let key = PageKey::new(file, 5);
        let pointer = cache.load(key, true).unwrap().unwrap();
        let ack = cache.store(key, &pointer).unwrap();
        pointer.decrement_readers();
        wait(ack.expect("flush scheduled")).unwrap();
        assert_eq!(cache.dirty_pages(), 0);
        assert_eq!(cache.exclusive_pages(), 0);
        assert_eq!(storage.writes("data"), 6);
    }

    #[test_traced]
    fn test_low_disk_space() {
        let storage = MemoryStorage::default();
        let mut cfg = config();
        cfg.free_space_limit = 10 * PAGE_SIZE as u64;
        let cache = open(&storage, &cfg, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = cache.add_low_disk_space_listener(Arc::new({
            let seen = seen.clone();
            move |info: listener::LowDiskSpace| seen.lock().unwrap().push(info)
        }));
        let file = cache.add_file("data").unwrap();
        storage.set_free_space(12 * PAGE_SIZE as u64);
        for index in 0..4 {
            write_page(&cache, PageKey::new(file, index), 1, None);
        }
        assert!(cache.check_low_disk_space().unwrap());
        let start = Instant::now();
        while seen.lock().unwrap().is_empty() {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(seen.lock().unwrap()[0].free, 8 * PAGE_SIZE as i64);

        // Flushing returns the allocated space.
        cache.flush(file).unwrap();
        assert!(!cache.check_low_disk_space().unwrap());
        assert!(cache.remove_low_disk_space_listener(handle));
    }

    #[test_traced]
    fn test_background_errors_reported() {
        let storage = MemoryStorage::default();
        let mut cfg = config();
        cfg.flush_interval = Some(Duration::from_millis(1));
        let cache = open(&storage, &cfg, None);
        let errors = Arc::new(AtomicUsize::new(0));
        cache.add_background_error_listener(Arc::new({
            let errors = errors.clone();
            move |_: &Error| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let file = cache.add_file("data").unwrap();
        storage.fail_writes(true);
        write_page(&cache, PageKey::new(file, 0), 1, None);

        let start = Instant::now();
        while errors.load(Ordering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(10), "no error reported");
            thread::sleep(Duration::from_millis(1));
        }
        storage.fail_writes(false);
        while cache.dirty_pages() > 0 {
            assert!(start.elapsed() < Duration::from_secs(10), "page never flushed");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
