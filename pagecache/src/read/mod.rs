//! Hand out referenced pages and keep the most useful ones in memory.
//!
//! The [ReadCache] implements the [2Q](https://www.vldb.org/conf/1994/P439.PDF) replacement
//! policy over three [LruList]s:
//!
//! - `a1in` holds pages loaded once. Hits in `a1in` do not change their position, so a scan
//!   passes through it without disturbing hot pages.
//! - `a1out` remembers the keys (not the content) of pages evicted from `a1in`.
//! - `am` holds pages that were loaded again after being evicted from `a1in`.
//!
//! Pages are only evicted while no caller uses them and they carry no unsaved modification.
//! Pinned pages are kept aside and never evicted. They count against the cache size, so the 2Q
//! queues share what pinned pages leave, and they may take at most
//! [crate::Config::pinned_pages_percent] of it.
//!
//! The cache can be resized while in use ([ReadCache::change_maximum_amount_of_memory]) and, with
//! [crate::Config::keep_cache_state], the keys of its queues survive a restart (see [state]).
//!
//! # Usage
//!
//! Every successful [ReadCache::load] (or [ReadCache::allocate_new_page]) must be paired with a
//! [ReadCache::release]. Pages modified through [CacheEntry::write] are handed to the
//! [WriteCache] when their last user releases them.

use crate::{
    key::PageKey,
    lock::{CacheLock, LockManager},
    lru::{Entry as _, LruList},
    metrics::ReadMetrics,
    page,
    storage::Storage,
    write::{self, WriteCache},
    Config, Error,
};
use prometheus_client::registry::Registry;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, info, trace, warn};

mod entry;
pub use entry::CacheEntry;
pub mod state;

/// Most candidates examined by an eviction pass that runs alongside other operations.
const MAX_EVICTION_ITERATIONS: usize = 1000;

/// Upper bound of [crate::Config::pinned_pages_percent].
pub const MAX_PINNED_PAGES_PERCENT: usize = 50;

type List = Box<dyn LruList<Arc<CacheEntry>>>;

/// Read side of the page cache.
pub struct ReadCache<S: Storage> {
    write: Arc<WriteCache<S>>,
    page_size: usize,

    // Read side for page operations, write side for file lifecycle changes and forced eviction.
    cache_lock: CacheLock,
    file_locks: LockManager<u64>,
    page_locks: LockManager<PageKey>,

    am: List,
    a1in: List,
    a1out: List,
    pinned: Mutex<HashMap<PageKey, Arc<CacheEntry>>>,
    pinned_count: AtomicUsize,

    // Indexes of the pages of each file present in any queue (ghosts included) or pinned.
    file_pages: Mutex<HashMap<u64, BTreeSet<u64>>>,

    evicting: AtomicBool,

    // Changes only under the cache lock held exclusively.
    max_size: AtomicUsize,
    min_size: usize,
    pinned_percent: usize,
    overflow: usize,
    keep_state: bool,

    metrics: ReadMetrics,
}

impl<S: Storage> ReadCache<S> {
    pub fn new(write: Arc<WriteCache<S>>, cfg: &Config, registry: &mut Registry) -> Self {
        assert!(
            cfg.pinned_pages_percent <= MAX_PINNED_PAGES_PERCENT,
            "pinned pages may take at most {MAX_PINNED_PAGES_PERCENT}% of the cache"
        );
        let min_size = cfg.min_cache_pages.max(1);
        let max_size = cfg.read_pages().max(min_size);
        debug!(max_size, lru = ?cfg.lru, "read cache opened");
        Self {
            write,
            page_size: cfg.page_size.get(),
            cache_lock: CacheLock::new(()),
            file_locks: LockManager::default(),
            page_locks: LockManager::default(),
            am: cfg.lru.build(),
            a1in: cfg.lru.build(),
            a1out: cfg.lru.build(),
            pinned: Mutex::new(HashMap::new()),
            pinned_count: AtomicUsize::new(0),
            file_pages: Mutex::new(HashMap::new()),
            evicting: AtomicBool::new(false),
            max_size: AtomicUsize::new(max_size),
            min_size,
            pinned_percent: cfg.pinned_pages_percent,
            overflow: cfg.cache_overflow,
            keep_state: cfg.keep_cache_state,
            metrics: ReadMetrics::new(registry),
        }
    }

    pub fn write_cache(&self) -> &Arc<WriteCache<S>> {
        &self.write
    }

    /// Number of pages the cache holds before evicting, pinned pages included.
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    /// Number of pages the 2Q queues hold before evicting.
    pub fn two_queue_size(&self) -> usize {
        self.max_size()
            .saturating_sub(self.pinned_count.load(Ordering::Acquire))
    }

    /// Size of the probationary queue above which it is evicted from first.
    pub fn k_in(&self) -> usize {
        self.two_queue_size() / 4
    }

    /// Number of evicted keys remembered.
    pub fn k_out(&self) -> usize {
        self.two_queue_size() / 2
    }

    pub fn am_pages(&self) -> usize {
        self.am.len()
    }

    pub fn a1in_pages(&self) -> usize {
        self.a1in.len()
    }

    pub fn a1out_pages(&self) -> usize {
        self.a1out.len()
    }

    pub fn pinned_pages(&self) -> usize {
        self.pinned.lock().unwrap().len()
    }

    pub fn hits(&self) -> u64 {
        self.metrics.hits.get()
    }

    pub fn misses(&self) -> u64 {
        self.metrics.misses.get()
    }

    /// Memory held by resident (not pinned) pages.
    pub fn used_memory(&self) -> usize {
        (self.am.len() + self.a1in.len()) * page::buffer_size(self.page_size)
    }

    /// Returns true if `key` is resident in `am`.
    pub fn in_am(&self, key: &PageKey) -> bool {
        self.am.contains(key)
    }

    /// Returns true if `key` is resident in `a1in`.
    pub fn in_a1in(&self, key: &PageKey) -> bool {
        self.a1in.contains(key)
    }

    /// Returns true if `key` is remembered in `a1out`.
    pub fn in_a1out(&self, key: &PageKey) -> bool {
        self.a1out.contains(key)
    }

    fn update_gauges(&self) {
        let am = self.am.len();
        let a1in = self.a1in.len();
        self.metrics.am_pages.set(am as i64);
        self.metrics.a1in_pages.set(a1in as i64);
        self.metrics.a1out_pages.set(self.a1out.len() as i64);
        self.metrics
            .pinned_pages
            .set(self.pinned.lock().unwrap().len() as i64);
        self.write.set_read_resident(am + a1in);
    }

    /// Load a page and take a usage on it.
    ///
    /// Returns `None` if the page is past the end of its file. If `check_pinned` is set, pinned
    /// pages are looked up first.
    pub fn load(
        &self,
        file_id: u64,
        page_index: u64,
        check_pinned: bool,
    ) -> Result<Option<Arc<CacheEntry>>, Error> {
        let key = PageKey::new(file_id, page_index);
        let loaded = {
            let _cache = self.cache_lock.read();
            let _file = self.file_locks.shared(&file_id);
            self.do_load(key, check_pinned, false)?
        };
        let Some((entry, evict)) = loaded else {
            return Ok(None);
        };
        self.after_load(entry, evict).map(Some)
    }

    /// Append a zeroed page to a file and take a usage on it.
    pub fn allocate_new_page(&self, file_id: u64) -> Result<Arc<CacheEntry>, Error> {
        let (entry, evict) = {
            let _cache = self.cache_lock.read();
            let _file = self.file_locks.exclusive(&file_id);
            let key = PageKey::new(file_id, self.write.filled_up_to(file_id)?);
            self.do_load(key, false, true)?
                .ok_or(Error::PageMissing(key))?
        };
        self.after_load(entry, evict)
    }

    fn after_load(&self, entry: Arc<CacheEntry>, evict: bool) -> Result<Arc<CacheEntry>, Error> {
        if evict {
            if let Err(err) = self.remove_coldest_pages_if_needed() {
                self.release(&entry)?;
                self.update_gauges();
                return Err(err);
            }
        }
        self.update_gauges();
        Ok(entry)
    }

    /// Find or fetch the page at `key`, returning it with a usage taken and whether eviction
    /// should run. The caller holds the cache lock and the lock of the file.
    fn do_load(
        &self,
        key: PageKey,
        check_pinned: bool,
        add_new_pages: bool,
    ) -> Result<Option<(Arc<CacheEntry>, bool)>, Error> {
        let _page = self.page_locks.exclusive(&key);
        if check_pinned {
            let pinned = self.pinned.lock().unwrap().get(&key).cloned();
            if let Some(entry) = pinned {
                entry.acquire();
                self.metrics.hits.inc();
                return Ok(Some((entry, false)));
            }
        }

        let (entry, evict) = if let Some(entry) = self.am.get(&key) {
            self.am.put_to_mru(entry.clone());
            self.metrics.hits.inc();
            (entry, false)
        } else if let Some(entry) = self.a1out.remove(&key) {
            // Seen before: the page goes straight to the hot queue.
            let pointer = match self.write.load(key, false) {
                Ok(Some(pointer)) => pointer,
                Ok(None) => {
                    self.forget(key);
                    return Ok(None);
                }
                Err(err) => {
                    self.forget(key);
                    return Err(err);
                }
            };
            entry.attach(pointer);
            self.am.put_to_mru(entry.clone());
            self.metrics.misses.inc();
            trace!(file_id = key.file_id, page_index = key.page_index, "ghost promoted");
            (entry, true)
        } else if let Some(entry) = self.a1in.get(&key) {
            self.metrics.hits.inc();
            (entry, false)
        } else {
            let Some(pointer) = self.write.load(key, add_new_pages)? else {
                return Ok(None);
            };
            let entry = Arc::new(CacheEntry::new(key, Some(pointer)));
            self.a1in.put_to_mru(entry.clone());
            self.track(key);
            self.metrics.misses.inc();
            (entry, true)
        };
        entry.acquire();
        Ok(Some((entry, evict)))
    }

    /// Drop a usage. If it was the last one and the page was modified, hand it to the write cache
    /// and wait for the flush that the write cache may schedule in response.
    pub fn release(&self, entry: &Arc<CacheEntry>) -> Result<(), Error> {
        let key = entry.key();
        let ack = {
            let _cache = self.cache_lock.read();
            let _file = self.file_locks.shared(&key.file_id);
            let _page = self.page_locks.exclusive(&key);
            if entry.release() == 0 && entry.is_dirty() {
                let pointer = entry.pointer().ok_or(Error::PageMissing(key))?;
                let ack = self.write.store(key, &pointer)?;
                entry.clear_dirty();
                ack
            } else {
                None
            }
        };
        if let Some(ack) = ack {
            write::wait(ack)?;
        }
        Ok(())
    }

    /// Move a loaded page out of the queues so that it is never evicted.
    ///
    /// Returns false (leaving the page in its queue) if pinning it would take pinned pages past
    /// their share of the cache.
    pub fn pin_page(&self, entry: &Arc<CacheEntry>) -> Result<bool, Error> {
        let key = entry.key();
        if self.pinned.lock().unwrap().contains_key(&key) {
            return Ok(true);
        }
        let max_size = self.max_size();
        let pinned = self.pinned_count.load(Ordering::Acquire);
        if 100 * (pinned + 1) / max_size > self.pinned_percent {
            warn!(
                file_id = key.file_id,
                page_index = key.page_index,
                pinned,
                max_size,
                limit = self.pinned_percent,
                "pinned page limit reached, page left unpinned"
            );
            return Ok(false);
        }
        {
            let _cache = self.cache_lock.read();
            let _file = self.file_locks.shared(&key.file_id);
            let _page = self.page_locks.exclusive(&key);
            if self.am.remove(&key).is_none() {
                self.a1in.remove(&key);
            }
            if self.pinned.lock().unwrap().insert(key, entry.clone()).is_none() {
                self.pinned_count.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.update_gauges();
        self.remove_coldest_pages_if_needed()?;
        self.update_gauges();
        Ok(true)
    }

    /// Set the cache size to `bytes` worth of pages (but no fewer than the minimum number of
    /// pages), evicting if the cache shrinks.
    ///
    /// Fails if pinned pages would take more than their share of the new size.
    pub fn change_maximum_amount_of_memory(&self, bytes: usize) -> Result<(), Error> {
        let pages = (bytes / page::buffer_size(self.page_size)).max(self.min_size);
        let previous = {
            let _cache = self.cache_lock.write();
            let previous = self.max_size();
            if previous == pages {
                return Ok(());
            }
            let pinned = self.pinned_count.load(Ordering::Acquire);
            if 100 * pinned / pages > self.pinned_percent {
                return Err(Error::PinnedPagesLimit { pinned, pages });
            }
            self.max_size.store(pages, Ordering::Release);
            previous
        };
        if pages < previous {
            self.remove_coldest_pages_if_needed()?;
            let _cache = self.cache_lock.read();
            self.trim_ghosts();
        }
        self.update_gauges();
        info!(previous, pages, "read cache resized");
        Ok(())
    }

    fn track(&self, key: PageKey) {
        self.file_pages
            .lock()
            .unwrap()
            .entry(key.file_id)
            .or_default()
            .insert(key.page_index);
    }

    fn forget(&self, key: PageKey) {
        let mut file_pages = self.file_pages.lock().unwrap();
        if let Some(pages) = file_pages.get_mut(&key.file_id) {
            pages.remove(&key.page_index);
            if pages.is_empty() {
                file_pages.remove(&key.file_id);
            }
        }
    }

    /// Evict pages until the cache fits its size, unless another thread is already doing so.
    fn remove_coldest_pages_if_needed(&self) -> Result<(), Error> {
        if self
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let resident = self.am.len() + self.a1in.len();
        let result = if resident > self.two_queue_size() + self.overflow {
            let _cache = self.cache_lock.write();
            self.remove_cold_pages_exclusive()
        } else {
            let _cache = self.cache_lock.read();
            self.remove_cold_pages_shared()
        };
        self.evicting.store(false, Ordering::Release);
        result
    }

    /// Evict while holding the cache lock exclusively (no page is being loaded or released).
    fn remove_cold_pages_exclusive(&self) -> Result<(), Error> {
        while self.am.len() + self.a1in.len() > self.two_queue_size() {
            if self.a1in.len() > self.k_in() {
                let entry = self.a1in.remove_lru().ok_or(Error::AllCacheEntriesInUse)?;
                entry.detach();
                self.a1out.put_to_mru(entry);
                self.metrics.evictions.inc();
                while self.a1out.len() > self.k_out() {
                    let Some(ghost) = self.a1out.remove_lru() else {
                        break;
                    };
                    self.forget(ghost.key());
                }
            } else {
                let entry = self.am.remove_lru().ok_or(Error::AllCacheEntriesInUse)?;
                entry.detach();
                self.forget(entry.key());
                self.metrics.evictions.inc();
            }
        }
        Ok(())
    }

    /// Evict while other threads load and release pages, locking each candidate before removing
    /// it.
    fn remove_cold_pages_shared(&self) -> Result<(), Error> {
        let mut iterations = 0;
        while self.am.len() + self.a1in.len() > self.two_queue_size() {
            if iterations >= MAX_EVICTION_ITERATIONS {
                debug!(iterations, "eviction pass ended early");
                break;
            }
            iterations += 1;

            if self.a1in.len() > self.k_in() {
                let candidate = self.a1in.get_lru().ok_or(Error::AllCacheEntriesInUse)?;
                if self.evict_candidate(&*self.a1in, &candidate, true) {
                    self.trim_ghosts();
                }
            } else {
                let candidate = self.am.get_lru().ok_or(Error::AllCacheEntriesInUse)?;
                self.evict_candidate(&*self.am, &candidate, false);
            }
        }
        Ok(())
    }

    /// Remove `candidate` from `list` if it is still there and unused. Returns true if it was
    /// evicted.
    fn evict_candidate(
        &self,
        list: &dyn LruList<Arc<CacheEntry>>,
        candidate: &Arc<CacheEntry>,
        remember: bool,
    ) -> bool {
        let key = candidate.key();
        let _file = self.file_locks.shared(&key.file_id);
        let _page = self.page_locks.exclusive(&key);
        let present = list
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(&current, candidate));
        if !present || candidate.in_use() {
            return false;
        }
        list.remove(&key);
        candidate.detach();
        if remember {
            self.a1out.put_to_mru(candidate.clone());
        } else {
            self.forget(key);
        }
        self.metrics.evictions.inc();
        true
    }

    fn trim_ghosts(&self) {
        while self.a1out.len() > self.k_out() {
            let Some(ghost) = self.a1out.get_lru() else {
                return;
            };
            let key = ghost.key();
            let _file = self.file_locks.shared(&key.file_id);
            let _page = self.page_locks.exclusive(&key);
            let present = self
                .a1out
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(&current, &ghost));
            if present {
                self.a1out.remove(&key);
                self.forget(key);
            }
        }
    }

    fn lookup(&self, key: &PageKey) -> Option<Arc<CacheEntry>> {
        self.pinned
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .or_else(|| self.am.get(key))
            .or_else(|| self.a1in.get(key))
            .or_else(|| self.a1out.get(key))
    }

    fn remove_entry(&self, key: &PageKey) {
        if self.pinned.lock().unwrap().remove(key).is_some() {
            self.pinned_count.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        if self.am.remove(key).is_none() && self.a1in.remove(key).is_none() {
            self.a1out.remove(key);
        }
    }

    /// Drop every page of a file. The caller holds the lock of the file exclusively.
    fn clear_file(&self, file_id: u64) -> Result<(), Error> {
        let pages: Vec<u64> = self
            .file_pages
            .lock()
            .unwrap()
            .get(&file_id)
            .map(|pages| pages.iter().copied().collect())
            .unwrap_or_default();
        let mut entries = Vec::with_capacity(pages.len());
        for page_index in pages {
            let key = PageKey::new(file_id, page_index);
            if let Some(entry) = self.lookup(&key) {
                if entry.in_use() {
                    return Err(Error::PageInUse(key));
                }
                entries.push(entry);
            }
        }
        for entry in &entries {
            self.remove_entry(&entry.key());
            entry.detach();
        }
        self.file_pages.lock().unwrap().remove(&file_id);
        self.update_gauges();
        debug!(file_id, pages = entries.len(), "file pages cleared");
        Ok(())
    }

    /// Drop every page. The caller holds the cache lock exclusively.
    fn clear_content(&self) -> Result<(), Error> {
        let pinned: Vec<_> = self.pinned.lock().unwrap().values().cloned().collect();
        let resident = pinned
            .into_iter()
            .chain(self.am.iter())
            .chain(self.a1in.iter())
            .collect::<Vec<_>>();
        if let Some(entry) = resident.iter().find(|entry| entry.in_use()) {
            return Err(Error::PageInUse(entry.key()));
        }
        for entry in &resident {
            entry.detach();
        }
        self.pinned.lock().unwrap().clear();
        self.pinned_count.store(0, Ordering::Release);
        self.am.clear();
        self.a1in.clear();
        self.a1out.clear();
        self.file_pages.lock().unwrap().clear();
        self.update_gauges();
        Ok(())
    }

    /// Drop every page, failing if any page is in use.
    pub fn clear(&self) -> Result<(), Error> {
        let _cache = self.cache_lock.write();
        self.clear_content()
    }

    pub fn add_file(&self, name: &str) -> Result<u64, Error> {
        let _cache = self.cache_lock.write();
        self.write.add_file(name)
    }

    pub fn add_file_with_id(&self, name: &str, file_id: u64) -> Result<(), Error> {
        let _cache = self.cache_lock.write();
        self.write.add_file_with_id(name, file_id)
    }

    pub fn open_file(&self, name: &str) -> Result<u64, Error> {
        let _cache = self.cache_lock.write();
        self.write.open_file(name)
    }

    pub fn open_file_by_id(&self, file_id: u64) -> Result<(), Error> {
        let _cache = self.cache_lock.read();
        let _file = self.file_locks.exclusive(&file_id);
        self.write.open_file_by_id(file_id)
    }

    pub fn open_file_with_id(&self, name: &str, file_id: u64) -> Result<(), Error> {
        let _cache = self.cache_lock.write();
        self.write.open_file_with_id(name, file_id)
    }

    /// Drop the pages of a file and shrink it to zero.
    pub fn truncate_file(&self, file_id: u64) -> Result<(), Error> {
        let _cache = self.cache_lock.read();
        let _file = self.file_locks.exclusive(&file_id);
        self.clear_file(file_id)?;
        self.write.truncate_file(file_id)
    }

    /// Drop the pages of a file and close it, writing its dirty pages first if `flush` is set.
    pub fn close_file(&self, file_id: u64, flush: bool) -> Result<(), Error> {
        let _cache = self.cache_lock.read();
        let _file = self.file_locks.exclusive(&file_id);
        self.clear_file(file_id)?;
        self.write.close_file(file_id, flush)
    }

    pub fn delete_file(&self, file_id: u64) -> Result<(), Error> {
        let _cache = self.cache_lock.read();
        let _file = self.file_locks.exclusive(&file_id);
        self.clear_file(file_id)?;
        self.write.delete_file(file_id)
    }

    pub fn rename_file(&self, file_id: u64, old: &str, new: &str) -> Result<(), Error> {
        let _cache = self.cache_lock.write();
        self.write.rename_file(file_id, old, new)
    }

    /// Drop every page, then flush and close the write cache.
    ///
    /// With [crate::Config::keep_cache_state] set, the keys of the queues are saved first.
    pub fn close_storage(&self) -> Result<(), Error> {
        let _cache = self.cache_lock.write();
        let snapshot = self.keep_state.then(|| self.snapshot());
        self.clear_content()?;
        if let Some(snapshot) = snapshot {
            if let Err(err) = self.store_state(&snapshot) {
                warn!(?err, "unable to store cache state");
            }
        }
        self.write.close()
    }

    /// Drop every page, then delete every file.
    pub fn delete_storage(&self) -> Result<(), Error> {
        let _cache = self.cache_lock.write();
        self.clear_content()?;
        self.remove_state()?;
        self.write.delete()
    }
}
