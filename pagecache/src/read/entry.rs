use crate::{key::PageKey, lru::Entry, pointer::CachePointer};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};

/// A page resident in the read cache (or, without a pointer, a key remembered in the ghost queue).
///
/// # Invariants
///
/// - `usages` and the pointer only change while the page lock of `key` is held.
/// - An entry with a non-zero usage count always has a pointer.
pub struct CacheEntry {
    key: PageKey,
    usages: AtomicU32,
    dirty: AtomicBool,
    pointer: Mutex<Option<Arc<CachePointer>>>,
}

impl CacheEntry {
    pub(crate) fn new(key: PageKey, pointer: Option<Arc<CachePointer>>) -> Self {
        Self {
            key,
            usages: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            pointer: Mutex::new(pointer),
        }
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn file_id(&self) -> u64 {
        self.key.file_id
    }

    pub fn page_index(&self) -> u64 {
        self.key.page_index
    }

    /// Number of callers that loaded the page and have not released it yet.
    pub fn usages(&self) -> u32 {
        self.usages.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Mark the page as modified so that releasing it hands it to the write cache.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn pointer(&self) -> Option<Arc<CachePointer>> {
        self.pointer.lock().unwrap().clone()
    }

    /// Read the page content.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not loaded.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.loaded().read(f)
    }

    /// Modify the page content and mark the page dirty.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not loaded.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.mark_dirty();
        self.loaded().write(f)
    }

    fn loaded(&self) -> Arc<CachePointer> {
        self.pointer()
            .unwrap_or_else(|| panic!("page {} is not loaded", self.key))
    }

    pub(crate) fn acquire(&self) {
        self.usages.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the usage count left.
    pub(crate) fn release(&self) -> u32 {
        let previous = self.usages.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "page {} released more than loaded", self.key);
        previous - 1
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn attach(&self, pointer: Arc<CachePointer>) {
        *self.pointer.lock().unwrap() = Some(pointer);
    }

    /// Drop the reader reference held on the page buffer, if any.
    pub(crate) fn detach(&self) {
        if let Some(pointer) = self.pointer.lock().unwrap().take() {
            pointer.decrement_readers();
        }
    }
}

impl Entry for Arc<CacheEntry> {
    fn key(&self) -> PageKey {
        self.key
    }

    fn in_use(&self) -> bool {
        self.usages() > 0 || self.is_dirty()
    }
}
