//! Shared ownership of an in-memory page buffer.
//!
//! A [CachePointer] is referenced from two sides: the read cache holds a _reader_ reference while
//! the page is resident, and the write cache holds a _writer_ reference while the page is dirty.
//! The buffer is released as soon as both counts drop to zero (after having been acquired at least
//! once). Accessing a released buffer is a bookkeeping bug and panics.

use crate::{key::PageKey, page::PADDING, wal::Lsn};
use std::sync::{Arc, Mutex, RwLock};

/// Notified when a page transitions in or out of the "only referenced by writers" state.
///
/// The write cache uses this to track pages that nothing but the write cache keeps in memory
/// (and that are therefore the cheapest to flush and forget).
pub trait WritersListener: Send + Sync {
    fn add_only_writers(&self, key: PageKey);
    fn remove_only_writers(&self, key: PageKey);
}

#[derive(Default)]
struct Refs {
    readers: usize,
    writers: usize,
    released: bool,
}

/// A reference-counted page buffer with a content lock.
pub struct CachePointer {
    key: PageKey,
    page_size: usize,

    // Padded buffer, `None` once released.
    buffer: RwLock<Option<Box<[u8]>>>,
    refs: Mutex<Refs>,

    last_flushed_lsn: Mutex<Option<Lsn>>,
    listener: Option<Arc<dyn WritersListener>>,
}

impl CachePointer {
    /// Create a zeroed buffer for the page identified by `key`.
    pub fn new(
        key: PageKey,
        page_size: usize,
        last_flushed_lsn: Option<Lsn>,
        listener: Option<Arc<dyn WritersListener>>,
    ) -> Self {
        Self {
            key,
            page_size,
            buffer: RwLock::new(Some(vec![0u8; page_size + 2 * PADDING].into_boxed_slice())),
            refs: Mutex::new(Refs::default()),
            last_flushed_lsn: Mutex::new(last_flushed_lsn),
            listener,
        }
    }

    /// Create a buffer holding a copy of `page`.
    pub fn from_page(
        key: PageKey,
        page: &[u8],
        last_flushed_lsn: Option<Lsn>,
        listener: Option<Arc<dyn WritersListener>>,
    ) -> Self {
        let pointer = Self::new(key, page.len(), last_flushed_lsn, listener);
        pointer.write(|buf| buf.copy_from_slice(page));
        pointer
    }

    pub const fn key(&self) -> PageKey {
        self.key
    }

    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Read the page content under the shared content lock.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was released.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let buffer = self.buffer.read().unwrap();
        let buffer = buffer.as_ref().expect("page buffer released");
        f(&buffer[PADDING..PADDING + self.page_size])
    }

    /// Like [CachePointer::read] but returns `None` instead of waiting if a writer holds the
    /// content lock.
    pub fn try_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let buffer = self.buffer.try_read().ok()?;
        let buffer = buffer.as_ref().expect("page buffer released");
        Some(f(&buffer[PADDING..PADDING + self.page_size]))
    }

    /// Modify the page content under the exclusive content lock.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was released.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buffer = self.buffer.write().unwrap();
        let buffer = buffer.as_mut().expect("page buffer released");
        f(&mut buffer[PADDING..PADDING + self.page_size])
    }

    pub fn increment_readers(&self) {
        let mut refs = self.refs.lock().unwrap();
        assert!(!refs.released, "page {} acquired after release", self.key);
        refs.readers += 1;
        if refs.readers == 1 && refs.writers > 0 {
            if let Some(listener) = &self.listener {
                listener.remove_only_writers(self.key);
            }
        }
    }

    pub fn decrement_readers(&self) {
        let release = {
            let mut refs = self.refs.lock().unwrap();
            assert!(refs.readers > 0, "page {} has no readers", self.key);
            refs.readers -= 1;
            if refs.readers == 0 && refs.writers > 0 {
                if let Some(listener) = &self.listener {
                    listener.add_only_writers(self.key);
                }
            }
            Self::mark_released(&mut refs)
        };
        if release {
            self.release();
        }
    }

    pub fn increment_writers(&self) {
        let mut refs = self.refs.lock().unwrap();
        assert!(!refs.released, "page {} acquired after release", self.key);
        refs.writers += 1;
        if refs.writers == 1 && refs.readers == 0 {
            if let Some(listener) = &self.listener {
                listener.add_only_writers(self.key);
            }
        }
    }

    pub fn decrement_writers(&self) {
        let release = {
            let mut refs = self.refs.lock().unwrap();
            assert!(refs.writers > 0, "page {} has no writers", self.key);
            refs.writers -= 1;
            if refs.writers == 0 && refs.readers == 0 {
                if let Some(listener) = &self.listener {
                    listener.remove_only_writers(self.key);
                }
            }
            Self::mark_released(&mut refs)
        };
        if release {
            self.release();
        }
    }

    fn mark_released(refs: &mut Refs) -> bool {
        if refs.readers == 0 && refs.writers == 0 {
            refs.released = true;
            return true;
        }
        false
    }

    fn release(&self) {
        self.buffer.write().unwrap().take();
    }

    pub fn readers(&self) -> usize {
        self.refs.lock().unwrap().readers
    }

    pub fn writers(&self) -> usize {
        self.refs.lock().unwrap().writers
    }

    pub fn is_released(&self) -> bool {
        self.refs.lock().unwrap().released
    }

    /// The last [Lsn] known to be durable when this page was last loaded or flushed.
    pub fn last_flushed_lsn(&self) -> Option<Lsn> {
        *self.last_flushed_lsn.lock().unwrap()
    }

    pub fn set_last_flushed_lsn(&self, lsn: Option<Lsn>) {
        *self.last_flushed_lsn.lock().unwrap() = lsn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{collections::BTreeSet, thread};

    const PAGE_SIZE: usize = 64;

    #[derive(Default)]
    struct Tracker {
        only_writers: Mutex<BTreeSet<PageKey>>,
    }

    impl WritersListener for Tracker {
        fn add_only_writers(&self, key: PageKey) {
            assert!(self.only_writers.lock().unwrap().insert(key));
        }

        fn remove_only_writers(&self, key: PageKey) {
            assert!(self.only_writers.lock().unwrap().remove(&key));
        }
    }

    #[test]
    fn test_pointer_content() {
        let key = PageKey::new(1, 2);
        let pointer = CachePointer::from_page(key, &[3u8; PAGE_SIZE], None, None);
        pointer.increment_readers();
        assert_eq!(pointer.key(), key);
        assert_eq!(pointer.page_size(), PAGE_SIZE);
        pointer.read(|page| assert!(page.iter().all(|b| *b == 3)));
        pointer.write(|page| page[0] = 9);
        assert_eq!(pointer.try_read(|page| page[0]), Some(9));
    }

    #[test]
    fn test_pointer_released_at_zero() {
        let pointer = CachePointer::new(PageKey::new(1, 0), PAGE_SIZE, None, None);
        pointer.increment_readers();
        pointer.increment_writers();
        pointer.decrement_readers();
        assert!(!pointer.is_released());
        pointer.read(|_| {});
        pointer.decrement_writers();
        assert!(pointer.is_released());
    }

    #[test]
    #[should_panic(expected = "page buffer released")]
    fn test_pointer_read_after_release() {
        let pointer = CachePointer::new(PageKey::new(1, 0), PAGE_SIZE, None, None);
        pointer.increment_readers();
        pointer.decrement_readers();
        pointer.read(|_| {});
    }

    #[test]
    #[should_panic(expected = "acquired after release")]
    fn test_pointer_acquire_after_release() {
        let pointer = CachePointer::new(PageKey::new(1, 0), PAGE_SIZE, None, None);
        pointer.increment_writers();
        pointer.decrement_writers();
        pointer.increment_readers();
    }

    #[test]
    fn test_pointer_writers_listener() {
        let tracker = Arc::new(Tracker::default());
        let key = PageKey::new(7, 7);
        let pointer = CachePointer::new(key, PAGE_SIZE, None, Some(tracker.clone()));

        // Reader only: not tracked.
        pointer.increment_readers();
        assert!(tracker.only_writers.lock().unwrap().is_empty());

        // Reader and writer: not tracked.
        pointer.increment_writers();
        assert!(tracker.only_writers.lock().unwrap().is_empty());

        // Writer only: tracked.
        pointer.decrement_readers();
        assert!(tracker.only_writers.lock().unwrap().contains(&key));

        // A reader returns: untracked.
        pointer.increment_readers();
        assert!(tracker.only_writers.lock().unwrap().is_empty());
        pointer.decrement_readers();
        assert!(tracker.only_writers.lock().unwrap().contains(&key));

        // Last writer leaves: untracked and released.
        pointer.decrement_writers();
        assert!(tracker.only_writers.lock().unwrap().is_empty());
        assert!(pointer.is_released());
    }

    #[test]
    fn test_pointer_last_flushed_lsn() {
        let pointer = CachePointer::new(PageKey::new(1, 0), PAGE_SIZE, Some(Lsn::new(1, 1)), None);
        assert_eq!(pointer.last_flushed_lsn(), Some(Lsn::new(1, 1)));
        pointer.set_last_flushed_lsn(Some(Lsn::new(2, 0)));
        assert_eq!(pointer.last_flushed_lsn(), Some(Lsn::new(2, 0)));
    }

    #[test]
    fn test_pointer_concurrent_references() {
        let tracker = Arc::new(Tracker::default());
        let pointer = Arc::new(CachePointer::new(
            PageKey::new(1, 1),
            PAGE_SIZE,
            None,
            Some(tracker.clone()),
        ));

        // Hold one reference for the whole test so the buffer must stay alive.
        pointer.increment_readers();

        let handles: Vec<_> = (0..8u64)
            .map(|seed| {
                let pointer = pointer.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    for _ in 0..2_000 {
                        let writer = rng.gen_bool(0.5);
                        if writer {
                            pointer.increment_writers();
                        } else {
                            pointer.increment_readers();
                        }
                        pointer.write(|page| page[seed as usize] = page[seed as usize].wrapping_add(1));
                        assert!(!pointer.is_released());
                        if writer {
                            pointer.decrement_writers();
                        } else {
                            pointer.decrement_readers();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pointer.readers(), 1);
        assert_eq!(pointer.writers(), 0);
        pointer.read(|page| {
            for seed in 0..8 {
                assert_eq!(page[seed], (2_000 % 256) as u8);
            }
        });
        assert!(tracker.only_writers.lock().unwrap().is_empty());
        pointer.decrement_readers();
        assert!(pointer.is_released());
    }
}
