//! Locks shared by the read and write caches.

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// The cache-wide readers-writer lock.
///
/// Page operations take the read side, structural operations the write side. Critical sections
/// under the write side are short, so a spinning lock is used.
pub type CacheLock = spin::RwLock<()>;

/// Default number of stripes in a [LockManager].
pub const STRIPES: usize = 1024;

/// Shared or exclusive locks for arbitrary keys, backed by a fixed set of stripes.
///
/// Two keys that hash to the same stripe share a lock, so a thread must never hold a lock for one
/// key while acquiring a lock for another.
pub struct LockManager<K> {
    stripes: Vec<RwLock<()>>,
    hasher: RandomState,
    _phantom: PhantomData<fn(&K)>,
}

impl<K: Hash> LockManager<K> {
    pub fn new(stripes: usize) -> Self {
        assert!(stripes > 0, "lock manager needs at least one stripe");
        Self {
            stripes: (0..stripes).map(|_| RwLock::new(())).collect(),
            hasher: RandomState::new(),
            _phantom: PhantomData,
        }
    }

    fn stripe(&self, key: &K) -> &RwLock<()> {
        let index = self.hasher.hash_one(key) as usize % self.stripes.len();
        &self.stripes[index]
    }

    /// Acquire the lock for `key` in shared mode.
    pub fn shared(&self, key: &K) -> RwLockReadGuard<'_, ()> {
        self.stripe(key).read().unwrap()
    }

    /// Acquire the lock for `key` in exclusive mode.
    pub fn exclusive(&self, key: &K) -> RwLockWriteGuard<'_, ()> {
        self.stripe(key).write().unwrap()
    }

    /// Acquire the lock for `key` in exclusive mode if it is free.
    #[cfg(test)]
    pub fn try_exclusive(&self, key: &K) -> Option<RwLockWriteGuard<'_, ()>> {
        self.stripe(key).try_write().ok()
    }
}

impl<K: Hash> Default for LockManager<K> {
    fn default() -> Self {
        Self::new(STRIPES)
    }
}
