//! Eviction-ordered containers of cache entries.
//!
//! An [LruList] maps a [PageKey] to an entry and orders entries from most recently used (MRU) to
//! least recently used (LRU). Two implementations are provided:
//!
//! - [arena::ArenaList]: entries live in a sharded concurrent index and recency is an append-only
//!   chain of tickets behind its own lock. Moving an entry only appends a ticket and stale tickets
//!   are swept in batches.
//! - [hash::HashList]: a hash index threaded by an explicit doubly linked list. It is not
//!   synchronized and is shared through [hash::Synchronized].
//!
//! Both are internally synchronized through the [LruList] interface. The read cache picks one with
//! [LruKind].

use crate::PageKey;

pub mod arena;
pub mod hash;

/// An entry that can be stored in an [LruList].
pub trait Entry: Clone + Send + Sync {
    /// The key the entry is stored under.
    fn key(&self) -> PageKey;

    /// Whether the entry is currently in use (and must not be evicted).
    fn in_use(&self) -> bool;
}

/// An associative container ordered by recency of use.
pub trait LruList<V: Entry>: Send + Sync {
    /// Return the entry stored under `key` without changing its position.
    fn get(&self, key: &PageKey) -> Option<V>;

    /// Remove and return the entry stored under `key`.
    fn remove(&self, key: &PageKey) -> Option<V>;

    /// Insert `value` (replacing any entry with the same key) at the MRU position.
    fn put_to_mru(&self, value: V);

    /// Remove and return the least recently used entry that is not in use.
    fn remove_lru(&self) -> Option<V>;

    /// Return the least recently used entry that is not in use, without removing it.
    fn get_lru(&self) -> Option<V>;

    fn contains(&self, key: &PageKey) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);

    /// A snapshot of all entries, ordered from MRU to LRU.
    fn iter(&self) -> Vec<V>;
}

/// The [LruList] implementation used by a cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LruKind {
    #[default]
    Arena,
    Hash,
}

impl LruKind {
    /// Create an empty list of this kind.
    pub fn build<V: Entry + 'static>(self) -> Box<dyn LruList<V>> {
        match self {
            Self::Arena => Box::new(arena::ArenaList::new()),
            Self::Hash => Box::new(hash::Synchronized::new()),
        }
    }
}
