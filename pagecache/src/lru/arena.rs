//! An [LruList] backed by a concurrent key index and an append-only recency chain.
//!
//! Entries live in a [DashMap] keyed by [PageKey], so point lookups (`get`, `contains`, `len`,
//! `remove`) only touch the shard holding the key. Each time an entry is put at the MRU position, it
//! is stamped with a fresh ticket and the ticket is appended to the back of the `chain`, which sits
//! behind its own lock. A ticket in the chain is _live_ only if the index still maps its key to the
//! same ticket, so moving or removing an entry never searches the chain: the old ticket simply
//! becomes stale. Stale tickets are dropped from the front of the chain as they are encountered and
//! swept in bulk once they outnumber live entries.
//!
//! Lock order: `chain` before any shard of `index`. No shard guard is held while taking `chain`.

use super::{Entry, LruList};
use crate::PageKey;
use dashmap::DashMap;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

/// Minimum number of stale tickets before a sweep is considered.
const SWEEP_THRESHOLD: usize = 64;

struct Slot<V> {
    value: V,
    ticket: u64,
}

#[derive(Clone, Copy)]
struct Ticket {
    key: PageKey,
    id: u64,
}

struct Chain {
    /// Tickets ordered from LRU (front) to MRU (back).
    ///
    /// # Invariants
    ///
    /// Every key of the index has exactly one live ticket in the queue.
    queue: VecDeque<Ticket>,

    next_ticket: u64,
}

/// A synchronized [LruList] whose point operations do not serialize on a single lock.
pub struct ArenaList<V> {
    index: DashMap<PageKey, Slot<V>>,
    chain: Mutex<Chain>,

    /// Approximate number of stale tickets in the chain.
    stale: AtomicUsize,
}

impl<V: Entry> ArenaList<V> {
    pub fn new() -> Self {
        Self {
            index: DashMap::new(),
            chain: Mutex::new(Chain {
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            stale: AtomicUsize::new(0),
        }
    }

    fn is_live(&self, ticket: &Ticket) -> bool {
        self.index
            .get(&ticket.key)
            .is_some_and(|slot| slot.ticket == ticket.id)
    }

    fn live(&self, ticket: &Ticket) -> Option<V> {
        let slot = self.index.get(&ticket.key)?;
        (slot.ticket == ticket.id).then(|| slot.value.clone())
    }

    fn drop_stale(&self, count: usize) {
        let _ = self
            .stale
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |stale| {
                Some(stale.saturating_sub(count))
            });
    }

    fn trim_front(&self, chain: &mut Chain) {
        while let Some(front) = chain.queue.front() {
            if self.is_live(front) {
                break;
            }
            chain.queue.pop_front();
            self.drop_stale(1);
        }
    }

    fn maybe_sweep(&self, chain: &mut Chain) {
        if self.stale.load(Ordering::Relaxed) <= SWEEP_THRESHOLD.max(self.index.len()) {
            return;
        }
        chain.queue.retain(|ticket| self.is_live(ticket));
        self.stale.store(0, Ordering::Relaxed);
    }

    /// Ticket of the LRU entry that is not in use.
    fn lru_ticket(&self, chain: &Chain) -> Option<(Ticket, V)> {
        chain.queue.iter().find_map(|ticket| {
            let value = self.live(ticket)?;
            (!value.in_use()).then_some((*ticket, value))
        })
    }
}

impl<V: Entry> Default for ArenaList<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Entry> LruList<V> for ArenaList<V> {
    fn get(&self, key: &PageKey) -> Option<V> {
        self.index.get(key).map(|slot| slot.value.clone())
    }

    fn remove(&self, key: &PageKey) -> Option<V> {
        let (_, slot) = self.index.remove(key)?;
        self.stale.fetch_add(1, Ordering::Relaxed);
        Some(slot.value)
    }

    fn put_to_mru(&self, value: V) {
        let mut chain = self.chain.lock().unwrap();
        let id = chain.next_ticket;
        chain.next_ticket += 1;

        let key = value.key();
        if self.index.insert(key, Slot { value, ticket: id }).is_some() {
            self.stale.fetch_add(1, Ordering::Relaxed);
        }
        chain.queue.push_back(Ticket { key, id });
        self.trim_front(&mut chain);
        self.maybe_sweep(&mut chain);
    }

    fn remove_lru(&self) -> Option<V> {
        let mut chain = self.chain.lock().unwrap();
        let (ticket, _) = self.lru_ticket(&chain)?;
        let (_, slot) = self
            .index
            .remove_if(&ticket.key, |_, slot| slot.ticket == ticket.id)?;
        self.stale.fetch_add(1, Ordering::Relaxed);
        self.trim_front(&mut chain);
        Some(slot.value)
    }

    fn get_lru(&self) -> Option<V> {
        let chain = self.chain.lock().unwrap();
        self.lru_ticket(&chain).map(|(_, value)| value)
    }

    fn contains(&self, key: &PageKey) -> bool {
        self.index.contains_key(key)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn clear(&self) {
        let mut chain = self.chain.lock().unwrap();
        self.index.clear();
        chain.queue.clear();
        self.stale.store(0, Ordering::Relaxed);
    }

    fn iter(&self) -> Vec<V> {
        let chain = self.chain.lock().unwrap();
        chain
            .queue
            .iter()
            .rev()
            .filter_map(|ticket| self.live(ticket))
            .collect()
    }
}
