//! An [LruList] backed by a hash index threaded with a doubly linked list.

use super::{Entry, LruList};
use crate::PageKey;
use std::{collections::HashMap, sync::Mutex};

struct Node<V> {
    value: V,

    /// The next more recently used key.
    before: Option<PageKey>,

    /// The next less recently used key.
    after: Option<PageKey>,
}

/// An unsynchronized LRU list.
///
/// Links between entries are stored as keys in the index, so every link update is a hash lookup.
pub struct HashList<V> {
    nodes: HashMap<PageKey, Node<V>>,

    /// Most recently used key.
    head: Option<PageKey>,

    /// Least recently used key.
    tail: Option<PageKey>,
}

impl<V: Entry> HashList<V> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn get(&self, key: &PageKey) -> Option<&V> {
        self.nodes.get(key).map(|node| &node.value)
    }

    fn unlink(&mut self, key: &PageKey) -> Option<Node<V>> {
        let node = self.nodes.remove(key)?;
        match node.before {
            Some(before) => {
                if let Some(prev) = self.nodes.get_mut(&before) {
                    prev.after = node.after;
                }
            }
            None => self.head = node.after,
        }
        match node.after {
            Some(after) => {
                if let Some(next) = self.nodes.get_mut(&after) {
                    next.before = node.before;
                }
            }
            None => self.tail = node.before,
        }
        Some(node)
    }

    pub fn remove(&mut self, key: &PageKey) -> Option<V> {
        self.unlink(key).map(|node| node.value)
    }

    pub fn put_to_mru(&mut self, value: V) {
        let key = value.key();
        self.unlink(&key);
        let node = Node {
            value,
            before: None,
            after: self.head,
        };
        match self.head {
            Some(head) => {
                if let Some(old) = self.nodes.get_mut(&head) {
                    old.before = Some(key);
                }
            }
            None => self.tail = Some(key),
        }
        self.head = Some(key);
        self.nodes.insert(key, node);
    }

    /// Key of the LRU entry that is not in use.
    fn lru_key(&self) -> Option<PageKey> {
        let mut cursor = self.tail;
        while let Some(key) = cursor {
            let node = self.nodes.get(&key)?;
            if !node.value.in_use() {
                return Some(key);
            }
            cursor = node.before;
        }
        None
    }

    pub fn remove_lru(&mut self) -> Option<V> {
        let key = self.lru_key()?;
        self.remove(&key)
    }

    pub fn get_lru(&self) -> Option<&V> {
        let key = self.lru_key()?;
        self.get(&key)
    }

    pub fn contains(&self, key: &PageKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    /// Iterate from MRU to LRU.
    pub fn iter(&self) -> impl Iterator<Item = &V> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.nodes.get(&cursor?)?;
            cursor = node.after;
            Some(&node.value)
        })
    }
}

impl<V: Entry> Default for HashList<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shares a [HashList] between threads behind a mutex.
pub struct Synchronized<V> {
    inner: Mutex<HashList<V>>,
}

impl<V: Entry> Synchronized<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashList::new()),
        }
    }
}

impl<V: Entry> Default for Synchronized<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Entry> LruList<V> for Synchronized<V> {
    fn get(&self, key: &PageKey) -> Option<V> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    fn remove(&self, key: &PageKey) -> Option<V> {
        self.inner.lock().unwrap().remove(key)
    }

    fn put_to_mru(&self, value: V) {
        self.inner.lock().unwrap().put_to_mru(value);
    }

    fn remove_lru(&self) -> Option<V> {
        self.inner.lock().unwrap().remove_lru()
    }

    fn get_lru(&self) -> Option<V> {
        self.inner.lock().unwrap().get_lru().cloned()
    }

    fn contains(&self, key: &PageKey) -> bool {
        self.inner.lock().unwrap().contains(key)
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    fn iter(&self) -> Vec<V> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }
}
