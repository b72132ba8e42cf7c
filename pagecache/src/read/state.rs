//! Saving and restoring the keys held by the read cache across restarts.
//!
//! On close, the keys of `am`, `a1in` and `a1out` (from LRU to MRU) are written to [CACHE_STATE]:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | Max Size (u64) | Count (u32) | Count x (File Id (u64), Page Index (u64)) | ...
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! ... (one count and key list per queue) | CRC32 (u32) |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+
//! ```
//!
//! On load, the pages of `am` and `a1in` are read back in file order and put in their queues in
//! the recorded order, while `a1out` only gets its keys back. Nothing is restored if the cache is
//! smaller than when the state was saved.

use super::{List, ReadCache};
use crate::{
    key::PageKey,
    lru::LruList,
    pointer::CachePointer,
    read::CacheEntry,
    storage::{File, Storage},
    Error,
};
use bytes::{Buf, BufMut};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info, trace, warn};

/// Name of the file holding the saved keys.
pub const CACHE_STATE: &str = "cache.stt";

const KEY_SIZE: usize = 16;
const CRC_SIZE: usize = 4;

/// Keys of each queue, ordered from LRU to MRU.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct State {
    pub(crate) max_size: u64,
    pub(crate) am: Vec<PageKey>,
    pub(crate) a1in: Vec<PageKey>,
    pub(crate) a1out: Vec<PageKey>,
}

impl State {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let keys = self.am.len() + self.a1in.len() + self.a1out.len();
        let mut buf = Vec::with_capacity(8 + 3 * 4 + keys * KEY_SIZE + CRC_SIZE);
        buf.put_u64(self.max_size);
        for queue in [&self.am, &self.a1in, &self.a1out] {
            buf.put_u32(queue.len() as u32);
            for key in queue {
                buf.put_u64(key.file_id);
                buf.put_u64(key.page_index);
            }
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf
    }

    /// Parse a saved state, returning `None` if it is truncated or fails its checksum.
    pub(crate) fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < CRC_SIZE {
            return None;
        }
        let (body, mut crc) = data.split_at(data.len() - CRC_SIZE);
        if crc.get_u32() != crc32fast::hash(body) {
            return None;
        }

        let mut buf = body;
        if buf.remaining() < 8 {
            return None;
        }
        let max_size = buf.get_u64();
        let mut queues = Vec::with_capacity(3);
        for _ in 0..3 {
            if buf.remaining() < 4 {
                return None;
            }
            let count = buf.get_u32() as usize;
            if buf.remaining() < count.checked_mul(KEY_SIZE)? {
                return None;
            }
            let keys: Vec<_> = (0..count)
                .map(|_| PageKey::new(buf.get_u64(), buf.get_u64()))
                .collect();
            queues.push(keys);
        }
        if buf.has_remaining() {
            return None;
        }
        let a1out = queues.pop()?;
        let a1in = queues.pop()?;
        let am = queues.pop()?;
        Some(Self {
            max_size,
            am,
            a1in,
            a1out,
        })
    }
}

fn keys(list: &List, files: &HashSet<u64>) -> Vec<PageKey> {
    list.iter()
        .into_iter()
        .rev()
        .map(|entry| entry.key())
        .filter(|key| files.contains(&key.file_id))
        .collect()
}

impl<S: Storage> ReadCache<S> {
    /// The keys of every queue that belong to a known file.
    pub(super) fn snapshot(&self) -> State {
        let files: HashSet<u64> = self.write.files().into_iter().map(|(id, _)| id).collect();
        State {
            max_size: self.max_size() as u64,
            am: keys(&self.am, &files),
            a1in: keys(&self.a1in, &files),
            a1out: keys(&self.a1out, &files),
        }
    }

    pub(super) fn store_state(&self, state: &State) -> Result<(), Error> {
        let buf = state.encode();
        let file = self.write.storage().open(CACHE_STATE, true)?;
        file.resize(0)?;
        file.write_at(&buf, 0)?;
        file.sync()?;
        debug!(
            am = state.am.len(),
            a1in = state.a1in.len(),
            a1out = state.a1out.len(),
            "cache state stored"
        );
        Ok(())
    }

    pub(super) fn remove_state(&self) -> Result<(), Error> {
        match self.write.storage().remove(CACHE_STATE) {
            Ok(()) | Err(Error::FileMissing(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Reload the pages held when the cache was last closed and return how many were loaded.
    ///
    /// Does nothing unless [crate::Config::keep_cache_state] is set. Pages of files that are not
    /// open (or no longer that long) are skipped, so files should be opened first.
    pub fn load_cache_state(&self) -> Result<usize, Error> {
        if !self.keep_state {
            return Ok(0);
        }
        let _cache = self.cache_lock.write();
        let storage = self.write.storage();
        if !storage.exists(CACHE_STATE)? {
            return Ok(0);
        }
        let file = storage.open(CACHE_STATE, false)?;
        let len = usize::try_from(file.size()?).map_err(|_| Error::OffsetOverflow)?;
        let mut data = vec![0u8; len];
        file.read_at(&mut data, 0)?;
        let Some(state) = State::decode(&data) else {
            warn!(len, "discarding corrupt cache state");
            return Ok(0);
        };

        let max_size = self.max_size();
        if state.max_size > max_size as u64 {
            info!(
                previous = state.max_size,
                max_size, "cache is smaller than when its state was stored, state not restored"
            );
            return Ok(0);
        }

        let restored = self.restore_queue(&*self.am, &state.am)
            + self.restore_queue(&*self.a1in, &state.a1in);
        for key in state.a1out {
            if self.write.file_name(key.file_id).is_none() || self.lookup(&key).is_some() {
                continue;
            }
            self.a1out.put_to_mru(Arc::new(CacheEntry::new(key, None)));
            self.track(key);
        }
        self.update_gauges();
        info!(restored, ghosts = self.a1out.len(), "cache state restored");
        Ok(restored)
    }

    /// Load the pages of `keys` in file order and put them in `list` in the order of `keys`.
    fn restore_queue(&self, list: &dyn LruList<Arc<CacheEntry>>, keys: &[PageKey]) -> usize {
        let mut order: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(position, key)| (*key, position))
            .collect();
        order.sort();
        order.dedup_by_key(|(key, _)| *key);

        let mut pointers: Vec<Option<Arc<CachePointer>>> = vec![None; keys.len()];
        for (key, position) in order {
            if self.lookup(&key).is_some() {
                continue;
            }
            match self.write.load(key, false) {
                Ok(Some(pointer)) => pointers[position] = Some(pointer),
                Ok(None) => {}
                Err(err) => trace!(
                    file_id = key.file_id,
                    page_index = key.page_index,
                    ?err,
                    "page not restored"
                ),
            }
        }

        let mut restored = 0;
        for (key, pointer) in keys.iter().zip(pointers) {
            let Some(pointer) = pointer else {
                continue;
            };
            list.put_to_mru(Arc::new(CacheEntry::new(*key, Some(pointer))));
            self.track(*key);
            restored += 1;
        }
        restored
    }
}
