//! Persistent binding of file names to file ids.
//!
//! The map is stored in [NAME_ID_MAP] as a sequence of records:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |   Len (i32)   |  Name (Len bytes)  |   Id (i64)    |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+
//! ```
//!
//! Records are only appended. When a name appears more than once, the latest record wins. A
//! negative id marks a deleted file (the absolute value is reused if the name is added again) and
//! a zero id means the name is no longer bound to anything.
//!
//! Compaction writes the surviving records to [NAME_ID_MAP_TEMP] and then replaces the map with it.
//! If both files are found on open, the compaction did not finish and the temporary file is
//! dropped. If only the temporary file is found, the replacement is completed.

use crate::{
    storage::{File, Storage},
    Error,
};
use bytes::{Buf, BufMut};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Name of the file holding the map.
pub const NAME_ID_MAP: &str = "name_id_map.cm";

/// Name of the file a compacted map is written to before it replaces [NAME_ID_MAP].
pub const NAME_ID_MAP_TEMP: &str = "name_id_map.cm.tmp";

const LEN_SIZE: usize = 4;
const ID_SIZE: usize = 8;

pub(crate) struct NameIdMap<F: File> {
    file: F,
    size: u64,
    entries: BTreeMap<String, i64>,
    counter: u64,
}

impl<F: File> NameIdMap<F> {
    /// Open (or create) the map stored in `storage` and replay its records.
    ///
    /// A partially written trailing record is discarded.
    pub(crate) fn open<S: Storage<File = F>>(storage: &S) -> Result<Self, Error> {
        if storage.exists(NAME_ID_MAP_TEMP)? {
            if storage.exists(NAME_ID_MAP)? {
                warn!("discarding interrupted name-id map compaction");
                storage.remove(NAME_ID_MAP_TEMP)?;
            } else {
                warn!("completing interrupted name-id map compaction");
                storage.rename(NAME_ID_MAP_TEMP, NAME_ID_MAP)?;
            }
        }
        let file = storage.open(NAME_ID_MAP, true)?;
        let len = file.size()?;
        let mut data = vec![0u8; usize::try_from(len).map_err(|_| Error::OffsetOverflow)?];
        if !data.is_empty() {
            file.read_at(&mut data, 0)?;
        }

        let mut entries = BTreeMap::new();
        let mut counter = 0;
        let mut buf = &data[..];
        let mut valid = 0;
        loop {
            if buf.remaining() < LEN_SIZE {
                break;
            }
            let name_len = (&buf[..LEN_SIZE]).get_i32();
            let name_len = usize::try_from(name_len)
                .map_err(|_| Error::NameIdMapCorrupt(format!("negative name length at {valid}")))?;
            if buf.remaining() < LEN_SIZE + name_len + ID_SIZE {
                break;
            }
            buf.advance(LEN_SIZE);
            let name = std::str::from_utf8(&buf[..name_len])
                .map_err(|_| Error::NameIdMapCorrupt(format!("invalid name at {valid}")))?
                .to_string();
            buf.advance(name_len);
            let id = buf.get_i64();
            valid += LEN_SIZE + name_len + ID_SIZE;

            counter = counter.max(id.unsigned_abs());
            if id == 0 {
                entries.remove(&name);
            } else {
                entries.insert(name, id);
            }
        }

        if valid < data.len() {
            warn!(
                trailing = data.len() - valid,
                "discarding partial name-id map record"
            );
            file.resize(valid as u64)?;
            file.sync()?;
        }
        debug!(files = entries.len(), counter, "name-id map loaded");

        Ok(Self {
            file,
            size: valid as u64,
            entries,
            counter,
        })
    }

    /// The id bound to `name`: positive if live, negative if deleted.
    pub(crate) fn get(&self, name: &str) -> Option<i64> {
        self.entries.get(name).copied()
    }

    /// The live id bound to `name`.
    pub(crate) fn live(&self, name: &str) -> Option<u64> {
        self.get(name).filter(|id| *id > 0).map(|id| id as u64)
    }

    /// The id that adding `name` would use.
    pub(crate) fn book(&self, name: &str) -> u64 {
        match self.get(name) {
            Some(id) if id < 0 => id.unsigned_abs(),
            _ => self.counter + 1,
        }
    }

    /// Make sure ids handed out later are greater than `id`.
    pub(crate) fn observe(&mut self, id: u64) {
        self.counter = self.counter.max(id);
    }

    /// The largest id handed out so far.
    pub(crate) fn counter(&self) -> u64 {
        self.counter
    }

    /// Durably bind `name` to `id` (`0` unbinds it).
    pub(crate) fn insert(&mut self, name: &str, id: i64) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(LEN_SIZE + name.len() + ID_SIZE);
        encode(&mut buf, name, id)?;
        self.file.write_at(&buf, self.size)?;
        self.file.sync()?;
        self.size += buf.len() as u64;

        self.observe(id.unsigned_abs());
        if id == 0 {
            self.entries.remove(name);
        } else {
            self.entries.insert(name.to_string(), id);
        }
        Ok(())
    }

    /// Live bindings, ordered by name.
    pub(crate) fn live_entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries
            .iter()
            .filter(|(_, id)| **id > 0)
            .map(|(name, id)| (name.as_str(), *id as u64))
    }

    /// Replace the file with one holding a single record per bound name.
    pub(crate) fn compact<S: Storage<File = F>>(&mut self, storage: &S) -> Result<(), Error> {
        let mut buf = Vec::new();
        for (name, id) in &self.entries {
            encode(&mut buf, name, *id)?;
        }
        let temp = storage.open(NAME_ID_MAP_TEMP, true)?;
        temp.resize(0)?;
        if !buf.is_empty() {
            temp.write_at(&buf, 0)?;
        }
        temp.sync()?;
        drop(temp);

        storage.remove(NAME_ID_MAP)?;
        storage.rename(NAME_ID_MAP_TEMP, NAME_ID_MAP)?;
        self.file = storage.open(NAME_ID_MAP, false)?;
        self.size = buf.len() as u64;
        debug!(records = self.entries.len(), "name-id map compacted");
        Ok(())
    }
}

fn encode(buf: &mut Vec<u8>, name: &str, id: i64) -> Result<(), Error> {
    let len = i32::try_from(name.len()).map_err(|_| Error::FileNameInvalid(name.into()))?;
    buf.put_i32(len);
    buf.put_slice(name.as_bytes());
    buf.put_i64(id);
    Ok(())
}
