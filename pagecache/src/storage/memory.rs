//! In-memory [crate::storage::Storage] with I/O counters and fault injection.

use super::validate_name;
use crate::Error;
use std::{
    collections::BTreeMap,
    io::{Error as IoError, ErrorKind},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

#[derive(Default)]
struct Content {
    data: RwLock<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
    syncs: AtomicU64,
}

#[derive(Default)]
struct Faults {
    reads: AtomicBool,
    writes: AtomicBool,
    syncs: AtomicBool,
}

/// In-memory storage. Clones share the same files.
#[derive(Clone)]
pub struct Storage {
    files: Arc<Mutex<BTreeMap<String, Arc<Content>>>>,
    faults: Arc<Faults>,
    free_space: Arc<AtomicU64>,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            files: Arc::new(Mutex::new(BTreeMap::new())),
            faults: Arc::new(Faults::default()),
            free_space: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }
}

impl Storage {
    fn content(&self, name: &str) -> Option<Arc<Content>> {
        self.files.lock().unwrap().get(name).cloned()
    }

    /// Number of [crate::storage::File::read_at] calls made against `name`.
    pub fn reads(&self, name: &str) -> u64 {
        self.content(name)
            .map_or(0, |c| c.reads.load(Ordering::Relaxed))
    }

    /// Number of [crate::storage::File::write_at] calls made against `name`.
    pub fn writes(&self, name: &str) -> u64 {
        self.content(name)
            .map_or(0, |c| c.writes.load(Ordering::Relaxed))
    }

    /// Number of [crate::storage::File::sync] calls made against `name`.
    pub fn syncs(&self, name: &str) -> u64 {
        self.content(name)
            .map_or(0, |c| c.syncs.load(Ordering::Relaxed))
    }

    /// A copy of the bytes of `name`.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.content(name).map(|c| c.data.read().unwrap().clone())
    }

    /// Overwrite bytes of `name` directly, bypassing counters and faults.
    pub fn corrupt(&self, name: &str, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        let content = self
            .content(name)
            .ok_or_else(|| Error::FileMissing(name.into()))?;
        let mut data = content.data.write().unwrap();
        let end = offset + bytes.len();
        if end > data.len() {
            return Err(Error::InsufficientLength);
        }
        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Set the value reported by [crate::storage::Storage::free_space].
    pub fn set_free_space(&self, bytes: u64) {
        self.free_space.store(bytes, Ordering::Relaxed);
    }

    /// Make every read fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.faults.reads.store(fail, Ordering::Relaxed);
    }

    /// Make every write fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.faults.writes.store(fail, Ordering::Relaxed);
    }

    /// Make every sync fail until reset.
    pub fn fail_syncs(&self, fail: bool) {
        self.faults.syncs.store(fail, Ordering::Relaxed);
    }
}

impl super::Storage for Storage {
    type File = File;

    fn open(&self, name: &str, create: bool) -> Result<File, Error> {
        validate_name(name)?;
        let mut files = self.files.lock().unwrap();
        let content = match files.get(name) {
            Some(content) => content.clone(),
            None if create => files.entry(name.into()).or_default().clone(),
            None => return Err(Error::FileMissing(name.into())),
        };
        Ok(File {
            name: name.into(),
            content,
            faults: self.faults.clone(),
        })
    }

    fn exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.files.lock().unwrap().contains_key(name))
    }

    fn remove(&self, name: &str) -> Result<(), Error> {
        self.files
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| Error::FileMissing(name.into()))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        validate_name(to)?;
        let mut files = self.files.lock().unwrap();
        if files.contains_key(to) {
            return Err(Error::FileRenameFailed(
                from.into(),
                to.into(),
                IoError::from(ErrorKind::AlreadyExists),
            ));
        }
        let content = files
            .remove(from)
            .ok_or_else(|| Error::FileMissing(from.into()))?;
        files.insert(to.into(), content);
        Ok(())
    }

    fn free_space(&self) -> Result<u64, Error> {
        Ok(self.free_space.load(Ordering::Relaxed))
    }
}

/// A file held in memory.
pub struct File {
    name: String,
    content: Arc<Content>,
    faults: Arc<Faults>,
}

impl super::File for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        self.content.reads.fetch_add(1, Ordering::Relaxed);
        if self.faults.reads.load(Ordering::Relaxed) {
            return Err(Error::ReadFailed);
        }
        let offset: usize = offset.try_into().map_err(|_| Error::OffsetOverflow)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(Error::OffsetOverflow)?;
        let data = self.content.data.read().unwrap();
        if end > data.len() {
            return Err(Error::InsufficientLength);
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        self.content.writes.fetch_add(1, Ordering::Relaxed);
        if self.faults.writes.load(Ordering::Relaxed) {
            return Err(Error::WriteFailed);
        }
        let offset: usize = offset.try_into().map_err(|_| Error::OffsetOverflow)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(Error::OffsetOverflow)?;
        let mut data = self.content.data.write().unwrap();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> Result<u64, Error> {
        Ok(self.content.data.read().unwrap().len() as u64)
    }

    fn resize(&self, len: u64) -> Result<(), Error> {
        let len: usize = len.try_into().map_err(|_| Error::OffsetOverflow)?;
        self.content.data.write().unwrap().resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        self.content.syncs.fetch_add(1, Ordering::Relaxed);
        if self.faults.syncs.load(Ordering::Relaxed) {
            return Err(Error::FileSyncFailed(
                self.name.clone(),
                IoError::other("injected sync failure"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{tests::run_storage_tests, File as _, Storage as _};

    #[test]
    fn test_memory_storage() {
        run_storage_tests(Storage::default());
    }

    #[test]
    fn test_counters() {
        let storage = Storage::default();
        let file = storage.open("counted", true).unwrap();
        file.write_at(&[1; 8], 0).unwrap();
        file.write_at(&[2; 8], 8).unwrap();
        let mut buf = [0u8; 8];
        file.read_at(&mut buf, 8).unwrap();
        file.sync().unwrap();
        assert_eq!(storage.writes("counted"), 2);
        assert_eq!(storage.reads("counted"), 1);
        assert_eq!(storage.syncs("counted"), 1);
        assert_eq!(storage.reads("other"), 0);

        // Counters follow the file across a rename.
        storage.rename("counted", "renamed").unwrap();
        assert_eq!(storage.writes("renamed"), 2);
    }

    #[test]
    fn test_faults() {
        let storage = Storage::default();
        let file = storage.open("faulty", true).unwrap();
        file.write_at(&[1; 8], 0).unwrap();

        storage.fail_writes(true);
        assert!(matches!(file.write_at(&[2; 8], 0), Err(Error::WriteFailed)));
        storage.fail_writes(false);

        storage.fail_reads(true);
        let mut buf = [0u8; 8];
        assert!(matches!(file.read_at(&mut buf, 0), Err(Error::ReadFailed)));
        storage.fail_reads(false);
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [1; 8]);

        storage.fail_syncs(true);
        assert!(matches!(file.sync(), Err(Error::FileSyncFailed(..))));
    }

    #[test]
    fn test_free_space() {
        let storage = Storage::default();
        assert_eq!(storage.free_space().unwrap(), u64::MAX);
        storage.set_free_space(1024);
        assert_eq!(storage.clone().free_space().unwrap(), 1024);
    }

    #[test]
    fn test_corrupt() {
        let storage = Storage::default();
        let file = storage.open("corrupt", true).unwrap();
        file.write_at(&[0; 4], 0).unwrap();
        storage.corrupt("corrupt", 1, &[9, 9]).unwrap();
        assert_eq!(storage.contents("corrupt").unwrap(), vec![0, 9, 9, 0]);
    }
}
