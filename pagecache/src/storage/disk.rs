//! [crate::storage::Storage] backed by files in a directory of the local file system.

use super::validate_name;
use crate::Error;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Files stored in a single directory.
#[derive(Clone)]
pub struct Storage {
    lock: Arc<Mutex<()>>,
    directory: PathBuf,
}

impl Storage {
    /// Use `directory` (created if missing on first open) to hold files.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl super::Storage for Storage {
    type File = File;

    fn open(&self, name: &str, create: bool) -> Result<File, Error> {
        validate_name(name)?;
        let _guard = self.lock.lock().unwrap();

        if create {
            fs::create_dir_all(&self.directory)
                .map_err(|e| Error::FileOpenFailed(name.into(), e))?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(self.directory.join(name))
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::FileMissing(name.into()),
                _ => Error::FileOpenFailed(name.into(), e),
            })?;
        Ok(File {
            name: name.into(),
            file: Arc::new(file),
        })
    }

    fn exists(&self, name: &str) -> Result<bool, Error> {
        validate_name(name)?;
        Ok(self.directory.join(name).is_file())
    }

    fn remove(&self, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        let _guard = self.lock.lock().unwrap();
        fs::remove_file(self.directory.join(name)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::FileMissing(name.into()),
            _ => Error::FileRemoveFailed(name.into(), e),
        })
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        validate_name(from)?;
        validate_name(to)?;
        let _guard = self.lock.lock().unwrap();
        let target = self.directory.join(to);
        if target.exists() {
            return Err(Error::FileRenameFailed(
                from.into(),
                to.into(),
                ErrorKind::AlreadyExists.into(),
            ));
        }
        fs::rename(self.directory.join(from), target).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::FileMissing(from.into()),
            _ => Error::FileRenameFailed(from.into(), to.into(), e),
        })
    }

    #[cfg(unix)]
    fn free_space(&self) -> Result<u64, Error> {
        use std::{ffi::CString, os::unix::ffi::OsStrExt};

        // Query the closest existing ancestor so free space can be checked before any file exists.
        let mut path = self.directory.as_path();
        while !path.exists() {
            path = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
        }
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::FileNameInvalid(path.display().to_string()))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: `c_path` is a valid NUL-terminated string and `stat` is a valid out pointer.
        let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if result != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn free_space(&self) -> Result<u64, Error> {
        Ok(u64::MAX)
    }
}

/// A file on the local file system.
pub struct File {
    name: String,
    file: Arc<fs::File>,
}

impl super::File for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file
                .read_exact_at(buf, offset)
                .map_err(|e| match e.kind() {
                    ErrorKind::UnexpectedEof => Error::InsufficientLength,
                    _ => Error::ReadFailed,
                })?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut read = 0;
            while read < buf.len() {
                let n = self
                    .file
                    .seek_read(&mut buf[read..], offset + read as u64)
                    .map_err(|_| Error::ReadFailed)?;
                if n == 0 {
                    return Err(Error::InsufficientLength);
                }
                read += n;
            }
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file
                .write_all_at(buf, offset)
                .map_err(|_| Error::WriteFailed)?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut written = 0;
            while written < buf.len() {
                let n = self
                    .file
                    .seek_write(&buf[written..], offset + written as u64)
                    .map_err(|_| Error::WriteFailed)?;
                written += n;
            }
        }
        Ok(())
    }

    fn size(&self) -> Result<u64, Error> {
        Ok(self.file.metadata().map_err(|_| Error::ReadFailed)?.len())
    }

    fn resize(&self, len: u64) -> Result<(), Error> {
        self.file
            .set_len(len)
            .map_err(|e| Error::FileResizeFailed(self.name.clone(), e))
    }

    fn sync(&self) -> Result<(), Error> {
        self.file
            .sync_all()
            .map_err(|e| Error::FileSyncFailed(self.name.clone(), e))
    }
}
