//! Files backing cached pages.
//!
//! The cache only performs positional reads and writes of whole pages, so the file abstraction is
//! narrow. Two implementations are provided: [memory::Storage] for tests and
//! [disk::Storage] for files in a directory on the local file system.

use crate::Error;

pub mod disk;
pub mod memory;

/// A collection of named files.
pub trait Storage: Clone + Send + Sync + 'static {
    /// The file handle returned by [Storage::open].
    type File: File;

    /// Open the file with the given `name`, creating it (empty) if `create` is set.
    fn open(&self, name: &str, create: bool) -> Result<Self::File, Error>;

    /// Whether a file with the given `name` exists.
    fn exists(&self, name: &str) -> Result<bool, Error>;

    /// Remove the file with the given `name`.
    fn remove(&self, name: &str) -> Result<(), Error>;

    /// Rename a file. Open handles keep referring to the renamed file.
    fn rename(&self, from: &str, to: &str) -> Result<(), Error>;

    /// Bytes available to new data.
    fn free_space(&self) -> Result<u64, Error>;
}

/// A file that supports positional I/O.
pub trait File: Send + Sync + 'static {
    /// Fill `buf` with the bytes starting at `offset`.
    ///
    /// Returns [Error::InsufficientLength] if the file ends before `buf` is filled.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error>;

    /// Write `buf` at `offset`, extending the file if needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error>;

    /// The current size of the file in bytes.
    fn size(&self) -> Result<u64, Error>;

    /// Set the size of the file, zero-filling or truncating as needed.
    fn resize(&self, len: u64) -> Result<(), Error>;

    /// Make all written data durable.
    fn sync(&self) -> Result<(), Error>;
}

/// Validates that a file name contains only allowed characters.
///
/// Allowed characters are: `a-z`, `A-Z`, `0-9`, `-`, `_` and `.`. Names may not start with a `.`.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::FileNameInvalid(name.into()));
    }
    Ok(())
}
