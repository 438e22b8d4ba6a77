//! The file abstraction the memory subsystem reads and writes through.

pub mod tempfs;

use alloc::sync::Arc;

/// Shared handle to an open file. Dropping the last clone closes it.
pub type FileRef = Arc<dyn File>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// file no longer exists
    NotFound,
    /// descriptor is not open, or is reserved
    BadDescriptor,
    /// descriptor table is full
    TooManyOpenFiles,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::BadDescriptor => write!(f, "bad file descriptor"),
            Self::TooManyOpenFiles => write!(f, "too many open files"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// An open file.
///
/// Offsets are absolute; there is no file position. Files do not grow: a write
/// running past the end stops at the end and reports the shorter count.
pub trait File: Send + Sync {
    /// Read into `buf` starting at `offset`, returning the number of bytes read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    /// Write `buf` starting at `offset`, returning the number of bytes written.
    ///
    /// While writes are denied this writes nothing and returns `Ok(0)`.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    /// Length of the file in bytes.
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Open a new, independent handle to the same file.
    fn reopen(&self) -> Result<FileRef>;
    /// Deny writes to the underlying file through any handle until this handle
    /// calls [`File::allow_write`] or is closed.
    fn deny_write(&self);
    /// Undo a previous [`File::deny_write`] through this handle.
    fn allow_write(&self);
}
