use super::{Error, File, FileRef, Result};
use crate::sync::mutex::Mutex;
use alloc::{sync::Arc, vec, vec::Vec};
use core::cmp::min;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct TempINode {
    data: Mutex<Vec<u8>>,
    deny_write_count: AtomicUsize,
    removed: AtomicBool,
}

/// An open handle to an in-memory file of fixed length.
pub struct TempFile {
    inode: Arc<TempINode>,
    /// Whether this handle currently holds a write denial.
    denying: AtomicBool,
}

impl TempFile {
    /// Create a file holding `contents` and return the first handle to it.
    pub fn with_contents(contents: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            inode: Arc::new(TempINode {
                data: Mutex::new(contents.to_vec()),
                deny_write_count: AtomicUsize::new(0),
                removed: AtomicBool::new(false),
            }),
            denying: AtomicBool::new(false),
        })
    }

    /// Create a zero-filled file of `len` bytes.
    pub fn zeroed(len: usize) -> Arc<Self> {
        Self::with_contents(&vec![0; len])
    }

    /// Unlink the file. Open handles keep working but it can no longer be
    /// reopened.
    pub fn remove(&self) {
        self.inode.removed.store(true, Ordering::Release);
    }

    /// Snapshot of the whole file.
    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }
}

impl File for TempFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.inode.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let count = min(buf.len(), data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.inode.deny_write_count.load(Ordering::Acquire) > 0 {
            return Ok(0);
        }
        let mut data = self.inode.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let count = min(buf.len(), data.len() - start);
        data[start..start + count].copy_from_slice(&buf[..count]);
        Ok(count)
    }

    fn len(&self) -> u64 {
        self.inode.data.lock().len() as u64
    }

    fn reopen(&self) -> Result<FileRef> {
        if self.inode.removed.load(Ordering::Acquire) {
            return Err(Error::NotFound);
        }
        Ok(Arc::new(TempFile {
            inode: self.inode.clone(),
            denying: AtomicBool::new(false),
        }))
    }

    fn deny_write(&self) {
        if !self.denying.swap(true, Ordering::AcqRel) {
            self.inode.deny_write_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn allow_write(&self) {
        if self.denying.swap(false, Ordering::AcqRel) {
            self.inode.deny_write_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        self.allow_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_write_read() {
        let file = TempFile::zeroed(8);
        assert_eq!(file.write_at(b"hello", 2).unwrap(), 5);
        let mut buf = [0; 10];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 8);
        assert_eq!(&buf[..8], b"\0\0hello\0");
    }

    #[test]
    fn writes_stop_at_end() {
        let file = TempFile::zeroed(4);
        assert_eq!(file.write_at(b"abcdef", 1).unwrap(), 3);
        assert_eq!(file.write_at(b"x", 4).unwrap(), 0);
        assert_eq!(file.contents(), b"\0abc");
        assert_eq!(file.len(), 4);
    }

    #[test]
    fn reopened_handles_share_data() {
        let file = TempFile::with_contents(b"ABCD");
        let other = file.reopen().unwrap();
        assert_eq!(other.write_at(b"WX", 0).unwrap(), 2);
        assert_eq!(file.contents(), b"WXCD");
    }

    #[test]
    fn deny_write_until_allowed_or_closed() {
        let file = TempFile::with_contents(b"ABCD");
        let other = file.reopen().unwrap();

        file.deny_write();
        assert_eq!(other.write_at(b"Z", 0).unwrap(), 0);
        file.allow_write();
        assert_eq!(other.write_at(b"Z", 0).unwrap(), 1);

        other.deny_write();
        drop(other);
        assert_eq!(file.write_at(b"Y", 0).unwrap(), 1);
        assert_eq!(file.contents(), b"YBCD");
    }

    #[test]
    fn removed_file_cannot_be_reopened() {
        let file = TempFile::with_contents(b"ABCD");
        let other = file.reopen().unwrap();
        file.remove();
        assert_eq!(file.reopen().err(), Some(Error::NotFound));

        let mut buf = [0; 4];
        assert_eq!(other.read_at(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"ABCD");
    }
}
