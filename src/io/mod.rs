//! Positioned file I/O.
//!
//! Log and discard files are preallocated to their configured size on open
//! and accessed exclusively through positioned reads and writes; no file
//! cursor is shared between callers. The trait seam exists so an mmap or
//! uring backend can be slotted in without touching call sites.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Available I/O backends. Only buffered file I/O is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoKind {
    #[default]
    File,
}

/// Uniform access to a preallocated regular file.
pub(crate) trait IoController: Send + Sync {
    /// Writes `buf` at `offset`, returning the number of bytes written.
    /// Callers must treat a short count as fatal for the write.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Reads into `buf` from `offset`, returning the number of bytes read.
    /// A count short of `buf.len()` means the physical end of the file was
    /// reached.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Commits file contents to stable storage.
    fn sync(&self) -> Result<()>;

    /// Removes the backing file. The handle must not be used afterwards.
    fn delete(&self) -> Result<()>;

    /// Reads exactly `buf.len()` bytes or fails.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let n = self.read_at(buf, offset)?;
        if n != buf.len() {
            return Err(Error::CorruptEntry("short positioned read"));
        }
        Ok(())
    }

    /// Writes the whole buffer or fails with [`Error::ShortWrite`].
    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let n = self.write_at(buf, offset)?;
        if n != buf.len() {
            return Err(Error::ShortWrite {
                written: n,
                expected: buf.len(),
            });
        }
        Ok(())
    }
}

pub(crate) fn open_controller(
    kind: IoKind,
    path: &Path,
    size: u64,
) -> Result<Box<dyn IoController>> {
    match kind {
        IoKind::File => Ok(Box::new(FileIo::open(path, size)?)),
    }
}

/// Standard file I/O over a preallocated file.
#[derive(Debug)]
pub(crate) struct FileIo {
    file: File,
    path: PathBuf,
}

impl FileIo {
    /// Opens (or creates) `path` and extends it to `size` bytes if it is
    /// currently shorter. Existing longer files are left untouched.
    pub(crate) fn open(path: &Path, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidParam("file size must be positive"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl IoController for FileIo {
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut written = 0usize;
        while written < buf.len() {
            match self.file.write_at(&buf[written..], offset + written as u64) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut read = 0usize;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preallocates_to_requested_size() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("io-test");
        let io = FileIo::open(&path, 4096)?;
        assert_eq!(std::fs::metadata(&path)?.len(), 4096);
        drop(io);

        // reopening with a smaller size must not shrink the file
        let _io = FileIo::open(&path, 1024)?;
        assert_eq!(std::fs::metadata(&path)?.len(), 4096);
        Ok(())
    }

    #[test]
    fn positioned_write_then_read_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let io = FileIo::open(&dir.path().join("io-test"), 4096)?;

        assert_eq!(io.write_at(b"hello", 100)?, 5);
        let mut buf = [0u8; 5];
        assert_eq!(io.read_at(&mut buf, 100)?, 5);
        assert_eq!(&buf, b"hello");

        // unwritten preallocated space reads back as zeroes
        let mut zeroes = [0xffu8; 8];
        assert_eq!(io.read_at(&mut zeroes, 200)?, 8);
        assert_eq!(zeroes, [0u8; 8]);
        Ok(())
    }

    #[test]
    fn read_past_physical_end_is_short() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let io = FileIo::open(&dir.path().join("io-test"), 64)?;
        let mut buf = [0u8; 32];
        assert_eq!(io.read_at(&mut buf, 48)?, 16);
        assert_eq!(io.read_at(&mut buf, 64)?, 0);
        Ok(())
    }

    #[test]
    fn delete_removes_backing_file() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("io-test");
        let io = FileIo::open(&path, 64)?;
        io.delete()?;
        assert!(!path.exists());
        Ok(())
    }
}
