//! Fid-tagged log files.
//!
//! A log file is a preallocated append-only file owned by one category.
//! The in-memory `offset` is the logical end of data, not the physical
//! file size; recovery advances it past every valid entry and appends
//! land strictly at `offset`.

mod entry;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

pub use entry::{EntryStatus, LogEntry};
pub(crate) use entry::{
    decode_header, encode_entry, put_varint_i64, read_varint_i64, recompute_crc, MAX_HEADER_SIZE,
};

use crate::error::{Error, Result};
use crate::io::{open_controller, IoController, IoKind};

pub(crate) const FILE_PREFIX: &str = "log";

/// The five value categories, each with its own family of log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Str,
    List,
    Hash,
    Set,
    ZSet,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Str,
        Category::List,
        Category::Hash,
        Category::Set,
        Category::ZSet,
    ];

    /// Short tag used in file names.
    pub(crate) fn tag(self) -> &'static str {
        match self {
            Category::Str => "strs",
            Category::List => "list",
            Category::Hash => "hash",
            Category::Set => "sets",
            Category::ZSet => "zset",
        }
    }

    pub(crate) fn from_tag(tag: &str) -> Option<Category> {
        match tag {
            "strs" => Some(Category::Str),
            "list" => Some(Category::List),
            "hash" => Some(Category::Hash),
            "sets" => Some(Category::Set),
            "zset" => Some(Category::ZSet),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Category::Str => 0,
            Category::List => 1,
            Category::Hash => 2,
            Category::Set => 3,
            Category::ZSet => 4,
        }
    }
}

/// `log.<tag>.<NNNNNNNN>` under `dir`.
pub(crate) fn log_file_path(dir: &Path, category: Category, fid: u32) -> PathBuf {
    dir.join(format!("{}.{}.{:08}", FILE_PREFIX, category.tag(), fid))
}

/// Parses a file name produced by [`log_file_path`]; returns `None` for
/// anything else in the directory.
pub(crate) fn parse_log_file_name(name: &str) -> Option<(Category, u32)> {
    let mut parts = name.split('.');
    if parts.next()? != FILE_PREFIX {
        return None;
    }
    let category = Category::from_tag(parts.next()?)?;
    let fid: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((category, fid))
}

/// One open log file. Append serialisation is the caller's job (the engine
/// holds the category append lock); `lock` only arbitrates readers against
/// file retirement by merge.
pub(crate) struct LogFile {
    pub(crate) fid: u32,
    offset: AtomicU64,
    io: Box<dyn IoController>,
    pub(crate) lock: RwLock<()>,
}

impl LogFile {
    /// Opens or creates the backing file preallocated to `size` bytes.
    /// The returned handle has `offset == 0`; recovery advances it.
    pub(crate) fn open(
        dir: &Path,
        fid: u32,
        size: u64,
        category: Category,
        kind: IoKind,
    ) -> Result<LogFile> {
        let path = log_file_path(dir, category, fid);
        let io = open_controller(kind, &path, size)
            .map_err(|e| Error::OpenLogFailed(format!("{}: {e}", path.display())))?;
        Ok(LogFile {
            fid,
            offset: AtomicU64::new(0),
            io,
            lock: RwLock::new(()),
        })
    }

    /// Logical end of data.
    pub(crate) fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Used by recovery to place `offset` at the last good entry boundary.
    pub(crate) fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    /// Appends `buf` at the current offset and advances it, returning the
    /// offset the buffer was written at.
    pub(crate) fn append(&self, buf: &[u8]) -> Result<u64> {
        let write_at = self.offset.load(Ordering::Acquire);
        let written = self.io.write_at(buf, write_at)?;
        if written != buf.len() {
            return Err(Error::ShortWrite {
                written,
                expected: buf.len(),
            });
        }
        self.offset.fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(write_at)
    }

    /// Reads the entry at `offset`, returning it with its encoded size.
    ///
    /// Returns [`Error::EndOfLog`] at the zeroed sentinel and
    /// [`Error::CorruptEntry`] on checksum mismatch or a torn record.
    pub(crate) fn read_entry(&self, offset: u64) -> Result<(LogEntry, usize)> {
        let mut header_buf = [0u8; MAX_HEADER_SIZE];
        let n = self.io.read_at(&mut header_buf, offset)?;
        if n == 0 || header_buf[..n].iter().all(|&b| b == 0) {
            return Err(Error::EndOfLog);
        }
        let header = decode_header(&header_buf[..n])?;

        let mut kv = vec![0u8; header.ksize + header.vsize];
        let read = self.io.read_at(&mut kv, offset + header.size as u64)?;
        if read != kv.len() {
            return Err(Error::CorruptEntry("torn key/value"));
        }

        let crc = recompute_crc(
            &header_buf[4..header.size],
            &kv[..header.ksize],
            &kv[header.ksize..],
        );
        if crc != header.crc {
            return Err(Error::CorruptEntry("crc mismatch"));
        }

        let mut kv = bytes::Bytes::from(kv);
        let value = kv.split_off(header.ksize);
        let entry = LogEntry {
            key: kv,
            value,
            expires_at: header.expires_at,
            status: header.status,
        };
        Ok((entry, header.size + header.ksize + header.vsize))
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    /// Unlinks the backing file. Callers hold `lock` exclusively first.
    pub(crate) fn delete(&self) -> Result<()> {
        self.io.delete()
    }
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("fid", &self.fid)
            .field("offset", &self.offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log(dir: &Path) -> LogFile {
        LogFile::open(dir, 1, 64 * 1024, Category::Str, IoKind::File).expect("open log")
    }

    #[test]
    fn file_names_round_trip() {
        let dir = Path::new("/data");
        let path = log_file_path(dir, Category::ZSet, 42);
        assert_eq!(path, dir.join("log.zset.00000042"));
        assert_eq!(
            parse_log_file_name("log.zset.00000042"),
            Some((Category::ZSet, 42))
        );
        assert_eq!(parse_log_file_name("log.zset"), None);
        assert_eq!(parse_log_file_name("wal.strs.00000001"), None);
        assert_eq!(parse_log_file_name("log.blob.00000001"), None);
    }

    #[test]
    fn append_then_read_back() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let lf = open_log(dir.path());

        let first = LogEntry::new(&b"alpha"[..], &b"1"[..]);
        let second = LogEntry::new(&b"beta"[..], &b"2"[..]).with_expiry(1_700_000_000);

        let (buf1, size1) = encode_entry(&first);
        let (buf2, size2) = encode_entry(&second);
        assert_eq!(lf.append(&buf1)?, 0);
        assert_eq!(lf.append(&buf2)?, size1 as u64);
        assert_eq!(lf.offset(), (size1 + size2) as u64);

        let (decoded, used) = lf.read_entry(0)?;
        assert_eq!(decoded, first);
        assert_eq!(used, size1);
        let (decoded, used) = lf.read_entry(size1 as u64)?;
        assert_eq!(decoded, second);
        assert_eq!(used, size2);
        Ok(())
    }

    #[test]
    fn scan_stops_at_end_of_log() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let lf = open_log(dir.path());
        let (buf, size) = encode_entry(&LogEntry::new(&b"k"[..], &b"v"[..]));
        lf.append(&buf)?;

        assert!(matches!(
            lf.read_entry(size as u64),
            Err(Error::EndOfLog)
        ));
        Ok(())
    }

    #[test]
    fn tampered_entry_reports_corruption() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let lf = open_log(dir.path());
        let (mut buf, _) = encode_entry(&LogEntry::new(&b"key"[..], &b"value"[..]));
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        lf.append(&buf)?;

        assert!(matches!(
            lf.read_entry(0),
            Err(Error::CorruptEntry(_))
        ));
        Ok(())
    }
}
