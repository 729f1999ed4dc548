//! Engine core.
//!
//! `Db` owns, per category: the active log file, the archived-file
//! registry, the discard accounting, and the in-memory index. Writers
//! append to the active log and upsert the index; readers resolve a
//! pointer through the index and read the record back; merge rewrites
//! live records out of heavily-discarded archived files.
//!
//! Locking discipline (taken in this order, never reversed):
//! category index lock -> category append lock -> per-file lock ->
//! archived-shard lock. No lock is held across `sync` of another
//! category. Discard state has its own mutex at the bottom.

mod batch;
mod hash;
mod list;
mod merge;
mod set;
mod strs;
mod zset;

pub use batch::WriteBatch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::config::Config;
use crate::discard::{Discard, DiscardRecord, DISCARD_DIR, DISCARD_FILE_SUFFIX};
use crate::error::{Error, Result};
use crate::index::skiplist::SkipList;
use crate::index::{decode_compound_key, IndexTree, ValuePointer};
use crate::logfile::{
    encode_entry, parse_log_file_name, Category, EntryStatus, LogEntry, LogFile,
};
use crate::sharded::{fid_sharding, ShardedMap};

/// Absolute unix seconds, the clock expiries are measured against.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Log files of one category.
pub(crate) struct CategoryFiles {
    /// Serialises append + rollover.
    append_lock: Mutex<()>,
    /// Held for a whole merge pass; at most one merge per category runs
    /// at a time.
    pub(crate) merge_lock: Mutex<()>,
    active: RwLock<Arc<LogFile>>,
    pub(crate) archived: ShardedMap<u32, Arc<LogFile>>,
    fids: RwLock<Vec<u32>>,
}

impl CategoryFiles {
    pub(crate) fn active(&self) -> Arc<LogFile> {
        self.active.read().clone()
    }

    pub(crate) fn active_fid(&self) -> u32 {
        self.active.read().fid
    }

    /// Every open file of the category, ascending by fid.
    fn ordered_files(&self) -> Vec<Arc<LogFile>> {
        let mut fids = self.fids.read().clone();
        fids.sort_unstable();
        let active = self.active();
        fids.into_iter()
            .filter_map(|fid| {
                if fid == active.fid {
                    Some(active.clone())
                } else {
                    self.archived.get(&fid)
                }
            })
            .collect()
    }

    pub(crate) fn drop_fid(&self, fid: u32) {
        self.fids.write().retain(|f| *f != fid);
    }
}

/// Sorted-set index: the pointer tree plus the rank skip list.
#[derive(Default)]
pub(crate) struct ZSetIndex {
    pub(crate) tree: IndexTree,
    pub(crate) skl: SkipList,
}

/// An embedded log-structured multi-structure key-value store.
///
/// All methods take `&self`; a `Db` wrapped in `Arc` is safe to share
/// across threads. The on-disk directory is owned exclusively by one
/// instance at a time — nothing prevents concurrent opens, per the
/// single-process ownership contract.
pub struct Db {
    pub(crate) cfg: Config,
    files: [CategoryFiles; 5],
    discards: [Discard; 5],
    pub(crate) str_index: RwLock<IndexTree>,
    pub(crate) hash_index: RwLock<FxHashMap<Vec<u8>, IndexTree>>,
    pub(crate) list_index: RwLock<FxHashMap<Vec<u8>, IndexTree>>,
    pub(crate) set_index: RwLock<FxHashMap<Vec<u8>, IndexTree>>,
    pub(crate) zset_index: RwLock<FxHashMap<Vec<u8>, ZSetIndex>>,
    closed: AtomicBool,
}

impl Db {
    /// Opens the engine rooted at `cfg.db_path`, creating the directory
    /// layout if needed and rebuilding every category index from the logs.
    pub fn open(cfg: Config) -> Result<Db> {
        std::fs::create_dir_all(&cfg.db_path)?;
        let discard_dir = cfg.db_path.join(DISCARD_DIR);
        std::fs::create_dir_all(&discard_dir)?;

        let mut discards = Vec::with_capacity(5);
        for category in Category::ALL {
            let name = format!("{}{}", category.tag(), DISCARD_FILE_SUFFIX);
            discards.push(Discard::open(&discard_dir, &name, cfg.discard_buffer_size)?);
        }
        let discards: [Discard; 5] = discards
            .try_into()
            .unwrap_or_else(|_| unreachable!("five categories"));

        let files = build_log_files(&cfg, &discards)?;

        // rebuild the five indexes in parallel, one thread per category
        let (str_index, hash_index, list_index, set_index, zset_index) =
            std::thread::scope(|s| -> Result<_> {
                let str_h = s.spawn(|| build_str_index(&files[Category::Str.index()]));
                let hash_h = s.spawn(|| build_subkey_index(&files[Category::Hash.index()]));
                let list_h = s.spawn(|| build_subkey_index(&files[Category::List.index()]));
                let set_h = s.spawn(|| build_set_index(&files[Category::Set.index()]));
                let zset_h = s.spawn(|| build_zset_index(&files[Category::ZSet.index()]));
                Ok((
                    join_build(str_h)?,
                    join_build(hash_h)?,
                    join_build(list_h)?,
                    join_build(set_h)?,
                    join_build(zset_h)?,
                ))
            })?;

        debug!(path = %cfg.db_path.display(), "engine opened");
        Ok(Db {
            cfg,
            files,
            discards,
            str_index: RwLock::new(str_index),
            hash_index: RwLock::new(hash_index),
            list_index: RwLock::new(list_index),
            set_index: RwLock::new(set_index),
            zset_index: RwLock::new(zset_index),
            closed: AtomicBool::new(false),
        })
    }

    /// Flushes every active log file and discard file to stable storage.
    pub fn sync(&self) -> Result<()> {
        for files in &self.files {
            files.active().sync()?;
        }
        for discard in &self.discards {
            discard.sync()?;
        }
        Ok(())
    }

    /// Syncs all files, stops the discard consumers and releases them.
    /// Idempotent; also invoked on drop.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for files in &self.files {
            files.active().sync()?;
            for archived in files.archived.values() {
                archived.sync()?;
            }
        }
        for discard in &self.discards {
            discard.close()?;
        }
        Ok(())
    }

    pub(crate) fn category_files(&self, category: Category) -> &CategoryFiles {
        &self.files[category.index()]
    }

    pub(crate) fn discard(&self, category: Category) -> &Discard {
        &self.discards[category.index()]
    }

    /// Appends `entry` to the category's active log, rolling over to a new
    /// fid when the configured cap would be exceeded. Returns the position
    /// the entry was written at.
    pub(crate) fn write_log_entry(
        &self,
        category: Category,
        entry: &LogEntry,
    ) -> Result<ValuePointer> {
        let files = self.category_files(category);
        let _guard = files.append_lock.lock();

        let (buf, size) = encode_entry(entry);
        let mut active = files.active();
        if active.offset() + size as u64 > self.cfg.max_log_file_size {
            active.sync()?;
            let new_fid = active.fid + 1;
            let new_active = Arc::new(LogFile::open(
                &self.cfg.db_path,
                new_fid,
                self.cfg.max_log_file_size,
                category,
                self.cfg.io_kind,
            )?);
            debug!(category = category.tag(), fid = new_fid, "log rollover");

            files.archived.insert(active.fid, active.clone());
            files.fids.write().push(new_fid);
            self.discard(category)
                .set_total(new_fid, clamp_u32(self.cfg.max_log_file_size))?;
            *files.active.write() = new_active.clone();
            active = new_active;
        }

        let offset = active.append(&buf)?;
        Ok(ValuePointer {
            fid: active.fid,
            offset,
            entry_size: size as u32,
            expires_at: entry.expires_at,
        })
    }

    /// Reads the entry a pointer refers to, from the active or an archived
    /// log file.
    pub(crate) fn read_log_entry(
        &self,
        category: Category,
        fid: u32,
        offset: u64,
    ) -> Result<LogEntry> {
        let files = self.category_files(category);
        let active = files.active();
        let file = if active.fid == fid {
            active
        } else {
            files
                .archived
                .get(&fid)
                .ok_or(Error::LogFileMissing(fid))?
        };
        let _guard = file.lock.read();
        let (entry, _) = file.read_entry(offset)?;
        Ok(entry)
    }

    /// Resolves a pointer to its live value: lazily evicts expired keys
    /// and treats tombstones (reachable only through races with merge) as
    /// missing.
    pub(crate) fn read_pointer(&self, category: Category, ptr: ValuePointer) -> Result<Bytes> {
        if ptr.expires_at != 0 && ptr.expires_at <= unix_now() {
            return Err(Error::KeyNotFound);
        }
        let entry = self.read_log_entry(category, ptr.fid, ptr.offset)?;
        if entry.status == EntryStatus::Deleted {
            return Err(Error::KeyNotFound);
        }
        Ok(entry.value)
    }

    /// Forwards a displaced pointer to the category's discard accounting.
    pub(crate) fn send_discard(
        &self,
        category: Category,
        old: Option<ValuePointer>,
    ) -> Result<()> {
        if let Some(old) = old {
            if old.entry_size > 0 {
                self.discard(category).send(DiscardRecord {
                    fid: old.fid,
                    bytes: old.entry_size,
                })?;
            }
        }
        Ok(())
    }

    /// Discard accounting for a tombstone the writer just appended; the
    /// tombstone itself is reclaimable once the merge pass drops it.
    pub(crate) fn send_tombstone_discard(
        &self,
        category: Category,
        pos: &ValuePointer,
    ) -> Result<()> {
        self.discard(category).send(DiscardRecord {
            fid: pos.fid,
            bytes: pos.entry_size,
        })
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "close on drop failed");
        }
    }
}

fn clamp_u32(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

fn join_build<T>(handle: std::thread::ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| Error::OpenLogFailed("index build thread panicked".into()))?
}

/// Enumerates `log.<cat>.<fid>` files and opens each category's family:
/// highest fid becomes the active file, the rest go to the archived
/// registry. Categories with no files get a fresh fid-1 active log.
fn build_log_files(cfg: &Config, discards: &[Discard; 5]) -> Result<[CategoryFiles; 5]> {
    let mut fids_per_category: [Vec<u32>; 5] = Default::default();
    for dirent in std::fs::read_dir(&cfg.db_path)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((category, fid)) = parse_log_file_name(name) {
            fids_per_category[category.index()].push(fid);
        }
    }

    let mut out = Vec::with_capacity(5);
    for category in Category::ALL {
        let fids = &mut fids_per_category[category.index()];
        fids.sort_unstable();

        let archived = ShardedMap::with_sharding(cfg.index_shard_count, fid_sharding);
        let active = if let Some((&last, rest)) = fids.split_last() {
            for &fid in rest {
                let file = LogFile::open(
                    &cfg.db_path,
                    fid,
                    cfg.max_log_file_size,
                    category,
                    cfg.io_kind,
                )?;
                archived.insert(fid, Arc::new(file));
            }
            Arc::new(LogFile::open(
                &cfg.db_path,
                last,
                cfg.max_log_file_size,
                category,
                cfg.io_kind,
            )?)
        } else {
            fids.push(1);
            let file = Arc::new(LogFile::open(
                &cfg.db_path,
                1,
                cfg.max_log_file_size,
                category,
                cfg.io_kind,
            )?);
            discards[category.index()].set_total(1, clamp_u32(cfg.max_log_file_size))?;
            file
        };

        out.push(CategoryFiles {
            append_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
            active: RwLock::new(active),
            archived,
            fids: RwLock::new(fids.clone()),
        });
    }
    Ok(out
        .try_into()
        .unwrap_or_else(|_| unreachable!("five categories")))
}

/// Drives `apply` over every valid entry of `file`, then leaves the file's
/// offset at the last good entry boundary. A crc failure or torn record
/// ends the scan for this file: for the active log that truncates the torn
/// tail, which later appends overwrite.
fn scan_log<F>(file: &LogFile, mut apply: F) -> Result<()>
where
    F: FnMut(ValuePointer, &LogEntry) -> Result<()>,
{
    let mut offset = 0u64;
    loop {
        match file.read_entry(offset) {
            Ok((entry, size)) => {
                let ptr = ValuePointer {
                    fid: file.fid,
                    offset,
                    entry_size: size as u32,
                    expires_at: entry.expires_at,
                };
                apply(ptr, &entry)?;
                offset += size as u64;
            }
            Err(Error::EndOfLog) => break,
            Err(Error::CorruptEntry(reason)) => {
                warn!(fid = file.fid, offset, reason, "torn log tail, truncating scan");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    file.set_offset(offset);
    Ok(())
}

fn expired(entry: &LogEntry, now: i64) -> bool {
    entry.expires_at != 0 && entry.expires_at <= now
}

fn build_str_index(files: &CategoryFiles) -> Result<IndexTree> {
    let mut tree = IndexTree::new();
    let now = unix_now();
    for file in files.ordered_files() {
        scan_log(&file, |ptr, entry| {
            if entry.status == EntryStatus::Deleted || expired(entry, now) {
                tree.delete(&entry.key);
            } else {
                tree.put(entry.key.to_vec(), ptr);
            }
            Ok(())
        })?;
    }
    Ok(tree)
}

/// Index builder shared by hash and list: entries carry compound
/// `(outer, sub)` keys and land in the outer key's tree.
fn build_subkey_index(files: &CategoryFiles) -> Result<FxHashMap<Vec<u8>, IndexTree>> {
    let mut map: FxHashMap<Vec<u8>, IndexTree> = FxHashMap::default();
    let now = unix_now();
    for file in files.ordered_files() {
        scan_log(&file, |ptr, entry| {
            let (outer, _) = decode_compound_key(&entry.key)?;
            let tree = map.entry(outer.to_vec()).or_default();
            if entry.status == EntryStatus::Deleted || expired(entry, now) {
                tree.delete(&entry.key);
            } else {
                tree.put(entry.key.to_vec(), ptr);
            }
            Ok(())
        })?;
    }
    map.retain(|_, tree| !tree.is_empty());
    Ok(map)
}

fn build_set_index(files: &CategoryFiles) -> Result<FxHashMap<Vec<u8>, IndexTree>> {
    let mut map: FxHashMap<Vec<u8>, IndexTree> = FxHashMap::default();
    let now = unix_now();
    for file in files.ordered_files() {
        scan_log(&file, |ptr, entry| {
            let tree = map.entry(entry.key.to_vec()).or_default();
            if entry.status == EntryStatus::Deleted {
                // tombstones carry the member hash as their value
                tree.delete(&entry.value);
            } else if expired(entry, now) {
                tree.delete(&set::member_hash(&entry.value));
            } else {
                tree.put(set::member_hash(&entry.value).to_vec(), ptr);
            }
            Ok(())
        })?;
    }
    map.retain(|_, tree| !tree.is_empty());
    Ok(map)
}

fn build_zset_index(files: &CategoryFiles) -> Result<FxHashMap<Vec<u8>, ZSetIndex>> {
    let mut map: FxHashMap<Vec<u8>, ZSetIndex> = FxHashMap::default();

    // old pointers must be chased back to their file to learn the score
    // they carried, so keep every file addressable by fid
    let files_by_fid: FxHashMap<u32, Arc<LogFile>> = files
        .ordered_files()
        .into_iter()
        .map(|f| (f.fid, f))
        .collect();
    let read_score = |ptr: ValuePointer| -> Result<f64> {
        let file = files_by_fid
            .get(&ptr.fid)
            .ok_or(Error::LogFileMissing(ptr.fid))?;
        let (entry, _) = file.read_entry(ptr.offset)?;
        zset::decode_score(&entry.value)
    };

    let now = unix_now();
    for file in files.ordered_files() {
        scan_log(&file, |ptr, entry| {
            let (outer, member) = decode_compound_key(&entry.key)?;
            let (outer, member) = (outer.to_vec(), member.to_vec());
            let index = map.entry(outer).or_default();
            if entry.status == EntryStatus::Deleted || expired(entry, now) {
                if let Some(old) = index.tree.delete(&entry.key) {
                    index.skl.remove(read_score(old)?, &member);
                }
            } else {
                let score = zset::decode_score(&entry.value)?;
                if let Some(old) = index.tree.put(entry.key.to_vec(), ptr) {
                    index.skl.remove(read_score(old)?, &member);
                }
                index.skl.insert(score, &member);
            }
            Ok(())
        })?;
    }
    map.retain(|_, index| !index.tree.is_empty());
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn small_config(path: &Path) -> Config {
        let mut cfg = Config::new(path);
        cfg.max_log_file_size = 150;
        cfg.discard_buffer_size = 1024;
        cfg
    }

    fn key(n: u32) -> Vec<u8> {
        format!("kvstore-bench-key------{n:09}").into_bytes()
    }

    fn value32() -> Vec<u8> {
        vec![b'v'; 32]
    }

    #[test]
    fn write_positions_roll_over_at_capacity() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let db = Db::open(small_config(dir.path()))?;

        // each entry encodes to 72 bytes; two fit under the 150-byte cap
        let expected = [(1u32, 0u64, 72u32), (1, 72, 72), (2, 0, 72)];
        for (fid, offset, size) in expected {
            let entry = LogEntry::new(key(1), value32());
            let pos = db.write_log_entry(Category::Str, &entry)?;
            assert_eq!((pos.fid, pos.offset, pos.entry_size), (fid, offset, size));
        }
        assert_eq!(db.category_files(Category::Str).active_fid(), 2);
        assert!(db
            .category_files(Category::Str)
            .archived
            .contains(&1));
        Ok(())
    }

    #[test]
    fn read_log_entry_resolves_archived_fids() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let db = Db::open(small_config(dir.path()))?;

        let entries: Vec<LogEntry> = (1..=3)
            .map(|n| LogEntry::new(key(n), value32()))
            .collect();
        let mut positions = Vec::new();
        for entry in &entries {
            positions.push(db.write_log_entry(Category::Str, entry)?);
        }

        for (entry, pos) in entries.iter().zip(&positions) {
            let read = db.read_log_entry(Category::Str, pos.fid, pos.offset)?;
            assert_eq!(&read, entry);
        }
        assert!(matches!(
            db.read_log_entry(Category::Str, 99, 0),
            Err(Error::LogFileMissing(99))
        ));
        Ok(())
    }

    #[test]
    fn reopened_engine_resumes_fids_and_offsets() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        {
            let db = Db::open(small_config(dir.path()))?;
            assert_eq!(db.category_files(Category::Str).active_fid(), 1);
            for n in 1..=3 {
                db.write_log_entry(Category::Str, &LogEntry::new(key(n), value32()))?;
            }
            db.close()?;
        }

        let db = Db::open(small_config(dir.path()))?;
        let files = db.category_files(Category::Str);
        assert_eq!(files.active_fid(), 2);
        assert!(files.archived.contains(&1));
        assert_eq!(files.active().offset(), 72);

        // the next write continues where recovery left off
        let pos = db.write_log_entry(Category::Str, &LogEntry::new(key(4), value32()))?;
        assert_eq!((pos.fid, pos.offset), (2, 72));
        Ok(())
    }

    #[test]
    fn torn_active_tail_is_truncated_on_recovery() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        {
            let db = Db::open(small_config(dir.path()))?;
            db.write_log_entry(Category::Str, &LogEntry::new(key(1), value32()))?;
            db.close()?;
        }

        // flip a byte inside the entry body to tear it
        let path = dir.path().join("log.strs.00000001");
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.write_at(&[0xff], 40)?;

        let db = Db::open(small_config(dir.path()))?;
        let files = db.category_files(Category::Str);
        assert_eq!(files.active().offset(), 0);

        // appends overwrite the torn suffix
        let pos = db.write_log_entry(Category::Str, &LogEntry::new(key(2), value32()))?;
        assert_eq!((pos.fid, pos.offset), (1, 0));
        Ok(())
    }
}
