//! Merge (garbage collection).
//!
//! A pass over one category: pick every archived file whose discarded
//! ratio exceeds the threshold, rewrite its still-live entries into the
//! active log, then drop the file and its discard slot. Liveness is
//! decided by `(fid, offset)` identity against the current index, which
//! is what keeps a concurrent writer's newer version from being
//! resurrected.
//!
//! At most one merge per category should run at a time; an I/O error
//! aborts the pass with the category still consistent (rewritten entries
//! are already indexed at their new position and the source file is only
//! deleted after its scan completed).

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::{expired, unix_now};
use crate::error::{Error, Result};
use crate::index::IndexTree;
use crate::logfile::{Category, EntryStatus, LogEntry};

impl super::Db {
    /// Runs one merge pass over `category` with the given ratio threshold.
    pub fn merge(&self, category: Category, gc_ratio: f64) -> Result<()> {
        let files = self.category_files(category);
        let discard = self.discard(category);

        let Some(_merge_guard) = files.merge_lock.try_lock() else {
            // another pass is already compacting this category
            return Ok(());
        };

        discard.sync()?;
        let ccl = discard.candidates(files.active_fid(), gc_ratio)?;
        if ccl.is_empty() {
            return Ok(());
        }
        debug!(
            category = category.tag(),
            candidates = ccl.len(),
            "merge pass start"
        );

        for fid in ccl {
            let Some(archived) = files.archived.get(&fid) else {
                // slot left behind by a file that is already gone
                discard.remove(fid)?;
                continue;
            };

            {
                let _scan_guard = archived.lock.read();
                let now = unix_now();
                let mut offset = 0u64;
                loop {
                    match archived.read_entry(offset) {
                        Ok((entry, size)) => {
                            let entry_offset = offset;
                            offset += size as u64;
                            if entry.status == EntryStatus::Deleted || expired(&entry, now) {
                                continue;
                            }
                            self.merge_entry(category, fid, entry_offset, &entry)?;
                        }
                        Err(Error::EndOfLog) => break,
                        Err(Error::CorruptEntry(reason)) => {
                            warn!(fid, offset, reason, "corrupt entry ends merge scan");
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            // retire: remove from the registry and unlink, holding the
            // shard across both steps and the file lock across the unlink
            let shard = files.archived.shard(&fid);
            let mut registry = shard.write();
            if let Some(file) = registry.remove(&fid) {
                let _write_guard = file.lock.write();
                file.delete()?;
            }
            drop(registry);

            files.drop_fid(fid);
            discard.clear(fid)?;
            debug!(category = category.tag(), fid, "merged and removed log file");
        }
        Ok(())
    }

    /// Rewrites one still-live entry into the active log and repoints the
    /// index at the copy. A stale `(fid, offset)` means a writer already
    /// superseded this entry; it is simply skipped.
    fn merge_entry(
        &self,
        category: Category,
        fid: u32,
        offset: u64,
        entry: &LogEntry,
    ) -> Result<()> {
        match category {
            Category::Str => {
                let mut tree = self.str_index.write();
                if points_here(tree.get(&entry.key), fid, offset) {
                    let pos = self.write_log_entry(category, entry)?;
                    tree.put(entry.key.to_vec(), pos);
                }
                Ok(())
            }
            Category::Hash => self.merge_subkey_entry(category, &self.hash_index, fid, offset, entry),
            Category::List => self.merge_subkey_entry(category, &self.list_index, fid, offset, entry),
            Category::Set => {
                let sum = super::set::member_hash(&entry.value);
                let mut map = self.set_index.write();
                let Some(tree) = map.get_mut(entry.key.as_ref()) else {
                    return Ok(());
                };
                if points_here(tree.get(&sum), fid, offset) {
                    let pos = self.write_log_entry(category, entry)?;
                    tree.put(sum.to_vec(), pos);
                }
                Ok(())
            }
            Category::ZSet => {
                let (outer, _) = crate::index::decode_compound_key(&entry.key)?;
                let outer = outer.to_vec();
                let mut map = self.zset_index.write();
                let Some(index) = map.get_mut(&outer) else {
                    return Ok(());
                };
                if points_here(index.tree.get(&entry.key), fid, offset) {
                    let pos = self.write_log_entry(category, entry)?;
                    index.tree.put(entry.key.to_vec(), pos);
                }
                Ok(())
            }
        }
    }

    fn merge_subkey_entry(
        &self,
        category: Category,
        index: &RwLock<FxHashMap<Vec<u8>, IndexTree>>,
        fid: u32,
        offset: u64,
        entry: &LogEntry,
    ) -> Result<()> {
        let (outer, _) = crate::index::decode_compound_key(&entry.key)?;
        let outer = outer.to_vec();
        let mut map = index.write();
        let Some(tree) = map.get_mut(&outer) else {
            return Ok(());
        };
        if points_here(tree.get(&entry.key), fid, offset) {
            let pos = self.write_log_entry(category, entry)?;
            tree.put(entry.key.to_vec(), pos);
        }
        Ok(())
    }
}

/// Only the exact `(fid, offset)` the index records is the live version.
fn points_here(ptr: Option<crate::index::ValuePointer>, fid: u32, offset: u64) -> bool {
    matches!(ptr, Some(p) if p.fid == fid && p.offset == offset)
}
