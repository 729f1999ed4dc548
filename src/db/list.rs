//! List operations.
//!
//! A list is a range of u32 sequence numbers between an exclusive head
//! and tail marker. Elements are log entries keyed by
//! `(key, seq-as-4-LE-bytes)`; the markers themselves live in a
//! `ListMeta` entry keyed by `(key, "")` whose value is
//! `head(u32 LE) ++ tail(u32 LE)`. Every push or pop rewrites the meta
//! entry, so recovery replays to the exact same bounds.

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::index::{encode_compound_key, IndexTree};
use crate::logfile::{Category, EntryStatus, LogEntry};

/// Fresh lists start in the middle of the sequence space so both ends can
/// grow.
const INITIAL_LIST_SEQ: u32 = u32::MAX / 2;

fn meta_key(key: &[u8]) -> Vec<u8> {
    encode_compound_key(key, &[])
}

fn element_key(key: &[u8], seq: u32) -> Vec<u8> {
    encode_compound_key(key, &seq.to_le_bytes())
}

impl super::Db {
    /// Pushes values onto the left end, creating the list if needed.
    pub fn lpush(&self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.push_many(key, values, true, true)
    }

    /// Pushes onto the left end only when the list already exists.
    pub fn lpush_x(&self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.push_many(key, values, true, false)
    }

    /// Pushes values onto the right end, creating the list if needed.
    pub fn rpush(&self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.push_many(key, values, false, true)
    }

    /// Pushes onto the right end only when the list already exists.
    pub fn rpush_x(&self, key: &[u8], values: &[&[u8]]) -> Result<()> {
        self.push_many(key, values, false, false)
    }

    /// Pops from the left end; `None` when the list is empty or absent.
    pub fn lpop(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let mut map = self.list_index.write();
        self.pop_inner(&mut map, key, true)
    }

    /// Pops from the right end; `None` when the list is empty or absent.
    pub fn rpop(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let mut map = self.list_index.write();
        self.pop_inner(&mut map, key, false)
    }

    /// Pops from one list and pushes onto another in a single locked
    /// step. Returns the moved value.
    pub fn lmove(
        &self,
        source: &[u8],
        dest: &[u8],
        from_left: bool,
        to_left: bool,
    ) -> Result<Option<Bytes>> {
        let mut map = self.list_index.write();
        let Some(value) = self.pop_inner(&mut map, source, from_left)? else {
            return Ok(None);
        };
        map.entry(dest.to_vec()).or_default();
        self.push_inner(&mut map, dest, &value, to_left)?;
        Ok(Some(value))
    }

    /// Number of elements in the list.
    pub fn llen(&self, key: &[u8]) -> Result<usize> {
        let map = self.list_index.read();
        let Some(tree) = map.get(key) else {
            return Ok(0);
        };
        let (head, tail) = self.list_meta(tree, key)?;
        Ok((tail - head - 1) as usize)
    }

    /// Element at `index`; negative indices count from the tail.
    pub fn lindex(&self, key: &[u8], index: i64) -> Result<Bytes> {
        let map = self.list_index.read();
        let tree = map.get(key).ok_or(Error::KeyNotFound)?;
        let (head, tail) = self.list_meta(tree, key)?;
        let seq = sequence_at(head, tail, index)?;
        let ptr = tree
            .get(&element_key(key, seq))
            .ok_or(Error::WrongIndex)?;
        self.read_pointer(Category::List, ptr)
    }

    /// Overwrites the element at `index`.
    pub fn lset(&self, key: &[u8], index: i64, value: &[u8]) -> Result<()> {
        let mut map = self.list_index.write();
        let tree = map.get_mut(key).ok_or(Error::KeyNotFound)?;
        let (head, tail) = self.list_meta(tree, key)?;
        let seq = sequence_at(head, tail, index)?;
        let ekey = element_key(key, seq);
        let entry = LogEntry::new(ekey.clone(), value.to_vec());
        let pos = self.write_log_entry(Category::List, &entry)?;
        let old = tree.put(ekey, pos);
        self.send_discard(Category::List, old)?;
        Ok(())
    }

    /// Elements between `start` and `stop` inclusive; negative indices
    /// count from the tail. Bounds are clamped into the list, and a range
    /// entirely outside it is [`Error::WrongIndex`].
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let map = self.list_index.read();
        let tree = map.get(key).ok_or(Error::KeyNotFound)?;
        let (head, tail) = self.list_meta(tree, key)?;

        let mut start_seq = raw_sequence(head, tail, start);
        let mut stop_seq = raw_sequence(head, tail, stop);
        if start_seq > stop_seq || start_seq >= tail as i64 || stop_seq <= head as i64 {
            return Err(Error::WrongIndex);
        }
        start_seq = start_seq.max(head as i64 + 1);
        stop_seq = stop_seq.min(tail as i64 - 1);

        let mut out = Vec::with_capacity((stop_seq - start_seq + 1) as usize);
        for seq in start_seq..=stop_seq {
            let ptr = tree
                .get(&element_key(key, seq as u32))
                .ok_or(Error::WrongIndex)?;
            out.push(self.read_pointer(Category::List, ptr)?);
        }
        Ok(out)
    }

    fn push_many(&self, key: &[u8], values: &[&[u8]], left: bool, create: bool) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidParam("empty key"));
        }
        if values.is_empty() {
            return Ok(());
        }
        let mut map = self.list_index.write();
        if !map.contains_key(key) {
            if !create {
                return Err(Error::KeyNotFound);
            }
            map.insert(key.to_vec(), IndexTree::new());
        }
        for value in values {
            self.push_inner(&mut map, key, value, left)?;
        }
        Ok(())
    }

    /// One push under the caller's lock; the tree must already exist.
    fn push_inner(
        &self,
        map: &mut FxHashMap<Vec<u8>, IndexTree>,
        key: &[u8],
        value: &[u8],
        left: bool,
    ) -> Result<()> {
        let tree = map.get_mut(key).ok_or(Error::KeyNotFound)?;
        let (mut head, mut tail) = self.list_meta(tree, key)?;
        let seq = if left { head } else { tail };

        let ekey = element_key(key, seq);
        let entry = LogEntry::new(ekey.clone(), value.to_vec());
        let pos = self.write_log_entry(Category::List, &entry)?;
        let old = tree.put(ekey, pos);
        self.send_discard(Category::List, old)?;

        if left {
            head -= 1;
        } else {
            tail += 1;
        }
        self.save_list_meta(tree, key, head, tail)
    }

    /// One pop under the caller's lock.
    fn pop_inner(
        &self,
        map: &mut FxHashMap<Vec<u8>, IndexTree>,
        key: &[u8],
        left: bool,
    ) -> Result<Option<Bytes>> {
        let Some(tree) = map.get_mut(key) else {
            return Ok(None);
        };
        let (mut head, mut tail) = self.list_meta(tree, key)?;
        if tail - head <= 1 {
            return Ok(None);
        }
        let seq = if left { head + 1 } else { tail - 1 };

        let ekey = element_key(key, seq);
        let Some(ptr) = tree.get(&ekey) else {
            return Ok(None);
        };
        let value = self.read_pointer(Category::List, ptr)?;

        let tombstone = LogEntry::new(ekey.clone(), Vec::new()).with_status(EntryStatus::Deleted);
        let pos = self.write_log_entry(Category::List, &tombstone)?;
        let old = tree.delete(&ekey);
        self.send_discard(Category::List, old)?;
        self.send_tombstone_discard(Category::List, &pos)?;

        if left {
            head += 1;
        } else {
            tail -= 1;
        }
        self.save_list_meta(tree, key, head, tail)?;

        if tail - head - 1 == 0 {
            // rewind the markers so the next incarnation starts centred
            if head != INITIAL_LIST_SEQ || tail != INITIAL_LIST_SEQ + 1 {
                self.save_list_meta(tree, key, INITIAL_LIST_SEQ, INITIAL_LIST_SEQ + 1)?;
            }
            map.remove(key);
        }
        Ok(Some(value))
    }

    /// Current `(head, tail)` markers, defaulting for a list that has
    /// never saved them.
    fn list_meta(&self, tree: &IndexTree, key: &[u8]) -> Result<(u32, u32)> {
        let Some(ptr) = tree.get(&meta_key(key)) else {
            return Ok((INITIAL_LIST_SEQ, INITIAL_LIST_SEQ + 1));
        };
        match self.read_pointer(Category::List, ptr) {
            Ok(raw) if raw.len() == 8 => Ok((
                u32::from_le_bytes(raw[..4].try_into().unwrap()),
                u32::from_le_bytes(raw[4..].try_into().unwrap()),
            )),
            Ok(_) => Err(Error::CorruptEntry("bad list meta encoding")),
            Err(Error::KeyNotFound) => Ok((INITIAL_LIST_SEQ, INITIAL_LIST_SEQ + 1)),
            Err(e) => Err(e),
        }
    }

    fn save_list_meta(
        &self,
        tree: &mut IndexTree,
        key: &[u8],
        head: u32,
        tail: u32,
    ) -> Result<()> {
        let mut value = Vec::with_capacity(8);
        value.extend_from_slice(&head.to_le_bytes());
        value.extend_from_slice(&tail.to_le_bytes());
        let entry =
            LogEntry::new(meta_key(key), value).with_status(EntryStatus::ListMeta);
        let pos = self.write_log_entry(Category::List, &entry)?;
        let old = tree.put(meta_key(key), pos);
        self.send_discard(Category::List, old)?;
        Ok(())
    }
}

/// Maps a user index to a sequence strictly inside `(head, tail)`.
fn sequence_at(head: u32, tail: u32, index: i64) -> Result<u32> {
    let seq = raw_sequence(head, tail, index);
    if seq <= head as i64 || seq >= tail as i64 {
        return Err(Error::WrongIndex);
    }
    Ok(seq as u32)
}

fn raw_sequence(head: u32, tail: u32, index: i64) -> i64 {
    if index >= 0 {
        head as i64 + index + 1
    } else {
        tail as i64 + index
    }
}
