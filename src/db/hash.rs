//! Hash operations.
//!
//! Each outer key owns one tree whose keys are compound
//! `(key, field)` encodings; the same compound key is what the log
//! entries carry, which is how recovery finds the right tree again.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::index::encode_compound_key;
use crate::logfile::{Category, EntryStatus, LogEntry};

impl super::Db {
    /// Inserts (or updates) the given field/value pairs under `key`.
    pub fn hset(&self, key: &[u8], pairs: &[(&[u8], &[u8])]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidParam("empty key"));
        }
        if pairs.is_empty() {
            return Ok(());
        }
        let mut map = self.hash_index.write();
        let tree = map.entry(key.to_vec()).or_default();
        for (field, value) in pairs {
            let hash_key = encode_compound_key(key, field);
            let entry = LogEntry::new(hash_key.clone(), value.to_vec());
            let pos = self.write_log_entry(Category::Hash, &entry)?;
            let old = tree.put(hash_key, pos);
            self.send_discard(Category::Hash, old)?;
        }
        Ok(())
    }

    /// Inserts `field` only when it does not exist yet. Returns whether
    /// the write happened.
    pub fn hset_nx(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::InvalidParam("empty key"));
        }
        let mut map = self.hash_index.write();
        let tree = map.entry(key.to_vec()).or_default();
        let hash_key = encode_compound_key(key, field);
        if tree.get(&hash_key).is_some() {
            return Ok(false);
        }
        let entry = LogEntry::new(hash_key.clone(), value.to_vec());
        let pos = self.write_log_entry(Category::Hash, &entry)?;
        tree.put(hash_key, pos);
        Ok(true)
    }

    /// Value of `field` under `key`, `None` when either is absent.
    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Bytes>> {
        let map = self.hash_index.read();
        let Some(tree) = map.get(key) else {
            return Ok(None);
        };
        let Some(ptr) = tree.get(&encode_compound_key(key, field)) else {
            return Ok(None);
        };
        match self.read_pointer(Category::Hash, ptr) {
            Ok(value) => Ok(Some(value)),
            Err(Error::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Values for several fields; absent fields are skipped.
    pub fn hmget(&self, key: &[u8], fields: &[&[u8]]) -> Result<Vec<Bytes>> {
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            if let Some(value) = self.hget(key, field)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Deletes fields under `key`, returning how many existed. A tombstone
    /// is appended per field; the tombstone and the displaced pointer both
    /// feed discard accounting.
    pub fn hdel(&self, key: &[u8], fields: &[&[u8]]) -> Result<usize> {
        let mut map = self.hash_index.write();
        let Some(tree) = map.get_mut(key) else {
            return Ok(0);
        };
        let mut deleted = 0;
        for field in fields {
            let hash_key = encode_compound_key(key, field);
            let tombstone =
                LogEntry::new(hash_key.clone(), Vec::new()).with_status(EntryStatus::Deleted);
            let pos = self.write_log_entry(Category::Hash, &tombstone)?;
            let old = tree.delete(&hash_key);
            if old.is_some() {
                deleted += 1;
            }
            self.send_discard(Category::Hash, old)?;
            self.send_tombstone_discard(Category::Hash, &pos)?;
        }
        if tree.is_empty() {
            map.remove(key);
        }
        Ok(deleted)
    }

    /// Whether `field` exists under `key`.
    pub fn hexists(&self, key: &[u8], field: &[u8]) -> bool {
        let map = self.hash_index.read();
        map.get(key)
            .and_then(|tree| tree.get(&encode_compound_key(key, field)))
            .is_some()
    }

    /// Every `(field, value)` pair under `key`, in field order.
    pub fn hgetall(&self, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let map = self.hash_index.read();
        let Some(tree) = map.get(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(tree.len());
        for (hash_key, ptr) in tree.iter() {
            let field = field_of(hash_key)?;
            match self.read_pointer(Category::Hash, ptr) {
                Ok(value) => out.push((field, value)),
                Err(Error::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Every field under `key`.
    pub fn hkeys(&self, key: &[u8]) -> Result<Vec<Bytes>> {
        let map = self.hash_index.read();
        let Some(tree) = map.get(key) else {
            return Ok(Vec::new());
        };
        tree.iter().map(|(hash_key, _)| field_of(hash_key)).collect()
    }

    /// Every value under `key`.
    pub fn hvals(&self, key: &[u8]) -> Result<Vec<Bytes>> {
        let map = self.hash_index.read();
        let Some(tree) = map.get(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(tree.len());
        for (_, ptr) in tree.iter() {
            match self.read_pointer(Category::Hash, ptr) {
                Ok(value) => out.push(value),
                Err(Error::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Number of fields under `key`.
    pub fn hlen(&self, key: &[u8]) -> usize {
        self.hash_index
            .read()
            .get(key)
            .map(|tree| tree.len())
            .unwrap_or(0)
    }
}

fn field_of(hash_key: &[u8]) -> Result<Bytes> {
    let (_, field) = crate::index::decode_compound_key(hash_key)?;
    Ok(Bytes::copy_from_slice(field))
}
