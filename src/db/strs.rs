//! String operations.
//!
//! Strings are the only category with per-key expiry. The index holds one
//! tree keyed by the raw key bytes; values live in the `strs` log family.

use bytes::Bytes;

use super::unix_now;
use crate::error::{Error, Result};
use crate::index::ValuePointer;
use crate::logfile::{Category, EntryStatus, LogEntry};

impl super::Db {
    /// Sets `key` to `value`, discarding any previous value and expiry.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.set_with_expiry(key, value, 0)
    }

    /// Sets `key` to `value` with a time-to-live.
    pub fn set_ex(&self, key: &[u8], value: &[u8], ttl: std::time::Duration) -> Result<()> {
        self.set_with_expiry(key, value, unix_now() + ttl.as_secs() as i64)
    }

    /// Sets `key` only if it does not already hold a live value. Returns
    /// whether the write happened.
    pub fn set_nx(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::InvalidParam("empty key"));
        }
        let mut tree = self.str_index.write();
        if live_pointer(tree.get(key)).is_some() {
            return Ok(false);
        }
        let entry = LogEntry::new(key.to_vec(), value.to_vec());
        let pos = self.write_log_entry(Category::Str, &entry)?;
        let old = tree.put(key.to_vec(), pos);
        self.send_discard(Category::Str, old)?;
        Ok(true)
    }

    /// Sets every pair. `args` alternates key, value, key, value, ...
    pub fn mset(&self, args: &[&[u8]]) -> Result<()> {
        if args.len() % 2 == 1 {
            return Err(Error::InvalidParam("odd number of mset arguments"));
        }
        for pair in args.chunks(2) {
            self.set(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Sets every pair, but performs nothing at all if any key already
    /// exists. Returns whether the writes happened.
    pub fn mset_nx(&self, args: &[&[u8]]) -> Result<bool> {
        if args.len() % 2 == 1 {
            return Err(Error::InvalidParam("odd number of mset arguments"));
        }
        let mut tree = self.str_index.write();
        if args
            .chunks(2)
            .any(|pair| live_pointer(tree.get(pair[0])).is_some())
        {
            return Ok(false);
        }
        for pair in args.chunks(2) {
            if pair[0].is_empty() {
                return Err(Error::InvalidParam("empty key"));
            }
            let entry = LogEntry::new(pair[0].to_vec(), pair[1].to_vec());
            let pos = self.write_log_entry(Category::Str, &entry)?;
            let old = tree.put(pair[0].to_vec(), pos);
            self.send_discard(Category::Str, old)?;
        }
        Ok(true)
    }

    /// Returns the value of `key`, or [`Error::KeyNotFound`].
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        let ptr = self.str_pointer(key)?;
        self.read_pointer(Category::Str, ptr)
    }

    /// Values for all `keys`; missing or expired keys yield `None`.
    pub fn mget(&self, keys: &[&[u8]]) -> Result<Vec<Option<Bytes>>> {
        keys.iter()
            .map(|key| match self.get(key) {
                Ok(value) => Ok(Some(value)),
                Err(Error::KeyNotFound) => Ok(None),
                Err(e) => Err(e),
            })
            .collect()
    }

    /// Substring of the value at `key` between inclusive offsets; negative
    /// offsets count from the end.
    pub fn get_range(&self, key: &[u8], start: i64, end: i64) -> Result<Bytes> {
        let value = self.get(key)?;
        let len = value.len() as i64;
        let clamp = |i: i64| -> i64 {
            let i = if i < 0 { i + len } else { i };
            i.clamp(0, len.max(1) - 1)
        };
        if len == 0 {
            return Ok(Bytes::new());
        }
        let (start, end) = (clamp(start), clamp(end));
        if start > end {
            return Ok(Bytes::new());
        }
        Ok(value.slice(start as usize..=end as usize))
    }

    /// Returns the value and deletes the key in one step; `None` when the
    /// key is absent.
    pub fn get_del(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let mut tree = self.str_index.write();
        let Some(ptr) = live_pointer(tree.get(key)) else {
            return Ok(None);
        };
        let value = self.read_pointer(Category::Str, ptr)?;
        let tombstone = LogEntry::new(key.to_vec(), Vec::new()).with_status(EntryStatus::Deleted);
        let pos = self.write_log_entry(Category::Str, &tombstone)?;
        let old = tree.delete(key);
        self.send_discard(Category::Str, old)?;
        self.send_tombstone_discard(Category::Str, &pos)?;
        Ok(Some(value))
    }

    /// Deletes `key`. A tombstone is appended even when the key is absent
    /// so that recovery converges; both the displaced pointer and the
    /// tombstone itself feed discard accounting.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut tree = self.str_index.write();
        let tombstone = LogEntry::new(key.to_vec(), Vec::new()).with_status(EntryStatus::Deleted);
        let pos = self.write_log_entry(Category::Str, &tombstone)?;
        let old = tree.delete(key);
        self.send_discard(Category::Str, old)?;
        self.send_tombstone_discard(Category::Str, &pos)?;
        Ok(())
    }

    /// Appends `value` to the existing value, or behaves like `set`.
    /// An existing expiry is preserved.
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidParam("empty key"));
        }
        let mut tree = self.str_index.write();
        let (mut combined, expires_at) = match live_pointer(tree.get(key)) {
            Some(ptr) => (self.read_pointer(Category::Str, ptr)?.to_vec(), ptr.expires_at),
            None => (Vec::new(), 0),
        };
        combined.extend_from_slice(value);
        let entry = LogEntry::new(key.to_vec(), combined).with_expiry(expires_at);
        let pos = self.write_log_entry(Category::Str, &entry)?;
        let old = tree.put(key.to_vec(), pos);
        self.send_discard(Category::Str, old)?;
        Ok(())
    }

    /// Increments the decimal integer at `key` by one.
    pub fn incr(&self, key: &[u8]) -> Result<i64> {
        self.incr_decr_by(key, 1)
    }

    /// Increments the decimal integer at `key` by `delta`.
    pub fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        self.incr_decr_by(key, delta)
    }

    /// Decrements the decimal integer at `key` by one.
    pub fn decr(&self, key: &[u8]) -> Result<i64> {
        self.incr_decr_by(key, -1)
    }

    /// Decrements the decimal integer at `key` by `delta`.
    pub fn decr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        self.incr_decr_by(key, delta.checked_neg().ok_or(Error::IntegerOverflow)?)
    }

    fn incr_decr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        if key.is_empty() {
            return Err(Error::InvalidParam("empty key"));
        }
        let mut tree = self.str_index.write();
        let (current, expires_at) = match live_pointer(tree.get(key)) {
            Some(ptr) => {
                let raw = self.read_pointer(Category::Str, ptr)?;
                let parsed = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(Error::InvalidValueType)?;
                (parsed, ptr.expires_at)
            }
            None => (0, 0),
        };
        let next = current.checked_add(delta).ok_or(Error::IntegerOverflow)?;

        let entry =
            LogEntry::new(key.to_vec(), next.to_string().into_bytes()).with_expiry(expires_at);
        let pos = self.write_log_entry(Category::Str, &entry)?;
        let old = tree.put(key.to_vec(), pos);
        self.send_discard(Category::Str, old)?;
        Ok(next)
    }

    /// Length of the value at `key`, 0 when absent.
    pub fn str_len(&self, key: &[u8]) -> usize {
        match self.get(key) {
            Ok(value) => value.len(),
            Err(_) => 0,
        }
    }

    /// Number of live string keys.
    pub fn count(&self) -> usize {
        self.str_index.read().len()
    }

    /// Keys starting with `prefix` together with their values, in key
    /// order, at most `count` of them (`None` = unlimited).
    pub fn scan(&self, prefix: &[u8], count: Option<usize>) -> Result<Vec<(Bytes, Bytes)>> {
        let keys = self.str_index.read().prefix_scan(prefix, count);
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(&key) {
                Ok(value) => out.push((Bytes::from(key), value)),
                Err(Error::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// All live string keys.
    pub fn keys(&self) -> Vec<Bytes> {
        self.str_index
            .read()
            .iter()
            .map(|(k, _)| Bytes::copy_from_slice(k))
            .collect()
    }

    /// Sets the expiration of `key` to `ttl` from now.
    pub fn expire(&self, key: &[u8], ttl: std::time::Duration) -> Result<()> {
        let value = self.get(key)?;
        self.set_with_expiry(key, &value, unix_now() + ttl.as_secs() as i64)
    }

    /// Seconds until `key` expires: `-1` when it has no expiry,
    /// [`Error::KeyNotFound`] when absent or already expired.
    pub fn ttl(&self, key: &[u8]) -> Result<i64> {
        let ptr = self.str_pointer(key)?;
        if ptr.expires_at == 0 {
            return Ok(-1);
        }
        Ok(ptr.expires_at - unix_now())
    }

    /// Removes the expiration from `key`.
    pub fn persist(&self, key: &[u8]) -> Result<()> {
        let value = self.get(key)?;
        self.set_with_expiry(key, &value, 0)
    }

    fn set_with_expiry(&self, key: &[u8], value: &[u8], expires_at: i64) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidParam("empty key"));
        }
        let mut tree = self.str_index.write();
        let entry = LogEntry::new(key.to_vec(), value.to_vec()).with_expiry(expires_at);
        let pos = self.write_log_entry(Category::Str, &entry)?;
        let old = tree.put(key.to_vec(), pos);
        self.send_discard(Category::Str, old)?;
        Ok(())
    }

    /// Index lookup with lazy eviction: an expired pointer is removed from
    /// the index (and its bytes sent to discard) on first access.
    fn str_pointer(&self, key: &[u8]) -> Result<ValuePointer> {
        let ptr = self
            .str_index
            .read()
            .get(key)
            .ok_or(Error::KeyNotFound)?;
        if ptr.expires_at != 0 && ptr.expires_at <= unix_now() {
            let mut tree = self.str_index.write();
            if tree.get(key) == Some(ptr) {
                tree.delete(key);
                self.send_discard(Category::Str, Some(ptr))?;
            }
            return Err(Error::KeyNotFound);
        }
        Ok(ptr)
    }
}

/// Filters out already-expired pointers so the write paths treat them as
/// absent.
fn live_pointer(ptr: Option<ValuePointer>) -> Option<ValuePointer> {
    ptr.filter(|p| p.expires_at == 0 || p.expires_at > unix_now())
}
