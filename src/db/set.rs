//! Set operations.
//!
//! Membership is indexed by a 128-bit hash of the member rather than the
//! member bytes themselves. Add entries store `key -> member` on disk and
//! the hash only in memory; tombstones carry the hash as their value so
//! recovery can undo the index insert without rehashing.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::logfile::{Category, EntryStatus, LogEntry};

/// Stable 128-bit member hash (truncated blake3).
pub(crate) fn member_hash(member: &[u8]) -> [u8; 16] {
    blake3::hash(member).as_bytes()[..16]
        .try_into()
        .expect("blake3 output is 32 bytes")
}

impl super::Db {
    /// Adds members to the set at `key`, creating it if needed. Empty
    /// members are ignored.
    pub fn sadd(&self, key: &[u8], members: &[&[u8]]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidParam("empty key"));
        }
        let mut map = self.set_index.write();
        let tree = map.entry(key.to_vec()).or_default();
        for member in members {
            if member.is_empty() {
                continue;
            }
            let sum = member_hash(member);
            let entry = LogEntry::new(key.to_vec(), member.to_vec());
            let pos = self.write_log_entry(Category::Set, &entry)?;
            let old = tree.put(sum.to_vec(), pos);
            self.send_discard(Category::Set, old)?;
        }
        Ok(())
    }

    /// Whether `member` is in the set at `key`.
    pub fn sismember(&self, key: &[u8], member: &[u8]) -> bool {
        self.set_index
            .read()
            .get(key)
            .and_then(|tree| tree.get(&member_hash(member)))
            .is_some()
    }

    /// Every member of the set at `key`, in hash order.
    pub fn smembers(&self, key: &[u8]) -> Result<Vec<Bytes>> {
        let map = self.set_index.read();
        let Some(tree) = map.get(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(tree.len());
        for (_, ptr) in tree.iter() {
            match self.read_pointer(Category::Set, ptr) {
                Ok(member) => out.push(member),
                Err(Error::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Set cardinality.
    pub fn scard(&self, key: &[u8]) -> usize {
        self.set_index
            .read()
            .get(key)
            .map(|tree| tree.len())
            .unwrap_or(0)
    }

    /// Removes members, returning how many were present.
    pub fn srem(&self, key: &[u8], members: &[&[u8]]) -> Result<usize> {
        let mut map = self.set_index.write();
        let Some(tree) = map.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for member in members {
            if self.srem_inner(tree, key, member)? {
                removed += 1;
            }
        }
        if tree.is_empty() {
            map.remove(key);
        }
        Ok(removed)
    }

    /// Removes and returns up to `count` members.
    pub fn spop(&self, key: &[u8], count: usize) -> Result<Vec<Bytes>> {
        let mut map = self.set_index.write();
        let Some(tree) = map.get_mut(key) else {
            return Ok(Vec::new());
        };

        let mut popped = Vec::with_capacity(count.min(tree.len()));
        for (_, ptr) in tree.iter().take(count) {
            match self.read_pointer(Category::Set, ptr) {
                Ok(member) => popped.push(member),
                Err(Error::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        for member in &popped {
            self.srem_inner(tree, key, member)?;
        }
        if tree.is_empty() {
            map.remove(key);
        }
        Ok(popped)
    }

    /// Removes one member under the caller's lock: tombstone first, then
    /// the index delete, then discard accounting for both the displaced
    /// pointer and the tombstone.
    fn srem_inner(
        &self,
        tree: &mut crate::index::IndexTree,
        key: &[u8],
        member: &[u8],
    ) -> Result<bool> {
        let sum = member_hash(member);
        let Some(old) = tree.delete(&sum) else {
            return Ok(false);
        };

        let tombstone =
            LogEntry::new(key.to_vec(), sum.to_vec()).with_status(EntryStatus::Deleted);
        let pos = self.write_log_entry(Category::Set, &tombstone)?;
        self.send_discard(Category::Set, Some(old))?;
        self.send_tombstone_discard(Category::Set, &pos)?;
        Ok(true)
    }
}
