//! Sorted-set operations.
//!
//! Two structures per outer key: the pointer tree keyed by compound
//! `(key, member)` for point lookups and merge identity checks, and the
//! rank skip list ordered by `(score, member length)` for rank and range
//! queries. Scores travel as the 8 little-endian bytes of the f64 bit
//! pattern.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::index::encode_compound_key;
use crate::logfile::{Category, EntryStatus, LogEntry};

pub(crate) fn encode_score(score: f64) -> [u8; 8] {
    score.to_bits().to_le_bytes()
}

pub(crate) fn decode_score(buf: &[u8]) -> Result<f64> {
    let bits: [u8; 8] = buf
        .try_into()
        .map_err(|_| Error::CorruptEntry("bad score encoding"))?;
    Ok(f64::from_bits(u64::from_le_bytes(bits)))
}

impl super::Db {
    /// Adds (or rescores) each `(score, member)` pair under `key`.
    pub fn zadd(&self, key: &[u8], pairs: &[(f64, &[u8])]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidParam("empty key"));
        }
        if pairs.is_empty() {
            return Ok(());
        }
        let mut map = self.zset_index.write();
        let index = map.entry(key.to_vec()).or_default();
        for (score, member) in pairs {
            let zset_key = encode_compound_key(key, member);
            let entry = LogEntry::new(zset_key.clone(), encode_score(*score).to_vec());
            let pos = self.write_log_entry(Category::ZSet, &entry)?;

            if let Some(old) = index.tree.put(zset_key, pos) {
                let old_score = decode_score(&self.read_pointer(Category::ZSet, old)?)?;
                index.skl.remove(old_score, member);
                self.send_discard(Category::ZSet, Some(old))?;
            }
            index.skl.insert(*score, member);
        }
        Ok(())
    }

    /// Score of `member`, `None` when the key or member is absent.
    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>> {
        let map = self.zset_index.read();
        let Some(index) = map.get(key) else {
            return Ok(None);
        };
        let Some(ptr) = index.tree.get(&encode_compound_key(key, member)) else {
            return Ok(None);
        };
        match self.read_pointer(Category::ZSet, ptr) {
            Ok(raw) => Ok(Some(decode_score(&raw)?)),
            Err(Error::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sorted-set cardinality.
    pub fn zcard(&self, key: &[u8]) -> usize {
        self.zset_index
            .read()
            .get(key)
            .map(|index| index.tree.len())
            .unwrap_or(0)
    }

    /// 0-based ascending rank of `member`.
    pub fn zrank(&self, key: &[u8], member: &[u8]) -> Result<Option<usize>> {
        let Some(score) = self.zscore(key, member)? else {
            return Ok(None);
        };
        let map = self.zset_index.read();
        Ok(map.get(key).and_then(|index| index.skl.rank(score, member)))
    }

    /// 0-based descending rank of `member`.
    pub fn zrev_rank(&self, key: &[u8], member: &[u8]) -> Result<Option<usize>> {
        let Some(rank) = self.zrank(key, member)? else {
            return Ok(None);
        };
        let len = self.zcard(key);
        Ok(Some(len - 1 - rank))
    }

    /// Members between ascending ranks `start` and `stop` inclusive;
    /// negative ranks count from the highest score.
    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Vec<Bytes> {
        self.zrange_with_scores(key, start, stop)
            .into_iter()
            .map(|(member, _)| member)
            .collect()
    }

    /// [`zrange`](Self::zrange) with each member's score.
    pub fn zrange_with_scores(&self, key: &[u8], start: i64, stop: i64) -> Vec<(Bytes, f64)> {
        let map = self.zset_index.read();
        let Some(index) = map.get(key) else {
            return Vec::new();
        };
        let Some((start, stop)) = normalize_range(index.skl.len(), start, stop) else {
            return Vec::new();
        };
        index
            .skl
            .range(start, stop)
            .into_iter()
            .map(|(score, member)| (Bytes::copy_from_slice(member), score))
            .collect()
    }

    /// Members between descending ranks `start` and `stop` inclusive.
    pub fn zrev_range(&self, key: &[u8], start: i64, stop: i64) -> Vec<Bytes> {
        self.zrev_range_with_scores(key, start, stop)
            .into_iter()
            .map(|(member, _)| member)
            .collect()
    }

    /// [`zrev_range`](Self::zrev_range) with each member's score.
    pub fn zrev_range_with_scores(&self, key: &[u8], start: i64, stop: i64) -> Vec<(Bytes, f64)> {
        let map = self.zset_index.read();
        let Some(index) = map.get(key) else {
            return Vec::new();
        };
        let len = index.skl.len();
        let Some((start, stop)) = normalize_range(len, start, stop) else {
            return Vec::new();
        };
        // descending rank r is ascending rank len-1-r
        let mut out: Vec<(Bytes, f64)> = index
            .skl
            .range(len - 1 - stop.min(len - 1), len - 1 - start)
            .into_iter()
            .map(|(score, member)| (Bytes::copy_from_slice(member), score))
            .collect();
        out.reverse();
        out
    }

    /// Adds `delta` to the member's score (0 when absent), returning the
    /// new score.
    pub fn zincr_by(&self, key: &[u8], delta: f64, member: &[u8]) -> Result<f64> {
        let current = self.zscore(key, member)?.unwrap_or(0.0);
        let next = current + delta;
        self.zadd(key, &[(next, member)])?;
        Ok(next)
    }

    /// Removes members, returning how many were present.
    pub fn zrem(&self, key: &[u8], members: &[&[u8]]) -> Result<usize> {
        let mut map = self.zset_index.write();
        let Some(index) = map.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for member in members {
            if self.zrem_inner(index, key, member)? {
                removed += 1;
            }
        }
        if index.tree.is_empty() {
            map.remove(key);
        }
        Ok(removed)
    }

    /// Removes and returns the highest-ranked member.
    pub fn zpop_max(&self, key: &[u8]) -> Result<Option<(Bytes, f64)>> {
        self.zpop(key, false)
    }

    /// Removes and returns the lowest-ranked member.
    pub fn zpop_min(&self, key: &[u8]) -> Result<Option<(Bytes, f64)>> {
        self.zpop(key, true)
    }

    /// Removes and returns up to `count` highest-ranked members.
    pub fn zpop_max_with_count(&self, key: &[u8], count: usize) -> Result<Vec<(Bytes, f64)>> {
        self.zpop_many(key, count, false)
    }

    /// Removes and returns up to `count` lowest-ranked members.
    pub fn zpop_min_with_count(&self, key: &[u8], count: usize) -> Result<Vec<(Bytes, f64)>> {
        self.zpop_many(key, count, true)
    }

    fn zpop(&self, key: &[u8], min: bool) -> Result<Option<(Bytes, f64)>> {
        let mut map = self.zset_index.write();
        let Some(index) = map.get_mut(key) else {
            return Ok(None);
        };
        let rank = if min { 0 } else { index.skl.len().saturating_sub(1) };
        let Some((score, member)) = index.skl.get_by_rank(rank) else {
            return Ok(None);
        };
        let (score, member) = (score, Bytes::copy_from_slice(member));
        self.zrem_inner(index, key, &member)?;
        if index.tree.is_empty() {
            map.remove(key);
        }
        Ok(Some((member, score)))
    }

    fn zpop_many(&self, key: &[u8], count: usize, min: bool) -> Result<Vec<(Bytes, f64)>> {
        let mut out = Vec::with_capacity(count.min(self.zcard(key)));
        for _ in 0..count {
            match self.zpop(key, min)? {
                Some(popped) => out.push(popped),
                None => break,
            }
        }
        Ok(out)
    }

    fn zrem_inner(
        &self,
        index: &mut super::ZSetIndex,
        key: &[u8],
        member: &[u8],
    ) -> Result<bool> {
        let zset_key = encode_compound_key(key, member);
        let Some(old) = index.tree.get(&zset_key) else {
            return Ok(false);
        };
        let score = decode_score(&self.read_pointer(Category::ZSet, old)?)?;

        let tombstone = LogEntry::new(zset_key.clone(), Vec::new())
            .with_status(EntryStatus::Deleted);
        let pos = self.write_log_entry(Category::ZSet, &tombstone)?;

        index.tree.delete(&zset_key);
        index.skl.remove(score, member);
        self.send_discard(Category::ZSet, Some(old))?;
        self.send_tombstone_discard(Category::ZSet, &pos)?;
        Ok(true)
    }
}

/// Resolves possibly-negative inclusive rank bounds against `len`,
/// clamping `stop`; `None` when the range selects nothing.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let start = if start < 0 { start + len } else { start };
    let stop = if stop < 0 { stop + len } else { stop };
    let start = start.max(0);
    let stop = stop.min(len - 1);
    if start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}
