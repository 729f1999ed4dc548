//! In-memory index structures.
//!
//! Indexes never hold values, only pointers: the `(fid, offset)` address
//! of the record on disk plus its size and expiry. The category decides
//! how an index key is formed — raw key bytes for strings, a compound
//! `(outer, sub)` encoding for hashes/lists/zsets, a 128-bit member hash
//! for sets.

pub(crate) mod skiplist;

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::logfile::{put_varint_i64, read_varint_i64};

/// The address of a record on disk, as held by every index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValuePointer {
    pub fid: u32,
    pub offset: u64,
    pub entry_size: u32,
    /// Copied from the entry so reads can lazily evict without touching
    /// disk; 0 means no expiry.
    pub expires_at: i64,
}

/// Ordered index over encoded keys.
///
/// The contract is the one the engine needs from any radix-style tree:
/// point ops returning the displaced pointer, ordered iteration, and
/// prefix scans. Backed by a `BTreeMap`, whose ordered ranges provide the
/// prefix scan directly.
#[derive(Debug, Default)]
pub(crate) struct IndexTree {
    map: BTreeMap<Vec<u8>, ValuePointer>,
}

impl IndexTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<ValuePointer> {
        self.map.get(key).copied()
    }

    /// Inserts, returning the pointer it displaced if any.
    pub(crate) fn put(&mut self, key: Vec<u8>, ptr: ValuePointer) -> Option<ValuePointer> {
        self.map.insert(key, ptr)
    }

    /// Removes, returning the displaced pointer if the key was present.
    pub(crate) fn delete(&mut self, key: &[u8]) -> Option<ValuePointer> {
        self.map.remove(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Ordered iteration over every `(key, pointer)` pair.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&[u8], ValuePointer)> {
        self.map.iter().map(|(k, v)| (k.as_slice(), *v))
    }

    /// Keys starting with `prefix`, at most `count` of them
    /// (`None` = unlimited), in order.
    pub(crate) fn prefix_scan(&self, prefix: &[u8], count: Option<usize>) -> Vec<Vec<u8>> {
        let iter = self
            .map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone());
        match count {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Encodes an `(outer, sub)` pair into a single index key:
/// `varint(len(outer)) ++ varint(len(sub)) ++ outer ++ sub`.
pub(crate) fn encode_compound_key(outer: &[u8], sub: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + outer.len() + sub.len());
    put_varint_i64(&mut buf, outer.len() as i64);
    put_varint_i64(&mut buf, sub.len() as i64);
    buf.extend_from_slice(outer);
    buf.extend_from_slice(sub);
    buf
}

/// Splits a compound key back into `(outer, sub)`.
pub(crate) fn decode_compound_key(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    let (outer_len, n) = read_varint_i64(buf)?;
    let (sub_len, m) = read_varint_i64(&buf[n..])?;
    let header = n + m;
    if outer_len < 0 || sub_len < 0 {
        return Err(Error::CorruptEntry("negative compound key length"));
    }
    let (outer_len, sub_len) = (outer_len as usize, sub_len as usize);
    if header + outer_len + sub_len > buf.len() {
        return Err(Error::CorruptEntry("compound key too short"));
    }
    Ok((
        &buf[header..header + outer_len],
        &buf[header + outer_len..header + outer_len + sub_len],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(fid: u32, offset: u64) -> ValuePointer {
        ValuePointer {
            fid,
            offset,
            entry_size: 10,
            expires_at: 0,
        }
    }

    #[test]
    fn put_returns_displaced_pointer() {
        let mut tree = IndexTree::new();
        assert_eq!(tree.put(b"a".to_vec(), ptr(1, 0)), None);
        assert_eq!(tree.put(b"a".to_vec(), ptr(1, 10)), Some(ptr(1, 0)));
        assert_eq!(tree.get(b"a"), Some(ptr(1, 10)));
        assert_eq!(tree.delete(b"a"), Some(ptr(1, 10)));
        assert_eq!(tree.delete(b"a"), None);
        assert!(tree.is_empty());
    }

    #[test]
    fn prefix_scan_respects_order_and_limit() {
        let mut tree = IndexTree::new();
        for key in [&b"ab"[..], b"aa", b"ac", b"b", b"a"] {
            tree.put(key.to_vec(), ptr(1, 0));
        }
        assert_eq!(
            tree.prefix_scan(b"a", None),
            vec![b"a".to_vec(), b"aa".to_vec(), b"ab".to_vec(), b"ac".to_vec()]
        );
        assert_eq!(
            tree.prefix_scan(b"a", Some(2)),
            vec![b"a".to_vec(), b"aa".to_vec()]
        );
        assert_eq!(tree.prefix_scan(b"c", None), Vec::<Vec<u8>>::new());
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn compound_keys_round_trip() -> anyhow::Result<()> {
        for (outer, sub) in [
            (&b"user:1"[..], &b"field"[..]),
            (b"", b""),
            (b"k", b""),
            (b"", b"sub"),
        ] {
            let buf = encode_compound_key(outer, sub);
            let (o, s) = decode_compound_key(&buf)?;
            assert_eq!(o, outer);
            assert_eq!(s, sub);
        }
        Ok(())
    }

    #[test]
    fn truncated_compound_key_is_corrupt() {
        let buf = encode_compound_key(b"outer", b"sub");
        assert!(decode_compound_key(&buf[..buf.len() - 1]).is_err());
    }
}
