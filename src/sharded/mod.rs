//! Sharded concurrent map.
//!
//! A fixed array of `RwLock<FxHashMap>` cells. The shard for a key is
//! picked by a stable function: FNV-32 for byte-string keys, the integer
//! itself for fid keys. Besides the atomic point operations, callers can
//! take a shard handle and hold its lock across multi-step updates (merge
//! does this when retiring a file).

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::hash::Hash;

pub(crate) const DEFAULT_SHARD_COUNT: usize = 32;

/// Stable shard selector. FNV-32 as specified for byte keys; Go's
/// `hash/fnv` New32 variant (multiply, then xor).
pub(crate) fn fnv32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in bytes {
        hash = hash.wrapping_mul(16_777_619);
        hash ^= b as u32;
    }
    hash
}

pub(crate) fn byte_sharding<K: AsRef<[u8]>>(key: &K) -> u32 {
    fnv32(key.as_ref())
}

pub(crate) fn fid_sharding(key: &u32) -> u32 {
    *key
}

pub(crate) struct ShardedMap<K, V> {
    shards: Vec<RwLock<FxHashMap<K, V>>>,
    sharding: fn(&K) -> u32,
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    /// `shard_count` is rounded up to [`DEFAULT_SHARD_COUNT`] when smaller.
    pub(crate) fn with_sharding(shard_count: usize, sharding: fn(&K) -> u32) -> Self {
        let shard_count = shard_count.max(DEFAULT_SHARD_COUNT);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(RwLock::new(FxHashMap::default()));
        }
        Self { shards, sharding }
    }

    /// The lockable shard cell owning `key`.
    pub(crate) fn shard(&self, key: &K) -> &RwLock<FxHashMap<K, V>> {
        let idx = (self.sharding)(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.shard(key).read().contains_key(key)
    }

    pub(crate) fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    pub(crate) fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

impl<K: Eq + Hash, V: Clone> ShardedMap<K, V> {
    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }

    /// Snapshot of every value, shard by shard.
    pub(crate) fn values(&self) -> Vec<V> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().values().cloned());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fnv32_matches_reference_vectors() {
        // reference values from the FNV-1 32-bit specification
        assert_eq!(fnv32(b""), 2_166_136_261);
        assert_eq!(fnv32(b"a"), 0x050c_5d7e);
    }

    #[test]
    fn point_operations_round_trip() {
        let map: ShardedMap<u32, u64> = ShardedMap::with_sharding(32, fid_sharding);
        assert_eq!(map.insert(7, 70), None);
        assert_eq!(map.insert(7, 71), Some(70));
        assert_eq!(map.get(&7), Some(71));
        assert!(map.contains(&7));
        assert_eq!(map.remove(&7), Some(71));
        assert_eq!(map.get(&7), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn byte_keys_spread_and_resolve() {
        let map: ShardedMap<Vec<u8>, u32> = ShardedMap::with_sharding(32, byte_sharding);
        for i in 0..256u32 {
            map.insert(format!("key-{i}").into_bytes(), i);
        }
        assert_eq!(map.len(), 256);
        for i in 0..256u32 {
            assert_eq!(map.get(&format!("key-{i}").into_bytes()), Some(i));
        }
    }

    #[test]
    fn small_shard_count_is_rounded_up() {
        let map: ShardedMap<u32, ()> = ShardedMap::with_sharding(1, fid_sharding);
        assert_eq!(map.shards.len(), DEFAULT_SHARD_COUNT);
    }

    #[test]
    fn shard_handle_holds_across_multi_step_update() {
        let map: Arc<ShardedMap<u32, u32>> = Arc::new(ShardedMap::with_sharding(32, fid_sharding));
        map.insert(3, 30);

        let shard = map.shard(&3);
        let mut guard = shard.write();
        let taken = guard.remove(&3);
        assert_eq!(taken, Some(30));
        guard.insert(3, 31);
        drop(guard);

        assert_eq!(map.get(&3), Some(31));
    }

    #[test]
    fn concurrent_inserts_land() {
        let map: Arc<ShardedMap<u32, u32>> = Arc::new(ShardedMap::with_sharding(32, fid_sharding));
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let map = Arc::clone(&map);
                s.spawn(move || {
                    for i in 0..100 {
                        map.insert(t * 100 + i, i);
                    }
                });
            }
        });
        assert_eq!(map.len(), 400);
    }
}
