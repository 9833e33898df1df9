// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::{alloc::Layout, fmt, sync::Arc};

use crate::{
    arena::{Arena, ArenaConfig, ArenaHandle, MemoryLimiter},
    error::{Error, Result},
    set::DurableSet,
};

pub const DEFAULT_BUCKETS: usize = 1024;

/// Fixed array of ordered sets, one per bucket, sharing a single arena.
///
/// A key lives in bucket `|key| % buckets`. There is no resizing.
pub struct HashTable<S: DurableSet> {
    buckets: Box<[S]>,
    arena: Arc<Arena<S::Limiter>>,
}

impl<S: DurableSet> fmt::Debug for HashTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTable")
            .field("buckets", &self.buckets.len())
            .field("arena", &self.arena)
            .finish()
    }
}

impl<S: DurableSet> HashTable<S> {
    pub fn new(buckets: usize, config: ArenaConfig, limiter: S::Limiter) -> Result<Self> {
        let arena = Arena::new(S::slot_layout(), config, limiter)?;
        Self::with_buckets(arena, buckets)
    }

    pub fn with_buckets(arena: Arc<Arena<S::Limiter>>, buckets: usize) -> Result<Self> {
        if buckets == 0 {
            return Err(Error::InvalidConfig("a hash table needs at least one bucket".to_owned()));
        }
        let buckets = (0..buckets)
            .map(|_| S::with_arena(Arc::clone(&arena)))
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();
        Ok(HashTable { buckets, arena })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, key: i64) -> &S {
        let idx = key.unsigned_abs() % self.buckets.len() as u64;
        &self.buckets[idx as usize]
    }
}

impl<S: DurableSet> DurableSet for HashTable<S> {
    type Value = S::Value;
    type Limiter = S::Limiter;

    fn slot_layout() -> Layout {
        S::slot_layout()
    }

    fn with_arena(arena: Arc<Arena<S::Limiter>>) -> Result<Self> {
        Self::with_buckets(arena, DEFAULT_BUCKETS)
    }

    fn arena(&self) -> &Arc<Arena<S::Limiter>> {
        &self.arena
    }

    fn insert(&self, key: i64, value: S::Value, handle: &ArenaHandle<S::Limiter>) -> bool {
        self.bucket(key).insert(key, value, handle)
    }

    fn remove(&self, key: i64, handle: &ArenaHandle<S::Limiter>) -> bool {
        self.bucket(key).remove(key, handle)
    }

    fn contains(&self, key: i64, handle: &ArenaHandle<S::Limiter>) -> bool {
        self.bucket(key).contains(key, handle)
    }

    fn get(&self, key: i64, handle: &ArenaHandle<S::Limiter>) -> Option<S::Value> {
        self.bucket(key).get(key, handle)
    }

    fn keys(&self, handle: &ArenaHandle<S::Limiter>) -> Vec<i64> {
        let mut keys: Vec<i64> = self.buckets.iter().flat_map(|b| b.keys(handle)).collect();
        keys.sort_unstable();
        keys
    }

    fn len(&self, handle: &ArenaHandle<S::Limiter>) -> usize {
        self.buckets.iter().map(|b| b.len(handle)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LinkFreeList, SoftList, Unlimited};

    #[test]
    fn test_buckets_partition_keys() {
        let table =
            HashTable::<SoftList<u64>>::new(4, ArenaConfig::default(), Unlimited::default()).unwrap();
        let h = table.handle();
        for k in -10..10 {
            assert!(table.insert(k, k.unsigned_abs(), &h));
        }
        assert!(!table.insert(-3, 0, &h));
        assert_eq!(table.get(-3, &h), Some(3));
        assert_eq!(table.bucket(-3).keys(&h), vec![-7, -3, 3, 7]);
        assert_eq!(table.keys(&h), (-10..10).collect::<Vec<_>>());
        assert!(table.remove(-3, &h));
        assert!(!table.contains(-3, &h));
        assert_eq!(table.len(&h), 19);
    }

    #[test]
    fn test_zero_buckets_rejected() {
        let res = HashTable::<LinkFreeList<u64>>::new(0, ArenaConfig::default(), Unlimited::default());
        assert!(matches!(res, Err(Error::InvalidConfig(_))));
    }
}
