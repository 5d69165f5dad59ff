use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use lru::LruCache;

use super::key::PoolKey;
use super::refcount::PoolEntry;

/// A bounded "hot set" of pool entries.
///
/// The LRU owns one reference per cached key. Eviction only releases that reference: a
/// resource still held elsewhere (e.g. by an in-flight computation) stays alive in the pool,
/// the reference count decides when it is disposed.
pub struct PoolLru<R> {
    cache: LruCache<PoolKey, Cached<R>>,
    max_count: usize,
    max_bytes: usize,
    total_size: usize,
}

struct Cached<R> {
    entry: PoolEntry<R>,
    size: usize,
}

impl<R> PoolLru<R> {
    /// `max_bytes` bounds the sum of the size estimates passed to [`PoolLru::insert`]
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self { cache: LruCache::unbounded(), max_count: max_count.max(1), max_bytes, total_size: 0 }
    }

    /// Cache `entry` with a size estimate, evicting least recently used entries while over
    /// either bound. The newest entry is never evicted by its own insertion.
    pub fn insert(&mut self, entry: PoolEntry<R>, size: usize) {
        let key = entry.key().clone();
        if let Some((_, replaced)) = self.cache.push(key, Cached { entry, size }) {
            self.total_size -= replaced.size;
        }
        self.total_size += size;

        while self.cache.len() > 1 && (self.cache.len() > self.max_count || self.total_size > self.max_bytes) {
            let Some((key, evicted)) = self.cache.pop_lru() else {
                break;
            };
            tracing::trace!("lru evicting {key} ({} bytes)", evicted.size);
            self.total_size -= evicted.size;
        }
    }

    /// The cached resource, marking it as most recently used
    pub fn get(&mut self, key: &PoolKey) -> Option<&Arc<R>> { self.cache.get(key).map(|cached| cached.entry.resource()) }

    pub fn contains(&self, key: &PoolKey) -> bool { self.cache.contains(key) }

    /// Drop the cache's reference to `key`. Returns false if it was not cached.
    pub fn evict(&mut self, key: &PoolKey) -> bool {
        match self.cache.pop(key) {
            Some(evicted) => {
                self.total_size -= evicted.size;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.total_size = 0;
    }

    pub fn len(&self) -> usize { self.cache.len() }

    pub fn is_empty(&self) -> bool { self.cache.is_empty() }

    pub fn total_size(&self) -> usize { self.total_size }
}

/// A [`PoolLru`] with an additional, smaller cap per owner.
///
/// When one owner caches more than `per_owner` keys, its oldest keys are evicted from the
/// global LRU as well, so a single busy owner cannot push everybody else out of the hot set.
///
/// A key is attributed to the owner that inserted it last; inserting a key cached by another
/// owner moves it over.
pub struct OwnerLru<O, R> {
    global: PoolLru<R>,
    owners: HashMap<O, VecDeque<PoolKey>>,
    per_owner: usize,
}

impl<O: Hash + Eq, R> OwnerLru<O, R> {
    pub fn new(global: PoolLru<R>, per_owner: usize) -> Self { Self { global, owners: HashMap::new(), per_owner: per_owner.max(1) } }

    pub fn insert(&mut self, owner: O, entry: PoolEntry<R>, size: usize) {
        let key = entry.key().clone();
        self.global.insert(entry, size);

        for keys in self.owners.values_mut() {
            keys.retain(|existing| *existing != key);
        }
        let keys = self.owners.entry(owner).or_default();
        let global = &self.global;
        // keys already pushed out of the global LRU no longer count against the owner
        keys.retain(|existing| global.contains(existing));
        keys.push_back(key);
        while keys.len() > self.per_owner {
            if let Some(oldest) = keys.pop_front() {
                self.global.evict(&oldest);
            }
        }
    }

    pub fn get(&mut self, key: &PoolKey) -> Option<&Arc<R>> { self.global.get(key) }

    /// Evict every key cached on behalf of `owner`
    pub fn remove_owner(&mut self, owner: &O) {
        if let Some(keys) = self.owners.remove(owner) {
            for key in keys {
                self.global.evict(&key);
            }
        }
    }

    /// Keys currently attributed to `owner` that are still cached
    pub fn owner_len(&self, owner: &O) -> usize {
        self.owners.get(owner).map_or(0, |keys| keys.iter().filter(|key| self.global.contains(key)).count())
    }

    pub fn global(&self) -> &PoolLru<R> { &self.global }
}
