use std::{collections::HashMap, hash::Hash};

/// A very basic concurrent hashmap that is hard to misuse in an async context.
/// The number one rule is that a lock can only be held very briefly - with no calls into
/// other functions that might block.
pub struct SafeMap<K: Hash + Eq, V>(std::sync::RwLock<HashMap<K, V>>);

impl<K: Hash + Eq, V> Default for SafeMap<K, V> {
    fn default() -> Self { Self::new() }
}

impl<K: Hash + Eq, V> SafeMap<K, V> {
    pub fn new() -> Self { Self(std::sync::RwLock::new(HashMap::new())) }

    pub fn insert(&self, key: K, value: V) -> Option<V> { self.0.write().expect("Failed to lock the map").insert(key, value) }

    pub fn remove(&self, key: &K) -> Option<V> { self.0.write().expect("Failed to lock the map").remove(key) }

    pub fn is_empty(&self) -> bool { self.0.read().expect("Failed to lock the map").is_empty() }
    pub fn len(&self) -> usize { self.0.read().expect("Failed to lock the map").len() }
}

impl<K: Hash + Eq, V> SafeMap<K, V>
where V: Clone
{
    /// Copy of every value, taken under a single read lock
    pub fn values(&self) -> Vec<V> { self.0.read().expect("Failed to lock the map").values().cloned().collect() }
}
