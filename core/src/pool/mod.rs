//! Reference counted sharing of expensive resources, plus LRU layers on top of it.

mod key;
mod lru;
mod refcount;

pub use key::{hash_json_key, PoolKey};
pub use lru::{OwnerLru, PoolLru};
pub use refcount::{PoolEntry, PoolSpec, RefCountPool};
