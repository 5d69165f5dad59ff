mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use computable::{hash_json_key, OwnerLru, PoolEntry, PoolError, PoolKey, PoolLru, PoolSpec, RefCountPool};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
struct FrameRequest {
    table: String,
    columns: Vec<String>,
}

/// A decoded data frame, expensive enough that nobody wants two of them
struct Frame {
    table: String,
    width: usize,
}

#[derive(Default)]
struct Stats {
    created: AtomicUsize,
    disposed: Mutex<Vec<String>>,
}

struct Frames(Arc<Stats>);

#[async_trait]
impl PoolSpec for Frames {
    type Params = FrameRequest;
    type Resource = Frame;

    fn key(&self, params: &FrameRequest) -> Result<PoolKey, PoolError> { hash_json_key(params) }

    fn create(&self, params: &FrameRequest, _key: &PoolKey) -> anyhow::Result<Frame> {
        self.0.created.fetch_add(1, Ordering::SeqCst);
        Ok(Frame { table: params.table.clone(), width: params.columns.len() })
    }

    async fn dispose(&self, _key: &PoolKey, resource: Arc<Frame>) {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.0.disposed.lock().unwrap().push(resource.table.clone());
    }
}

fn request(table: &str, columns: &[&str]) -> FrameRequest {
    FrameRequest { table: table.to_string(), columns: columns.iter().map(|c| c.to_string()).collect() }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_duplicate_construction() -> anyhow::Result<()> {
    let stats = Arc::new(Stats::default());
    let pool = RefCountPool::new(Frames(stats.clone()));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&request("users", &["id", "name"])) })
        })
        .collect();
    let mut entries: Vec<PoolEntry<Frame>> = Vec::new();
    for handle in handles {
        entries.push(handle.await??);
    }

    assert_eq!(stats.created.load(Ordering::SeqCst), 1);
    let key = entries[0].key().clone();
    assert!(entries.iter().all(|entry| Arc::ptr_eq(entry.resource(), entries[0].resource())));
    assert_eq!(pool.ref_count(&key), 64);
    assert_eq!(entries[0].width, 2);
    Ok(())
}

#[tokio::test]
async fn test_disposal_waits_for_last_reference() -> anyhow::Result<()> {
    let stats = Arc::new(Stats::default());
    let pool = RefCountPool::new(Frames(stats.clone()));

    let first = pool.acquire(&request("orders", &["id"]))?;
    let second = pool.acquire(&request("orders", &["id"]))?;
    let disposed = first.disposed();

    first.unref();
    first.unref();
    assert_eq!(pool.ref_count(second.key()), 1);
    assert!(!disposed.is_cancelled());

    drop(second);
    assert!(disposed.is_cancelled());
    pool.flush_disposals().await;
    assert_eq!(*stats.disposed.lock().unwrap(), vec!["orders".to_string()]);

    // a new acquire after disposal builds a fresh resource
    let _third = pool.acquire(&request("orders", &["id"]))?;
    assert_eq!(stats.created.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_release_follows_cancellation() -> anyhow::Result<()> {
    let stats = Arc::new(Stats::default());
    let pool = RefCountPool::new(Frames(stats.clone()));
    let entry = pool.acquire(&request("audit", &[]))?;
    let done = computable::CancellationToken::new();
    entry.unref_on_cancel(done.clone());
    assert!(!entry.is_released());

    done.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(entry.is_released());
    assert!(pool.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cache_eviction_under_reference() -> anyhow::Result<()> {
    let stats = Arc::new(Stats::default());
    let pool = RefCountPool::new(Frames(stats.clone()));
    let mut lru = PoolLru::new(2, 1024);

    let held = pool.acquire(&request("a", &["x"]))?;
    let key_a = held.key().clone();
    lru.insert(pool.acquire(&request("a", &["x"]))?, 100);
    lru.insert(pool.acquire(&request("b", &["x"]))?, 100);
    lru.insert(pool.acquire(&request("c", &["x"]))?, 100);

    // "a" left the hot set but is still referenced elsewhere
    assert_eq!(lru.len(), 2);
    assert!(lru.get(&key_a).is_none());
    assert!(pool.contains(&key_a));
    assert_eq!(pool.ref_count(&key_a), 1);

    drop(held);
    assert!(!pool.contains(&key_a));
    pool.flush_disposals().await;
    assert_eq!(*stats.disposed.lock().unwrap(), vec!["a".to_string()]);

    // per owner caps evict through to the global hot set
    let mut owners = OwnerLru::new(PoolLru::new(10, usize::MAX), 1);
    owners.insert("tab-1", pool.acquire(&request("d", &[]))?, 1);
    owners.insert("tab-1", pool.acquire(&request("e", &[]))?, 1);
    assert_eq!(owners.owner_len(&"tab-1"), 1);
    assert_eq!(owners.global().len(), 1);
    owners.remove_owner(&"tab-1");
    assert_eq!(owners.global().len(), 0);
    Ok(())
}
