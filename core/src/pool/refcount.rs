use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::key::PoolKey;
use crate::error::PoolError;

/// Describes how a [`RefCountPool`] derives keys, builds and tears down its resources.
#[async_trait]
pub trait PoolSpec: Send + Sync + 'static {
    type Params: ?Sized + Sync;
    type Resource: Send + Sync + 'static;

    /// Must be pure: equal params always map to the same key. A params value that cannot be
    /// turned into a key fails the acquire before anything is constructed.
    fn key(&self, params: &Self::Params) -> Result<PoolKey, PoolError>;

    /// Build the resource for a key that has no live entry. Runs under the pool lock, so it must
    /// be quick and must not call back into the same pool; expensive work belongs in the resource
    /// itself (e.g. a lazily started task).
    fn create(&self, params: &Self::Params, key: &PoolKey) -> anyhow::Result<Self::Resource>;

    /// Tear down a resource whose last reference was released. Disposals run one at a time, in
    /// the order the entries were released.
    async fn dispose(&self, _key: &PoolKey, _resource: Arc<Self::Resource>) {}
}

/// A pool of shared resources that lives as long as anybody holds a [`PoolEntry`] for them.
///
/// Acquiring a key with a live entry shares the existing resource and bumps its reference
/// count. Releasing the last reference removes the entry immediately and queues the resource
/// for disposal on a background task, so a later acquire of the same key builds a fresh one.
///
/// Must be created within a tokio runtime.
pub struct RefCountPool<S: PoolSpec> {
    shared: Arc<PoolShared<S>>,
}

struct PoolShared<S: PoolSpec> {
    spec: Arc<S>,
    entries: Mutex<HashMap<PoolKey, Record<S::Resource>>>,
    disposals: mpsc::UnboundedSender<Disposal<S::Resource>>,
}

struct Record<R> {
    resource: Arc<R>,
    refs: usize,
    disposed: CancellationToken,
}

enum Disposal<R> {
    Dispose(PoolKey, Arc<R>),
    Flush(oneshot::Sender<()>),
}

/// Type erased release path, so entries don't carry the pool spec around
trait Unref: Send + Sync {
    fn unref(&self, key: &PoolKey);
}

impl<S: PoolSpec> Clone for RefCountPool<S> {
    fn clone(&self) -> Self { Self { shared: self.shared.clone() } }
}

impl<S: PoolSpec> RefCountPool<S> {
    pub fn new(spec: S) -> Self {
        let spec = Arc::new(spec);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_disposals(spec.clone(), rx));
        Self { shared: Arc::new(PoolShared { spec, entries: Mutex::new(HashMap::new()), disposals: tx }) }
    }

    pub fn spec(&self) -> &S { &self.shared.spec }

    /// Get a reference to the resource for `params`, constructing it if there is no live entry.
    /// A failed construction leaves nothing behind; the next acquire tries again.
    pub fn acquire(&self, params: &S::Params) -> Result<PoolEntry<S::Resource>, PoolError> {
        let key = self.shared.spec.key(params)?;
        let mut entries = self.shared.entries.lock().expect("pool lock poisoned");
        let (resource, disposed) = match entries.get_mut(&key) {
            Some(record) => {
                record.refs += 1;
                (record.resource.clone(), record.disposed.clone())
            }
            None => {
                let resource = Arc::new(
                    self.shared.spec.create(params, &key).map_err(|cause| PoolError::Construction { key: key.clone(), cause })?,
                );
                let disposed = CancellationToken::new();
                entries.insert(key.clone(), Record { resource: resource.clone(), refs: 1, disposed: disposed.clone() });
                crate::action_debug!(key, "created");
                (resource, disposed)
            }
        };
        drop(entries);

        let release = Arc::new(Release { pool: self.shared.clone(), key: key.clone(), done: AtomicBool::new(false), released: CancellationToken::new() });
        Ok(PoolEntry { key, resource, disposed, release })
    }

    /// The resource under `key`, without taking a reference
    pub fn get_by_key(&self, key: &PoolKey) -> Result<Arc<S::Resource>, PoolError> {
        self.try_get_by_key(key).ok_or_else(|| PoolError::NotFound(key.clone()))
    }

    pub fn try_get_by_key(&self, key: &PoolKey) -> Option<Arc<S::Resource>> {
        self.shared.entries.lock().expect("pool lock poisoned").get(key).map(|record| record.resource.clone())
    }

    pub fn contains(&self, key: &PoolKey) -> bool { self.shared.entries.lock().expect("pool lock poisoned").contains_key(key) }

    /// Live references to `key`, zero if there is no entry
    pub fn ref_count(&self, key: &PoolKey) -> usize {
        self.shared.entries.lock().expect("pool lock poisoned").get(key).map_or(0, |record| record.refs)
    }

    pub fn len(&self) -> usize { self.shared.entries.lock().expect("pool lock poisoned").len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Wait until every disposal queued before this call has completed
    pub async fn flush_disposals(&self) {
        let (tx, rx) = oneshot::channel();
        if self.shared.disposals.send(Disposal::Flush(tx)).is_ok() {
            // the queue only goes away together with the pool
            let _ = rx.await;
        }
    }
}

impl<S: PoolSpec> Unref for PoolShared<S> {
    fn unref(&self, key: &PoolKey) {
        let mut entries = self.entries.lock().expect("pool lock poisoned");
        let Some(record) = entries.get_mut(key) else {
            return;
        };
        record.refs -= 1;
        if record.refs > 0 {
            return;
        }
        if let Some(record) = entries.remove(key) {
            record.disposed.cancel();
            // queued under the lock so that disposals follow removal order
            if self.disposals.send(Disposal::Dispose(key.clone(), record.resource)).is_err() {
                tracing::trace!("disposal queue closed, dropping {key}");
            }
        }
    }
}

async fn run_disposals<S: PoolSpec>(spec: Arc<S>, mut rx: mpsc::UnboundedReceiver<Disposal<S::Resource>>) {
    while let Some(disposal) = rx.recv().await {
        match disposal {
            Disposal::Dispose(key, resource) => {
                crate::action_debug!(key, "dispose");
                spec.dispose(&key, resource).await;
            }
            Disposal::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

struct Release {
    pool: Arc<dyn Unref>,
    key: PoolKey,
    done: AtomicBool,
    released: CancellationToken,
}

impl Release {
    fn run(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.released.cancel();
            self.pool.unref(&self.key);
        }
    }
}

/// One reference to a pooled resource. Dropping the entry releases the reference.
pub struct PoolEntry<R> {
    key: PoolKey,
    resource: Arc<R>,
    disposed: CancellationToken,
    release: Arc<Release>,
}

impl<R> PoolEntry<R> {
    pub fn key(&self) -> &PoolKey { &self.key }

    pub fn resource(&self) -> &Arc<R> { &self.resource }

    /// Release this reference. Calling it more than once has no further effect.
    pub fn unref(&self) { self.release.run(); }

    pub fn is_released(&self) -> bool { self.release.done.load(Ordering::SeqCst) }

    /// Cancelled once the pooled resource itself is disposed, which happens after the last
    /// reference (possibly held by somebody else) is released
    pub fn disposed(&self) -> CancellationToken { self.disposed.clone() }

    /// Release this reference as soon as `token` is cancelled, if it was not released already.
    pub fn unref_on_cancel(&self, token: CancellationToken) {
        let release = self.release.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => release.run(),
                _ = release.released.cancelled() => {}
            }
        });
    }
}

impl<R> std::ops::Deref for PoolEntry<R> {
    type Target = R;
    fn deref(&self) -> &R { &self.resource }
}

impl<R> Drop for PoolEntry<R> {
    fn drop(&mut self) { self.release.run(); }
}

impl<R> std::fmt::Debug for PoolEntry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry").field("key", &self.key).field("released", &self.is_released()).finish()
    }
}
