use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Named mutexes: at most one holder per id, waiters are served in arrival order.
///
/// An id only occupies memory while it is held or waited for.
pub struct AdvisoryLocks<Id> {
    inner: Arc<Mutex<HashMap<Id, VecDeque<oneshot::Sender<()>>>>>,
}

impl<Id> Clone for AdvisoryLocks<Id> {
    fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<Id: Hash + Eq + Clone> Default for AdvisoryLocks<Id> {
    fn default() -> Self { Self::new() }
}

impl<Id: Hash + Eq + Clone> AdvisoryLocks<Id> {
    pub fn new() -> Self { Self { inner: Arc::new(Mutex::new(HashMap::new())) } }

    /// Wait for exclusive ownership of `id`. Dropping the returned future gives up the place in
    /// the queue.
    pub async fn lock(&self, id: Id) -> AdvisoryGuard<Id> {
        let rx = {
            let mut locks = self.inner.lock().expect("advisory lock registry poisoned");
            match locks.get_mut(&id) {
                None => {
                    locks.insert(id.clone(), VecDeque::new());
                    None
                }
                Some(queue) => {
                    let (tx, rx) = oneshot::channel();
                    queue.push_back(tx);
                    Some(rx)
                }
            }
        };

        if let Some(rx) = rx {
            let mut waiting = Waiting { locks: self, id: Some(id.clone()), rx };
            // the sender is only dropped by a handover, never without sending
            let _ = (&mut waiting.rx).await;
            waiting.id = None;
        }
        AdvisoryGuard { locks: self.clone(), id: Some(id) }
    }

    /// Run `critical` while holding `id`. The lock is released before the result (or error)
    /// is handed back.
    pub async fn with_lock<F: Future>(&self, id: Id, critical: F) -> F::Output {
        let guard = self.lock(id).await;
        let result = critical.await;
        drop(guard);
        result
    }

    pub fn is_locked(&self, id: &Id) -> bool { self.inner.lock().expect("advisory lock registry poisoned").contains_key(id) }

    /// Number of ids currently held
    pub fn len(&self) -> usize { self.inner.lock().expect("advisory lock registry poisoned").len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Hand the lock over to the next live waiter, or forget the id if there is none
    fn release(&self, id: &Id) {
        let mut locks = self.inner.lock().expect("advisory lock registry poisoned");
        let Some(queue) = locks.get_mut(id) else {
            return;
        };
        while let Some(next) = queue.pop_front() {
            if next.send(()).is_ok() {
                return;
            }
        }
        locks.remove(id);
    }
}

/// A queued `lock` call. If it is dropped after ownership was handed to it but before the
/// guard exists, ownership is passed on.
struct Waiting<'a, Id: Hash + Eq + Clone> {
    locks: &'a AdvisoryLocks<Id>,
    id: Option<Id>,
    rx: oneshot::Receiver<()>,
}

impl<Id: Hash + Eq + Clone> Drop for Waiting<'_, Id> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.rx.close();
            if self.rx.try_recv().is_ok() {
                self.locks.release(&id);
            }
        }
    }
}

/// Ownership of one advisory lock id. Released on drop.
pub struct AdvisoryGuard<Id: Hash + Eq + Clone> {
    locks: AdvisoryLocks<Id>,
    id: Option<Id>,
}

impl<Id: Hash + Eq + Clone> AdvisoryGuard<Id> {
    pub fn id(&self) -> Option<&Id> { self.id.as_ref() }

    /// Release the lock now. Further calls (and the drop) do nothing.
    pub fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.locks.release(&id);
        }
    }
}

impl<Id: Hash + Eq + Clone> Drop for AdvisoryGuard<Id> {
    fn drop(&mut self) { self.release(); }
}
