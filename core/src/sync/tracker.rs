use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use futures::FutureExt;
use tokio::sync::watch;

use crate::error::TaskError;
use crate::util::SafeMap;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Fulfilled,
    Rejected,
}

type ConsumeHook = Box<dyn FnOnce() + Send>;
type Registry = SafeMap<u64, watch::Receiver<bool>>;

/// A spawned future whose progress can be inspected without consuming it.
///
/// In eager mode a failure is logged as soon as it happens. In deferred mode it stays silent
/// until somebody consumes the result, which lets callers attach error handling later.
///
/// Must be spawned within a tokio runtime.
pub struct TrackedTask<T> {
    shared: Arc<TaskShared<T>>,
}

struct TaskShared<T> {
    id: u64,
    deferred: bool,
    outcome: Mutex<Option<Result<T, TaskError>>>,
    settled: watch::Sender<bool>,
    consumed: AtomicBool,
    on_consume: Mutex<Option<ConsumeHook>>,
}

impl<T> Clone for TrackedTask<T> {
    fn clone(&self) -> Self { Self { shared: self.shared.clone() } }
}

impl<T: Clone + Send + Sync + 'static> TrackedTask<T> {
    /// Spawn `future` and log its failure, if any, right away
    pub fn spawn<F>(future: F) -> Self
    where F: Future<Output = anyhow::Result<T>> + Send + 'static {
        Self::spawn_inner(future, false, None)
    }

    /// Spawn `future`, keeping a failure quiet until the result is consumed
    pub fn spawn_deferred<F>(future: F) -> Self
    where F: Future<Output = anyhow::Result<T>> + Send + 'static {
        Self::spawn_inner(future, true, None)
    }

    fn spawn_inner<F>(future: F, deferred: bool, registry: Option<&Arc<Registry>>) -> Self
    where F: Future<Output = anyhow::Result<T>> + Send + 'static {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let (settled, settled_rx) = watch::channel(false);
        let shared = Arc::new(TaskShared {
            id,
            deferred,
            outcome: Mutex::new(None),
            settled,
            consumed: AtomicBool::new(false),
            on_consume: Mutex::new(None),
        });
        let registry: Option<Weak<Registry>> = registry.map(|registry| {
            registry.insert(id, settled_rx);
            Arc::downgrade(registry)
        });

        let guard = SettleGuard { shared: shared.clone(), registry };
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(cause)) => Err(TaskError::Failed { id, cause: Arc::new(cause) }),
                Err(panic) => Err(TaskError::Panicked { id, message: panic_message(panic.as_ref()) }),
            };
            guard.shared.settle(outcome);
        });
        Self { shared }
    }

    pub fn with_on_consume(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.shared.on_consume.lock().expect("task hook lock poisoned") = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> u64 { self.shared.id }

    pub fn state(&self) -> TaskState {
        match &*self.shared.outcome.lock().expect("task outcome lock poisoned") {
            None => TaskState::Pending,
            Some(Ok(_)) => TaskState::Fulfilled,
            Some(Err(_)) => TaskState::Rejected,
        }
    }

    pub fn is_settled(&self) -> bool { self.state() != TaskState::Pending }

    pub fn is_consumed(&self) -> bool { self.shared.consumed.load(Ordering::SeqCst) }

    /// Wait for the task to settle and return its outcome. The first call runs the
    /// `on_consume` hook.
    pub async fn result(&self) -> Result<T, TaskError> {
        let mut settled = self.shared.settled.subscribe();
        // the sender lives as long as `shared`, the channel can't close under us
        let _ = settled.wait_for(|settled| *settled).await;

        if !self.shared.consumed.swap(true, Ordering::SeqCst) {
            let hook = self.shared.on_consume.lock().expect("task hook lock poisoned").take();
            if let Some(hook) = hook {
                hook();
            }
        }
        let outcome = self.shared.outcome.lock().expect("task outcome lock poisoned").clone();
        outcome.unwrap_or(Err(TaskError::Cancelled { id: self.shared.id }))
    }
}

impl<T> TaskShared<T> {
    fn settle(&self, outcome: Result<T, TaskError>) {
        let mut slot = self.outcome.lock().expect("task outcome lock poisoned");
        if slot.is_some() {
            return;
        }
        match &outcome {
            Err(err) if self.deferred => tracing::trace!("{err} (deferred until consumed)"),
            Err(err) => crate::action_warn!(format!("task {}", self.id), "failed", "{}", err),
            Ok(_) => {}
        }
        *slot = Some(outcome);
        drop(slot);
        self.settled.send_replace(true);
    }
}

impl<T> Drop for TaskShared<T> {
    fn drop(&mut self) {
        let rejected = matches!(self.outcome.get_mut(), Ok(Some(Err(_))));
        if self.deferred && rejected && !*self.consumed.get_mut() {
            tracing::trace!("task {} failure was never observed", self.id);
        }
    }
}

/// Owned by the spawned future: settles the task as cancelled if the runtime drops it early,
/// and removes the task from its tracker once settled
struct SettleGuard<T> {
    shared: Arc<TaskShared<T>>,
    registry: Option<Weak<Registry>>,
}

impl<T> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        self.shared.settle(Err(TaskError::Cancelled { id: self.shared.id }));
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.remove(&self.shared.id);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Keeps track of in-flight tasks so that a caller can wait for everything started so far.
///
/// Tasks are spawned on the current tokio runtime, so [`TaskTracker::track`] must be called
/// within one.
#[derive(Clone, Default)]
pub struct TaskTracker {
    tasks: Arc<Registry>,
}

impl TaskTracker {
    pub fn new() -> Self { Self::default() }

    pub fn track<T, F>(&self, future: F) -> TrackedTask<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        TrackedTask::spawn_inner(future, false, Some(&self.tasks))
    }

    pub fn track_deferred<T, F>(&self, future: F) -> TrackedTask<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        TrackedTask::spawn_inner(future, true, Some(&self.tasks))
    }

    /// Wait until every task in flight at the time of the call has settled. Tasks tracked
    /// afterwards are not waited for. Returns how many tasks were awaited.
    pub async fn await_all(&self) -> usize {
        let pending = self.tasks.values();
        let count = pending.len();
        for mut settled in pending {
            let _ = settled.wait_for(|settled| *settled).await;
        }
        count
    }

    pub fn in_flight(&self) -> usize { self.tasks.len() }
}
