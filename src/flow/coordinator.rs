//! Coordinators: the single-threaded drivers of flow callbacks.

use std::sync::Arc;

use crate::actor::WeakActorHandle;

use super::disposable::{Action, Disposable};

/// Serializes flow callbacks for one owner. Actor-backed coordinators run
/// delayed actions between mailbox dispatches on the actor's worker thread;
/// [`super::ScopedCoordinator`] runs them in its own `run` loop.
pub trait Coordinator: Send + Sync {
    /// Enqueues a callable to run on the owner's thread, after the current
    /// callback and before the next mailbox dequeue.
    fn delay(&self, action: Action);

    /// Extends the owner's liveness until the disposable reports disposed.
    fn watch(&self, disposable: Disposable);
}

/// Cloneable handle to a coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Arc<dyn Coordinator>,
}

impl CoordinatorHandle {
    pub fn new(inner: Arc<dyn Coordinator>) -> Self {
        Self { inner }
    }

    pub(crate) fn for_actor(target: WeakActorHandle) -> Self {
        Self::new(Arc::new(ActorCoordinator { target }))
    }

    pub fn delay(&self, action: Action) {
        self.inner.delay(action);
    }

    /// Sugar: wraps `f` in a one-shot [`Action`].
    pub fn delay_fn<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.delay(Action::once(f));
    }

    pub fn watch(&self, disposable: Disposable) {
        self.inner.watch(disposable);
    }
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CoordinatorHandle")
    }
}

/// Routes flow callbacks onto an actor's own thread via its action queue.
struct ActorCoordinator {
    target: WeakActorHandle,
}

impl Coordinator for ActorCoordinator {
    fn delay(&self, action: Action) {
        match self.target.upgrade() {
            Some(handle) => handle.block().enqueue_action(action),
            // Owner gone: the callback can never run.
            None => action.dispose(),
        }
    }

    fn watch(&self, disposable: Disposable) {
        if let Some(handle) = self.target.upgrade() {
            handle.block().watched.lock().push(disposable);
        }
    }
}
