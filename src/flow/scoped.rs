//! A coordinator for plain threads.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::coordinator::{Coordinator, CoordinatorHandle};
use super::disposable::{Action, Disposable};

struct ScopedInner {
    actions: Mutex<VecDeque<Action>>,
    cv: Condvar,
    watched: Mutex<Vec<Disposable>>,
}

impl Coordinator for ScopedInner {
    fn delay(&self, action: Action) {
        let mut actions = self.actions.lock();
        actions.push_back(action);
        if actions.len() == 1 {
            self.cv.notify_all();
        }
    }

    fn watch(&self, disposable: Disposable) {
        self.watched.lock().push(disposable);
    }
}

/// Runs flows on the calling thread: processes delayed actions until none
/// remain and no watched disposable is still alive.
pub struct ScopedCoordinator {
    inner: Arc<ScopedInner>,
}

impl ScopedCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopedInner {
                actions: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
                watched: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Handle for building flows on this coordinator.
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle::new(self.inner.clone())
    }

    /// Blocking loop: waits for actions, runs them, drops disposed flows,
    /// and returns once the queue is empty and nothing is watched anymore.
    pub fn run(&self) {
        loop {
            let action = {
                let mut actions = self.inner.actions.lock();
                loop {
                    if let Some(action) = actions.pop_front() {
                        break Some(action);
                    }
                    if self.all_watched_disposed() {
                        break None;
                    }
                    self.inner.cv.wait(&mut actions);
                }
            };
            match action {
                Some(action) => {
                    action.run();
                    self.drop_disposed_flows();
                }
                None => return,
            }
        }
    }

    /// Non-blocking variant: runs whatever is queued right now (including
    /// follow-ups those actions enqueue) and returns.
    pub fn run_pending(&self) {
        loop {
            let action = self.inner.actions.lock().pop_front();
            match action {
                Some(action) => {
                    action.run();
                    self.drop_disposed_flows();
                }
                None => return,
            }
        }
    }

    pub fn pending_actions(&self) -> usize {
        self.inner.actions.lock().len()
    }

    pub fn watched_flows(&self) -> usize {
        self.inner.watched.lock().len()
    }

    fn all_watched_disposed(&self) -> bool {
        self.inner.watched.lock().iter().all(Disposable::disposed)
    }

    fn drop_disposed_flows(&self) {
        self.inner.watched.lock().retain(|d| !d.disposed());
    }
}

impl Default for ScopedCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_pending_executes_queued_actions_in_order() {
        let coord = ScopedCoordinator::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handle = coord.handle();
        for i in 0..3 {
            let order = order.clone();
            handle.delay_fn(move || order.lock().push(i));
        }
        coord.run_pending();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn actions_may_enqueue_follow_ups() {
        let coord = ScopedCoordinator::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = coord.handle();
        let inner_handle = handle.clone();
        let inner_hits = hits.clone();
        handle.delay_fn(move || {
            let hits = inner_hits.clone();
            inner_handle.delay_fn(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        });
        coord.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_returns_once_watched_flows_are_disposed() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let action = Action::new(|| {});
        handle.watch(action.as_disposable());
        let to_dispose = action.clone();
        handle.delay_fn(move || to_dispose.dispose());
        coord.run();
        assert_eq!(coord.watched_flows(), 0);
    }
}
