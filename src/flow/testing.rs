//! In-crate helpers for flow tests.

use std::sync::Arc;

use parking_lot::Mutex;

use super::coordinator::CoordinatorHandle;
use super::disposable::Disposable;
use super::observable::{Obs, ObservableImpl};
use super::observer::{Observer, ObserverHandle};
use super::subscription::{Subscription, SubscriptionImpl};
use crate::error::Error;

struct CollectorState<T> {
    items: Vec<T>,
    completed: bool,
    error: Option<Error>,
    sub: Subscription,
}

/// Records everything an observer sees; demand is signaled manually.
pub(crate) struct Collector<T> {
    state: Arc<Mutex<CollectorState<T>>>,
}

impl<T: Send + 'static> Collector<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CollectorState {
                items: Vec::new(),
                completed: false,
                error: None,
                sub: Subscription::empty(),
            })),
        }
    }

    pub(crate) fn handle(&self) -> ObserverHandle<T> {
        ObserverHandle::new(CollectorObserver {
            state: self.state.clone(),
        })
    }

    pub(crate) fn request(&self, n: usize) {
        let sub = self.state.lock().sub.clone();
        sub.request(n);
    }

    pub(crate) fn completed(&self) -> bool {
        self.state.lock().completed
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.state.lock().error.clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.state.lock().items.len()
    }
}

impl<T: Clone + Send + 'static> Collector<T> {
    pub(crate) fn items(&self) -> Vec<T> {
        self.state.lock().items.clone()
    }
}

struct CollectorObserver<T> {
    state: Arc<Mutex<CollectorState<T>>>,
}

impl<T: Send + 'static> Observer<T> for CollectorObserver<T> {
    fn on_subscribe(&mut self, sub: Subscription) {
        self.state.lock().sub = sub;
    }

    fn on_next(&mut self, item: T) {
        self.state.lock().items.push(item);
    }

    fn on_complete(&mut self) {
        self.state.lock().completed = true;
    }

    fn on_error(&mut self, err: Error) {
        self.state.lock().error = Some(err);
    }
}

/// A source that never emits but records every `request` call, so tests can
/// observe the demand an operator forwards upstream.
pub(crate) struct DemandProbe {
    coord: CoordinatorHandle,
    requests: Arc<Mutex<Vec<usize>>>,
}

impl DemandProbe {
    pub(crate) fn new(coord: &CoordinatorHandle) -> Self {
        Self {
            coord: coord.clone(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn observable(&self) -> Obs<u64> {
        Obs::new(Arc::new(DemandProbeOp {
            coord: self.coord.clone(),
            requests: self.requests.clone(),
        }))
    }

    pub(crate) fn requests(&self) -> Vec<usize> {
        self.requests.lock().clone()
    }
}

struct DemandProbeOp {
    coord: CoordinatorHandle,
    requests: Arc<Mutex<Vec<usize>>>,
}

impl ObservableImpl<u64> for DemandProbeOp {
    fn subscribe_observer(&self, out: ObserverHandle<u64>) -> Disposable {
        let sub = Arc::new(DemandProbeSub {
            requests: self.requests.clone(),
            disposed: std::sync::atomic::AtomicBool::new(false),
        });
        out.on_subscribe(Subscription::new(sub.clone()));
        Subscription::new(sub).as_disposable()
    }

    fn coordinator(&self) -> CoordinatorHandle {
        self.coord.clone()
    }
}

struct DemandProbeSub {
    requests: Arc<Mutex<Vec<usize>>>,
    disposed: std::sync::atomic::AtomicBool,
}

impl SubscriptionImpl for DemandProbeSub {
    fn request(&self, n: usize) {
        self.requests.lock().push(n);
    }

    fn dispose(&self) {
        self.disposed
            .store(true, std::sync::atomic::Ordering::Release);
    }

    fn disposed(&self) -> bool {
        self.disposed.load(std::sync::atomic::Ordering::Acquire)
    }
}
