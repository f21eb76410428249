//! Observers: the consuming side of a flow.

use std::sync::Arc;

use parking_lot::Mutex;

use super::subscription::Subscription;
use crate::error::Error;

/// Receives items from an observable. All callbacks on one observer are
/// serialized on the owning coordinator; after `on_complete` or `on_error`
/// no further callbacks arrive.
pub trait Observer<T>: Send {
    /// Called once with the subscription controlling demand.
    fn on_subscribe(&mut self, sub: Subscription);

    /// Called at most as often as cumulative demand signaled via
    /// `Subscription::request`.
    fn on_next(&mut self, item: T);

    fn on_complete(&mut self);

    fn on_error(&mut self, err: Error);
}

/// Shared handle to an observer; operators hold these.
pub struct ObserverHandle<T> {
    inner: Arc<Mutex<dyn Observer<T>>>,
}

impl<T> Clone for ObserverHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> ObserverHandle<T> {
    pub fn new(observer: impl Observer<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(observer)),
        }
    }

    pub fn on_subscribe(&self, sub: Subscription) {
        self.inner.lock().on_subscribe(sub);
    }

    pub fn on_next(&self, item: T) {
        self.inner.lock().on_next(item);
    }

    pub fn on_complete(&self) {
        self.inner.lock().on_complete();
    }

    pub fn on_error(&self, err: Error) {
        self.inner.lock().on_error(err);
    }
}

impl<T> std::fmt::Debug for ObserverHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ObserverHandle")
    }
}
