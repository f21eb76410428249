//! Observables and the combinator surface.

use std::sync::Arc;

use super::coordinator::CoordinatorHandle;
use super::disposable::Disposable;
use super::observer::{Observer, ObserverHandle};
use super::ops;
use crate::error::Result;

/// The producing side of a flow.
pub trait ObservableImpl<T>: Send + Sync {
    /// Attaches an observer; returns a handle that severs the whole chain.
    fn subscribe_observer(&self, out: ObserverHandle<T>) -> Disposable;

    /// The coordinator all callbacks of this flow are serialized on.
    fn coordinator(&self) -> CoordinatorHandle;
}

/// Cloneable handle to an observable; combinators build new handles on top.
pub struct Obs<T> {
    inner: Arc<dyn ObservableImpl<T>>,
}

impl<T> Clone for Obs<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Obs<T> {
    pub fn new(inner: Arc<dyn ObservableImpl<T>>) -> Self {
        Self { inner }
    }

    pub fn coordinator(&self) -> CoordinatorHandle {
        self.inner.coordinator()
    }

    /// Subscribes a boxed-up observer value.
    pub fn subscribe_with(&self, observer: impl Observer<T> + 'static) -> Disposable {
        self.inner.subscribe_observer(ObserverHandle::new(observer))
    }

    /// Subscribes an existing observer handle.
    pub fn subscribe_handle(&self, out: ObserverHandle<T>) -> Disposable {
        self.inner.subscribe_observer(out)
    }

    /// Terminal: calls `f` for each item, requesting demand in chunks.
    pub fn for_each<F>(&self, f: F) -> Disposable
    where
        F: FnMut(T) + Send + 'static,
    {
        self.subscribe_with(ops::sink::ForEach::new(f))
    }

    /// 1-to-1 transform. A panic in `f` propagates to the hosting
    /// coordinator; use [`Obs::try_map`] for recoverable failures.
    pub fn map<U, F>(&self, f: F) -> Obs<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        ops::transform::map(self, f)
    }

    /// Fallible transform: an `Err` disposes upstream and emits `on_error`.
    pub fn try_map<U, F>(&self, f: F) -> Obs<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Result<U> + Send + 'static,
    {
        ops::transform::try_map(self, f)
    }

    /// Keeps items matching `p`; dropped items re-request upstream so
    /// downstream demand is still satisfied.
    pub fn filter<P>(&self, p: P) -> Obs<T>
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        ops::transform::filter(self, p)
    }

    /// At most `n` items, then completes and severs upstream.
    pub fn take(&self, n: usize) -> Obs<T> {
        ops::transform::take(self, n)
    }

    /// Discards the first `n` items.
    pub fn skip(&self, n: usize) -> Obs<T> {
        ops::transform::skip(self, n)
    }

    /// This observable, then `other`; unused demand carries over.
    pub fn concat_with(&self, other: &Obs<T>) -> Obs<T> {
        ops::concat(&self.coordinator(), vec![self.clone(), other.clone()])
    }

    /// Interleaves with `other` as items arrive.
    pub fn merge_with(&self, other: &Obs<T>) -> Obs<T> {
        ops::merge(&self.coordinator(), vec![self.clone(), other.clone()], usize::MAX)
    }

    /// Buffers up to `n` items for a slow consumer, then errors it out and
    /// severs upstream.
    pub fn on_backpressure_buffer(&self, n: usize) -> Obs<T>
    where
        T: Clone,
    {
        ops::buffer::on_backpressure_buffer(self, n)
    }

    /// Multicast with an explicit `connect` call.
    pub fn publish(&self) -> ops::Publish<T>
    where
        T: Clone,
    {
        ops::publish::publish(self)
    }

    /// Multicast that connects to the source on the first subscriber.
    pub fn share(&self) -> Obs<T>
    where
        T: Clone,
    {
        ops::publish::share(self)
    }
}

impl<T> std::fmt::Debug for Obs<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Obs")
    }
}
