//! Subscriptions: the demand-signaling side of a flow.

use std::sync::Arc;

use super::disposable::{Disposable, DisposableImpl};

/// Internal interface of a [`Subscription`].
pub trait SubscriptionImpl: Send + Sync {
    /// Signals demand for `n` more items.
    fn request(&self, n: usize);

    /// Stops the producer. Idempotent; in-flight items may still arrive.
    fn dispose(&self);

    fn disposed(&self) -> bool;
}

/// Controls the flow of items from one observable to one observer.
/// An invalid (default) subscription ignores all calls.
#[derive(Clone, Default)]
pub struct Subscription {
    inner: Option<Arc<dyn SubscriptionImpl>>,
}

impl Subscription {
    pub fn new(inner: Arc<dyn SubscriptionImpl>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn request(&self, n: usize) {
        if let Some(inner) = &self.inner {
            inner.request(n);
        }
    }

    pub fn dispose(&self) {
        if let Some(inner) = &self.inner {
            inner.dispose();
        }
    }

    pub fn disposed(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.disposed(),
            None => true,
        }
    }

    /// Invalidates this handle without disposing the producer.
    pub fn reset(&mut self) {
        self.inner = None;
    }

    pub fn as_disposable(&self) -> Disposable {
        match &self.inner {
            Some(inner) => Disposable::new(Arc::new(SubscriptionDisposable {
                inner: inner.clone(),
            })),
            None => Disposable::empty(),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("valid", &self.valid())
            .finish()
    }
}

struct SubscriptionDisposable {
    inner: Arc<dyn SubscriptionImpl>,
}

impl DisposableImpl for SubscriptionDisposable {
    fn dispose(&self) {
        self.inner.dispose();
    }

    fn disposed(&self) -> bool {
        self.inner.disposed()
    }
}
