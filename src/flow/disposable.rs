//! Cancellation handles and schedulable actions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Internal interface of a [`Disposable`].
pub trait DisposableImpl: Send + Sync {
    /// Cancels the underlying operation. Idempotent and safe from any
    /// thread; already-scheduled invocations may still run but will observe
    /// `disposed() == true`.
    fn dispose(&self);

    fn disposed(&self) -> bool;
}

/// Handle whose `dispose()` cancels a scheduled action, subscription, or
/// timeout. A default-constructed disposable is already disposed.
#[derive(Clone, Default)]
pub struct Disposable {
    inner: Option<Arc<dyn DisposableImpl>>,
}

impl Disposable {
    pub fn new(inner: Arc<dyn DisposableImpl>) -> Self {
        Self { inner: Some(inner) }
    }

    /// An already-disposed handle.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps a bare flag; disposing sets it.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self::new(Arc::new(FlagDisposable { flag }))
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
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.disposed())
            .finish()
    }
}

struct FlagDisposable {
    flag: Arc<AtomicBool>,
}

impl DisposableImpl for FlagDisposable {
    fn dispose(&self) {
        self.flag.store(true, Ordering::Release);
    }

    fn disposed(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

type ActionFn = Box<dyn FnMut() + Send>;

struct ActionInner {
    f: Mutex<Option<ActionFn>>,
    disposed: AtomicBool,
}

impl DisposableImpl for ActionInner {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        // Drop the closure if nothing is running it right now; a running
        // invocation finishes and the next `run` clears it.
        if let Some(mut guard) = self.f.try_lock() {
            guard.take();
        }
    }

    fn disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// A re-runnable, cancellable callable. Coordinators and the clock schedule
/// actions; disposing one turns every later `run` into a no-op.
#[derive(Clone)]
pub struct Action {
    inner: Arc<ActionInner>,
}

impl Action {
    /// An action that can run any number of times.
    pub fn new(f: impl FnMut() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(ActionInner {
                f: Mutex::new(Some(Box::new(f))),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// An action that runs at most once and then disposes itself.
    pub fn once(f: impl FnOnce() + Send + 'static) -> Self {
        let mut f = Some(f);
        let inner = Arc::new(ActionInner {
            f: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&inner);
        *inner.f.lock() = Some(Box::new(move || {
            if let Some(f) = f.take() {
                f();
            }
            if let Some(inner) = weak.upgrade() {
                inner.disposed.store(true, Ordering::Release);
            }
        }));
        Self { inner }
    }

    pub fn run(&self) {
        if self.inner.disposed() {
            if let Some(mut guard) = self.inner.f.try_lock() {
                guard.take();
            }
            return;
        }
        // Take the closure out while running so a reentrant dispose never
        // blocks and a reentrant run is a no-op.
        let f = self.inner.f.lock().take();
        if let Some(mut f) = f {
            f();
            if !self.inner.disposed() {
                let mut guard = self.inner.f.lock();
                if guard.is_none() {
                    *guard = Some(f);
                }
            }
        }
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn disposed(&self) -> bool {
        self.inner.disposed()
    }

    pub fn as_disposable(&self) -> Disposable {
        Disposable::new(self.inner.clone())
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("disposed", &self.disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn actions_rerun_until_disposed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let action = Action::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        action.run();
        action.run();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        action.dispose();
        action.run();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispose_is_idempotent() {
        let action = Action::new(|| {});
        action.dispose();
        action.dispose();
        assert!(action.disposed());
        let d = action.as_disposable();
        d.dispose();
        assert!(d.disposed());
    }

    #[test]
    fn once_actions_self_dispose() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let action = Action::once(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!action.disposed());
        action.run();
        assert!(action.disposed());
        action.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_disposable_reports_disposed() {
        assert!(Disposable::empty().disposed());
    }
}
