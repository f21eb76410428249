//! One-input transforms: map, try_map, filter, take, skip.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::flow::coordinator::CoordinatorHandle;
use crate::flow::disposable::Disposable;
use crate::flow::observable::{Obs, ObservableImpl};
use crate::flow::observer::{Observer, ObserverHandle};
use crate::flow::subscription::{Subscription, SubscriptionImpl};

/// Builds an operator from a source plus a per-subscriber observer factory.
struct TransformOp<T, U, F> {
    source: Obs<T>,
    make: F,
    _marker: std::marker::PhantomData<fn() -> U>,
}

impl<T, U, F> ObservableImpl<U> for TransformOp<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(ObserverHandle<U>) -> ObserverHandle<T> + Send + Sync + 'static,
{
    fn subscribe_observer(&self, out: ObserverHandle<U>) -> Disposable {
        self.source.subscribe_handle((self.make)(out))
    }

    fn coordinator(&self) -> CoordinatorHandle {
        self.source.coordinator()
    }
}

fn lift<T, U, F>(source: &Obs<T>, make: F) -> Obs<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(ObserverHandle<U>) -> ObserverHandle<T> + Send + Sync + 'static,
{
    Obs::new(Arc::new(TransformOp {
        source: source.clone(),
        make,
        _marker: std::marker::PhantomData,
    }))
}

// -- map --------------------------------------------------------------------

pub(crate) fn map<T, U, F>(source: &Obs<T>, f: F) -> Obs<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    let f = Arc::new(Mutex::new(f));
    lift(source, move |out| {
        ObserverHandle::new(MapObserver {
            out,
            f: f.clone(),
            _marker: std::marker::PhantomData,
        })
    })
}

struct MapObserver<T, U, F: FnMut(T) -> U> {
    out: ObserverHandle<U>,
    f: Arc<Mutex<F>>,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, U, F> Observer<T> for MapObserver<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    fn on_subscribe(&mut self, sub: Subscription) {
        // Demand maps one to one; the upstream subscription serves directly.
        self.out.on_subscribe(sub);
    }

    fn on_next(&mut self, item: T) {
        let mapped = (self.f.lock())(item);
        self.out.on_next(mapped);
    }

    fn on_complete(&mut self) {
        self.out.on_complete();
    }

    fn on_error(&mut self, err: Error) {
        self.out.on_error(err);
    }
}

// -- try_map ----------------------------------------------------------------

pub(crate) fn try_map<T, U, F>(source: &Obs<T>, f: F) -> Obs<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Result<U> + Send + 'static,
{
    let f = Arc::new(Mutex::new(f));
    lift(source, move |out| {
        ObserverHandle::new(TryMapObserver {
            out,
            f: f.clone(),
            sub: Subscription::empty(),
            failed: false,
            _marker: std::marker::PhantomData,
        })
    })
}

struct TryMapObserver<T, U, F: FnMut(T) -> Result<U>> {
    out: ObserverHandle<U>,
    f: Arc<Mutex<F>>,
    sub: Subscription,
    failed: bool,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, U, F> Observer<T> for TryMapObserver<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Result<U> + Send + 'static,
{
    fn on_subscribe(&mut self, sub: Subscription) {
        self.sub = sub.clone();
        self.out.on_subscribe(sub);
    }

    fn on_next(&mut self, item: T) {
        if self.failed {
            return;
        }
        let mapped = (self.f.lock())(item);
        match mapped {
            Ok(mapped) => self.out.on_next(mapped),
            Err(err) => {
                self.failed = true;
                self.sub.dispose();
                self.out.on_error(err);
            }
        }
    }

    fn on_complete(&mut self) {
        if !self.failed {
            self.out.on_complete();
        }
    }

    fn on_error(&mut self, err: Error) {
        if !self.failed {
            self.out.on_error(err);
        }
    }
}

// -- filter -----------------------------------------------------------------

pub(crate) fn filter<T, P>(source: &Obs<T>, p: P) -> Obs<T>
where
    T: Send + 'static,
    P: FnMut(&T) -> bool + Send + 'static,
{
    let p = Arc::new(Mutex::new(p));
    lift(source, move |out| {
        ObserverHandle::new(FilterObserver {
            out,
            p: p.clone(),
            sub: Subscription::empty(),
        })
    })
}

struct FilterObserver<T, P: FnMut(&T) -> bool> {
    out: ObserverHandle<T>,
    p: Arc<Mutex<P>>,
    sub: Subscription,
}

impl<T, P> Observer<T> for FilterObserver<T, P>
where
    T: Send + 'static,
    P: FnMut(&T) -> bool + Send + 'static,
{
    fn on_subscribe(&mut self, sub: Subscription) {
        self.sub = sub.clone();
        self.out.on_subscribe(sub);
    }

    fn on_next(&mut self, item: T) {
        let keep = (self.p.lock())(&item);
        if keep {
            self.out.on_next(item);
        } else {
            // Replace the dropped item so downstream demand stays served.
            self.sub.request(1);
        }
    }

    fn on_complete(&mut self) {
        self.out.on_complete();
    }

    fn on_error(&mut self, err: Error) {
        self.out.on_error(err);
    }
}

// -- take -------------------------------------------------------------------

pub(crate) fn take<T>(source: &Obs<T>, n: usize) -> Obs<T>
where
    T: Send + 'static,
{
    lift(source, move |out| {
        ObserverHandle::new(TakeObserver {
            out,
            remaining: n,
            done: false,
            upstream: Subscription::empty(),
        })
    })
}

struct TakeObserver<T> {
    out: ObserverHandle<T>,
    remaining: usize,
    done: bool,
    upstream: Subscription,
}

impl<T: Send + 'static> Observer<T> for TakeObserver<T> {
    fn on_subscribe(&mut self, sub: Subscription) {
        if self.remaining == 0 {
            self.done = true;
            sub.dispose();
            self.out.on_subscribe(Subscription::empty());
            self.out.on_complete();
            return;
        }
        self.upstream = sub.clone();
        let capped = Subscription::new(Arc::new(CappedSub {
            upstream: sub,
            left: AtomicUsize::new(self.remaining),
        }));
        self.out.on_subscribe(capped);
    }

    fn on_next(&mut self, item: T) {
        if self.done || self.remaining == 0 {
            return;
        }
        self.remaining -= 1;
        self.out.on_next(item);
        if self.remaining == 0 {
            self.done = true;
            self.upstream.dispose();
            self.out.on_complete();
        }
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.done = true;
            self.out.on_complete();
        }
    }

    fn on_error(&mut self, err: Error) {
        if !self.done {
            self.done = true;
            self.out.on_error(err);
        }
    }
}

/// Forwards at most `left` units of demand upstream, then severs it.
struct CappedSub {
    upstream: Subscription,
    left: AtomicUsize,
}

impl SubscriptionImpl for CappedSub {
    fn request(&self, n: usize) {
        let mut granted = 0;
        let mut left = self.left.load(Ordering::Acquire);
        while left > 0 {
            let grant = n.min(left);
            match self.left.compare_exchange(
                left,
                left - grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    granted = grant;
                    break;
                }
                Err(actual) => left = actual,
            }
        }
        if granted > 0 {
            self.upstream.request(granted);
        }
    }

    fn dispose(&self) {
        self.upstream.dispose();
    }

    fn disposed(&self) -> bool {
        self.upstream.disposed()
    }
}

// -- skip -------------------------------------------------------------------

pub(crate) fn skip<T>(source: &Obs<T>, n: usize) -> Obs<T>
where
    T: Send + 'static,
{
    lift(source, move |out| {
        ObserverHandle::new(SkipObserver {
            out,
            to_skip: n,
        })
    })
}

struct SkipObserver<T> {
    out: ObserverHandle<T>,
    to_skip: usize,
}

impl<T: Send + 'static> Observer<T> for SkipObserver<T> {
    fn on_subscribe(&mut self, sub: Subscription) {
        let padded = Subscription::new(Arc::new(PaddedSub {
            upstream: sub,
            extra: AtomicUsize::new(self.to_skip),
            first: AtomicBool::new(true),
        }));
        self.out.on_subscribe(padded);
    }

    fn on_next(&mut self, item: T) {
        if self.to_skip > 0 {
            self.to_skip -= 1;
            return;
        }
        self.out.on_next(item);
    }

    fn on_complete(&mut self) {
        self.out.on_complete();
    }

    fn on_error(&mut self, err: Error) {
        self.out.on_error(err);
    }
}

/// Adds the skipped prefix to the first downstream request.
struct PaddedSub {
    upstream: Subscription,
    extra: AtomicUsize,
    first: AtomicBool,
}

impl SubscriptionImpl for PaddedSub {
    fn request(&self, n: usize) {
        let extra = if self.first.swap(false, Ordering::AcqRel) {
            self.extra.swap(0, Ordering::AcqRel)
        } else {
            0
        };
        self.upstream.request(n + extra);
    }

    fn dispose(&self) {
        self.upstream.dispose();
    }

    fn disposed(&self) -> bool {
        self.upstream.disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::flow::ops::source::{from_iter, iota};
    use crate::flow::scoped::ScopedCoordinator;
    use crate::flow::testing::Collector;

    #[test]
    fn map_transforms_one_to_one() {
        let coord = ScopedCoordinator::new();
        let collector = Collector::new();
        iota(&coord.handle(), 0)
            .map(|n| n * 2)
            .subscribe_handle(collector.handle());
        collector.request(3);
        coord.run_pending();
        assert_eq!(collector.items(), vec![0, 2, 4]);
    }

    #[test]
    fn try_map_errors_abort_the_flow() {
        let coord = ScopedCoordinator::new();
        let collector = Collector::new();
        iota(&coord.handle(), 0)
            .try_map(|n| {
                if n < 2 {
                    Ok(n)
                } else {
                    Err(Error::new(ErrorCode::InvalidArgument))
                }
            })
            .subscribe_handle(collector.handle());
        collector.request(10);
        coord.run_pending();
        assert_eq!(collector.items(), vec![0, 1]);
        assert_eq!(collector.error().map(|e| e.code()), Some(ErrorCode::InvalidArgument));
        assert!(!collector.completed());
    }

    #[test]
    fn filter_replaces_dropped_demand() {
        let coord = ScopedCoordinator::new();
        let collector = Collector::new();
        iota(&coord.handle(), 0)
            .filter(|n| n % 2 == 0)
            .subscribe_handle(collector.handle());
        collector.request(3);
        coord.run_pending();
        // Three even numbers arrive even though odds were dropped upstream.
        assert_eq!(collector.items(), vec![0, 2, 4]);
    }

    #[test]
    fn take_completes_at_the_bound() {
        let coord = ScopedCoordinator::new();
        let collector = Collector::new();
        iota(&coord.handle(), 0)
            .take(4)
            .subscribe_handle(collector.handle());
        collector.request(100);
        coord.run_pending();
        assert_eq!(collector.items(), vec![0, 1, 2, 3]);
        assert!(collector.completed());
    }

    #[test]
    fn take_zero_completes_immediately() {
        let coord = ScopedCoordinator::new();
        let collector = Collector::<u64>::new();
        iota(&coord.handle(), 0)
            .take(0)
            .subscribe_handle(collector.handle());
        coord.run_pending();
        assert!(collector.completed());
        assert!(collector.items().is_empty());
    }

    #[test]
    fn skip_shifts_the_sequence() {
        let coord = ScopedCoordinator::new();
        let collector = Collector::new();
        from_iter(&coord.handle(), vec![1u64, 2, 3, 4, 5])
            .skip(2)
            .subscribe_handle(collector.handle());
        collector.request(10);
        coord.run_pending();
        assert_eq!(collector.items(), vec![3, 4, 5]);
        assert!(collector.completed());
    }
}
