//! Cold sources: restartable per subscriber, synchronous, demand-driven.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::flow::coordinator::CoordinatorHandle;
use crate::flow::disposable::{Disposable, DisposableImpl};
use crate::flow::observable::{Obs, ObservableImpl};
use crate::flow::observer::ObserverHandle;
use crate::flow::subscription::{Subscription, SubscriptionImpl};

/// A source that completes on the first request without emitting.
pub fn empty<T: Send + 'static>(coord: &CoordinatorHandle) -> Obs<T> {
    from_iter(coord, std::iter::empty::<T>())
}

/// Emits exactly `value`, then completes.
pub fn just<T: Send + Clone + Sync + 'static>(coord: &CoordinatorHandle, value: T) -> Obs<T> {
    from_iter(coord, std::iter::once(value))
}

/// Emits `init`, `init + 1`, `init + 2`, … forever.
pub fn iota(coord: &CoordinatorHandle, init: u64) -> Obs<u64> {
    from_iter(coord, init..)
}

/// Cold source over any cloneable iterator; each subscriber restarts it.
pub fn from_iter<I>(coord: &CoordinatorHandle, items: I) -> Obs<I::Item>
where
    I: IntoIterator + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    Obs::new(Arc::new(FromIterOp {
        coord: coord.clone(),
        items,
    }))
}

struct FromIterOp<I> {
    coord: CoordinatorHandle,
    items: I,
}

impl<I> ObservableImpl<I::Item> for FromIterOp<I>
where
    I: IntoIterator + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe_observer(&self, out: ObserverHandle<I::Item>) -> Disposable {
        let sub: Arc<ColdSub<I::IntoIter>> = Arc::new_cyclic(|self_weak| ColdSub {
            coord: self.coord.clone(),
            out: out.clone(),
            iter: Mutex::new(self.items.clone().into_iter()),
            demand: Mutex::new(0),
            scheduled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        });
        out.on_subscribe(Subscription::new(sub.clone()));
        Disposable::new(sub)
    }

    fn coordinator(&self) -> CoordinatorHandle {
        self.coord.clone()
    }
}

struct ColdSub<It: Iterator> {
    coord: CoordinatorHandle,
    out: ObserverHandle<It::Item>,
    iter: Mutex<It>,
    demand: Mutex<usize>,
    scheduled: AtomicBool,
    done: AtomicBool,
    self_weak: Weak<Self>,
}

impl<It> ColdSub<It>
where
    It: Iterator + Send + 'static,
    It::Item: Send + 'static,
{
    fn schedule_drain(&self) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(me) = self.self_weak.upgrade() else {
            return;
        };
        self.coord.delay_fn(move || me.drain());
    }

    /// Runs on the coordinator: emits while demand lasts, one item per
    /// demand unit, completing at iterator end.
    fn drain(&self) {
        self.scheduled.store(false, Ordering::Release);
        loop {
            if self.done.load(Ordering::Acquire) {
                return;
            }
            {
                let mut demand = self.demand.lock();
                if *demand == 0 {
                    return;
                }
                *demand -= 1;
            }
            let item = self.iter.lock().next();
            match item {
                Some(item) => self.out.on_next(item),
                None => {
                    self.done.store(true, Ordering::Release);
                    self.out.on_complete();
                    return;
                }
            }
        }
    }
}

impl<It> SubscriptionImpl for ColdSub<It>
where
    It: Iterator + Send + 'static,
    It::Item: Send + 'static,
{
    fn request(&self, n: usize) {
        if n == 0 || self.done.load(Ordering::Acquire) {
            return;
        }
        *self.demand.lock() += n;
        self.schedule_drain();
    }

    fn dispose(&self) {
        self.done.store(true, Ordering::Release);
    }

    fn disposed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl<It> DisposableImpl for ColdSub<It>
where
    It: Iterator + Send + 'static,
    It::Item: Send + 'static,
{
    fn dispose(&self) {
        SubscriptionImpl::dispose(self);
    }

    fn disposed(&self) -> bool {
        SubscriptionImpl::disposed(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::scoped::ScopedCoordinator;
    use crate::flow::testing::Collector;

    #[test]
    fn empty_completes_on_first_request() {
        let coord = ScopedCoordinator::new();
        let collector = Collector::<u64>::new();
        empty::<u64>(&coord.handle()).subscribe_handle(collector.handle());
        coord.run_pending();
        assert!(!collector.completed());
        collector.request(1);
        coord.run_pending();
        assert!(collector.completed());
        assert!(collector.items().is_empty());
    }

    #[test]
    fn just_is_restartable_per_subscriber() {
        let coord = ScopedCoordinator::new();
        let source = just(&coord.handle(), 7u64);
        for _ in 0..2 {
            let collector = Collector::new();
            source.subscribe_handle(collector.handle());
            collector.request(10);
            coord.run_pending();
            assert_eq!(collector.items(), vec![7]);
            assert!(collector.completed());
        }
    }

    #[test]
    fn iota_respects_demand() {
        let coord = ScopedCoordinator::new();
        let collector = Collector::new();
        iota(&coord.handle(), 5).subscribe_handle(collector.handle());
        collector.request(3);
        coord.run_pending();
        assert_eq!(collector.items(), vec![5, 6, 7]);
        assert!(!collector.completed());
        collector.request(2);
        coord.run_pending();
        assert_eq!(collector.items(), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn dispose_stops_emission() {
        let coord = ScopedCoordinator::new();
        let collector = Collector::new();
        let d = iota(&coord.handle(), 0).subscribe_handle(collector.handle());
        collector.request(2);
        coord.run_pending();
        d.dispose();
        collector.request(10);
        coord.run_pending();
        assert_eq!(collector.items(), vec![0, 1]);
    }
}
