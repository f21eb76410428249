//! Sequential combinator.
//!
//! Subscribes to each input in order, completing one before subscribing to
//! the next; demand unused by the previous input carries over to its
//! successor. Inputs may be plain observables or an observable factory (an
//! observable of observables) that is asked for one inner observable at a
//! time.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Error;
use crate::flow::coordinator::CoordinatorHandle;
use crate::flow::disposable::{Disposable, DisposableImpl};
use crate::flow::observable::{Obs, ObservableImpl};
use crate::flow::observer::{Observer, ObserverHandle};
use crate::flow::subscription::{Subscription, SubscriptionImpl};

use super::source::empty;

/// One concat input.
pub enum ConcatInput<T> {
    /// A plain observable.
    One(Obs<T>),
    /// A factory: each emitted observable is drained before the next is
    /// requested.
    Factory(Obs<Obs<T>>),
}

impl<T> Clone for ConcatInput<T> {
    fn clone(&self) -> Self {
        match self {
            ConcatInput::One(obs) => ConcatInput::One(obs.clone()),
            ConcatInput::Factory(fac) => ConcatInput::Factory(fac.clone()),
        }
    }
}

/// Concatenates plain observables.
pub fn concat<T: Send + 'static>(coord: &CoordinatorHandle, inputs: Vec<Obs<T>>) -> Obs<T> {
    concat_all(coord, inputs.into_iter().map(ConcatInput::One).collect())
}

/// Concatenates a mixed list of observables and factories.
pub fn concat_all<T: Send + 'static>(
    coord: &CoordinatorHandle,
    inputs: Vec<ConcatInput<T>>,
) -> Obs<T> {
    Obs::new(Arc::new(ConcatOp {
        coord: coord.clone(),
        inputs,
    }))
}

struct ConcatOp<T> {
    coord: CoordinatorHandle,
    inputs: Vec<ConcatInput<T>>,
}

impl<T: Send + 'static> ObservableImpl<T> for ConcatOp<T> {
    fn subscribe_observer(&self, out: ObserverHandle<T>) -> Disposable {
        if self.inputs.is_empty() {
            return empty::<T>(&self.coord).subscribe_handle(out);
        }
        let sub: Arc<ConcatSub<T>> = Arc::new_cyclic(|self_weak| ConcatSub {
            coord: self.coord.clone(),
            state: Mutex::new(ConcatState {
                out: Some(out.clone()),
                delay_error: false,
                err: None,
                inputs: self.inputs.iter().cloned().collect(),
                factory_sub: Subscription::empty(),
                active_sub: Subscription::empty(),
                factory_key: 0,
                active_key: 0,
                next_key: 1,
                in_flight: 0,
            }),
            self_weak: self_weak.clone(),
        });
        out.on_subscribe(Subscription::new(sub.clone()));
        sub.subscribe_next();
        Disposable::new(sub)
    }

    fn coordinator(&self) -> CoordinatorHandle {
        self.coord.clone()
    }
}

struct ConcatState<T> {
    out: Option<ObserverHandle<T>>,
    delay_error: bool,
    err: Option<Error>,
    /// Pending inputs; the front is subscribed next.
    inputs: VecDeque<ConcatInput<T>>,
    factory_sub: Subscription,
    active_sub: Subscription,
    factory_key: u64,
    active_key: u64,
    next_key: u64,
    /// Demand granted downstream but not yet served; carries over when
    /// switching inputs.
    in_flight: usize,
}

struct ConcatSub<T> {
    coord: CoordinatorHandle,
    state: Mutex<ConcatState<T>>,
    self_weak: Weak<Self>,
}

enum NextStep<T> {
    RequestFactory(Subscription),
    SubscribeOne(Obs<T>, u64),
    SubscribeFactory(Obs<Obs<T>>, u64),
    Fin,
    Nothing,
}

impl<T: Send + 'static> ConcatSub<T> {
    fn me(&self) -> Option<Arc<Self>> {
        self.self_weak.upgrade()
    }

    fn subscribe_next(&self) {
        let step = {
            let mut s = self.state.lock();
            if s.out.is_none() {
                NextStep::Nothing
            } else if s.factory_key != 0 && s.factory_sub.valid() {
                // Ask the factory for the next observable.
                NextStep::RequestFactory(s.factory_sub.clone())
            } else {
                match s.inputs.pop_front() {
                    Some(ConcatInput::One(obs)) => {
                        let key = s.next_key;
                        s.next_key += 1;
                        s.active_key = key;
                        NextStep::SubscribeOne(obs, key)
                    }
                    Some(ConcatInput::Factory(fac)) => {
                        let key = s.next_key;
                        s.next_key += 1;
                        s.factory_key = key;
                        NextStep::SubscribeFactory(fac, key)
                    }
                    None => NextStep::Fin,
                }
            }
        };
        match step {
            NextStep::RequestFactory(sub) => sub.request(1),
            NextStep::SubscribeOne(obs, key) => {
                let Some(parent) = self.me() else { return };
                obs.subscribe_handle(ObserverHandle::new(ItemForwarder { parent, key }));
            }
            NextStep::SubscribeFactory(fac, key) => {
                let Some(parent) = self.me() else { return };
                fac.subscribe_handle(ObserverHandle::new(FactoryForwarder { parent, key }));
            }
            NextStep::Fin => self.fin(),
            NextStep::Nothing => {}
        }
    }

    fn subscribe_inner(&self, obs: Obs<T>) {
        let key = {
            let mut s = self.state.lock();
            let key = s.next_key;
            s.next_key += 1;
            s.active_key = key;
            key
        };
        let Some(parent) = self.me() else { return };
        obs.subscribe_handle(ObserverHandle::new(ItemForwarder { parent, key }));
    }

    fn fwd_on_subscribe(&self, key: u64, sub: Subscription) {
        enum Act {
            Adopt(Subscription, usize),
            AdoptFactory(Subscription),
            Reject(Subscription),
        }
        let act = {
            let mut s = self.state.lock();
            if s.active_key == key && !s.active_sub.valid() {
                s.active_sub = sub.clone();
                Act::Adopt(sub, s.in_flight)
            } else if s.factory_key == key && !s.factory_sub.valid() {
                s.factory_sub = sub.clone();
                Act::AdoptFactory(sub)
            } else {
                Act::Reject(sub)
            }
        };
        match act {
            Act::Adopt(sub, in_flight) => {
                // Carry over unused demand from the previous input.
                if in_flight > 0 {
                    sub.request(in_flight);
                }
            }
            Act::AdoptFactory(sub) => sub.request(1),
            Act::Reject(sub) => sub.dispose(),
        }
    }

    fn fwd_on_next(&self, key: u64, item: T) {
        let out = {
            let mut s = self.state.lock();
            if s.active_key == key && s.out.is_some() {
                s.in_flight = s.in_flight.saturating_sub(1);
                s.out.clone()
            } else {
                None
            }
        };
        if let Some(out) = out {
            out.on_next(item);
        }
    }

    fn fwd_on_factory_next(&self, key: u64, inner: Obs<T>) {
        let adopt = {
            let s = self.state.lock();
            s.factory_key == key && !s.active_sub.valid() && s.out.is_some()
        };
        if adopt {
            self.subscribe_inner(inner);
        }
    }

    fn fwd_on_complete(&self, key: u64) {
        let proceed = {
            let mut s = self.state.lock();
            if s.active_key == key && s.active_sub.valid() {
                s.active_sub = Subscription::empty();
                true
            } else if s.factory_key == key && s.factory_sub.valid() {
                s.factory_sub = Subscription::empty();
                s.factory_key = 0;
                !s.active_sub.valid()
            } else {
                false
            }
        };
        if proceed {
            self.subscribe_next();
        }
    }

    fn fwd_on_error(&self, key: u64, err: Error) {
        enum Act {
            Continue,
            Abort,
            Ignore,
        }
        let act = {
            let mut s = self.state.lock();
            if key != s.active_key && key != s.factory_key {
                Act::Ignore
            } else if s.delay_error {
                if s.err.is_none() {
                    s.err = Some(err.clone());
                }
                if key == s.active_key {
                    s.active_sub = Subscription::empty();
                } else {
                    s.factory_sub = Subscription::empty();
                    s.factory_key = 0;
                }
                Act::Continue
            } else {
                s.err = Some(err.clone());
                Act::Abort
            }
        };
        match act {
            Act::Continue => self.subscribe_next(),
            Act::Abort => self.fin(),
            Act::Ignore => {}
        }
    }

    /// Tears everything down and emits the terminal event.
    fn fin(&self) {
        let (factory_sub, active_sub, out, err) = {
            let mut s = self.state.lock();
            let factory_sub = std::mem::take(&mut s.factory_sub);
            let active_sub = std::mem::take(&mut s.active_sub);
            s.factory_key = 0;
            s.active_key = 0;
            (factory_sub, active_sub, s.out.take(), s.err.take())
        };
        factory_sub.dispose();
        active_sub.dispose();
        if let Some(out) = out {
            match err {
                Some(err) => out.on_error(err),
                None => out.on_complete(),
            }
        }
    }

    /// Silent cancellation: severs the inputs and drops the downstream
    /// handle without a terminal callback.
    fn tear_down(&self) {
        let (factory_sub, active_sub) = {
            let mut s = self.state.lock();
            let factory_sub = std::mem::take(&mut s.factory_sub);
            let active_sub = std::mem::take(&mut s.active_sub);
            s.factory_key = 0;
            s.active_key = 0;
            s.err = None;
            s.inputs.clear();
            s.out = None;
            (factory_sub, active_sub)
        };
        factory_sub.dispose();
        active_sub.dispose();
    }
}

impl<T: Send + 'static> SubscriptionImpl for ConcatSub<T> {
    fn request(&self, n: usize) {
        let active = {
            let mut s = self.state.lock();
            s.in_flight += n;
            s.active_sub.clone()
        };
        if active.valid() {
            active.request(n);
        }
    }

    fn dispose(&self) {
        let Some(me) = self.me() else { return };
        let has_out = self.state.lock().out.is_some();
        if has_out {
            self.coord.delay_fn(move || me.tear_down());
        }
    }

    fn disposed(&self) -> bool {
        self.state.lock().out.is_none()
    }
}

impl<T: Send + 'static> DisposableImpl for ConcatSub<T> {
    fn dispose(&self) {
        SubscriptionImpl::dispose(self);
    }

    fn disposed(&self) -> bool {
        SubscriptionImpl::disposed(self)
    }
}

struct ItemForwarder<T> {
    parent: Arc<ConcatSub<T>>,
    key: u64,
}

impl<T: Send + 'static> Observer<T> for ItemForwarder<T> {
    fn on_subscribe(&mut self, sub: Subscription) {
        self.parent.fwd_on_subscribe(self.key, sub);
    }

    fn on_next(&mut self, item: T) {
        self.parent.fwd_on_next(self.key, item);
    }

    fn on_complete(&mut self) {
        self.parent.fwd_on_complete(self.key);
    }

    fn on_error(&mut self, err: Error) {
        self.parent.fwd_on_error(self.key, err);
    }
}

struct FactoryForwarder<T> {
    parent: Arc<ConcatSub<T>>,
    key: u64,
}

impl<T: Send + 'static> Observer<Obs<T>> for FactoryForwarder<T> {
    fn on_subscribe(&mut self, sub: Subscription) {
        self.parent.fwd_on_subscribe(self.key, sub);
    }

    fn on_next(&mut self, inner: Obs<T>) {
        self.parent.fwd_on_factory_next(self.key, inner);
    }

    fn on_complete(&mut self) {
        self.parent.fwd_on_complete(self.key);
    }

    fn on_error(&mut self, err: Error) {
        self.parent.fwd_on_error(self.key, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ops::source::{from_iter, just};
    use crate::flow::scoped::ScopedCoordinator;
    use crate::flow::testing::{Collector, DemandProbe};

    #[test]
    fn inputs_drain_in_order() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let a = from_iter(&handle, vec![1u64, 2, 3]);
        let b = from_iter(&handle, vec![4u64, 5]);
        let collector = Collector::new();
        concat(&handle, vec![a, b]).subscribe_handle(collector.handle());
        collector.request(10);
        coord.run_pending();
        assert_eq!(collector.items(), vec![1, 2, 3, 4, 5]);
        assert!(collector.completed());
    }

    #[test]
    fn unused_demand_carries_over() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let a = from_iter(&handle, vec![1u64, 2, 3]);
        let probe = DemandProbe::new(&handle);
        let collector = Collector::new();
        concat(&handle, vec![a, probe.observable()]).subscribe_handle(collector.handle());
        collector.request(10);
        coord.run_pending();
        // `a` served 3 of the 10; the second input sees the remaining 7 at
        // subscription time.
        assert_eq!(collector.items(), vec![1, 2, 3]);
        assert_eq!(probe.requests(), vec![7]);
    }

    #[test]
    fn factories_are_drained_one_inner_at_a_time() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let inner_a = from_iter(&handle, vec![1u64, 2]);
        let inner_b = just(&handle, 3u64);
        let factory = from_iter(&handle, vec![inner_a, inner_b]);
        let collector = Collector::new();
        concat_all(&handle, vec![ConcatInput::Factory(factory)])
            .subscribe_handle(collector.handle());
        collector.request(10);
        coord.run_pending();
        assert_eq!(collector.items(), vec![1, 2, 3]);
        assert!(collector.completed());
    }

    #[test]
    fn empty_input_list_completes() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let collector = Collector::<u64>::new();
        concat(&handle, Vec::new()).subscribe_handle(collector.handle());
        collector.request(1);
        coord.run_pending();
        assert!(collector.completed());
    }

    #[test]
    fn dispose_is_deferred_and_idempotent() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let a = from_iter(&handle, vec![1u64, 2, 3]);
        let collector = Collector::new();
        let d = concat(&handle, vec![a]).subscribe_handle(collector.handle());
        d.dispose();
        d.dispose();
        coord.run_pending();
        assert!(d.disposed());
        assert!(!collector.completed());
    }
}
