//! Parallel combinator.
//!
//! Subscribes to up to `max_concurrent` inputs at once, interleaving their
//! items as they arrive; completes when every input has completed and the
//! buffer is drained. Each active input holds a small demand window that is
//! replenished one-for-one as its items are emitted downstream.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Error;
use crate::flow::coordinator::CoordinatorHandle;
use crate::flow::disposable::{Disposable, DisposableImpl};
use crate::flow::observable::{Obs, ObservableImpl};
use crate::flow::observer::{Observer, ObserverHandle};
use crate::flow::subscription::{Subscription, SubscriptionImpl};

use super::source::empty;

/// Demand window granted to every active input.
const PER_INPUT_WINDOW: usize = 8;

/// Merges `inputs`, running at most `max_concurrent` subscriptions at once.
pub fn merge<T: Send + 'static>(
    coord: &CoordinatorHandle,
    inputs: Vec<Obs<T>>,
    max_concurrent: usize,
) -> Obs<T> {
    Obs::new(Arc::new(MergeOp {
        coord: coord.clone(),
        inputs,
        max_concurrent: max_concurrent.max(1),
    }))
}

struct MergeOp<T> {
    coord: CoordinatorHandle,
    inputs: Vec<Obs<T>>,
    max_concurrent: usize,
}

impl<T: Send + 'static> ObservableImpl<T> for MergeOp<T> {
    fn subscribe_observer(&self, out: ObserverHandle<T>) -> Disposable {
        if self.inputs.is_empty() {
            return empty::<T>(&self.coord).subscribe_handle(out);
        }
        let sub: Arc<MergeSub<T>> = Arc::new_cyclic(|self_weak| MergeSub {
            state: Mutex::new(MergeState {
                out: Some(out.clone()),
                pending_inputs: self.inputs.iter().cloned().collect(),
                active: HashMap::new(),
                awaiting_subscribe: 0,
                buf: VecDeque::new(),
                demand: 0,
                next_key: 1,
                err: None,
                max_concurrent: self.max_concurrent,
            }),
            self_weak: self_weak.clone(),
        });
        out.on_subscribe(Subscription::new(sub.clone()));
        sub.activate_more();
        Disposable::new(sub)
    }

    fn coordinator(&self) -> CoordinatorHandle {
        self.coord.clone()
    }
}

struct MergeState<T> {
    out: Option<ObserverHandle<T>>,
    pending_inputs: VecDeque<Obs<T>>,
    active: HashMap<u64, Subscription>,
    /// Inputs subscribed to whose `on_subscribe` has not arrived yet.
    awaiting_subscribe: usize,
    buf: VecDeque<(u64, T)>,
    demand: usize,
    next_key: u64,
    err: Option<Error>,
    max_concurrent: usize,
}

struct MergeSub<T> {
    state: Mutex<MergeState<T>>,
    self_weak: Weak<Self>,
}

impl<T: Send + 'static> MergeSub<T> {
    fn me(&self) -> Option<Arc<Self>> {
        self.self_weak.upgrade()
    }

    /// Starts subscriptions until the concurrency cap is reached.
    fn activate_more(&self) {
        loop {
            let next = {
                let mut s = self.state.lock();
                if s.out.is_none() {
                    return;
                }
                if s.active.len() + s.awaiting_subscribe >= s.max_concurrent {
                    return;
                }
                match s.pending_inputs.pop_front() {
                    Some(input) => {
                        let key = s.next_key;
                        s.next_key += 1;
                        s.awaiting_subscribe += 1;
                        Some((input, key))
                    }
                    None => None,
                }
            };
            match next {
                Some((input, key)) => {
                    let Some(parent) = self.me() else { return };
                    input.subscribe_handle(ObserverHandle::new(MergeForwarder { parent, key }));
                }
                None => return,
            }
        }
    }

    fn fwd_on_subscribe(&self, key: u64, sub: Subscription) {
        let adopted = {
            let mut s = self.state.lock();
            s.awaiting_subscribe = s.awaiting_subscribe.saturating_sub(1);
            if s.out.is_none() {
                false
            } else {
                s.active.insert(key, sub.clone());
                true
            }
        };
        if adopted {
            sub.request(PER_INPUT_WINDOW);
        } else {
            sub.dispose();
        }
    }

    fn fwd_on_next(&self, key: u64, item: T) {
        let emit = {
            let mut s = self.state.lock();
            if s.out.is_none() {
                return;
            }
            if s.demand > 0 && s.buf.is_empty() {
                s.demand -= 1;
                let sub = s.active.get(&key).cloned().unwrap_or_default();
                s.out.clone().map(|out| (out, sub))
            } else {
                s.buf.push_back((key, item));
                return;
            }
        };
        if let Some((out, sub)) = emit {
            out.on_next(item);
            // Replenish the window of the input that produced the item.
            sub.request(1);
        }
    }

    fn fwd_on_complete(&self, key: u64) {
        {
            let mut s = self.state.lock();
            s.active.remove(&key);
        }
        self.activate_more();
        self.check_done();
    }

    fn fwd_on_error(&self, key: u64, err: Error) {
        let _ = key;
        let (subs, out) = {
            let mut s = self.state.lock();
            if s.out.is_none() || s.err.is_some() {
                return;
            }
            s.err = Some(err.clone());
            let subs: Vec<Subscription> = s.active.drain().map(|(_, sub)| sub).collect();
            s.pending_inputs.clear();
            s.buf.clear();
            (subs, s.out.take())
        };
        for sub in subs {
            sub.dispose();
        }
        if let Some(out) = out {
            out.on_error(err);
        }
    }

    /// Emits buffered items while demand lasts.
    fn drain(&self) {
        loop {
            let step = {
                let mut s = self.state.lock();
                if s.out.is_none() {
                    return;
                }
                if s.demand > 0 && !s.buf.is_empty() {
                    s.demand -= 1;
                    let (key, item) = match s.buf.pop_front() {
                        Some(entry) => entry,
                        None => return,
                    };
                    let out = match s.out.clone() {
                        Some(out) => out,
                        None => return,
                    };
                    let sub = s.active.get(&key).cloned().unwrap_or_default();
                    Some((out, sub, item))
                } else {
                    None
                }
            };
            match step {
                Some((out, sub, item)) => {
                    out.on_next(item);
                    sub.request(1);
                }
                None => break,
            }
        }
        self.check_done();
    }

    fn check_done(&self) {
        let out = {
            let mut s = self.state.lock();
            let finished = s.out.is_some()
                && s.err.is_none()
                && s.active.is_empty()
                && s.awaiting_subscribe == 0
                && s.pending_inputs.is_empty()
                && s.buf.is_empty();
            if finished {
                s.out.take()
            } else {
                None
            }
        };
        if let Some(out) = out {
            out.on_complete();
        }
    }
}

impl<T: Send + 'static> SubscriptionImpl for MergeSub<T> {
    fn request(&self, n: usize) {
        {
            let mut s = self.state.lock();
            s.demand += n;
        }
        self.drain();
    }

    fn dispose(&self) {
        let subs = {
            let mut s = self.state.lock();
            if s.out.is_none() {
                return;
            }
            s.out = None;
            s.pending_inputs.clear();
            s.buf.clear();
            s.active.drain().map(|(_, sub)| sub).collect::<Vec<_>>()
        };
        for sub in subs {
            sub.dispose();
        }
    }

    fn disposed(&self) -> bool {
        self.state.lock().out.is_none()
    }
}

impl<T: Send + 'static> DisposableImpl for MergeSub<T> {
    fn dispose(&self) {
        SubscriptionImpl::dispose(self);
    }

    fn disposed(&self) -> bool {
        SubscriptionImpl::disposed(self)
    }
}

struct MergeForwarder<T> {
    parent: Arc<MergeSub<T>>,
    key: u64,
}

impl<T: Send + 'static> Observer<T> for MergeForwarder<T> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ops::source::from_iter;
    use crate::flow::scoped::ScopedCoordinator;
    use crate::flow::testing::Collector;

    #[test]
    fn merges_all_items_and_completes() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let a = from_iter(&handle, vec![1u64, 2, 3]);
        let b = from_iter(&handle, vec![10u64, 20]);
        let collector = Collector::new();
        merge(&handle, vec![a, b], usize::MAX).subscribe_handle(collector.handle());
        collector.request(100);
        coord.run_pending();
        let mut items = collector.items();
        items.sort_unstable();
        assert_eq!(items, vec![1, 2, 3, 10, 20]);
        assert!(collector.completed());
    }

    #[test]
    fn concurrency_cap_defers_later_inputs() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let a = from_iter(&handle, vec![1u64]);
        let b = from_iter(&handle, vec![2u64]);
        let c = from_iter(&handle, vec![3u64]);
        let collector = Collector::new();
        merge(&handle, vec![a, b, c], 1).subscribe_handle(collector.handle());
        collector.request(100);
        coord.run_pending();
        // With the cap at one, inputs complete strictly in order.
        assert_eq!(collector.items(), vec![1, 2, 3]);
        assert!(collector.completed());
    }

    #[test]
    fn items_buffer_without_demand() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let a = from_iter(&handle, vec![1u64, 2, 3, 4]);
        let collector = Collector::new();
        merge(&handle, vec![a], usize::MAX).subscribe_handle(collector.handle());
        collector.request(2);
        coord.run_pending();
        assert_eq!(collector.items(), vec![1, 2]);
        assert!(!collector.completed());
        collector.request(10);
        coord.run_pending();
        assert_eq!(collector.items(), vec![1, 2, 3, 4]);
        assert!(collector.completed());
    }
}
