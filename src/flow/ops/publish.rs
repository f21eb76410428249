//! Multicast: one upstream subscription feeding many downstream observers.
//!
//! Each sink owns `{buf, demand, closed, err, running}` state plus two
//! hooks: `when_disposed` (detaches the sink from the operator) and
//! `when_consumed_some` (tops up upstream demand). At most one `do_run`
//! executes per sink at a time; the `running` guard makes concurrent
//! pushes append to the buffer instead of re-entering the observer.
//!
//! Upstream demand equals the maximum demand across sinks; slower sinks
//! buffer the difference.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Error;
use crate::flow::coordinator::CoordinatorHandle;
use crate::flow::disposable::{Action, Disposable, DisposableImpl};
use crate::flow::observable::{Obs, ObservableImpl};
use crate::flow::observer::{Observer, ObserverHandle};
use crate::flow::subscription::{Subscription, SubscriptionImpl};

/// Multicast with an explicit connect step.
pub(crate) fn publish<T: Send + Clone + 'static>(source: &Obs<T>) -> Publish<T> {
    Publish {
        op: PublishOp::new(source.clone(), false),
    }
}

/// Multicast that connects on the first subscriber.
pub(crate) fn share<T: Send + Clone + 'static>(source: &Obs<T>) -> Obs<T> {
    Obs::new(PublishOp::new(source.clone(), true))
}

/// Handle to a multicast operator before/after connecting it.
pub struct Publish<T> {
    op: Arc<PublishOp<T>>,
}

impl<T: Send + Clone + 'static> Publish<T> {
    /// The observable side; subscribers attach here.
    pub fn as_obs(&self) -> Obs<T> {
        Obs::new(self.op.clone())
    }

    /// Subscribes the operator to its source. Idempotent.
    pub fn connect(&self) -> Disposable {
        self.op.connect()
    }

    pub fn observer_count(&self) -> usize {
        self.op.state.lock().sinks.len()
    }

    /// Largest demand across sinks; this is what upstream sees.
    pub fn max_demand(&self) -> usize {
        self.op.max_demand()
    }

    /// Smallest demand across sinks.
    pub fn min_demand(&self) -> usize {
        self.op.fold_sinks(usize::MAX, |acc, s| acc.min(s.demand))
    }

    /// Largest per-sink buffer.
    pub fn max_buffered(&self) -> usize {
        self.op.fold_sinks(0, |acc, s| acc.max(s.buf.len()))
    }

    /// Smallest per-sink buffer.
    pub fn min_buffered(&self) -> usize {
        self.op.fold_sinks(usize::MAX, |acc, s| acc.min(s.buf.len()))
    }
}

// ---------------------------------------------------------------------------
// per-sink state

struct SinkState<T> {
    buf: VecDeque<T>,
    demand: usize,
    closed: bool,
    disposed: bool,
    running: bool,
    err: Option<Error>,
    out: Option<ObserverHandle<T>>,
    when_disposed: Option<Action>,
    when_consumed_some: Option<Action>,
}

pub(crate) struct McastSinkState<T> {
    coord: CoordinatorHandle,
    state: Mutex<SinkState<T>>,
}

impl<T: Send + Clone + 'static> McastSinkState<T> {
    fn new(coord: CoordinatorHandle, out: ObserverHandle<T>) -> Arc<Self> {
        Arc::new(Self {
            coord,
            state: Mutex::new(SinkState {
                buf: VecDeque::new(),
                demand: 0,
                closed: false,
                disposed: false,
                running: false,
                err: None,
                out: Some(out),
                when_disposed: None,
                when_consumed_some: None,
            }),
        })
    }

    /// Feeds one item to the sink: emits directly while demand is available
    /// and nothing is running, buffers otherwise.
    fn push(&self, item: T) {
        let emit = {
            let mut s = self.state.lock();
            if s.disposed {
                return;
            }
            if s.demand > 0 && !s.running && s.buf.is_empty() {
                s.demand -= 1;
                s.out.clone().map(|out| (out, s.when_consumed_some.clone()))
            } else {
                s.buf.push_back(item);
                return;
            }
        };
        if let Some((out, notify)) = emit {
            out.on_next(item);
            if let Some(notify) = notify {
                self.coord.delay(notify);
            }
        }
    }

    /// Upstream finished; completes now or once the buffer drains.
    fn close(&self) {
        let out = {
            let mut s = self.state.lock();
            if s.disposed {
                return;
            }
            s.closed = true;
            if !s.running && s.buf.is_empty() {
                s.disposed = true;
                s.when_disposed = None;
                s.when_consumed_some = None;
                s.out.take()
            } else {
                None
            }
        };
        if let Some(out) = out {
            out.on_complete();
        }
    }

    /// Upstream failed; errors now or once the buffer drains.
    fn abort(&self, reason: Error) {
        let out = {
            let mut s = self.state.lock();
            if s.disposed || s.err.is_some() {
                return;
            }
            s.closed = true;
            s.err = Some(reason.clone());
            if !s.running && s.buf.is_empty() {
                s.disposed = true;
                s.when_disposed = None;
                s.when_consumed_some = None;
                s.out.take()
            } else {
                None
            }
        };
        if let Some(out) = out {
            out.on_error(reason);
        }
    }

    /// Silent cancellation requested by the sink's own downstream; the
    /// observer handle is dropped without a terminal callback.
    fn do_dispose(&self) {
        let when_disposed = {
            let mut s = self.state.lock();
            if s.disposed {
                return;
            }
            s.disposed = true;
            s.buf.clear();
            s.demand = 0;
            s.out = None;
            if let Some(consumed) = s.when_consumed_some.take() {
                consumed.dispose();
            }
            s.when_disposed.take()
        };
        if let Some(action) = when_disposed {
            self.coord.delay(action);
        }
    }

    /// Drains the buffer while demand lasts; at most one instance runs at a
    /// time (`running` guard). Ends the sink once closed and drained.
    fn do_run(&self) {
        enum Step<T> {
            Emit(ObserverHandle<T>, T),
            Terminal(Option<ObserverHandle<T>>, Option<Error>, Option<Action>),
            Done(Option<Action>),
        }
        let mut got_some = false;
        loop {
            let step = {
                let mut s = self.state.lock();
                if s.disposed {
                    s.running = false;
                    return;
                }
                if s.demand > 0 && !s.buf.is_empty() {
                    s.demand -= 1;
                    let item = match s.buf.pop_front() {
                        Some(item) => item,
                        None => continue,
                    };
                    match s.out.clone() {
                        Some(out) => Step::Emit(out, item),
                        None => {
                            s.running = false;
                            return;
                        }
                    }
                } else if s.buf.is_empty() && s.closed {
                    s.running = false;
                    s.disposed = true;
                    let when_disposed = s.when_disposed.take();
                    if let Some(consumed) = s.when_consumed_some.take() {
                        consumed.dispose();
                    }
                    Step::Terminal(s.out.take(), s.err.take(), when_disposed)
                } else {
                    s.running = false;
                    let notify = if got_some {
                        s.when_consumed_some.clone()
                    } else {
                        None
                    };
                    Step::Done(notify)
                }
            };
            match step {
                Step::Emit(out, item) => {
                    got_some = true;
                    out.on_next(item);
                }
                Step::Terminal(out, err, when_disposed) => {
                    if let Some(out) = out {
                        match err {
                            Some(err) => out.on_error(err),
                            None => out.on_complete(),
                        }
                    }
                    if let Some(action) = when_disposed {
                        self.coord.delay(action);
                    }
                    return;
                }
                Step::Done(notify) => {
                    if let Some(notify) = notify {
                        self.coord.delay(notify);
                    }
                    return;
                }
            }
        }
    }
}

/// The subscription handed to each sink.
struct McastSub<T> {
    coord: CoordinatorHandle,
    state: Mutex<Option<Arc<McastSinkState<T>>>>,
}

impl<T: Send + Clone + 'static> SubscriptionImpl for McastSub<T> {
    fn request(&self, n: usize) {
        if n == 0 {
            return;
        }
        let Some(sink) = self.state.lock().clone() else {
            return;
        };
        let (start_run, top_up) = {
            let mut s = sink.state.lock();
            s.demand += n;
            let start = if !s.running {
                s.running = true;
                true
            } else {
                false
            };
            (start, s.when_consumed_some.clone())
        };
        if start_run {
            let sink = sink.clone();
            self.coord.delay_fn(move || sink.do_run());
        }
        // New demand may raise the maximum across sinks; let the operator
        // re-balance its upstream request.
        if let Some(top_up) = top_up {
            self.coord.delay(top_up);
        }
    }

    fn dispose(&self) {
        let Some(sink) = self.state.lock().take() else {
            return;
        };
        self.coord.delay_fn(move || sink.do_dispose());
    }

    fn disposed(&self) -> bool {
        match self.state.lock().as_ref() {
            Some(sink) => sink.state.lock().disposed,
            None => true,
        }
    }
}

impl<T: Send + Clone + 'static> DisposableImpl for McastSub<T> {
    fn dispose(&self) {
        SubscriptionImpl::dispose(self);
    }

    fn disposed(&self) -> bool {
        SubscriptionImpl::disposed(self)
    }
}

// ---------------------------------------------------------------------------
// the operator

struct PubState<T> {
    sinks: Vec<Arc<McastSinkState<T>>>,
    closed: bool,
    err: Option<Error>,
    upstream: Subscription,
    /// Demand requested upstream that has not been delivered yet.
    requested: usize,
    connected: bool,
    auto_connect: bool,
}

struct PublishOp<T> {
    coord: CoordinatorHandle,
    source: Obs<T>,
    state: Mutex<PubState<T>>,
    self_weak: Weak<Self>,
}

impl<T: Send + Clone + 'static> PublishOp<T> {
    fn new(source: Obs<T>, auto_connect: bool) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            coord: source.coordinator(),
            source,
            state: Mutex::new(PubState {
                sinks: Vec::new(),
                closed: false,
                err: None,
                upstream: Subscription::empty(),
                requested: 0,
                connected: false,
                auto_connect,
            }),
            self_weak: self_weak.clone(),
        })
    }

    fn connect(&self) -> Disposable {
        let Some(me) = self.self_weak.upgrade() else {
            return Disposable::empty();
        };
        {
            let mut s = self.state.lock();
            if s.connected || s.closed {
                return s.upstream.as_disposable();
            }
            s.connected = true;
        }
        let forwarder = UpstreamForwarder { op: me };
        self.source.subscribe_handle(ObserverHandle::new(forwarder))
    }

    fn add_sink(&self, out: ObserverHandle<T>) -> Arc<McastSinkState<T>> {
        let sink = McastSinkState::new(self.coord.clone(), out);
        let op = self.self_weak.clone();
        let for_dispose = Arc::downgrade(&sink);
        {
            let mut s = sink.state.lock();
            s.when_disposed = Some(Action::new(move || {
                if let (Some(op), Some(sink)) = (op.upgrade(), for_dispose.upgrade()) {
                    op.remove_sink(&sink);
                }
            }));
            let op = self.self_weak.clone();
            s.when_consumed_some = Some(Action::new(move || {
                if let Some(op) = op.upgrade() {
                    op.top_up();
                }
            }));
        }
        self.state.lock().sinks.push(sink.clone());
        sink
    }

    fn remove_sink(&self, sink: &Arc<McastSinkState<T>>) {
        self.state
            .lock()
            .sinks
            .retain(|s| !Arc::ptr_eq(s, sink));
    }

    /// Raises upstream demand to the current maximum across sinks.
    fn top_up(&self) {
        let (sub, diff) = {
            let mut s = self.state.lock();
            if !s.upstream.valid() {
                return;
            }
            let want = max_demand_of(&s.sinks);
            if want > s.requested {
                let diff = want - s.requested;
                s.requested = want;
                (s.upstream.clone(), diff)
            } else {
                return;
            }
        };
        sub.request(diff);
    }

    fn max_demand(&self) -> usize {
        max_demand_of(&self.state.lock().sinks)
    }

    fn fold_sinks(&self, init: usize, f: impl Fn(usize, &SinkState<T>) -> usize) -> usize {
        let sinks = self.state.lock().sinks.clone();
        if sinks.is_empty() {
            return 0;
        }
        let mut acc = init;
        for sink in &sinks {
            let s = sink.state.lock();
            acc = f(acc, &s);
        }
        acc
    }
}

fn max_demand_of<T>(sinks: &[Arc<McastSinkState<T>>]) -> usize {
    sinks
        .iter()
        .map(|sink| sink.state.lock().demand)
        .max()
        .unwrap_or(0)
}

impl<T: Send + Clone + 'static> ObservableImpl<T> for PublishOp<T> {
    fn subscribe_observer(&self, out: ObserverHandle<T>) -> Disposable {
        {
            let s = self.state.lock();
            if s.closed {
                if let Some(err) = s.err.clone() {
                    drop(s);
                    out.on_error(err);
                    return Disposable::empty();
                }
                drop(s);
                return super::source::empty::<T>(&self.coord).subscribe_handle(out);
            }
        }
        let sink = self.add_sink(out.clone());
        let sub = Arc::new(McastSub {
            coord: self.coord.clone(),
            state: Mutex::new(Some(sink)),
        });
        out.on_subscribe(Subscription::new(sub.clone()));
        let auto_connect = self.state.lock().auto_connect;
        if auto_connect {
            self.connect();
        }
        Disposable::new(sub)
    }

    fn coordinator(&self) -> CoordinatorHandle {
        self.coord.clone()
    }
}

/// The operator's own observer on the source.
struct UpstreamForwarder<T> {
    op: Arc<PublishOp<T>>,
}

impl<T: Send + Clone + 'static> Observer<T> for UpstreamForwarder<T> {
    fn on_subscribe(&mut self, sub: Subscription) {
        let want = {
            let mut s = self.op.state.lock();
            s.upstream = sub.clone();
            let want = max_demand_of(&s.sinks);
            s.requested = want;
            want
        };
        if want > 0 {
            sub.request(want);
        }
    }

    fn on_next(&mut self, item: T) {
        let sinks = {
            let mut s = self.op.state.lock();
            s.requested = s.requested.saturating_sub(1);
            s.sinks.clone()
        };
        for sink in sinks {
            sink.push(item.clone());
        }
        self.op.top_up();
    }

    fn on_complete(&mut self) {
        let sinks = {
            let mut s = self.op.state.lock();
            s.closed = true;
            s.upstream = Subscription::empty();
            std::mem::take(&mut s.sinks)
        };
        for sink in sinks {
            sink.close();
        }
    }

    fn on_error(&mut self, err: Error) {
        let sinks = {
            let mut s = self.op.state.lock();
            s.closed = true;
            s.err = Some(err.clone());
            s.upstream = Subscription::empty();
            std::mem::take(&mut s.sinks)
        };
        for sink in sinks {
            sink.abort(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ops::source::from_iter;
    use crate::flow::scoped::ScopedCoordinator;
    use crate::flow::testing::Collector;

    #[test]
    fn upstream_demand_is_the_max_across_sinks() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let source = from_iter(&handle, (0..100).collect::<Vec<u64>>());
        let published = source.publish();
        let fast = Collector::new();
        let slow = Collector::new();
        published.as_obs().subscribe_handle(fast.handle());
        published.as_obs().subscribe_handle(slow.handle());
        fast.request(10);
        slow.request(5);
        published.connect();
        coord.run_pending();
        assert_eq!(fast.count(), 10);
        assert_eq!(slow.count(), 5);
        // Upstream saw exactly max(10, 5) demand in total: the slow sink
        // buffered the five extra items, the fast one buffered nothing.
        assert_eq!(published.max_demand(), 0);
        assert_eq!(published.max_buffered(), 5);
        assert_eq!(published.min_buffered(), 0);
    }

    #[test]
    fn min_accessors_return_their_minimum() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let source = from_iter(&handle, Vec::<u64>::new());
        let published = source.publish();
        let a = Collector::new();
        let b = Collector::new();
        published.as_obs().subscribe_handle(a.handle());
        published.as_obs().subscribe_handle(b.handle());
        a.request(4);
        b.request(9);
        coord.run_pending();
        assert_eq!(published.min_demand(), 4);
        assert_eq!(published.max_demand(), 9);
        assert_eq!(published.min_buffered(), 0);
    }

    #[test]
    fn share_connects_on_first_subscriber() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let shared = from_iter(&handle, vec![1u64, 2, 3]).share();
        let collector = Collector::new();
        shared.subscribe_handle(collector.handle());
        collector.request(10);
        coord.run_pending();
        assert_eq!(collector.items(), vec![1, 2, 3]);
        assert!(collector.completed());
    }

    #[test]
    fn late_subscribers_after_completion_get_on_complete() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let source = from_iter(&handle, vec![1u64]);
        let published = source.publish();
        let first = Collector::new();
        published.as_obs().subscribe_handle(first.handle());
        first.request(10);
        published.connect();
        coord.run_pending();
        assert!(first.completed());
        let late = Collector::<u64>::new();
        published.as_obs().subscribe_handle(late.handle());
        late.request(1);
        coord.run_pending();
        assert!(late.completed());
        assert!(late.items().is_empty());
    }

    #[test]
    fn disposing_one_sink_leaves_the_other_running() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let source = from_iter(&handle, (0..10).collect::<Vec<u64>>());
        let published = source.publish();
        let keep = Collector::new();
        let drop_me = Collector::new();
        let _keep_d = published.as_obs().subscribe_handle(keep.handle());
        let drop_d = published.as_obs().subscribe_handle(drop_me.handle());
        keep.request(3);
        drop_d.dispose();
        published.connect();
        coord.run_pending();
        assert_eq!(keep.items(), vec![0, 1, 2]);
        assert_eq!(published.observer_count(), 1);
        // Cancellation is silent: the disposed sink sees no terminal event.
        assert!(drop_me.items().is_empty());
        assert!(!drop_me.completed());
        assert!(drop_me.error().is_none());
    }
}
