//! End-to-end flow scenarios: backpressured multicast and concat demand
//! carry-over, driven deterministically on a scoped coordinator.

use std::sync::Arc;

use parking_lot::Mutex;

use rook::flow::{
    concat, from_iter, CoordinatorHandle, Disposable, Obs, ObservableImpl, Observer,
    ObserverHandle, ScopedCoordinator, Subscription, SubscriptionImpl,
};

// -- a minimal manual-demand observer ---------------------------------------

struct SinkState<T> {
    items: Vec<T>,
    completed: bool,
    sub: Subscription,
}

#[derive(Clone)]
struct Sink<T> {
    state: Arc<Mutex<SinkState<T>>>,
}

impl<T: Send + 'static> Sink<T> {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                items: Vec::new(),
                completed: false,
                sub: Subscription::empty(),
            })),
        }
    }

    fn observer(&self) -> SinkObserver<T> {
        SinkObserver {
            state: self.state.clone(),
        }
    }

    fn request(&self, n: usize) {
        let sub = self.state.lock().sub.clone();
        sub.request(n);
    }

    fn count(&self) -> usize {
        self.state.lock().items.len()
    }

    fn completed(&self) -> bool {
        self.state.lock().completed
    }
}

struct SinkObserver<T> {
    state: Arc<Mutex<SinkState<T>>>,
}

impl<T: Send + 'static> Observer<T> for SinkObserver<T> {
    fn on_subscribe(&mut self, sub: Subscription) {
        self.state.lock().sub = sub;
    }

    fn on_next(&mut self, item: T) {
        self.state.lock().items.push(item);
    }

    fn on_complete(&mut self) {
        self.state.lock().completed = true;
    }

    fn on_error(&mut self, _err: rook::Error) {}
}

// -- an upstream that records the demand it receives ------------------------

struct ProbeSub {
    requests: Arc<Mutex<Vec<usize>>>,
    disposed: std::sync::atomic::AtomicBool,
}

impl SubscriptionImpl for ProbeSub {
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

struct ProbeOp {
    coord: CoordinatorHandle,
    requests: Arc<Mutex<Vec<usize>>>,
}

impl ObservableImpl<u64> for ProbeOp {
    fn subscribe_observer(&self, out: ObserverHandle<u64>) -> Disposable {
        let sub = Arc::new(ProbeSub {
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

#[test]
fn backpressured_multicast_issues_max_demand_upstream() {
    let coord = ScopedCoordinator::new();
    let handle = coord.handle();
    // A source of 100 integers behind a multicast.
    let source = from_iter(&handle, (0..100u64).collect::<Vec<_>>());
    let published = source.publish();

    let x = Sink::new();
    let y = Sink::new();
    published.as_obs().subscribe_with(x.observer());
    published.as_obs().subscribe_with(y.observer());
    x.request(10);
    y.request(5);
    published.connect();
    coord.run_pending();

    // X observed 10, Y observed 5.
    assert_eq!(x.count(), 10);
    assert_eq!(y.count(), 5);
    // Total upstream demand was max(10, 5): ten items entered the operator,
    // so Y buffered the five it had no demand for.
    assert_eq!(published.max_buffered(), 5);
    assert_eq!(published.min_buffered(), 0);
    assert_eq!(published.max_demand(), 0);
    assert_eq!(published.min_demand(), 0);
}

#[test]
fn concat_carries_unused_demand_to_the_next_input() {
    let coord = ScopedCoordinator::new();
    let handle = coord.handle();
    let a = from_iter(&handle, vec![1u64, 2, 3]);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let b = Obs::new(Arc::new(ProbeOp {
        coord: handle.clone(),
        requests: requests.clone(),
    }));

    let sink = Sink::new();
    concat(&handle, vec![a, b]).subscribe_with(sink.observer());
    sink.request(10);
    coord.run_pending();

    // `a` emitted 3 of the requested 10 and completed; `b` sees the
    // remaining demand of 7 at subscription time.
    assert_eq!(sink.count(), 3);
    assert_eq!(*requests.lock(), vec![7]);
}

#[test]
fn shared_flows_complete_every_subscriber() {
    let coord = ScopedCoordinator::new();
    let handle = coord.handle();
    let shared = from_iter(&handle, (0..4u64).collect::<Vec<_>>()).share();
    let x = Sink::new();
    let y = Sink::new();
    shared.subscribe_with(x.observer());
    shared.subscribe_with(y.observer());
    x.request(100);
    y.request(100);
    coord.run_pending();
    assert_eq!(x.count(), 4);
    assert_eq!(y.count(), 4);
    assert!(x.completed());
    assert!(y.completed());
}

#[test]
fn operator_chains_compose() {
    let coord = ScopedCoordinator::new();
    let handle = coord.handle();
    let sink = Sink::new();
    from_iter(&handle, (0..50u64).collect::<Vec<_>>())
        .filter(|n| n % 2 == 0)
        .map(|n| n * 10)
        .skip(1)
        .take(3)
        .subscribe_with(sink.observer());
    sink.request(100);
    coord.run_pending();
    assert_eq!(sink.state.lock().items, vec![20, 40, 60]);
    assert!(sink.completed());
}
