//! Bounded decoupling buffer.
//!
//! Requests eagerly upstream and buffers up to `n` items for a slow
//! downstream. Exceeding the bound severs the upstream subscription and
//! errors the sink: a consumer that cannot keep up is disconnected rather
//! than allowed to grow the buffer without bound.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, ErrorCode};
use crate::flow::coordinator::CoordinatorHandle;
use crate::flow::disposable::Disposable;
use crate::flow::observable::{Obs, ObservableImpl};
use crate::flow::observer::{Observer, ObserverHandle};
use crate::flow::subscription::{Subscription, SubscriptionImpl};

use std::collections::VecDeque;

/// Demand requested upstream in one go; effectively unbounded.
const UPSTREAM_WINDOW: usize = usize::MAX >> 1;

pub(crate) fn on_backpressure_buffer<T>(source: &Obs<T>, n: usize) -> Obs<T>
where
    T: Send + Clone + 'static,
{
    Obs::new(Arc::new(BufferOp {
        source: source.clone(),
        cap: n,
    }))
}

struct BufferOp<T> {
    source: Obs<T>,
    cap: usize,
}

impl<T: Send + Clone + 'static> ObservableImpl<T> for BufferOp<T> {
    fn subscribe_observer(&self, out: ObserverHandle<T>) -> Disposable {
        let shared: Arc<BufferShared<T>> = Arc::new(BufferShared {
            state: Mutex::new(BufferState {
                out: Some(out.clone()),
                buf: VecDeque::new(),
                demand: 0,
                upstream: Subscription::empty(),
                closed: false,
                err: None,
            }),
            cap: self.cap,
        });
        self.source
            .subscribe_handle(ObserverHandle::new(BufferObserver {
                shared: shared.clone(),
            }));
        // Downstream demand routes through the shared state.
        Disposable::new(shared)
    }

    fn coordinator(&self) -> CoordinatorHandle {
        self.source.coordinator()
    }
}

struct BufferState<T> {
    out: Option<ObserverHandle<T>>,
    buf: VecDeque<T>,
    demand: usize,
    upstream: Subscription,
    closed: bool,
    err: Option<Error>,
}

struct BufferShared<T> {
    state: Mutex<BufferState<T>>,
    cap: usize,
}

impl<T: Send + Clone + 'static> BufferShared<T> {
    fn drain(&self) {
        loop {
            let step = {
                let mut s = self.state.lock();
                if s.out.is_none() {
                    return;
                }
                if s.demand > 0 && !s.buf.is_empty() {
                    s.demand -= 1;
                    let item = match s.buf.pop_front() {
                        Some(item) => item,
                        None => return,
                    };
                    s.out.clone().map(|out| (out, item))
                } else {
                    None
                }
            };
            match step {
                Some((out, item)) => out.on_next(item),
                None => break,
            }
        }
        self.finish_if_done();
    }

    fn finish_if_done(&self) {
        let terminal = {
            let mut s = self.state.lock();
            if s.out.is_some() && s.closed && s.buf.is_empty() {
                let err = s.err.take();
                s.out.take().map(|out| (out, err))
            } else {
                None
            }
        };
        if let Some((out, err)) = terminal {
            match err {
                Some(err) => out.on_error(err),
                None => out.on_complete(),
            }
        }
    }

    fn overflow(&self) {
        let (upstream, out) = {
            let mut s = self.state.lock();
            if s.out.is_none() {
                return;
            }
            s.buf.clear();
            s.closed = true;
            (s.upstream.clone(), s.out.take())
        };
        upstream.dispose();
        if let Some(out) = out {
            out.on_error(Error::with_message(
                ErrorCode::OutOfRange,
                "backpressure buffer overflowed",
            ));
        }
    }
}

impl<T: Send + Clone + 'static> SubscriptionImpl for BufferShared<T> {
    fn request(&self, n: usize) {
        {
            let mut s = self.state.lock();
            s.demand += n;
        }
        self.drain();
    }

    fn dispose(&self) {
        let upstream = {
            let mut s = self.state.lock();
            if s.out.is_none() {
                return;
            }
            s.out = None;
            s.buf.clear();
            s.upstream.clone()
        };
        upstream.dispose();
    }

    fn disposed(&self) -> bool {
        self.state.lock().out.is_none()
    }
}

impl<T: Send + Clone + 'static> crate::flow::disposable::DisposableImpl for BufferShared<T> {
    fn dispose(&self) {
        SubscriptionImpl::dispose(self);
    }

    fn disposed(&self) -> bool {
        SubscriptionImpl::disposed(self)
    }
}

struct BufferObserver<T> {
    shared: Arc<BufferShared<T>>,
}

impl<T: Send + Clone + 'static> Observer<T> for BufferObserver<T> {
    fn on_subscribe(&mut self, sub: Subscription) {
        let out = {
            let mut s = self.shared.state.lock();
            s.upstream = sub.clone();
            s.out.clone()
        };
        sub.request(UPSTREAM_WINDOW);
        if let Some(out) = out {
            out.on_subscribe(Subscription::new(self.shared.clone()));
        }
    }

    fn on_next(&mut self, item: T) {
        let emit = {
            let mut s = self.shared.state.lock();
            if s.out.is_none() {
                return;
            }
            if s.demand > 0 && s.buf.is_empty() {
                s.demand -= 1;
                s.out.clone().map(|out| (out, item))
            } else {
                s.buf.push_back(item);
                if s.buf.len() > self.shared.cap {
                    drop(s);
                    self.shared.overflow();
                }
                return;
            }
        };
        if let Some((out, item)) = emit {
            out.on_next(item);
        }
    }

    fn on_complete(&mut self) {
        {
            let mut s = self.shared.state.lock();
            s.closed = true;
        }
        self.shared.finish_if_done();
    }

    fn on_error(&mut self, err: Error) {
        {
            let mut s = self.shared.state.lock();
            s.closed = true;
            s.err = Some(err);
        }
        self.shared.finish_if_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ops::source::from_iter;
    use crate::flow::scoped::ScopedCoordinator;
    use crate::flow::testing::Collector;

    #[test]
    fn buffers_until_demand_arrives() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let collector = Collector::new();
        from_iter(&handle, vec![1u64, 2, 3])
            .on_backpressure_buffer(10)
            .subscribe_handle(collector.handle());
        coord.run_pending();
        assert_eq!(collector.count(), 0);
        collector.request(5);
        coord.run_pending();
        assert_eq!(collector.items(), vec![1, 2, 3]);
        assert!(collector.completed());
    }

    #[test]
    fn overflow_disconnects_with_an_error() {
        let coord = ScopedCoordinator::new();
        let handle = coord.handle();
        let collector = Collector::<u64>::new();
        from_iter(&handle, (0..100).collect::<Vec<u64>>())
            .on_backpressure_buffer(4)
            .subscribe_handle(collector.handle());
        coord.run_pending();
        assert_eq!(
            collector.error().map(|e| e.code()),
            Some(ErrorCode::OutOfRange)
        );
        assert!(!collector.completed());
    }
}
