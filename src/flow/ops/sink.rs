//! Terminal observers.

use tracing::warn;

use crate::error::Error;
use crate::flow::subscription::Subscription;
use crate::flow::Observer;

/// Demand chunk for sinks with effectively unbounded appetite.
const CHUNK: usize = 64;

/// Calls a closure per item; demand is unbounded but requested in chunks,
/// re-upped once half a chunk was consumed.
pub struct ForEach<T, F: FnMut(T)> {
    f: F,
    sub: Subscription,
    consumed: usize,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, F: FnMut(T)> ForEach<T, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            sub: Subscription::empty(),
            consumed: 0,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, F> Observer<T> for ForEach<T, F>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    fn on_subscribe(&mut self, sub: Subscription) {
        self.sub = sub;
        self.sub.request(CHUNK);
    }

    fn on_next(&mut self, item: T) {
        (self.f)(item);
        self.consumed += 1;
        if self.consumed >= CHUNK / 2 {
            let n = self.consumed;
            self.consumed = 0;
            self.sub.request(n);
        }
    }

    fn on_complete(&mut self) {
        self.sub = Subscription::empty();
    }

    fn on_error(&mut self, err: Error) {
        warn!(%err, "flow terminated with an error");
        self.sub = Subscription::empty();
    }
}
