//! # Reactive flows
//!
//! Observable/observer/subscription graphs with demand-based backpressure,
//! driven cooperatively by a [`CoordinatorHandle`]: either an actor (flow
//! callbacks run interleaved with its mailbox) or a [`ScopedCoordinator`]
//! on a plain thread.
//!
//! The backpressure invariant holds everywhere: an operator never calls
//! `on_next` on an observer without outstanding demand; excess arrivals are
//! buffered or cause disposal, per operator contract.

mod coordinator;
mod disposable;
mod observable;
mod observer;
pub mod ops;
mod scoped;
mod subscription;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{Coordinator, CoordinatorHandle};
pub use disposable::{Action, Disposable, DisposableImpl};
pub use observable::{Obs, ObservableImpl};
pub use observer::{Observer, ObserverHandle};
pub use ops::interval::interval;
pub use ops::source::{empty, from_iter, iota, just};
pub use ops::{concat, concat_all, merge, ConcatInput, Publish};
pub use scoped::ScopedCoordinator;
pub use subscription::{Subscription, SubscriptionImpl};
