//! # rook
//!
//! A lightweight actor runtime with reactive flows: many isolated actors
//! with private mailboxes run cooperatively on a small pool of worker
//! threads, communicate only through asynchronous messages, and may host
//! demand-driven dataflows on their own thread.
//!
//! ## Core pieces
//!
//! - [`registry`]: process-wide type registry with interned signature lists
//! - [`message`]: copy-on-write, type-tagged value tuples
//! - [`mailbox`]: three-lane MPSC queues (urgent, normal, skip-stash)
//! - [`clock`]: one timer thread feeding scheduler actions and mailbox
//!   deliveries
//! - [`scheduler`]: work-sharing and work-stealing worker pools
//! - [`actor`]: control blocks, the per-actor state machine, contexts
//! - [`behavior`]: typed handler sets with receive timeouts and skipping
//! - [`request`]: request/response correlation with typed reply checking
//! - [`flow`]: observables with reactive-stream backpressure, driven on the
//!   owning actor's thread
//! - [`config`]: settings tree, config file parser, CLI options
//!
//! ## A short example
//!
//! ```no_run
//! use rook::{behavior, ActorSystem, ActorSystemConfig, Message, Reply};
//!
//! fn main() -> rook::Result<()> {
//!     let system = ActorSystem::new(ActorSystemConfig::default())?;
//!     let doubler = system.spawn("doubler", |_ctx| {
//!         behavior()
//!             .handle(|_ctx, n: i64| Reply::with(n * 2))
//!             .build()
//!     })?;
//!     system.send(&doubler, Message::of(21i64)?)?;
//!     system.shutdown();
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod behavior;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod flow;
pub mod logging;
pub mod mailbox;
pub mod message;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod system;

pub use actor::{
    ActorContext, ActorHandle, ActorId, DownMsg, ExitMsg, ExitReason, NodeId, WeakActorHandle,
};
pub use behavior::{behavior, Behavior, BehaviorBuilder, Protocol, Reply, Signature};
pub use clock::{CancelToken, Clock, StallPolicy};
pub use config::{ActorSystemConfig, ConfigValue, OptionSet, Settings};
pub use envelope::{CorrelationId, Envelope, Lane};
pub use error::{Error, ErrorCode, Result};
pub use message::{Message, MessageArgs};
pub use registry::{Registry, TypeTag};
pub use request::Awaited;
pub use scheduler::{SchedulerConfig, SchedulerPolicy};
pub use system::{ActorSystem, SystemStats};
