//! # Scheduler
//!
//! A pool of worker threads executing [`Resumable`]s: almost always actors,
//! occasionally one-shot actions forwarded by the clock. Two policies:
//!
//! - **work-sharing**: one shared queue behind a mutex and condvar. Simple,
//!   fair, preferred on small core counts. The default.
//! - **work-stealing**: per-worker deques plus a lock-free injector; idle
//!   workers steal from the tail of a victim chosen round-robin, then
//!   randomly. Preferred on many cores.
//!
//! The scheduler holds a strong reference to a resumable for the duration of
//! each `resume` call. `ResumeLater` re-enqueues behind later arrivals;
//! every other result releases the reference; an actor that reports
//! `AwaitingMessage` is re-submitted by its own mailbox when the next
//! message arrives.

use std::sync::Arc;

use crate::flow::Action;

mod sharing;
mod stealing;

pub use sharing::SharingScheduler;
pub use stealing::StealingScheduler;

/// What a resumable tells its worker after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResult {
    /// Finished for good; release the reference.
    Done,
    /// Out of work; the mailbox re-submits on the next enqueue.
    AwaitingMessage,
    /// Budget exhausted with work left; re-enqueue FIFO.
    ResumeLater,
    /// The system is stopping; release the reference.
    Shutdown,
}

/// Identifies the worker currently running a resumable.
#[derive(Debug)]
pub struct WorkerContext {
    pub worker_id: usize,
}

/// Anything the scheduler can run.
pub trait Resumable: Send + Sync {
    /// Handle up to `max_throughput` units of work, then report back.
    fn resume(&self, worker: &WorkerContext, max_throughput: usize) -> ResumeResult;
}

pub type ResumableRef = Arc<dyn Resumable>;

/// Scheduling policy chosen at system start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPolicy {
    Sharing,
    Stealing,
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub policy: SchedulerPolicy,
    /// Worker count; defaults to the hardware concurrency.
    pub max_threads: usize,
    /// Upper bound on messages handled per `resume` call; `usize::MAX`
    /// means no bound.
    pub max_throughput: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulerPolicy::Sharing,
            max_threads: num_cpus::get().max(1),
            max_throughput: 5,
        }
    }
}

/// Common interface of the two pools.
pub trait Scheduler: Send + Sync {
    /// Hands a resumable to the pool. After system shutdown the reference is
    /// dropped instead.
    fn schedule(&self, r: ResumableRef);

    /// Signals shutdown, gives every still-queued resumable one final
    /// `resume`, and joins the worker threads.
    fn shutdown(&self);
}

/// Builds the pool described by `config`.
pub(crate) fn build(config: &SchedulerConfig) -> Arc<dyn Scheduler> {
    let threads = config.max_threads.max(1);
    match config.policy {
        SchedulerPolicy::Sharing => {
            Arc::new(SharingScheduler::start(threads, config.max_throughput))
        }
        SchedulerPolicy::Stealing => {
            Arc::new(StealingScheduler::start(threads, config.max_throughput))
        }
    }
}

/// Adapter that lets the clock run an [`Action`] on the pool.
pub struct OneShot {
    action: Action,
}

impl OneShot {
    pub fn new(action: Action) -> Self {
        Self { action }
    }
}

impl Resumable for OneShot {
    fn resume(&self, _worker: &WorkerContext, _max_throughput: usize) -> ResumeResult {
        self.action.run();
        ResumeResult::Done
    }
}
