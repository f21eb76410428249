//! # Clock
//!
//! Monotonic time source for the runtime. One dedicated thread holds a heap
//! of entries keyed by deadline, sleeps until the nearest one, and is woken
//! whenever an earlier deadline is inserted. The clock never executes user
//! code on its own thread: due actions are handed to the scheduler and due
//! messages become ordinary mailbox deliveries.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::actor::WeakActorHandle;
use crate::envelope::Envelope;
use crate::error::{Error, ErrorCode};
use crate::flow::{Action, Disposable};
use crate::message::Message;

/// Where the clock forwards due actions; implemented by the actor system on
/// top of its scheduler.
pub trait ActionRunner: Send + Sync {
    fn run_action(&self, action: Action);
}

/// What a periodic entry does when its previous tick is still running at the
/// next deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallPolicy {
    /// Dispose the recurring action and deliver `periodic_action_failed` to
    /// the owning actor.
    Fail,
    /// Drop the tick silently; missed ticks coalesce into one.
    Skip,
}

/// Cancels one clock entry. Cancellation is idempotent and safe from any
/// thread; an entry already being fired still completes.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A token not tied to any clock entry, for operations that failed
    /// before anything was scheduled.
    pub fn unarmed() -> Self {
        Self::new()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn as_disposable(&self) -> Disposable {
        Disposable::from_flag(self.flag.clone())
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

enum EntryKind {
    Action(Action),
    Message {
        target: WeakActorHandle,
        env: Envelope,
    },
    Periodic {
        action: Action,
        interval: Duration,
        policy: StallPolicy,
        owner: Option<WeakActorHandle>,
        in_flight: Arc<AtomicBool>,
    },
}

struct Entry {
    at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    kind: EntryKind,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; flip so the earliest deadline surfaces,
        // insertion order breaking ties.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ClockState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    stopping: bool,
}

struct ClockCore {
    state: Mutex<ClockState>,
    cv: Condvar,
    runner: Arc<dyn ActionRunner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the clock thread.
#[derive(Clone)]
pub struct Clock {
    core: Arc<ClockCore>,
}

impl Clock {
    /// Starts the clock thread.
    pub(crate) fn start(runner: Arc<dyn ActionRunner>) -> Self {
        let core = Arc::new(ClockCore {
            state: Mutex::new(ClockState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                stopping: false,
            }),
            cv: Condvar::new(),
            runner,
            thread: Mutex::new(None),
        });
        let thread_core = core.clone();
        let handle = std::thread::Builder::new()
            .name("rook-clock".into())
            .spawn(move || run_loop(thread_core))
            .expect("failed to spawn clock thread");
        *core.thread.lock() = Some(handle);
        Self { core }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    fn insert(&self, at: Instant, kind: EntryKind) -> CancelToken {
        let token = CancelToken::new();
        let mut state = self.core.state.lock();
        if state.stopping {
            // Late entries are dropped; the token reports cancelled.
            token.cancel();
            return token;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            at,
            seq,
            cancelled: token.flag.clone(),
            kind,
        });
        drop(state);
        // Wake the thread; it re-computes the nearest deadline itself.
        self.core.cv.notify_one();
        token
    }

    /// Schedules a one-shot action; it runs via the scheduler at `at`.
    pub fn schedule_action(&self, at: Instant, action: Action) -> CancelToken {
        self.insert(at, EntryKind::Action(action))
    }

    /// Schedules a one-shot action after `delay`.
    pub fn schedule_action_in(&self, delay: Duration, action: Action) -> CancelToken {
        self.schedule_action(Instant::now() + delay, action)
    }

    /// Schedules a message delivery at `at`.
    pub fn schedule_message(
        &self,
        at: Instant,
        target: WeakActorHandle,
        env: Envelope,
    ) -> CancelToken {
        self.insert(at, EntryKind::Message { target, env })
    }

    /// Schedules a message delivery after `delay`.
    pub fn schedule_message_in(
        &self,
        delay: Duration,
        target: WeakActorHandle,
        env: Envelope,
    ) -> CancelToken {
        self.schedule_message(Instant::now() + delay, target, env)
    }

    /// Schedules `action` every `interval`, first firing one interval from
    /// now. `owner` receives the failure message under
    /// [`StallPolicy::Fail`].
    pub fn schedule_periodic(
        &self,
        interval: Duration,
        action: Action,
        policy: StallPolicy,
        owner: Option<WeakActorHandle>,
    ) -> CancelToken {
        self.insert(
            Instant::now() + interval,
            EntryKind::Periodic {
                action,
                interval,
                policy,
                owner,
                in_flight: Arc::new(AtomicBool::new(false)),
            },
        )
    }

    /// Number of entries waiting on the heap (cancelled ones included until
    /// they surface).
    pub fn pending(&self) -> usize {
        self.core.state.lock().heap.len()
    }

    /// Stops the clock thread, dropping pending entries.
    pub(crate) fn stop(&self) {
        {
            let mut state = self.core.state.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
            state.heap.clear();
        }
        self.core.cv.notify_all();
        let handle = self.core.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("clock thread panicked during shutdown");
            }
        }
    }
}

fn run_loop(core: Arc<ClockCore>) {
    let mut state = core.state.lock();
    loop {
        if state.stopping {
            return;
        }
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(top) = state.heap.peek() {
            if top.at <= now {
                // Pop never fails right after a successful peek.
                if let Some(entry) = state.heap.pop() {
                    due.push(entry);
                }
            } else {
                break;
            }
        }
        if !due.is_empty() {
            drop(state);
            let mut repush = Vec::new();
            for entry in due {
                if let Some(next) = fire(&core, entry, now) {
                    repush.push(next);
                }
            }
            state = core.state.lock();
            for entry in repush {
                state.heap.push(entry);
            }
            continue;
        }
        match state.heap.peek().map(|top| top.at) {
            None => {
                core.cv.wait(&mut state);
            }
            Some(deadline) => {
                core.cv.wait_until(&mut state, deadline);
            }
        }
    }
}

fn fire(core: &Arc<ClockCore>, entry: Entry, now: Instant) -> Option<Entry> {
    if entry.cancelled.load(Ordering::Acquire) {
        return None;
    }
    match entry.kind {
        EntryKind::Action(action) => {
            core.runner.run_action(action);
            None
        }
        EntryKind::Message { target, env } => {
            if let Some(handle) = target.upgrade() {
                handle.block().deliver(env);
            }
            None
        }
        EntryKind::Periodic {
            action,
            interval,
            policy,
            owner,
            in_flight,
        } => {
            if action.disposed() {
                return None;
            }
            if in_flight.load(Ordering::Acquire) {
                match policy {
                    StallPolicy::Skip => {
                        // Drop this tick; the next deadline coalesces.
                    }
                    StallPolicy::Fail => {
                        action.dispose();
                        if let Some(owner) = owner.as_ref().and_then(WeakActorHandle::upgrade) {
                            let err = Error::with_message(
                                ErrorCode::PeriodicActionFailed,
                                "periodic action missed its deadline",
                            );
                            owner
                                .block()
                                .deliver(Envelope::urgent(None, Message::from_error(err)));
                        }
                        return None;
                    }
                }
            } else {
                in_flight.store(true, Ordering::Release);
                let tick = action.clone();
                let clear = in_flight.clone();
                core.runner.run_action(Action::once(move || {
                    tick.run();
                    clear.store(false, Ordering::Release);
                }));
            }
            // Coalesce missed ticks: never schedule into the past.
            let mut next = entry.at + interval;
            if next <= now {
                next = now + interval;
            }
            Some(Entry {
                at: next,
                seq: entry.seq,
                cancelled: entry.cancelled,
                kind: EntryKind::Periodic {
                    action,
                    interval,
                    policy,
                    owner,
                    in_flight,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct ChannelRunner {
        tx: mpsc::Sender<Action>,
    }

    impl ActionRunner for ChannelRunner {
        fn run_action(&self, action: Action) {
            let _ = self.tx.send(action);
        }
    }

    fn clock_with_runner() -> (Clock, mpsc::Receiver<Action>) {
        let (tx, rx) = mpsc::channel();
        (Clock::start(Arc::new(ChannelRunner { tx })), rx)
    }

    #[test]
    fn one_shot_actions_fire_in_deadline_order() {
        let (clock, rx) = clock_with_runner();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        clock.schedule_action_in(Duration::from_millis(40), Action::once(move || o2.lock().push(2)));
        clock.schedule_action_in(Duration::from_millis(5), Action::once(move || o1.lock().push(1)));
        for _ in 0..2 {
            let action = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            action.run();
        }
        assert_eq!(*order.lock(), vec![1, 2]);
        clock.stop();
    }

    #[test]
    fn cancelled_entries_never_fire() {
        let (clock, rx) = clock_with_runner();
        let token = clock.schedule_action_in(Duration::from_millis(10), Action::once(|| {}));
        token.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        clock.stop();
    }

    #[test]
    fn periodic_skip_coalesces_stalled_ticks() {
        let (clock, rx) = clock_with_runner();
        let ticks = Arc::new(AtomicBool::new(false));
        let t = ticks.clone();
        let token = clock.schedule_periodic(
            Duration::from_millis(10),
            Action::new(move || {
                t.store(true, Ordering::SeqCst);
            }),
            StallPolicy::Skip,
            None,
        );
        // Never run the dispatched wrapper: the first tick stays in flight,
        // so later deadlines must all skip instead of piling up.
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(rx.try_recv().is_err(), "stalled ticks must be skipped");
        first.run();
        assert!(ticks.load(Ordering::SeqCst));
        // With the tick finished, the next deadline dispatches again.
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        token.cancel();
        clock.stop();
    }

    #[test]
    fn stop_drops_pending_entries() {
        let (clock, rx) = clock_with_runner();
        clock.schedule_action_in(Duration::from_secs(60), Action::once(|| {}));
        assert_eq!(clock.pending(), 1);
        clock.stop();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
