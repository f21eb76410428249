//! # Actor system
//!
//! Owns the scheduler pool, the clock thread, and the actor name registry.
//! Spawning wires a control block to the pool; shutdown kills the remaining
//! actors, drains the scheduler, and stops the clock, in that order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::actor::{
    cell, exit_message, ActorContext, ActorHandle, ActorId, ControlBlock, ExitReason, Lifecycle,
    NodeId, WeakActorHandle,
};
use crate::behavior::Behavior;
use crate::clock::{ActionRunner, Clock};
use crate::config::ActorSystemConfig;
use crate::envelope::Envelope;
use crate::error::{Error, ErrorCode, Result};
use crate::flow::Action;
use crate::message::Message;
use crate::registry::{self, tags, Registry};
use crate::scheduler::{self, OneShot, Scheduler};

/// Counter snapshot of one system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemStats {
    /// Messages bounced off closed mailboxes.
    pub rejected_messages: u64,
    /// Responses that found no pending request.
    pub unmatched_responses: u64,
    /// Unmatched user messages dropped by the default handler.
    pub dropped_messages: u64,
    /// Actors currently alive.
    pub live_actors: u64,
}

pub(crate) struct SystemCore {
    config: ActorSystemConfig,
    node: NodeId,
    next_actor_id: AtomicU64,
    scheduler: Arc<dyn Scheduler>,
    clock: Clock,
    stopping: AtomicBool,
    actors: Mutex<HashMap<String, WeakActorHandle>>,
    live: AtomicU64,
    rejected: AtomicU64,
    unmatched: AtomicU64,
    dropped: AtomicU64,
}

/// Forwards due clock actions onto the scheduler pool.
struct ClockRunner {
    core: Weak<SystemCore>,
}

impl ActionRunner for ClockRunner {
    fn run_action(&self, action: Action) {
        if let Some(core) = self.core.upgrade() {
            core.scheduler.schedule(Arc::new(OneShot::new(action)));
        }
    }
}

impl SystemCore {
    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn count_rejected(&self, n: u64) {
        self.rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn count_unmatched(&self, n: u64) {
        self.unmatched.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn count_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn actor_terminated(&self, actor: &ActorHandle) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        if let Some(name) = actor.name() {
            let mut actors = self.actors.lock();
            let same = actors
                .get(name)
                .map(|w| w.upgrade().map(|h| h == *actor).unwrap_or(true))
                .unwrap_or(false);
            if same {
                actors.remove(name);
            }
        }
    }

    /// Creates actor object and control block, runs the behavior factory,
    /// then marks the actor idle and enqueues it when the mailbox was primed
    /// during initialization.
    pub(crate) fn spawn<F>(core: &Arc<Self>, name: &str, factory: F) -> Result<ActorHandle>
    where
        F: FnOnce(&mut ActorContext<'_>) -> Result<Behavior>,
    {
        if core.is_stopping() {
            return Err(Error::with_message(
                ErrorCode::ActorUnreachable,
                "system is shutting down",
            ));
        }
        let id = ActorId(core.next_actor_id.fetch_add(1, Ordering::Relaxed));
        let name = if name.is_empty() {
            id.to_string()
        } else {
            name.to_string()
        };
        let block = ControlBlock::new(id, core.node, Some(name.clone()), Arc::downgrade(core));
        {
            let mut actors = core.actors.lock();
            if let Some(existing) = actors.get(&name) {
                if existing.upgrade().is_some() {
                    return Err(Error::with_message(
                        ErrorCode::InvalidArgument,
                        format!("actor name '{name}' already exists"),
                    ));
                }
            }
            actors.insert(name.clone(), ActorHandle(block.clone()).downgrade());
            core.live.fetch_add(1, Ordering::AcqRel);
        }

        let handle = ActorHandle(block);
        let mut guard = handle.block().body.lock();
        let factory_result = {
            let body = guard.as_mut().ok_or_else(|| {
                Error::with_message(ErrorCode::ActorUnreachable, "actor body missing at spawn")
            })?;
            let mut ctx = ActorContext {
                block: handle.block(),
                body,
                system: core.clone(),
                sender: None,
                correlation: crate::envelope::CorrelationId::ASYNC,
            };
            factory(&mut ctx)
        };
        match factory_result {
            Ok(behavior) => {
                let body = guard.as_mut().ok_or_else(|| {
                    Error::with_message(
                        ErrorCode::ActorUnreachable,
                        "actor body missing at spawn",
                    )
                })?;
                body.become_op = None;
                body.behaviors.push(behavior);
                cell::rearm_timeout(&handle, body, core);
                if let Some(reason) = body.exit_requested.take() {
                    cell::terminate(&handle, &mut *guard, core, reason);
                    drop(guard);
                    return Ok(handle);
                }
            }
            Err(err) => {
                cell::terminate(&handle, &mut *guard, core, ExitReason::UnhandledException);
                drop(guard);
                return Err(err);
            }
        }
        drop(guard);
        debug!(actor = %id, name = %name, "spawned");

        let block = handle.block();
        // Priming messages may have arrived during the factory run.
        if !block.mailbox.is_empty() || block.has_flow_work() {
            block.state.store(Lifecycle::Idle);
            core.scheduler.schedule(block.clone());
        } else {
            block.state.store(Lifecycle::AwaitingMessage);
            if (!block.mailbox.is_empty() || block.has_flow_work())
                && block
                    .state
                    .transition(Lifecycle::AwaitingMessage, Lifecycle::Idle)
            {
                core.scheduler.schedule(block.clone());
            }
        }
        Ok(handle)
    }
}

/// Handle to a running actor system.
#[derive(Clone)]
pub struct ActorSystem {
    core: Arc<SystemCore>,
}

impl ActorSystem {
    /// Boots scheduler and clock. Installs the builtin type registry when
    /// none was installed yet; a custom registry must have been built from
    /// [`Registry::with_builtins`] and installed beforehand.
    pub fn new(config: ActorSystemConfig) -> Result<Self> {
        if !registry::is_installed() {
            Registry::with_builtins().install()?;
        }
        if registry::global()?.meta(tags::EXIT).is_none() {
            return Err(Error::with_message(
                ErrorCode::UnknownType,
                "installed registry lacks builtin types; start from Registry::with_builtins()",
            ));
        }
        let scheduler = scheduler::build(&config.scheduler);
        let core = Arc::new_cyclic(|weak: &Weak<SystemCore>| SystemCore {
            config,
            node: NodeId::random(),
            next_actor_id: AtomicU64::new(1),
            scheduler,
            clock: Clock::start(Arc::new(ClockRunner { core: weak.clone() })),
            stopping: AtomicBool::new(false),
            actors: Mutex::new(HashMap::new()),
            live: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        info!(node = %core.node, "actor system started");
        Ok(Self { core })
    }

    pub(crate) fn from_core(core: Arc<SystemCore>) -> Self {
        Self { core }
    }

    pub fn node_id(&self) -> NodeId {
        self.core.node
    }

    pub fn config(&self) -> &ActorSystemConfig {
        &self.core.config
    }

    pub fn clock(&self) -> Clock {
        self.core.clock.clone()
    }

    /// Spawns a top-level actor. An empty name auto-generates one.
    pub fn spawn<F>(&self, name: &str, factory: F) -> Result<ActorHandle>
    where
        F: FnOnce(&mut ActorContext<'_>) -> Result<Behavior>,
    {
        SystemCore::spawn(&self.core, name, factory)
    }

    /// Looks up a live actor by name.
    pub fn find(&self, name: &str) -> Option<ActorHandle> {
        self.core
            .actors
            .lock()
            .get(name)
            .and_then(WeakActorHandle::upgrade)
            .filter(ActorHandle::is_alive)
    }

    /// Anonymous send from outside any actor.
    pub fn send(&self, target: &ActorHandle, msg: Message) -> Result<()> {
        target.send(msg)
    }

    pub fn stats(&self) -> SystemStats {
        SystemStats {
            rejected_messages: self.core.rejected.load(Ordering::Relaxed),
            unmatched_responses: self.core.unmatched.load(Ordering::Relaxed),
            dropped_messages: self.core.dropped.load(Ordering::Relaxed),
            live_actors: self.core.live.load(Ordering::Acquire),
        }
    }

    pub fn live_actors(&self) -> u64 {
        self.core.live.load(Ordering::Acquire)
    }

    /// Polls until every live actor is parked with an empty mailbox, or the
    /// deadline passes. Test helper; not a synchronization primitive.
    pub fn await_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = {
                let actors = self.core.actors.lock();
                actors.values().all(|weak| match weak.upgrade() {
                    Some(handle) => {
                        let block = handle.block();
                        block.is_terminated()
                            || (block.lifecycle() == Lifecycle::AwaitingMessage
                                && block.mailbox.is_empty()
                                && !block.has_flow_work())
                    }
                    None => true,
                })
            };
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stops the system: kills remaining actors, drains the scheduler (each
    /// scheduled resumable sees one final resume), stops the clock. Safe to
    /// call more than once; must not be called from an actor thread.
    pub fn shutdown(&self) {
        if self.core.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.core.node, "actor system shutting down");
        let actors: Vec<WeakActorHandle> =
            self.core.actors.lock().values().cloned().collect();
        for weak in actors {
            if let Some(handle) = weak.upgrade() {
                handle.block().deliver(Envelope::urgent(
                    None,
                    exit_message(None, ExitReason::Kill),
                ));
            }
        }
        self.core.scheduler.shutdown();
        self.core.clock.stop();
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("node", &self.core.node)
            .field("live_actors", &self.live_actors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{behavior, Reply};
    use crate::envelope::Lane;
    use crate::test_support::{self, Hit, Ping, Pong};
    use std::sync::mpsc;

    fn small_system() -> ActorSystem {
        test_support::boot();
        let mut config = ActorSystemConfig::default();
        config.scheduler.max_threads = 2;
        ActorSystem::new(config).unwrap()
    }

    #[test]
    fn spawned_actor_handles_messages() {
        let system = small_system();
        let (tx, rx) = mpsc::channel();
        let echo = system
            .spawn("echo", move |_ctx| {
                behavior()
                    .handle(move |_ctx, Ping(n): Ping| {
                        let _ = tx.send(n);
                        Reply::unit()
                    })
                    .build()
            })
            .unwrap();
        system.send(&echo, Message::of(Ping(7)).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        system.shutdown();
    }

    #[test]
    fn empty_mailbox_parks_without_dispatch() {
        let system = small_system();
        let actor = system
            .spawn("sleeper", |_ctx| {
                behavior().handle(|_ctx, _p: Ping| Reply::unit()).build()
            })
            .unwrap();
        assert!(system.await_idle(Duration::from_secs(2)));
        assert_eq!(actor.block().lifecycle(), Lifecycle::AwaitingMessage);
        system.shutdown();
    }

    #[test]
    fn urgent_messages_dispatch_before_normal() {
        let system = small_system();
        let (seen_tx, seen_rx) = mpsc::channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let probe = system
            .spawn("probe", move |_ctx| {
                behavior()
                    .handle(move |_ctx, Ping(n): Ping| {
                        let _ = seen_tx.send(n);
                        if n == 1 {
                            // Hold the actor here until the test has queued
                            // both lanes behind this message.
                            let _ = entered_tx.send(());
                            let _ = gate_rx.recv_timeout(Duration::from_secs(2));
                        }
                        Reply::unit()
                    })
                    .build()
            })
            .unwrap();
        system.send(&probe, Message::of(Ping(1)).unwrap()).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        for n in 2..=3 {
            system.send(&probe, Message::of(Ping(n)).unwrap()).unwrap();
        }
        let mut env =
            crate::envelope::Envelope::asynchronous(None, Message::of(Ping(99)).unwrap());
        env.lane = Lane::Urgent;
        probe.block().deliver(env);
        gate_tx.send(()).unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(seen_rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        // The urgent message overtakes every queued normal one.
        assert_eq!(seen, vec![1, 99, 2, 3]);
        system.shutdown();
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let system = small_system();
        let mk = |_ctx: &mut ActorContext<'_>| behavior().handle(|_c, _p: Ping| Reply::unit()).build();
        system.spawn("twin", mk).unwrap();
        let err = system.spawn("twin", mk).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        system.shutdown();
    }

    #[test]
    fn messages_to_dead_actors_bounce_into_the_counter() {
        let system = small_system();
        let short = system
            .spawn("short", |_ctx| {
                behavior()
                    .handle(|ctx, _h: Hit| {
                        ctx.quit(ExitReason::Normal);
                        Reply::unit()
                    })
                    .build()
            })
            .unwrap();
        system.send(&short, Message::of(Hit).unwrap()).unwrap();
        assert!(system.await_idle(Duration::from_secs(2)));
        // Poll until termination has fully propagated.
        let deadline = Instant::now() + Duration::from_secs(2);
        while short.is_alive() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!short.is_alive());
        assert!(system.send(&short, Message::of(Hit).unwrap()).is_err());
        assert!(system.stats().rejected_messages >= 1);
        system.shutdown();
    }

    #[test]
    fn request_reply_round_trip() {
        let system = small_system();
        let adder = system
            .spawn("adder", |_ctx| {
                behavior()
                    .handle2(|_ctx, a: i64, b: i64| Reply::with(a + b))
                    .build()
            })
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let _driver = system
            .spawn("driver", move |ctx| {
                let target = adder.clone();
                let tx = tx.clone();
                ctx.request(&target, Duration::from_secs(1), Message::of2(20i64, 22i64).unwrap())
                    .expect_reply::<(i64,), _, _>(
                        move |_ctx, (sum,)| {
                            let _ = tx.send(sum);
                        },
                        |_ctx, err| panic!("unexpected error: {err}"),
                    );
                behavior().handle(|_ctx, _p: Ping| Reply::unit()).build()
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        system.shutdown();
    }

    #[test]
    fn behavior_timeout_fires_once_and_rearms_on_traffic() {
        let system = small_system();
        let (tx, rx) = mpsc::channel();
        let _watcher = system
            .spawn("watcher", move |_ctx| {
                let tx = tx.clone();
                behavior()
                    .handle(|_ctx, _p: Ping| Reply::unit())
                    .on_timeout(Duration::from_millis(20), move |_ctx| {
                        let _ = tx.send(Instant::now());
                    })
                    .build()
            })
            .unwrap();
        // Fires once...
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        // ...and stays disarmed without further traffic.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        // A message re-arms it.
        let watcher = system.find("watcher").unwrap();
        system.send(&watcher, Message::of(Ping(0)).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        system.shutdown();
    }

    #[test]
    fn skip_defers_to_a_later_behavior() {
        let system = small_system();
        let (tx, rx) = mpsc::channel();
        let _actor = system
            .spawn("stasher", move |_ctx| {
                let tx_ready = tx.clone();
                behavior()
                    .handle_skippable(|_ctx, Pong(_): Pong| Reply::skip())
                    .handle(move |ctx, _h: Hit| {
                        let tx_done = tx_ready.clone();
                        ctx.set_behavior(
                            behavior()
                                .handle(move |_ctx, Pong(n): Pong| {
                                    let _ = tx_done.send(n);
                                    Reply::unit()
                                })
                                .build()
                                .expect("behavior"),
                        );
                        Reply::unit()
                    })
                    .build()
            })
            .unwrap();
        let actor = system.find("stasher").unwrap();
        system.send(&actor, Message::of(Pong(5)).unwrap()).unwrap();
        // The Pong is skipped and stashed until Hit swaps the behavior.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        system.send(&actor, Message::of(Hit).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 5);
        system.shutdown();
    }

    #[test]
    fn unmatched_messages_hit_the_drop_counter() {
        let system = small_system();
        let actor = system
            .spawn("picky", |_ctx| {
                behavior().handle(|_ctx, _p: Ping| Reply::unit()).build()
            })
            .unwrap();
        system.send(&actor, Message::of(Pong(1)).unwrap()).unwrap();
        assert!(system.await_idle(Duration::from_secs(2)));
        assert_eq!(system.stats().dropped_messages, 1);
        system.shutdown();
    }
}
