//! Control blocks and actor handles.
//!
//! One heap cell per actor carries its identity, mailbox, lifecycle state,
//! exit reason, link and monitor sets, and the runtime body. Strong handles
//! keep the whole cell reachable; weak handles keep only the identity alive.
//! After termination the body is dropped, while the block (id, exit reason)
//! persists until the last handle goes away.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use super::cell::CellBody;
use super::ExitReason;
use crate::envelope::Envelope;
use crate::error::{Error, ErrorCode, Result};
use crate::flow::{Action, Disposable};
use crate::mailbox::{Enqueued, Mailbox};
use crate::message::Message;
use crate::system::SystemCore;

/// Process-unique actor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorId(pub u64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.0)
    }
}

/// Identifies the hosting node; opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an actor.
///
/// `Idle` covers "enqueued on the scheduler"; the scheduler flips to
/// `Running` for the duration of each resume call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Idle = 0,
    Running = 1,
    AwaitingMessage = 2,
    Terminated = 3,
}

pub(crate) struct LifecycleState(AtomicU8);

impl LifecycleState {
    fn new(initial: Lifecycle) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub(crate) fn load(&self) -> Lifecycle {
        match self.0.load(Ordering::Acquire) {
            0 => Lifecycle::Idle,
            1 => Lifecycle::Running,
            2 => Lifecycle::AwaitingMessage,
            _ => Lifecycle::Terminated,
        }
    }

    pub(crate) fn store(&self, state: Lifecycle) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The persistent identity record of one actor.
pub struct ControlBlock {
    pub(crate) id: ActorId,
    pub(crate) node: NodeId,
    pub(crate) name: Option<String>,
    pub(crate) mailbox: Mailbox,
    pub(crate) state: LifecycleState,
    pub(crate) exit: Mutex<Option<ExitReason>>,
    pub(crate) links: Mutex<Vec<WeakActorHandle>>,
    pub(crate) monitors: Mutex<Vec<WeakActorHandle>>,
    /// Pending flow callbacks, drained on the actor's own thread between
    /// message dispatches.
    pub(crate) flow_queue: Mutex<VecDeque<Action>>,
    /// Disposables extending the actor's liveness.
    pub(crate) watched: Mutex<Vec<Disposable>>,
    pub(crate) body: Mutex<Option<CellBody>>,
    pub(crate) system: Weak<SystemCore>,
    pub(crate) self_weak: Weak<ControlBlock>,
}

impl ControlBlock {
    pub(crate) fn new(
        id: ActorId,
        node: NodeId,
        name: Option<String>,
        system: Weak<SystemCore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            id,
            node,
            name,
            mailbox: Mailbox::new(),
            // Spawn primes the mailbox before the first schedule; Running
            // keeps writers from scheduling a half-built actor.
            state: LifecycleState::new(Lifecycle::Running),
            exit: Mutex::new(None),
            links: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            flow_queue: Mutex::new(VecDeque::new()),
            watched: Mutex::new(Vec::new()),
            body: Mutex::new(Some(CellBody::new())),
            system,
            self_weak: self_weak.clone(),
        })
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.load()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit.lock().clone()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state.load(), Lifecycle::Terminated)
    }

    pub(crate) fn downgrade_self(&self) -> WeakActorHandle {
        WeakActorHandle(self.self_weak.clone())
    }

    /// Enqueues one element and wakes the actor if it was parked. Returns
    /// `false` when the mailbox bounced the element; the bounce is counted.
    pub(crate) fn deliver(&self, env: Envelope) -> bool {
        match self.mailbox.enqueue(env) {
            Enqueued::Ok => {
                self.wake();
                true
            }
            Enqueued::Closed(env) => {
                if let Some(sys) = self.system.upgrade() {
                    sys.count_rejected(1);
                }
                // A bounced request still owes its sender an error response.
                if env.correlation.is_request() {
                    if let Some(sender) = env.sender.as_ref().and_then(WeakActorHandle::upgrade) {
                        sender.block().deliver(Envelope::response(
                            Some(self.downgrade_self()),
                            env.correlation,
                            Message::from_error(Error::new(ErrorCode::ActorUnreachable)),
                        ));
                    }
                }
                false
            }
        }
    }

    /// Posts a flow callback on this actor's coordinator queue and wakes it.
    pub(crate) fn enqueue_action(&self, action: Action) {
        if self.is_terminated() {
            action.dispose();
            return;
        }
        self.flow_queue.lock().push_back(action);
        self.wake();
    }

    pub(crate) fn has_flow_work(&self) -> bool {
        !self.flow_queue.lock().is_empty()
    }

    /// Re-submits the actor to the scheduler when it was awaiting a message.
    /// The CAS makes losing writers back off, so each wake schedules once.
    pub(crate) fn wake(&self) {
        if self
            .state
            .transition(Lifecycle::AwaitingMessage, Lifecycle::Idle)
        {
            if let (Some(sys), Some(me)) = (self.system.upgrade(), self.self_weak.upgrade()) {
                sys.scheduler().schedule(me);
            }
        }
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.load())
            .finish()
    }
}

/// Strong reference to an actor.
#[derive(Clone)]
pub struct ActorHandle(pub(crate) Arc<ControlBlock>);

impl ActorHandle {
    pub fn id(&self) -> ActorId {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name()
    }

    pub fn is_alive(&self) -> bool {
        !self.0.is_terminated()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.0.exit_reason()
    }

    /// Number of undelivered messages in the urgent and normal lanes.
    pub fn pending_messages(&self) -> usize {
        self.0.mailbox.len()
    }

    /// Sends an asynchronous message from outside any actor.
    pub fn send(&self, msg: Message) -> Result<()> {
        if self.0.deliver(Envelope::asynchronous(None, msg)) {
            Ok(())
        } else {
            Err(Error::new(ErrorCode::ActorUnreachable))
        }
    }

    pub fn downgrade(&self) -> WeakActorHandle {
        WeakActorHandle(Arc::downgrade(&self.0))
    }

    pub(crate) fn block(&self) -> &Arc<ControlBlock> {
        &self.0
    }
}

impl PartialEq for ActorHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ActorHandle {}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorHandle({})", self.0.id)
    }
}

/// Weak reference: keeps the identity alive, not the actor.
#[derive(Clone, Default)]
pub struct WeakActorHandle(pub(crate) Weak<ControlBlock>);

impl WeakActorHandle {
    /// A handle that never upgrades.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn upgrade(&self) -> Option<ActorHandle> {
        self.0.upgrade().map(ActorHandle)
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for WeakActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(block) => write!(f, "WeakActorHandle({})", block.id),
            None => write!(f, "WeakActorHandle(gone)"),
        }
    }
}
