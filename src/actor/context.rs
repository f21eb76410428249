//! What a running handler sees.
//!
//! The context borrows the actor's control block and runtime body for the
//! duration of one dispatch. Sending, requesting, spawning, behavior
//! changes, linking, and flow hosting all go through here.

use std::sync::Arc;
use std::time::Duration;

use super::cell::{BecomeOp, CellBody, DefaultHandler};
use super::control::{ActorHandle, ActorId, ControlBlock, WeakActorHandle};
use super::{
    demonitor_message, down_message, exit_message, link_message, monitor_message,
    unlink_message, ExitReason,
};
use crate::behavior::Behavior;
use crate::clock::{CancelToken, Clock};
use crate::envelope::{CorrelationId, Envelope, Lane};
use crate::error::{Error, ErrorCode, Result};
use crate::flow::{Action, CoordinatorHandle, Disposable};
use crate::message::Message;
use crate::request::Awaited;
use crate::system::{ActorSystem, SystemCore};
use tracing::debug;

/// Execution context of one message dispatch.
pub struct ActorContext<'a> {
    pub(crate) block: &'a Arc<ControlBlock>,
    pub(crate) body: &'a mut CellBody,
    pub(crate) system: Arc<SystemCore>,
    pub(crate) sender: Option<WeakActorHandle>,
    pub(crate) correlation: CorrelationId,
}

impl<'a> ActorContext<'a> {
    pub fn id(&self) -> ActorId {
        self.block.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.block.name()
    }

    /// Strong handle to the running actor.
    pub fn self_handle(&self) -> ActorHandle {
        ActorHandle(self.block.clone())
    }

    /// The sender of the current message, if it is still alive.
    pub fn sender(&self) -> Option<ActorHandle> {
        self.sender.as_ref().and_then(WeakActorHandle::upgrade)
    }

    /// Handle to the hosting system.
    pub fn system(&self) -> ActorSystem {
        ActorSystem::from_core(self.system.clone())
    }

    pub fn clock(&self) -> Clock {
        self.system.clock().clone()
    }

    // -- sending ------------------------------------------------------------

    /// Fire-and-forget send on the normal lane. Messages to dead actors are
    /// counted, not reported.
    pub fn send(&self, target: &ActorHandle, msg: Message) {
        self.send_with(target, msg, Lane::Normal);
    }

    /// Send on a chosen lane.
    pub fn send_with(&self, target: &ActorHandle, msg: Message, lane: Lane) {
        let mut env = Envelope::asynchronous(Some(self.block.downgrade_self()), msg);
        env.lane = lane;
        target.block().deliver(env);
    }

    /// Sends a request and returns the continuation hook. The timeout rides
    /// the clock as a self-addressed `request_timeout` error response under
    /// the same correlation id, so response and timeout resolve the request
    /// table entry exactly once between them.
    pub fn request<'s>(
        &'s mut self,
        target: &ActorHandle,
        timeout: Duration,
        msg: Message,
    ) -> Awaited<'s, 'a> {
        let id = self.body.requests.allocate();
        let env = Envelope::request(self.block.downgrade_self(), id, msg);
        if !target.block().deliver(env) {
            return Awaited {
                ctx: self,
                id,
                timeout: CancelToken::unarmed(),
                send_error: Some(Error::new(ErrorCode::ActorUnreachable)),
            };
        }
        let timeout_env = Envelope {
            sender: None,
            correlation: CorrelationId::request(id).response(),
            lane: Lane::Normal,
            content: Message::from_error(Error::new(ErrorCode::RequestTimeout)),
        };
        let token =
            self.system
                .clock()
                .schedule_message_in(timeout, self.block.downgrade_self(), timeout_env);
        Awaited {
            ctx: self,
            id,
            timeout: token,
            send_error: None,
        }
    }

    /// Captures the current request so a later handler can fulfill it.
    pub fn make_response_promise(&self) -> ResponsePromise {
        ResponsePromise {
            target: self.sender.clone(),
            source: self.block.downgrade_self(),
            correlation: self.correlation,
            delivered: false,
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Spawns a child actor on the same system.
    pub fn spawn<F>(&self, name: &str, factory: F) -> Result<ActorHandle>
    where
        F: FnOnce(&mut ActorContext<'_>) -> Result<Behavior>,
    {
        SystemCore::spawn(&self.system, name, factory)
    }

    /// Replaces the top of the behavior stack after this handler returns.
    pub fn set_behavior(&mut self, behavior: Behavior) {
        self.body.become_op = Some(BecomeOp::Replace(behavior));
    }

    /// Pushes a behavior; the current one resumes after `pop_behavior`.
    pub fn push_behavior(&mut self, behavior: Behavior) {
        self.body.become_op = Some(BecomeOp::Push(behavior));
    }

    /// Pops the top behavior; an empty stack winds the actor down normally.
    pub fn pop_behavior(&mut self) {
        self.body.become_op = Some(BecomeOp::Pop);
    }

    /// Requests termination with `reason` once this handler returns.
    pub fn quit(&mut self, reason: ExitReason) {
        self.body.exit_requested = Some(reason);
    }

    /// Replaces the drop-and-log handler for unmatched messages.
    pub fn set_default_handler<F>(&mut self, f: F)
    where
        F: FnMut(&mut ActorContext<'_>, &Envelope) + Send + 'static,
    {
        self.body.default_handler = Some(Box::new(f) as DefaultHandler);
    }

    // -- links and monitors --------------------------------------------------

    /// Links this actor with `target`. Links are symmetric; non-normal exit
    /// reasons propagate along them. Linking a terminated peer delivers the
    /// exit notification immediately.
    pub fn link(&mut self, target: &ActorHandle) {
        let me = self.block.downgrade_self();
        super::cell::add_link(self.block, target.downgrade());
        let env = Envelope::urgent(Some(me.clone()), link_message(me));
        if !target.block().deliver(env) {
            let reason = target.exit_reason().unwrap_or(ExitReason::Unreachable);
            self.block.deliver(Envelope::urgent(
                None,
                exit_message(Some(target.downgrade()), reason),
            ));
        }
    }

    /// Dissolves a link from both sides. Idempotent.
    pub fn unlink(&mut self, target: &ActorHandle) {
        let peer = target.downgrade();
        self.block.links.lock().retain(|l| !l.ptr_eq(&peer));
        let me = self.block.downgrade_self();
        target
            .block()
            .deliver(Envelope::urgent(Some(me.clone()), unlink_message(me)));
    }

    /// Registers this actor as a monitor of `target`; a `DownMsg` arrives
    /// when the target terminates (immediately if it already has).
    pub fn monitor(&self, target: &ActorHandle) {
        let me = self.block.downgrade_self();
        let env = Envelope::urgent(Some(me.clone()), monitor_message(me));
        if !target.block().deliver(env) {
            let reason = target.exit_reason().unwrap_or(ExitReason::Unreachable);
            self.block.deliver(Envelope::urgent(
                None,
                down_message(target.downgrade(), reason),
            ));
        }
    }

    /// Revokes a monitor registration.
    pub fn demonitor(&self, target: &ActorHandle) {
        let me = self.block.downgrade_self();
        target
            .block()
            .deliver(Envelope::urgent(Some(me.clone()), demonitor_message(me)));
    }

    // -- flow coordination ---------------------------------------------------

    /// Enqueues a callable to run after this handler returns and before the
    /// next mailbox dequeue.
    pub fn delay(&self, action: Action) {
        self.block.flow_queue.lock().push_back(action);
    }

    /// Sugar for [`ActorContext::delay`].
    pub fn delay_fn<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.delay(Action::once(f));
    }

    /// Extends this actor's liveness until `disposable` reports disposed.
    pub fn watch(&self, disposable: Disposable) {
        self.block.watched.lock().push(disposable);
    }

    /// Coordinator handle for building flows owned by this actor.
    pub fn coordinator(&self) -> CoordinatorHandle {
        CoordinatorHandle::for_actor(self.block.downgrade_self())
    }
}

/// Lets a handler defer its response: the promise carries the request's
/// correlation id and fulfills it from any later point on the same actor.
pub struct ResponsePromise {
    target: Option<WeakActorHandle>,
    source: WeakActorHandle,
    correlation: CorrelationId,
    delivered: bool,
}

impl ResponsePromise {
    /// True when the captured message was actually a request.
    pub fn valid(&self) -> bool {
        self.correlation.is_request()
    }

    /// Fulfills the promise with a payload.
    pub fn deliver(mut self, msg: Message) {
        self.send(msg);
    }

    /// Fulfills the promise with an error.
    pub fn fail(mut self, err: Error) {
        self.send(Message::from_error(err));
    }

    fn send(&mut self, msg: Message) {
        if self.delivered || !self.correlation.is_request() {
            return;
        }
        self.delivered = true;
        if let Some(target) = self.target.as_ref().and_then(WeakActorHandle::upgrade) {
            target.block().deliver(Envelope::response(
                Some(self.source.clone()),
                self.correlation,
                msg,
            ));
        }
    }
}

impl Drop for ResponsePromise {
    fn drop(&mut self) {
        if !self.delivered && self.correlation.is_request() {
            debug!("response promise dropped without a reply");
        }
    }
}
