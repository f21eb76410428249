//! The per-actor state machine.
//!
//! A control block *is* a resumable: workers call [`Resumable::resume`],
//! which drains up to `max_throughput` mailbox elements (urgent lane first),
//! runs pending flow callbacks between dispatches, and parks the actor with
//! an atomic re-check so no message can be lost between "mailbox empty" and
//! "awaiting message".

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, debug_span, error, warn};

use super::control::{ActorHandle, ControlBlock, Lifecycle};
use super::{
    down_message, exit_message, receive_timeout_message, DemonitorMsg, ExitMsg, ExitReason,
    LinkMsg, MonitorMsg, ReceiveTimeout, UnlinkMsg,
};
use crate::actor::ActorContext;
use crate::behavior::{Behavior, Reply};
use crate::clock::CancelToken;
use crate::envelope::{CorrelationId, Envelope};
use crate::error::{Error, ErrorCode};
use crate::message::Message;
use crate::registry::{intern, same_list, tags, TypeListRef};
use crate::request::RequestTable;
use crate::scheduler::{Resumable, ResumeResult, WorkerContext};
use crate::system::SystemCore;

pub(crate) type DefaultHandler = Box<dyn FnMut(&mut ActorContext<'_>, &Envelope) + Send>;

/// Deferred behavior-stack operation requested by a running handler.
pub(crate) enum BecomeOp {
    Replace(Behavior),
    Push(Behavior),
    Pop,
}

/// Mutable runtime state of one actor; dropped at termination while the
/// control block lives on.
pub(crate) struct CellBody {
    pub(crate) behaviors: Vec<Behavior>,
    pub(crate) requests: RequestTable,
    /// Un-stashed messages, re-examined before the mailbox after a behavior
    /// change.
    pub(crate) retry_queue: VecDeque<Envelope>,
    pub(crate) become_op: Option<BecomeOp>,
    pub(crate) exit_requested: Option<ExitReason>,
    pub(crate) timeout_gen: u64,
    pub(crate) timeout_token: Option<CancelToken>,
    pub(crate) default_handler: Option<DefaultHandler>,
}

impl CellBody {
    pub(crate) fn new() -> Self {
        Self {
            behaviors: Vec::new(),
            requests: RequestTable::new(),
            retry_queue: VecDeque::new(),
            become_op: None,
            exit_requested: None,
            timeout_gen: 0,
            timeout_token: None,
            default_handler: None,
        }
    }
}

impl Resumable for ControlBlock {
    fn resume(&self, worker: &WorkerContext, max_throughput: usize) -> ResumeResult {
        let Some(me) = self.self_weak.upgrade() else {
            return ResumeResult::Done;
        };
        let me = ActorHandle(me);
        let Some(sys) = self.system.upgrade() else {
            return ResumeResult::Shutdown;
        };
        if self.is_terminated() {
            return ResumeResult::Done;
        }
        self.state.store(Lifecycle::Running);
        let span = debug_span!("actor", id = %self.id, worker = worker.worker_id);
        let _enter = span.enter();

        let mut guard = self.body.lock();
        let Some(body) = guard.as_mut() else {
            return ResumeResult::Done;
        };

        let budget = max_throughput.max(1);
        let mut handled = 0usize;
        loop {
            // Delayed flow callbacks run before the next mailbox dequeue.
            if run_flow_actions(me.block()) {
                body.exit_requested
                    .get_or_insert(ExitReason::UnhandledException);
            }
            prune_watched(me.block());
            if sys.is_stopping() {
                body.exit_requested.get_or_insert(ExitReason::Kill);
            }
            if body.exit_requested.is_some() || handled >= budget {
                break;
            }
            let env = body
                .retry_queue
                .pop_front()
                .or_else(|| self.mailbox.try_dequeue());
            let Some(env) = env else {
                break;
            };
            handled += 1;
            dispatch_envelope(&me, body, &sys, env);
            maybe_finish_normally(&me, body);
        }
        if run_flow_actions(me.block()) {
            body.exit_requested
                .get_or_insert(ExitReason::UnhandledException);
        }
        prune_watched(me.block());
        maybe_finish_normally(&me, body);

        if let Some(reason) = body.exit_requested.take() {
            terminate(&me, &mut *guard, &sys, reason);
            return if sys.is_stopping() {
                ResumeResult::Shutdown
            } else {
                ResumeResult::Done
            };
        }
        let retry_pending = guard
            .as_ref()
            .map(|b| !b.retry_queue.is_empty())
            .unwrap_or(false);
        drop(guard);

        if retry_pending || !self.mailbox.is_empty() || self.has_flow_work() {
            self.state.store(Lifecycle::Idle);
            return ResumeResult::ResumeLater;
        }
        // Park, then re-check: a writer racing the flip either sees
        // AwaitingMessage and wins the CAS (scheduling the actor itself), or
        // we win here and stay runnable.
        self.state.store(Lifecycle::AwaitingMessage);
        if !self.mailbox.is_empty() || self.has_flow_work() {
            if self
                .state
                .transition(Lifecycle::AwaitingMessage, Lifecycle::Idle)
            {
                return ResumeResult::ResumeLater;
            }
        }
        ResumeResult::AwaitingMessage
    }
}

/// With the behavior stack empty, the actor winds down normally once no
/// watched disposable and no pending flow callback keeps it alive.
fn maybe_finish_normally(me: &ActorHandle, body: &mut CellBody) {
    if body.exit_requested.is_some() || !body.behaviors.is_empty() {
        return;
    }
    let block = me.block();
    let watched_alive = block.watched.lock().iter().any(|d| !d.disposed());
    if !watched_alive && !block.has_flow_work() {
        body.exit_requested = Some(ExitReason::Normal);
    }
}

/// Runs every queued flow callback; returns true if one panicked.
fn run_flow_actions(block: &Arc<ControlBlock>) -> bool {
    let mut panicked = false;
    loop {
        let action = block.flow_queue.lock().pop_front();
        let Some(action) = action else {
            break;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| action.run())).is_err() {
            error!("flow callback panicked");
            panicked = true;
        }
    }
    panicked
}

fn prune_watched(block: &Arc<ControlBlock>) {
    block.watched.lock().retain(|d| !d.disposed());
}

fn list_of(tag: crate::registry::TypeTag) -> TypeListRef {
    intern(&[tag])
}

fn dispatch_envelope(
    me: &ActorHandle,
    body: &mut CellBody,
    sys: &Arc<SystemCore>,
    env: Envelope,
) {
    if env.correlation.is_response() {
        handle_response(me, body, sys, env);
        rearm_timeout(me, body, sys);
        return;
    }
    let types = env.content.types();
    if same_list(types, list_of(tags::RECEIVE_TIMEOUT)) {
        handle_receive_timeout(me, body, sys, env);
        return;
    }
    let idx = body.behaviors.last().and_then(|b| b.position(types));
    match idx {
        Some(idx) => invoke_handler(me, body, sys, env, idx),
        None => handle_unmatched(me, body, sys, env),
    }
    rearm_timeout(me, body, sys);
}

fn invoke_handler(
    me: &ActorHandle,
    body: &mut CellBody,
    sys: &Arc<SystemCore>,
    mut env: Envelope,
    idx: usize,
) {
    let Some(mut top) = body.behaviors.pop() else {
        return;
    };
    let skippable = top.entries[idx].skippable;
    let sender = env.sender.clone();
    let correlation = env.correlation;
    // Skippable handlers work on a shared copy so the original message can
    // go back to the stash; everything else consumes the payload in place.
    let msg = if skippable {
        env.content.clone()
    } else {
        std::mem::replace(&mut env.content, Message::unit())
    };
    let outcome = {
        let mut ctx = ActorContext {
            block: me.block(),
            body: &mut *body,
            system: sys.clone(),
            sender: sender.clone(),
            correlation,
        };
        panic::catch_unwind(AssertUnwindSafe(|| (top.entries[idx].invoke)(&mut ctx, msg)))
    };
    match outcome {
        Ok(Reply::Unit) => {}
        Ok(Reply::Message(reply)) => {
            if correlation.is_request() {
                respond(me, sys, &sender, correlation, reply);
            }
        }
        Ok(Reply::Skip) => {
            if skippable {
                me.block().mailbox.stash(env);
            } else {
                sys.count_dropped(1);
                warn!(actor = %me.id(), "non-skippable handler returned Skip; message dropped");
            }
        }
        Ok(Reply::Failure(err)) => {
            if correlation.is_request() {
                respond(me, sys, &sender, correlation, Message::from_error(err));
            } else {
                error!(actor = %me.id(), %err, "handler failed outside a request");
                body.exit_requested
                    .get_or_insert(ExitReason::UnhandledException);
            }
        }
        Err(_) => {
            error!(actor = %me.id(), "handler panicked");
            if correlation.is_request() {
                let err = Error::with_message(ErrorCode::UnexpectedMessage, "handler panicked");
                respond(me, sys, &sender, correlation, Message::from_error(err));
            }
            body.exit_requested
                .get_or_insert(ExitReason::UnhandledException);
        }
    }
    restore_stack(me, body, top);
}

/// Re-installs the behavior stack after a dispatch, honoring `become` ops
/// issued by the handler. A change un-stashes skipped messages.
fn restore_stack(me: &ActorHandle, body: &mut CellBody, top: Behavior) {
    match body.become_op.take() {
        None => body.behaviors.push(top),
        Some(BecomeOp::Replace(b)) => {
            body.behaviors.push(b);
            unstash_all(me, body);
        }
        Some(BecomeOp::Push(b)) => {
            body.behaviors.push(top);
            body.behaviors.push(b);
            unstash_all(me, body);
        }
        Some(BecomeOp::Pop) => {
            unstash_all(me, body);
        }
    }
}

fn unstash_all(me: &ActorHandle, body: &mut CellBody) {
    body.retry_queue.extend(me.block().mailbox.take_stash());
}

fn handle_response(me: &ActorHandle, body: &mut CellBody, sys: &Arc<SystemCore>, env: Envelope) {
    let id = env.correlation.request_number();
    let Some(pending) = body.requests.remove(id) else {
        sys.count_unmatched(1);
        debug!(actor = %me.id(), id, "response without a pending request");
        return;
    };
    pending.timeout.cancel();
    let msg = env.content;
    let mut ctx = ActorContext {
        block: me.block(),
        body: &mut *body,
        system: sys.clone(),
        sender: env.sender.clone(),
        correlation: CorrelationId::ASYNC,
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Some(err) = msg.to_error() {
            (pending.on_err)(&mut ctx, err);
        } else if let Some(expected) = pending.expected {
            if same_list(msg.types(), expected) {
                (pending.on_ok)(&mut ctx, msg);
            } else {
                (pending.on_err)(&mut ctx, Error::new(ErrorCode::UnexpectedResponse));
            }
        } else {
            (pending.on_ok)(&mut ctx, msg);
        }
    }));
    if outcome.is_err() {
        error!(actor = %me.id(), "response continuation panicked");
        body.exit_requested
            .get_or_insert(ExitReason::UnhandledException);
    }
}

fn handle_receive_timeout(
    me: &ActorHandle,
    body: &mut CellBody,
    sys: &Arc<SystemCore>,
    env: Envelope,
) {
    let generation = env
        .content
        .get::<ReceiveTimeout>(0)
        .map(|t| t.generation);
    if generation != Some(body.timeout_gen) {
        return; // stale arming
    }
    // Disarm: fires exactly once until the next receipt re-arms it.
    body.timeout_gen += 1;
    let Some(mut top) = body.behaviors.pop() else {
        return;
    };
    if let Some(timeout) = top.timeout.as_mut() {
        let outcome = {
            let mut ctx = ActorContext {
                block: me.block(),
                body: &mut *body,
                system: sys.clone(),
                sender: None,
                correlation: CorrelationId::ASYNC,
            };
            panic::catch_unwind(AssertUnwindSafe(|| (timeout.handler)(&mut ctx)))
        };
        if outcome.is_err() {
            error!(actor = %me.id(), "timeout handler panicked");
            body.exit_requested
                .get_or_insert(ExitReason::UnhandledException);
        }
    }
    restore_stack(me, body, top);
}

fn handle_unmatched(me: &ActorHandle, body: &mut CellBody, sys: &Arc<SystemCore>, env: Envelope) {
    let types = env.content.types();
    let block = me.block();
    // Hardcoded defaults for system messages without a user handler.
    if same_list(types, list_of(tags::EXIT)) {
        if let Some(msg) = env.content.get::<ExitMsg>(0) {
            if !msg.reason.is_normal() {
                body.exit_requested.get_or_insert(msg.reason.clone());
            }
        }
        return;
    }
    if same_list(types, list_of(tags::DOWN)) {
        // Unobserved down notifications are dropped.
        return;
    }
    if same_list(types, list_of(tags::LINK)) {
        if let Some(msg) = env.content.get::<LinkMsg>(0) {
            add_link(block, msg.peer.clone());
        }
        return;
    }
    if same_list(types, list_of(tags::UNLINK)) {
        if let Some(msg) = env.content.get::<UnlinkMsg>(0) {
            block.links.lock().retain(|l| !l.ptr_eq(&msg.peer));
        }
        return;
    }
    if same_list(types, list_of(tags::MONITOR)) {
        if let Some(msg) = env.content.get::<MonitorMsg>(0) {
            let mut monitors = block.monitors.lock();
            if !monitors.iter().any(|m| m.ptr_eq(&msg.peer)) {
                monitors.push(msg.peer.clone());
            }
        }
        return;
    }
    if same_list(types, list_of(tags::DEMONITOR)) {
        if let Some(msg) = env.content.get::<DemonitorMsg>(0) {
            block.monitors.lock().retain(|m| !m.ptr_eq(&msg.peer));
        }
        return;
    }
    // Plain unmatched user message: drop, log, count; requests still get an
    // error response.
    sys.count_dropped(1);
    warn!(actor = %me.id(), msg = %env.content.stringify(), "unexpected message dropped");
    if env.correlation.is_request() {
        respond(
            me,
            sys,
            &env.sender,
            env.correlation,
            Message::from_error(Error::new(ErrorCode::UnexpectedMessage)),
        );
    }
    if let Some(mut handler) = body.default_handler.take() {
        let mut ctx = ActorContext {
            block: me.block(),
            body: &mut *body,
            system: sys.clone(),
            sender: env.sender.clone(),
            correlation: env.correlation,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut ctx, &env)));
        if outcome.is_err() {
            error!(actor = %me.id(), "default handler panicked");
        }
        if body.default_handler.is_none() {
            body.default_handler = Some(handler);
        }
    }
}

pub(crate) fn add_link(block: &Arc<ControlBlock>, peer: super::WeakActorHandle) {
    let mut links = block.links.lock();
    if !links.iter().any(|l| l.ptr_eq(&peer)) {
        links.push(peer);
    }
}

fn respond(
    me: &ActorHandle,
    sys: &Arc<SystemCore>,
    sender: &Option<super::WeakActorHandle>,
    correlation: CorrelationId,
    msg: Message,
) {
    let Some(target) = sender.as_ref().and_then(super::WeakActorHandle::upgrade) else {
        sys.count_rejected(1);
        return;
    };
    let env = Envelope::response(Some(me.block().downgrade_self()), correlation, msg);
    target.block().deliver(env);
}

/// Re-arms the top behavior's receive timeout; no-op without one.
pub(crate) fn rearm_timeout(me: &ActorHandle, body: &mut CellBody, sys: &Arc<SystemCore>) {
    if let Some(token) = body.timeout_token.take() {
        token.cancel();
    }
    let Some(after) = body.behaviors.last().and_then(|b| b.timeout.as_ref().map(|t| t.after))
    else {
        return;
    };
    body.timeout_gen += 1;
    let env = Envelope::urgent(None, receive_timeout_message(body.timeout_gen));
    let token = sys
        .clock()
        .schedule_message_in(after, me.block().downgrade_self(), env);
    body.timeout_token = Some(token);
}

/// Exit processing: close and bounce the mailbox, cancel pending requests,
/// fan out exit/down notifications, release the behavior stack.
pub(crate) fn terminate(
    me: &ActorHandle,
    body_slot: &mut Option<CellBody>,
    sys: &Arc<SystemCore>,
    reason: ExitReason,
) {
    let Some(mut body) = body_slot.take() else {
        return;
    };
    let block = me.block();
    block.state.store(Lifecycle::Terminated);
    *block.exit.lock() = Some(reason.clone());
    let mut bounced = block.mailbox.close();
    bounced.extend(body.retry_queue.drain(..));
    sys.count_rejected(bounced.len() as u64);
    for env in bounced {
        bounce_request(me, &env);
    }
    for req in body.requests.drain() {
        req.timeout.cancel();
    }
    if let Some(token) = body.timeout_token.take() {
        token.cancel();
    }
    for d in block.watched.lock().drain(..) {
        d.dispose();
    }
    for a in block.flow_queue.lock().drain(..) {
        a.dispose();
    }
    let weak_self = block.downgrade_self();
    let links = std::mem::take(&mut *block.links.lock());
    for peer in links {
        if let Some(peer) = peer.upgrade() {
            peer.block().deliver(Envelope::urgent(
                Some(weak_self.clone()),
                exit_message(Some(weak_self.clone()), reason.clone()),
            ));
        }
    }
    let monitors = std::mem::take(&mut *block.monitors.lock());
    for peer in monitors {
        if let Some(peer) = peer.upgrade() {
            peer.block().deliver(Envelope::urgent(
                Some(weak_self.clone()),
                down_message(weak_self.clone(), reason.clone()),
            ));
        }
    }
    body.behaviors.clear();
    sys.actor_terminated(me);
    debug!(actor = %me.id(), ?reason, "actor terminated");
}

/// A bounced request still owes its sender an error response.
fn bounce_request(me: &ActorHandle, env: &Envelope) {
    if !env.correlation.is_request() {
        return;
    }
    let Some(sender) = env.sender.as_ref().and_then(super::WeakActorHandle::upgrade) else {
        return;
    };
    let err = Error::new(ErrorCode::ActorUnreachable);
    sender.block().deliver(Envelope::response(
        Some(me.block().downgrade_self()),
        env.correlation,
        Message::from_error(err),
    ));
}
