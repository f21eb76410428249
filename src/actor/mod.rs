//! # Actor runtime
//!
//! The per-actor state machine: control block and handles ([`control`]),
//! the resume loop and exit processing ([`cell`]), and the context handlers
//! see ([`context`]).

use serde::{Deserialize, Serialize};

pub(crate) mod cell;
mod context;
mod control;

pub use context::ActorContext;
pub use control::{ActorHandle, ActorId, ControlBlock, Lifecycle, NodeId, WeakActorHandle};

use crate::message::Message;
use crate::registry::{intern, tags, ErasedValue};

/// Why an actor terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Regular wind-down; does not propagate through links.
    Normal,
    /// Forced termination, e.g. at system shutdown.
    Kill,
    /// Application-defined reason.
    User { code: u64, message: String },
    /// A handler failed outside a request, or panicked.
    UnhandledException,
    /// The peer was gone before any reason could be observed.
    Unreachable,
}

impl ExitReason {
    /// Only non-normal reasons propagate through links.
    pub fn is_normal(&self) -> bool {
        matches!(self, ExitReason::Normal)
    }
}

/// Delivered to linked actors when a peer terminates.
#[derive(Debug, Clone)]
pub struct ExitMsg {
    pub source: Option<WeakActorHandle>,
    pub reason: ExitReason,
}

impl ExitMsg {
    pub fn new(source: Option<WeakActorHandle>, reason: ExitReason) -> Self {
        Self { source, reason }
    }
}

/// Delivered to monitors when the monitored actor terminates.
#[derive(Debug, Clone)]
pub struct DownMsg {
    pub source: WeakActorHandle,
    pub reason: ExitReason,
}

/// Asks the receiver to add the peer to its link set.
#[derive(Debug, Clone)]
pub struct LinkMsg {
    pub peer: WeakActorHandle,
}

/// Asks the receiver to remove the peer from its link set.
#[derive(Debug, Clone)]
pub struct UnlinkMsg {
    pub peer: WeakActorHandle,
}

/// Asks the receiver to notify the peer on termination.
#[derive(Debug, Clone)]
pub struct MonitorMsg {
    pub peer: WeakActorHandle,
}

/// Revokes a monitor registration.
#[derive(Debug, Clone)]
pub struct DemonitorMsg {
    pub peer: WeakActorHandle,
}

/// Internal marker the clock delivers when a behavior's receive timeout
/// elapses; the generation guards against stale deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReceiveTimeout {
    pub generation: u64,
}

// Builders for system messages; their type lists use reserved tags, so no
// registry lookup can fail here.

pub(crate) fn exit_message(source: Option<WeakActorHandle>, reason: ExitReason) -> Message {
    Message::from_parts(
        intern(&[tags::EXIT]),
        vec![Box::new(ExitMsg::new(source, reason)) as ErasedValue],
    )
}

pub(crate) fn down_message(source: WeakActorHandle, reason: ExitReason) -> Message {
    Message::from_parts(
        intern(&[tags::DOWN]),
        vec![Box::new(DownMsg { source, reason }) as ErasedValue],
    )
}

pub(crate) fn link_message(peer: WeakActorHandle) -> Message {
    Message::from_parts(
        intern(&[tags::LINK]),
        vec![Box::new(LinkMsg { peer }) as ErasedValue],
    )
}

pub(crate) fn unlink_message(peer: WeakActorHandle) -> Message {
    Message::from_parts(
        intern(&[tags::UNLINK]),
        vec![Box::new(UnlinkMsg { peer }) as ErasedValue],
    )
}

pub(crate) fn monitor_message(peer: WeakActorHandle) -> Message {
    Message::from_parts(
        intern(&[tags::MONITOR]),
        vec![Box::new(MonitorMsg { peer }) as ErasedValue],
    )
}

pub(crate) fn demonitor_message(peer: WeakActorHandle) -> Message {
    Message::from_parts(
        intern(&[tags::DEMONITOR]),
        vec![Box::new(DemonitorMsg { peer }) as ErasedValue],
    )
}

pub(crate) fn receive_timeout_message(generation: u64) -> Message {
    Message::from_parts(
        intern(&[tags::RECEIVE_TIMEOUT]),
        vec![Box::new(ReceiveTimeout { generation }) as ErasedValue],
    )
}
