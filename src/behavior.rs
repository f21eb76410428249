//! # Behaviors
//!
//! A behavior is an ordered set of typed message handlers plus an optional
//! receive timeout. Each handler is reified at construction into its interned
//! input type list and a boxed invoker closure; dispatch is a linear scan
//! with pointer-equality on the type lists.
//!
//! Handlers return a [`Reply`]: a value (which becomes the response when the
//! incoming message carries a request id), `unit`, a skip marker, or an
//! error. Skipping is only available to handlers registered through the
//! `*_skippable` variants; those receive a shared copy of the message so
//! the original can be left in the mailbox's stash.

use std::any::Any;
use std::time::Duration;

use crate::actor::ActorContext;
use crate::error::{Error, ErrorCode, Result};
use crate::message::{Message, MessageArgs};
use crate::registry::{same_list, TypeListRef};

/// What a handler tells the dispatcher.
pub enum Reply {
    /// No response, even under a request id.
    Unit,
    /// Response payload; routed back to the requester when the incoming
    /// message was a request, dropped otherwise.
    Message(Message),
    /// Leave the message for a later behavior (skippable handlers only).
    Skip,
    /// Failure: becomes an error response under a request id, aborts the
    /// actor with `unhandled_exception` otherwise.
    Failure(Error),
}

impl Reply {
    pub fn unit() -> Self {
        Reply::Unit
    }

    pub fn skip() -> Self {
        Reply::Skip
    }

    pub fn error(err: Error) -> Self {
        Reply::Failure(err)
    }

    /// Replies with a single value.
    pub fn with<A: Any + Send + Sync>(a: A) -> Self {
        Message::of(a).into()
    }

    /// Replies with a pair.
    pub fn with2<A, B>(a: A, b: B) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        Message::of2(a, b).into()
    }

    /// Replies with a triple.
    pub fn with3<A, B, C>(a: A, b: B, c: C) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        C: Any + Send + Sync,
    {
        Message::of3(a, b, c).into()
    }

    /// Replies with a prebuilt message.
    pub fn with_message(msg: Message) -> Self {
        Reply::Message(msg)
    }
}

impl From<Result<Message>> for Reply {
    fn from(r: Result<Message>) -> Self {
        match r {
            Ok(msg) => Reply::Message(msg),
            Err(err) => Reply::Failure(err),
        }
    }
}

pub(crate) type HandlerFn = Box<dyn FnMut(&mut ActorContext<'_>, Message) -> Reply + Send>;
pub(crate) type TimeoutFn = Box<dyn FnMut(&mut ActorContext<'_>) + Send>;

pub(crate) struct HandlerEntry {
    pub(crate) inputs: TypeListRef,
    pub(crate) outputs: Option<TypeListRef>,
    pub(crate) skippable: bool,
    pub(crate) invoke: HandlerFn,
}

pub(crate) struct TimeoutEntry {
    pub(crate) after: Duration,
    pub(crate) handler: TimeoutFn,
}

/// An ordered set of typed handlers with an optional receive timeout.
pub struct Behavior {
    pub(crate) entries: Vec<HandlerEntry>,
    pub(crate) timeout: Option<TimeoutEntry>,
}

impl Behavior {
    pub fn builder() -> BehaviorBuilder {
        BehaviorBuilder::new()
    }

    /// Index of the first handler whose input list matches `types`.
    pub(crate) fn position(&self, types: TypeListRef) -> Option<usize> {
        self.entries.iter().position(|e| same_list(e.inputs, types))
    }

    pub fn handler_count(&self) -> usize {
        self.entries.len()
    }

    pub fn has_timeout(&self) -> bool {
        self.timeout.is_some()
    }
}

impl std::fmt::Debug for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behavior")
            .field("handlers", &self.entries.len())
            .field("timeout", &self.timeout.as_ref().map(|t| t.after))
            .finish()
    }
}

/// Starts a new [`BehaviorBuilder`].
pub fn behavior() -> BehaviorBuilder {
    BehaviorBuilder::new()
}

/// Collects handlers into a [`Behavior`]. Registration errors (unregistered
/// argument types) are deferred to `build`.
pub struct BehaviorBuilder {
    entries: Vec<HandlerEntry>,
    timeout: Option<TimeoutEntry>,
    error: Option<Error>,
}

impl BehaviorBuilder {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            timeout: None,
            error: None,
        }
    }

    fn push<A, F>(mut self, mut f: F, skippable: bool) -> Self
    where
        A: MessageArgs,
        F: FnMut(&mut ActorContext<'_>, A) -> Reply + Send + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        match A::type_list() {
            Ok(inputs) => {
                self.entries.push(HandlerEntry {
                    inputs,
                    outputs: None,
                    skippable,
                    invoke: Box::new(move |ctx, msg| match A::from_message(msg) {
                        Ok(args) => f(ctx, args),
                        Err(err) => Reply::Failure(err),
                    }),
                });
            }
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Adds a one-argument handler. The argument is moved out of the message
    /// when the actor is its sole owner.
    pub fn handle<A, F>(self, mut f: F) -> Self
    where
        A: Any + Send + Sync,
        F: FnMut(&mut ActorContext<'_>, A) -> Reply + Send + 'static,
    {
        self.push::<(A,), _>(move |ctx, (a,)| f(ctx, a), false)
    }

    /// Adds a two-argument handler.
    pub fn handle2<A, B, F>(self, mut f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: FnMut(&mut ActorContext<'_>, A, B) -> Reply + Send + 'static,
    {
        self.push::<(A, B), _>(move |ctx, (a, b)| f(ctx, a, b), false)
    }

    /// Adds a three-argument handler.
    pub fn handle3<A, B, C, F>(self, mut f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        C: Any + Send + Sync,
        F: FnMut(&mut ActorContext<'_>, A, B, C) -> Reply + Send + 'static,
    {
        self.push::<(A, B, C), _>(move |ctx, (a, b, c)| f(ctx, a, b, c), false)
    }

    /// Adds a four-argument handler.
    pub fn handle4<A, B, C, D, F>(self, mut f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        C: Any + Send + Sync,
        D: Any + Send + Sync,
        F: FnMut(&mut ActorContext<'_>, A, B, C, D) -> Reply + Send + 'static,
    {
        self.push::<(A, B, C, D), _>(move |ctx, (a, b, c, d)| f(ctx, a, b, c, d), false)
    }

    /// Adds a handler that may return [`Reply::Skip`]. The handler works on
    /// a shared copy, so the original message survives in the stash.
    pub fn handle_skippable<A, F>(self, mut f: F) -> Self
    where
        A: Any + Send + Sync,
        F: FnMut(&mut ActorContext<'_>, A) -> Reply + Send + 'static,
    {
        self.push::<(A,), _>(move |ctx, (a,)| f(ctx, a), true)
    }

    /// Two-argument skippable handler.
    pub fn handle2_skippable<A, B, F>(self, mut f: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: FnMut(&mut ActorContext<'_>, A, B) -> Reply + Send + 'static,
    {
        self.push::<(A, B), _>(move |ctx, (a, b)| f(ctx, a, b), true)
    }

    /// Declares the reply signature of the most recently added handler, for
    /// interface verification via [`BehaviorBuilder::build_typed`].
    pub fn reply_types<R: MessageArgs>(mut self) -> Self {
        if self.error.is_some() {
            return self;
        }
        match R::type_list() {
            Ok(outputs) => match self.entries.last_mut() {
                Some(entry) => entry.outputs = Some(outputs),
                None => {
                    self.error = Some(Error::with_message(
                        ErrorCode::InvalidArgument,
                        "reply_types called before any handler",
                    ));
                }
            },
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Installs a receive timeout: fires once if no message arrives within
    /// `after`; re-armed on each message receipt. A zero duration fires on
    /// the next scheduling quantum.
    pub fn on_timeout<F>(mut self, after: Duration, handler: F) -> Self
    where
        F: FnMut(&mut ActorContext<'_>) + Send + 'static,
    {
        self.timeout = Some(TimeoutEntry {
            after,
            handler: Box::new(handler),
        });
        self
    }

    /// Finishes the behavior.
    pub fn build(self) -> Result<Behavior> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(Behavior {
            entries: self.entries,
            timeout: self.timeout,
        })
    }

    /// Finishes the behavior and verifies the handler set against a declared
    /// interface: the multiset of `(inputs → outputs)` pairs must equal the
    /// protocol's. Verification happens at construction time, before any
    /// message flows.
    pub fn build_typed(self, protocol: &Protocol) -> Result<Behavior> {
        let behavior = self.build()?;
        let mut declared: Vec<(usize, usize)> = protocol
            .sigs
            .iter()
            .map(|s| (s.inputs as *const _ as usize, s.outputs as *const _ as usize))
            .collect();
        let mut actual = Vec::with_capacity(behavior.entries.len());
        for entry in &behavior.entries {
            let outputs = entry.outputs.ok_or_else(|| {
                Error::with_message(
                    ErrorCode::InvalidArgument,
                    "typed behavior has a handler without declared reply types",
                )
            })?;
            actual.push((
                entry.inputs as *const _ as usize,
                outputs as *const _ as usize,
            ));
        }
        declared.sort_unstable();
        actual.sort_unstable();
        if declared != actual {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "handler set does not match the declared interface",
            ));
        }
        Ok(behavior)
    }
}

/// One `(inputs → outputs)` pair of a typed interface.
#[derive(Clone, Copy)]
pub struct Signature {
    pub inputs: TypeListRef,
    pub outputs: TypeListRef,
}

/// A declared interface: a multiset of signatures.
#[derive(Clone, Default)]
pub struct Protocol {
    sigs: Vec<Signature>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares one `I → O` signature.
    pub fn with<I: MessageArgs, O: MessageArgs>(mut self) -> Result<Self> {
        self.sigs.push(Signature {
            inputs: I::type_list()?,
            outputs: O::type_list()?,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.sigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigs.is_empty()
    }
}
