//! # Request/response
//!
//! Outgoing requests allocate a monotonically increasing id per actor and
//! park their continuations in the request table. The matching response,
//! or the timeout error the clock delivers under the same correlation id,
//! removes the entry exactly once and resumes the stored continuation on
//! the actor's own thread.

use std::collections::HashMap;

use tracing::warn;

use crate::actor::ActorContext;
use crate::clock::CancelToken;
use crate::error::Error;
use crate::message::{Message, MessageArgs};
use crate::registry::TypeListRef;

pub(crate) type OkContinuation = Box<dyn FnOnce(&mut ActorContext<'_>, Message) + Send>;
pub(crate) type ErrContinuation = Box<dyn FnOnce(&mut ActorContext<'_>, Error) + Send>;

/// One outstanding request of an actor.
pub(crate) struct PendingRequest {
    pub(crate) on_ok: OkContinuation,
    pub(crate) on_err: ErrContinuation,
    /// Declared reply signature of the typed variant; `None` accepts any
    /// non-error response.
    pub(crate) expected: Option<TypeListRef>,
    pub(crate) timeout: CancelToken,
}

/// Per-actor table of outstanding requests.
pub(crate) struct RequestTable {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocates the next request number. Ids are monotonic per actor and
    /// never reused.
    pub(crate) fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, id: u64, request: PendingRequest) {
        let prev = self.pending.insert(id, request);
        debug_assert!(prev.is_none(), "request id reused");
    }

    /// Removes an entry; each id resolves at most once.
    pub(crate) fn remove(&mut self, id: u64) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingRequest> {
        self.pending.drain().map(|(_, req)| req).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Continuation hook returned by [`ActorContext::request`].
///
/// Dropping it without installing a continuation leaves the response to the
/// unmatched-response counter.
#[must_use = "call then() or expect_reply() to receive the response"]
pub struct Awaited<'a, 'b> {
    pub(crate) ctx: &'a mut ActorContext<'b>,
    pub(crate) id: u64,
    pub(crate) timeout: CancelToken,
    /// Set when the request could not even be sent; `then` short-circuits
    /// into the error continuation.
    pub(crate) send_error: Option<Error>,
}

impl<'a, 'b> Awaited<'a, 'b> {
    /// The allocated request number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Installs the success and error continuations.
    pub fn then<OnOk, OnErr>(self, on_ok: OnOk, on_err: OnErr)
    where
        OnOk: FnOnce(&mut ActorContext<'_>, Message) + Send + 'static,
        OnErr: FnOnce(&mut ActorContext<'_>, Error) + Send + 'static,
    {
        self.install(Box::new(on_ok), Box::new(on_err), None);
    }

    /// Typed variant: the dispatcher verifies the response's type list
    /// against `R` before invoking `on_ok`; a mismatch reports
    /// `unexpected_response` through `on_err`.
    pub fn expect_reply<R, OnOk, OnErr>(self, on_ok: OnOk, on_err: OnErr)
    where
        R: MessageArgs,
        OnOk: FnOnce(&mut ActorContext<'_>, R) + Send + 'static,
        OnErr: FnOnce(&mut ActorContext<'_>, Error) + Send + 'static,
    {
        let expected = match R::type_list() {
            Ok(list) => list,
            Err(err) => {
                self.timeout.cancel();
                on_err(self.ctx, err);
                return;
            }
        };
        let wrapped: OkContinuation = Box::new(move |ctx, msg| match R::from_message(msg) {
            Ok(args) => on_ok(ctx, args),
            // The dispatcher verified the signature; only an unregistered
            // type raced here, which cannot happen after install().
            Err(err) => warn!(%err, "typed reply extraction failed"),
        });
        self.install(wrapped, Box::new(on_err), Some(expected));
    }

    fn install(self, on_ok: OkContinuation, on_err: ErrContinuation, expected: Option<TypeListRef>) {
        if let Some(err) = self.send_error {
            self.timeout.cancel();
            on_err(self.ctx, err);
            return;
        }
        self.ctx.body.requests.insert(
            self.id,
            PendingRequest {
                on_ok,
                on_err,
                expected,
                timeout: self.timeout,
            },
        );
    }
}
