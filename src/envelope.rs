//! Mailbox elements: a message plus routing metadata.

use std::fmt;

use crate::actor::WeakActorHandle;
use crate::message::Message;

/// Tags a message as asynchronous, a request, or a response.
///
/// Layout: bit 63 is the response flag, bits 0–62 hold the request number,
/// and the all-zero value marks a plain asynchronous message. Request
/// numbers are allocated monotonically per actor, so a response id always
/// names a prior outgoing request of its receiver.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CorrelationId(u64);

impl CorrelationId {
    const RESPONSE_BIT: u64 = 1 << 63;

    /// A plain asynchronous message.
    pub const ASYNC: CorrelationId = CorrelationId(0);

    /// Tags an outgoing request. `number` must be non-zero and below 2^63.
    pub fn request(number: u64) -> Self {
        debug_assert!(number != 0 && number < Self::RESPONSE_BIT);
        Self(number & !Self::RESPONSE_BIT)
    }

    /// The correlation id of the response to this request.
    pub fn response(self) -> Self {
        Self(self.0 | Self::RESPONSE_BIT)
    }

    pub fn is_async(self) -> bool {
        self.0 == 0
    }

    pub fn is_request(self) -> bool {
        self.0 != 0 && self.0 & Self::RESPONSE_BIT == 0
    }

    pub fn is_response(self) -> bool {
        self.0 & Self::RESPONSE_BIT != 0
    }

    /// The request number, with the response flag masked off.
    pub fn request_number(self) -> u64 {
        self.0 & !Self::RESPONSE_BIT
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_async() {
            write!(f, "async")
        } else if self.is_request() {
            write!(f, "request({})", self.request_number())
        } else {
            write!(f, "response({})", self.request_number())
        }
    }
}

/// Priority class within a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Lane {
    /// Drained strictly before normal messages within one dispatch step.
    Urgent,
    #[default]
    Normal,
}

/// One mailbox element: a message addressed to a single actor.
#[derive(Debug)]
pub struct Envelope {
    /// Weak reference to the sender's control block; `None` for anonymous
    /// sends (from outside any actor).
    pub sender: Option<WeakActorHandle>,
    pub correlation: CorrelationId,
    pub lane: Lane,
    pub content: Message,
}

impl Envelope {
    /// A plain asynchronous message on the normal lane.
    pub fn asynchronous(sender: Option<WeakActorHandle>, content: Message) -> Self {
        Self {
            sender,
            correlation: CorrelationId::ASYNC,
            lane: Lane::Normal,
            content,
        }
    }

    /// An internal delivery on the urgent lane.
    pub(crate) fn urgent(sender: Option<WeakActorHandle>, content: Message) -> Self {
        Self {
            sender,
            correlation: CorrelationId::ASYNC,
            lane: Lane::Urgent,
            content,
        }
    }

    pub(crate) fn request(
        sender: WeakActorHandle,
        number: u64,
        content: Message,
    ) -> Self {
        Self {
            sender: Some(sender),
            correlation: CorrelationId::request(number),
            lane: Lane::Normal,
            content,
        }
    }

    pub(crate) fn response(
        sender: Option<WeakActorHandle>,
        to_request: CorrelationId,
        content: Message,
    ) -> Self {
        Self {
            sender,
            correlation: to_request.response(),
            lane: Lane::Normal,
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_id_is_zero() {
        assert!(CorrelationId::ASYNC.is_async());
        assert!(!CorrelationId::ASYNC.is_request());
        assert!(!CorrelationId::ASYNC.is_response());
    }

    #[test]
    fn request_and_response_share_a_number() {
        let req = CorrelationId::request(42);
        assert!(req.is_request());
        let rsp = req.response();
        assert!(rsp.is_response());
        assert_eq!(req.request_number(), 42);
        assert_eq!(rsp.request_number(), 42);
        assert_ne!(req, rsp);
    }

    #[test]
    fn lanes_order_urgent_first() {
        assert!(Lane::Urgent < Lane::Normal);
    }
}
