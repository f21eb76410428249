//! # Mailbox
//!
//! Multi-producer, single-consumer queue with three lanes: urgent, normal,
//! and the skip-stash. Urgent and normal are unbounded flume channels;
//! writers never block each other, and exactly one consumer (the owning
//! actor while it runs) dequeues. The stash holds messages a handler chose
//! to skip; it is consulted again only after a behavior change.
//!
//! The mailbox also carries the atomic message count that the actor's
//! scheduling handshake reads: an actor may only park in `awaiting_message`
//! while the count is observably zero.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::envelope::{Envelope, Lane};

/// Outcome of an enqueue attempt.
#[derive(Debug)]
pub(crate) enum Enqueued {
    /// Stored; the actor already knows it has work.
    Ok,
    /// The mailbox no longer accepts messages.
    Closed(Envelope),
}

// Manual instead of derived: `Envelope` carries a type-erased `Message`
// payload with no defined equality, and nothing compares `Closed(..)`
// envelopes by value — only the `Ok` discriminant is asserted against.
impl PartialEq for Enqueued {
    fn eq(&self, other: &Self) -> bool {
        matches!((self, other), (Enqueued::Ok, Enqueued::Ok))
    }
}

impl Eq for Enqueued {}

/// MPSC mailbox with urgent/normal lanes and a skip-stash.
pub struct Mailbox {
    urgent_tx: flume::Sender<Envelope>,
    urgent_rx: flume::Receiver<Envelope>,
    normal_tx: flume::Sender<Envelope>,
    normal_rx: flume::Receiver<Envelope>,
    stash: Mutex<VecDeque<Envelope>>,
    /// Messages in the urgent and normal lanes; the stash does not count,
    /// stashed messages cannot wake the actor.
    len: AtomicUsize,
    closed: AtomicBool,
}

impl Mailbox {
    pub fn new() -> Self {
        let (urgent_tx, urgent_rx) = flume::unbounded();
        let (normal_tx, normal_rx) = flume::unbounded();
        Self {
            urgent_tx,
            urgent_rx,
            normal_tx,
            normal_rx,
            stash: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues without blocking. Returns the envelope when the mailbox is
    /// closed so the caller can bounce it.
    pub(crate) fn enqueue(&self, env: Envelope) -> Enqueued {
        if self.closed.load(Ordering::Acquire) {
            return Enqueued::Closed(env);
        }
        let tx = match env.lane {
            Lane::Urgent => &self.urgent_tx,
            Lane::Normal => &self.normal_tx,
        };
        // Unbounded channels only fail when all receivers are gone, which
        // cannot happen while the control block is alive.
        if let Err(flume::TrySendError::Disconnected(env)) = tx.try_send(env) {
            return Enqueued::Closed(env);
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        // A close may have raced the send; the closer drains after setting
        // the flag, so the message is either drained there or visible here.
        if self.closed.load(Ordering::Acquire) {
            if let Some(env) = self.try_dequeue() {
                return Enqueued::Closed(env);
            }
        }
        Enqueued::Ok
    }

    /// Dequeues one element, urgent lane first. Single-consumer.
    pub(crate) fn try_dequeue(&self) -> Option<Envelope> {
        let env = self
            .urgent_rx
            .try_recv()
            .or_else(|_| self.normal_rx.try_recv())
            .ok()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(env)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffers a skipped message on the stash lane.
    pub(crate) fn stash(&self, env: Envelope) {
        self.stash.lock().push_back(env);
    }

    /// Removes all stashed messages for re-examination.
    pub(crate) fn take_stash(&self) -> VecDeque<Envelope> {
        std::mem::take(&mut *self.stash.lock())
    }

    pub fn stashed(&self) -> usize {
        self.stash.lock().len()
    }

    /// Closes the mailbox and drains every remaining element (both lanes and
    /// the stash). Returns the drained elements so the caller can account
    /// for them in the bounce counter.
    pub(crate) fn close(&self) -> Vec<Envelope> {
        self.closed.store(true, Ordering::Release);
        let mut drained = Vec::new();
        while let Ok(env) = self.urgent_rx.try_recv() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            drained.push(env);
        }
        while let Ok(env) = self.normal_rx.try_recv() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            drained.push(env);
        }
        drained.extend(self.stash.lock().drain(..));
        drained
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.len())
            .field("stashed", &self.stashed())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Lane;
    use crate::message::Message;
    use crate::test_support;

    fn plain(n: i64) -> Envelope {
        Envelope::asynchronous(None, Message::of(n).unwrap())
    }

    fn urgent(n: i64) -> Envelope {
        let mut env = plain(n);
        env.lane = Lane::Urgent;
        env
    }

    #[test]
    fn fifo_within_a_lane() {
        test_support::boot();
        let mb = Mailbox::new();
        assert_eq!(mb.enqueue(plain(1)), Enqueued::Ok);
        assert_eq!(mb.enqueue(plain(2)), Enqueued::Ok);
        let a = mb.try_dequeue().unwrap();
        let b = mb.try_dequeue().unwrap();
        assert_eq!(a.content.get::<i64>(0), Some(&1));
        assert_eq!(b.content.get::<i64>(0), Some(&2));
        assert!(mb.try_dequeue().is_none());
    }

    #[test]
    fn urgent_lane_drains_first() {
        test_support::boot();
        let mb = Mailbox::new();
        mb.enqueue(plain(1));
        mb.enqueue(urgent(2));
        mb.enqueue(plain(3));
        mb.enqueue(urgent(4));
        let order: Vec<i64> = std::iter::from_fn(|| mb.try_dequeue())
            .map(|env| *env.content.get::<i64>(0).unwrap())
            .collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn close_bounces_everything_exactly_once() {
        test_support::boot();
        let mb = Mailbox::new();
        mb.enqueue(plain(1));
        mb.enqueue(urgent(2));
        mb.stash(plain(3));
        let drained = mb.close();
        assert_eq!(drained.len(), 3);
        assert!(mb.is_empty());
        // Further sends bounce.
        match mb.enqueue(plain(4)) {
            Enqueued::Closed(env) => assert_eq!(env.content.get::<i64>(0), Some(&4)),
            other => panic!("expected bounce, got {other:?}"),
        }
    }

    #[test]
    fn stash_does_not_count_as_pending_work() {
        test_support::boot();
        let mb = Mailbox::new();
        mb.stash(plain(1));
        assert!(mb.is_empty());
        assert_eq!(mb.take_stash().len(), 1);
        assert_eq!(mb.stashed(), 0);
    }
}
