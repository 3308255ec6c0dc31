//! Sequenced outbox with channel fan-out.
//!
//! The outbox is the durable hand-off point between the ledger and its
//! consumers (reporting, customs integrations, notifications):
//!
//! ```text
//! unit of work ─┬─ movements / balances / MRN / trace (ledger state)
//!               └─ events ──► Outbox (append, same critical section)
//!                                ├─► subscribers (live channels)
//!                                └─► read_after(cursor) (catch-up / replay)
//! ```
//!
//! Delivery to live subscribers is best-effort; a consumer that falls behind
//! or restarts catches up with `read_after` using the last sequence it saw.
//!
//! Entries are retained until a consumer acknowledges them with
//! `prune_through`; sequence numbers keep counting across pruning.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::envelope::EventEnvelope;
use crate::event::Event;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// The entries after `cursor` were already pruned.
    #[error("outbox cursor {cursor} is behind the oldest retained entry {oldest}")]
    CursorPruned { cursor: u64, oldest: u64 },
}

/// A live subscription to outbox appends.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Append-only, sequenced event outbox.
pub trait Outbox<E: Event>: Send + Sync {
    /// Append events in order, assigning consecutive sequence numbers.
    fn append(&self, events: Vec<E>) -> Result<Vec<EventEnvelope<E>>, OutboxError>;

    /// Entries with `sequence > cursor`, oldest first, at most `limit`.
    fn read_after(&self, cursor: u64, limit: usize) -> Result<Vec<EventEnvelope<E>>, OutboxError>;

    /// Sequence of the most recent entry (0 when nothing was ever appended).
    fn last_sequence(&self) -> u64;

    /// Drop entries with `sequence <= cursor`. Returns how many were removed.
    fn prune_through(&self, cursor: u64) -> Result<usize, OutboxError>;

    /// Receive every entry appended after this call.
    fn subscribe(&self) -> Subscription<EventEnvelope<E>>;
}

impl<E, O> Outbox<E> for Arc<O>
where
    E: Event,
    O: Outbox<E> + ?Sized,
{
    fn append(&self, events: Vec<E>) -> Result<Vec<EventEnvelope<E>>, OutboxError> {
        (**self).append(events)
    }

    fn read_after(&self, cursor: u64, limit: usize) -> Result<Vec<EventEnvelope<E>>, OutboxError> {
        (**self).read_after(cursor, limit)
    }

    fn last_sequence(&self) -> u64 {
        (**self).last_sequence()
    }

    fn prune_through(&self, cursor: u64) -> Result<usize, OutboxError> {
        (**self).prune_through(cursor)
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<E>> {
        (**self).subscribe()
    }
}

#[derive(Debug)]
struct OutboxInner<E> {
    entries: Vec<EventEnvelope<E>>,
    /// Sequence of the last pruned entry; `entries[0]` is `pruned + 1`.
    pruned: u64,
    subscribers: Vec<Sender<EventEnvelope<E>>>,
}

impl<E> OutboxInner<E> {
    fn last_sequence(&self) -> u64 {
        self.pruned + self.entries.len() as u64
    }
}

/// In-memory outbox for tests/dev and single-process deployments.
#[derive(Debug)]
pub struct InMemoryOutbox<E> {
    inner: Mutex<OutboxInner<E>>,
}

impl<E> InMemoryOutbox<E> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(OutboxInner {
                entries: Vec::with_capacity(capacity),
                pruned: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Every critical section leaves `inner` consistent, so a panic elsewhere
    /// while holding the lock does not invalidate it.
    fn lock(&self) -> MutexGuard<'_, OutboxInner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of entries currently retained.
    pub fn retained(&self) -> usize {
        self.lock().entries.len()
    }
}

impl<E: Event> InMemoryOutbox<E> {
    /// Infallible form of [`Outbox::append`], for callers that append while
    /// holding their own commit latch.
    pub fn publish(&self, events: Vec<E>) -> Vec<EventEnvelope<E>> {
        if events.is_empty() {
            return vec![];
        }

        let mut inner = self.lock();
        let mut next = inner.last_sequence() + 1;

        let mut sealed = Vec::with_capacity(events.len());
        for event in events {
            sealed.push(EventEnvelope::seal(next, event));
            next += 1;
        }
        inner.entries.extend(sealed.iter().cloned());

        // Drop subscribers whose receiving end is gone.
        inner.subscribers.retain(|tx| {
            sealed
                .iter()
                .all(|envelope| tx.send(envelope.clone()).is_ok())
        });

        tracing::trace!(
            appended = sealed.len(),
            last_sequence = next - 1,
            "outbox append"
        );
        sealed
    }
}

impl<E> Default for InMemoryOutbox<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Outbox<E> for InMemoryOutbox<E> {
    fn append(&self, events: Vec<E>) -> Result<Vec<EventEnvelope<E>>, OutboxError> {
        Ok(self.publish(events))
    }

    fn read_after(&self, cursor: u64, limit: usize) -> Result<Vec<EventEnvelope<E>>, OutboxError> {
        let inner = self.lock();
        if cursor < inner.pruned {
            return Err(OutboxError::CursorPruned {
                cursor,
                oldest: inner.pruned + 1,
            });
        }
        // Sequences are gap-free, so `cursor - pruned` is an index.
        let start = usize::try_from(cursor - inner.pruned)
            .unwrap_or(usize::MAX)
            .min(inner.entries.len());
        Ok(inner.entries[start..].iter().take(limit).cloned().collect())
    }

    fn last_sequence(&self) -> u64 {
        self.lock().last_sequence()
    }

    fn prune_through(&self, cursor: u64) -> Result<usize, OutboxError> {
        let mut inner = self.lock();
        let through = cursor.min(inner.last_sequence());
        if through <= inner.pruned {
            return Ok(0);
        }
        let count = usize::try_from(through - inner.pruned)
            .unwrap_or(usize::MAX)
            .min(inner.entries.len());
        inner.entries.drain(..count);
        inner.pruned = through;
        tracing::debug!(pruned = count, through, "outbox pruned");
        Ok(count)
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<E>> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        Subscription::new(rx)
    }
}
