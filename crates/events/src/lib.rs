//! Ledger events and the transactional outbox.
//!
//! Every committed unit of work appends its domain events to an outbox in the
//! same critical section that publishes the new ledger state, so consumers
//! never see an event for a write that was not applied (or vice versa).

pub mod envelope;
pub mod event;
pub mod outbox;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use outbox::{InMemoryOutbox, Outbox, OutboxError, Subscription};
