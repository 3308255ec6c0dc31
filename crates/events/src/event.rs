use chrono::{DateTime, Utc};

/// A ledger event.
///
/// Events are:
/// - **immutable** (facts about a committed unit of work)
/// - **versioned** (schema evolution)
/// - **keyed** by the subject they describe, so consumers can partition work
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "movement.recorded").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the underlying business fact occurred.
    fn occurred_at(&self) -> DateTime<Utc>;

    /// What the event is about (item, MRN, guarantee account, ...).
    fn subject(&self) -> String;
}
