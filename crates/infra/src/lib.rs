//! Infrastructure layer: the transactional ledger engine.
//!
//! Domain crates stay pure; this crate adds keyed locking, the unit-of-work
//! commit, the outbox wiring, configuration and journal replay.

pub mod catalog;
pub mod config;
pub mod events;
pub mod ledger;
pub mod locks;
pub mod replay;


pub use catalog::{InMemoryCatalog, OpenCatalog, ReferenceCatalog};
pub use config::{BackoffStrategy, LedgerConfig, RetryPolicy};
pub use events::LedgerEvent;
pub use ledger::{InventoryLedger, ProductionRun, StatusChangeRequest, TracedNode};
pub use locks::{KeyGuard, KeyLocks, LockKey};
