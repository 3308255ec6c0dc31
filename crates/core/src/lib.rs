//! `lonerp-core`: shared building blocks for the inventory & customs ledger.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, fixed-point quantities and the error taxonomy every ledger
//! component reports through.

pub mod error;
pub mod id;
pub mod quantity;

pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use id::{
    ActorId, BatchNumber, CycleCountId, DocumentRef, GuaranteeAccountId, GuaranteeEntryId, ItemId,
    LocationId, MovementId, Mrn, UomId,
};
pub use quantity::{percent, Quantity, QUANTITY_MAX, QUANTITY_MAX_SCALE};
