//! Inventory ledger domain module.
//!
//! This crate contains the business rules for stock movements, balances,
//! quality status and cycle counts, implemented purely as deterministic domain
//! logic (no IO, no locking, no storage). Orchestration lives in `lonerp-infra`.

pub mod balance;
pub mod cycle_count;
pub mod movement;
pub mod quality;

pub use balance::{
    BalanceDraft, BalanceFilter, BalanceKey, BalanceMismatch, BalanceStore, InventoryBalance,
};
pub use cycle_count::{CycleCount, CycleCountLine, CycleCountStatus, CycleCountSummary};
pub use movement::{
    AdjustmentKind, BalanceChange, BalanceEffect, InventoryMovement, MovementFilter, MovementKind,
    MovementLine, format_movement_number,
};
pub use quality::{QualityStatus, StatusTransition, validate_transition};
