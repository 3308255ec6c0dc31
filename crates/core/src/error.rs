//! Ledger error model.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::id::{GuaranteeAccountId, GuaranteeEntryId, ItemId, LocationId, Mrn};
use crate::quantity::Quantity;

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Coarse classification of a [`LedgerError`].
///
/// Callers branch on the kind, not on the concrete variant: only
/// `ConcurrencyConflict` and `Infrastructure` are worth retrying.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or incomplete command, rejected before any side effect.
    Validation,
    /// A business invariant would be violated; state is unchanged.
    DomainInvariant,
    /// Key locks could not be acquired within the configured attempts.
    ConcurrencyConflict,
    /// Unknown item, location, MRN, account, entry or cycle count.
    NotFound,
    /// The genealogy graph contains a cycle (data-integrity alarm).
    GraphCycle,
    /// Storage-level failure (e.g. a poisoned latch).
    Infrastructure,
}

/// Ledger error.
///
/// Every variant is a deterministic rejection except `ConcurrencyConflict`
/// and `Storage`. A rejected operation never leaves partial state behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient stock for item {item} at {location}: available {available}, requested {requested}")]
    InsufficientStock {
        item: ItemId,
        location: LocationId,
        available: Quantity,
        requested: Quantity,
    },

    #[error("balance of item {item} at {location} cannot go negative (current {current}, decrease {decrease})")]
    NegativeBalance {
        item: ItemId,
        location: LocationId,
        current: Quantity,
        decrease: Quantity,
    },

    #[error("stock of item {item} at {location} has quality status {status} and is not eligible for outbound use")]
    QualityNotEligible {
        item: ItemId,
        location: LocationId,
        status: String,
    },

    #[error("quality status is already {status}")]
    IdempotentChange { status: String },

    #[error("MRN {mrn} exhausted: total {total}, used {used}, requested {requested}")]
    MrnExhausted {
        mrn: Mrn,
        total: Quantity,
        used: Quantity,
        requested: Quantity,
    },

    #[error("MRN {mrn} expired on {expired_on}")]
    MrnExpired { mrn: Mrn, expired_on: NaiveDate },

    #[error("MRN {0} is inactive")]
    MrnInactive(Mrn),

    #[error("MRN {0} is already registered with different values")]
    DuplicateMrn(Mrn),

    #[error("guarantee limit exceeded on account {account}: limit {limit}, balance {balance}, debit {amount}")]
    LimitExceeded {
        account: GuaranteeAccountId,
        limit: Decimal,
        balance: Decimal,
        amount: Decimal,
    },

    #[error("credit of {amount} exceeds outstanding exposure {balance} on account {account}")]
    NegativeExposure {
        account: GuaranteeAccountId,
        balance: Decimal,
        amount: Decimal,
    },

    #[error("guarantee account {0} is inactive")]
    AccountInactive(GuaranteeAccountId),

    #[error("guarantee entry {0} is already released")]
    AlreadyReleased(GuaranteeEntryId),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("genealogy graph contains a cycle through {node}")]
    GraphCycle { node: String },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::InsufficientStock { .. }
            | LedgerError::NegativeBalance { .. }
            | LedgerError::QualityNotEligible { .. }
            | LedgerError::IdempotentChange { .. }
            | LedgerError::MrnExhausted { .. }
            | LedgerError::MrnExpired { .. }
            | LedgerError::MrnInactive(_)
            | LedgerError::DuplicateMrn(_)
            | LedgerError::LimitExceeded { .. }
            | LedgerError::NegativeExposure { .. }
            | LedgerError::AccountInactive(_)
            | LedgerError::AlreadyReleased(_) => ErrorKind::DomainInvariant,
            LedgerError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::GraphCycle { .. } => ErrorKind::GraphCycle,
            LedgerError::Storage(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether the caller may retry the whole operation unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConcurrencyConflict | ErrorKind::Infrastructure
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        let mrn = Mrn::new("MRN-001").unwrap();
        assert_eq!(LedgerError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(
            LedgerError::MrnInactive(mrn.clone()).kind(),
            ErrorKind::DomainInvariant
        );
        assert_eq!(
            LedgerError::not_found("mrn", &mrn).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            LedgerError::GraphCycle { node: "batch B1".into() }.kind(),
            ErrorKind::GraphCycle
        );
    }

    #[test]
    fn only_conflicts_and_storage_are_transient() {
        assert!(LedgerError::conflict("busy").is_transient());
        assert!(LedgerError::storage("latch poisoned").is_transient());
        assert!(!LedgerError::validation("bad").is_transient());
        assert!(!LedgerError::AlreadyReleased(GuaranteeEntryId::new()).is_transient());
    }

    #[test]
    fn not_found_message_names_the_entity() {
        let err = LedgerError::not_found("guarantee account", "GA-1");
        assert_eq!(err.to_string(), "guarantee account not found: GA-1");
    }
}
