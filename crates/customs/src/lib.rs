//! Customs domain module.
//!
//! Two independent ledgers driven by customs events:
//! - the MRN registry, which caps how much of an imported lot may be consumed
//! - the guarantee ledger, which tracks bank-guarantee exposure against a limit
//!
//! Both are pure state machines; locking and atomicity live in `lonerp-infra`.

pub mod guarantee;
pub mod mrn;

pub use guarantee::{
    EntryType, GuaranteeAccount, GuaranteeExposure, GuaranteeLedger, GuaranteeLedgerEntry,
    GuaranteePosting,
};
pub use mrn::{MrnRegistry, MrnRegistryEntry, MrnUtilization};
