//! Quality status of stock and its transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lonerp_core::{ActorId, LedgerError, LedgerResult, Quantity};

use crate::balance::BalanceKey;

/// Quality flag gating outbound eligibility of a balance.
///
/// There is no fixed transition graph: any status may move to any other.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    #[default]
    Ok,
    Blocked,
    Quarantine,
}

impl QualityStatus {
    pub const ALL: [QualityStatus; 3] = [
        QualityStatus::Ok,
        QualityStatus::Blocked,
        QualityStatus::Quarantine,
    ];

    /// Integer code used by the legacy schema and reports.
    pub fn code(self) -> u8 {
        match self {
            QualityStatus::Ok => 1,
            QualityStatus::Blocked => 2,
            QualityStatus::Quarantine => 3,
        }
    }

    pub fn from_code(code: u8) -> LedgerResult<Self> {
        match code {
            1 => Ok(QualityStatus::Ok),
            2 => Ok(QualityStatus::Blocked),
            3 => Ok(QualityStatus::Quarantine),
            other => Err(LedgerError::validation(format!(
                "unknown quality status code {other}"
            ))),
        }
    }

    /// Human-readable label for reporting.
    pub fn label(self) -> &'static str {
        match self {
            QualityStatus::Ok => "OK (Available)",
            QualityStatus::Blocked => "Blocked (Cannot Issue)",
            QualityStatus::Quarantine => "Quarantine (Under Review)",
        }
    }

    /// Only OK stock may be shipped or issued to production.
    pub fn is_outbound_eligible(self) -> bool {
        matches!(self, QualityStatus::Ok)
    }
}

impl TryFrom<u8> for QualityStatus {
    type Error = LedgerError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

impl core::fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            QualityStatus::Ok => "OK",
            QualityStatus::Blocked => "Blocked",
            QualityStatus::Quarantine => "Quarantine",
        })
    }
}

/// Audit record of one quality status change (immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Source balance key (carries the `from` status).
    pub key: BalanceKey,
    pub from: QualityStatus,
    pub to: QualityStatus,
    pub quantity: Quantity,
    pub reason: String,
    pub actor: ActorId,
    pub at: DateTime<Utc>,
    /// Number of the `StatusChange` movement that carried the quantity.
    pub movement_number: u64,
}

/// Check a requested transition before anything is staged.
pub fn validate_transition(
    current: QualityStatus,
    target: QualityStatus,
    reason: &str,
) -> LedgerResult<()> {
    if reason.trim().is_empty() {
        return Err(LedgerError::validation(
            "reason is required for a quality status change",
        ));
    }
    if current == target {
        return Err(LedgerError::IdempotentChange {
            status: target.to_string(),
        });
    }
    Ok(())
}
