//! Cycle counts: snapshot-based physical count reconciliation.
//!
//! ```text
//! Setup ──► Counting ──► Review ──► Completed
//!   └──────────┴───────────┴──────► Cancelled
//! ```
//!
//! The baseline is frozen when counting starts. Variances are computed against
//! that baseline only, never against live balances, so stock that moves
//! between the snapshot and completion is not silently absorbed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lonerp_core::{
    CycleCountId, DocumentRef, LedgerError, LedgerResult, LocationId, Quantity, UomId, percent,
};

use crate::balance::{BalanceKey, InventoryBalance};
use crate::movement::MovementLine;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleCountStatus {
    Setup,
    Counting,
    Review,
    Completed,
    Cancelled,
}

impl core::fmt::Display for CycleCountStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            CycleCountStatus::Setup => "Setup",
            CycleCountStatus::Counting => "Counting",
            CycleCountStatus::Review => "Review",
            CycleCountStatus::Completed => "Completed",
            CycleCountStatus::Cancelled => "Cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCountLine {
    pub key: BalanceKey,
    pub uom_id: UomId,
    /// System quantity at snapshot time (zero for found lines).
    pub baseline: Quantity,
    pub counted: Option<Quantity>,
    /// Stock found during counting that the snapshot did not list.
    pub found: bool,
}

impl CycleCountLine {
    /// `counted - baseline`, once counted.
    pub fn variance(&self) -> Option<Quantity> {
        self.counted.map(|c| c - self.baseline)
    }
}

/// Accuracy report of one count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCountSummary {
    pub lines: usize,
    pub counted_lines: usize,
    pub accurate_lines: usize,
    pub positive_variance_lines: usize,
    pub negative_variance_lines: usize,
    /// Accurate lines over counted lines, in percent (two decimals).
    pub accuracy_percent: Decimal,
    pub total_abs_variance: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCount {
    pub id: CycleCountId,
    pub location_id: LocationId,
    pub status: CycleCountStatus,
    pub lines: Vec<CycleCountLine>,
    pub created_at: DateTime<Utc>,
    pub snapshot_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl CycleCount {
    pub fn new(location_id: LocationId, at: DateTime<Utc>) -> Self {
        Self {
            id: CycleCountId::new(),
            location_id,
            status: CycleCountStatus::Setup,
            lines: Vec::new(),
            created_at: at,
            snapshot_at: None,
            closed_at: None,
        }
    }

    pub fn reference(&self) -> DocumentRef {
        DocumentRef::new("cycle_count", *self.id.as_uuid())
    }

    fn require(&self, expected: CycleCountStatus, action: &str) -> LedgerResult<()> {
        if self.status != expected {
            return Err(LedgerError::validation(format!(
                "cannot {action} a cycle count in {} state (requires {expected})",
                self.status
            )));
        }
        Ok(())
    }

    /// Freeze the baseline from `snapshot` and start counting.
    ///
    /// Rows outside the count's location or without stock are ignored.
    pub fn start_counting(
        &mut self,
        snapshot: Vec<InventoryBalance>,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.require(CycleCountStatus::Setup, "start")?;

        let mut lines: Vec<CycleCountLine> = snapshot
            .into_iter()
            .filter(|b| b.key.location_id == self.location_id && b.quantity.is_positive())
            .map(|b| CycleCountLine {
                key: b.key,
                uom_id: b.uom_id,
                baseline: b.quantity,
                counted: None,
                found: false,
            })
            .collect();
        lines.sort_by(|a, b| a.key.cmp(&b.key));

        self.lines = lines;
        self.snapshot_at = Some(at);
        self.status = CycleCountStatus::Counting;
        Ok(())
    }

    pub fn line(&self, key: &BalanceKey) -> Option<&CycleCountLine> {
        self.lines.iter().find(|l| &l.key == key)
    }

    /// Record (or re-record) the physical quantity for a snapshot line.
    pub fn record_count(&mut self, key: &BalanceKey, counted: Quantity) -> LedgerResult<()> {
        self.require(CycleCountStatus::Counting, "record a count on")?;
        if counted.is_negative() {
            return Err(LedgerError::validation("counted quantity cannot be negative"));
        }
        let line = self
            .lines
            .iter_mut()
            .find(|l| &l.key == key)
            .ok_or_else(|| LedgerError::not_found("cycle count line", key))?;
        line.counted = Some(counted);
        Ok(())
    }

    /// Add a line for stock the snapshot did not list (baseline zero).
    pub fn add_found_line(
        &mut self,
        key: BalanceKey,
        uom_id: UomId,
        counted: Quantity,
    ) -> LedgerResult<()> {
        self.require(CycleCountStatus::Counting, "add a line to")?;
        if key.location_id != self.location_id {
            return Err(LedgerError::validation(format!(
                "found line location {} is not the counted location {}",
                key.location_id, self.location_id
            )));
        }
        if counted.is_negative() {
            return Err(LedgerError::validation("counted quantity cannot be negative"));
        }
        if self.line(&key).is_some() {
            return Err(LedgerError::validation(format!(
                "cycle count already has a line for {key}"
            )));
        }
        self.lines.push(CycleCountLine {
            key,
            uom_id,
            baseline: Quantity::ZERO,
            counted: Some(counted),
            found: true,
        });
        Ok(())
    }

    pub fn submit_for_review(&mut self) -> LedgerResult<()> {
        self.require(CycleCountStatus::Counting, "submit")?;
        let uncounted = self.lines.iter().filter(|l| l.counted.is_none()).count();
        if uncounted > 0 {
            return Err(LedgerError::validation(format!(
                "{uncounted} cycle count line(s) have not been counted"
            )));
        }
        self.status = CycleCountStatus::Review;
        Ok(())
    }

    /// One variance line per counted line whose count differs from its baseline.
    pub fn variance_lines(&self, at: DateTime<Utc>) -> LedgerResult<Vec<MovementLine>> {
        self.require(CycleCountStatus::Review, "complete")?;
        let reference = self.reference();

        Ok(self
            .lines
            .iter()
            .filter_map(|line| {
                let delta = line.variance()?;
                if delta.is_zero() {
                    return None;
                }
                let mut movement = MovementLine::cycle_count_variance(
                    line.key.item_id,
                    line.key.location_id,
                    delta,
                    line.uom_id,
                    at,
                )
                .with_quality(line.key.quality)
                .with_reference(reference.clone());
                movement.batch = line.key.batch.clone();
                movement.mrn = line.key.mrn.clone();
                Some(movement)
            })
            .collect())
    }

    /// Close the count once its variance lines have been applied.
    pub fn complete(&mut self, at: DateTime<Utc>) -> LedgerResult<()> {
        self.require(CycleCountStatus::Review, "complete")?;
        self.status = CycleCountStatus::Completed;
        self.closed_at = Some(at);
        Ok(())
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> LedgerResult<()> {
        match self.status {
            CycleCountStatus::Setup | CycleCountStatus::Counting | CycleCountStatus::Review => {
                self.status = CycleCountStatus::Cancelled;
                self.closed_at = Some(at);
                Ok(())
            }
            other => Err(LedgerError::validation(format!(
                "cannot cancel a cycle count in {other} state"
            ))),
        }
    }

    pub fn summary(&self) -> CycleCountSummary {
        let variances: Vec<Quantity> = self.lines.iter().filter_map(|l| l.variance()).collect();
        let accurate = variances.iter().filter(|v| v.is_zero()).count();

        CycleCountSummary {
            lines: self.lines.len(),
            counted_lines: variances.len(),
            accurate_lines: accurate,
            positive_variance_lines: variances.iter().filter(|v| v.is_positive()).count(),
            negative_variance_lines: variances.iter().filter(|v| v.is_negative()).count(),
            accuracy_percent: percent(Decimal::from(accurate), Decimal::from(variances.len())),
            total_abs_variance: variances.iter().map(|v| v.abs()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{AdjustmentKind, MovementKind};
    use crate::quality::QualityStatus;
    use lonerp_core::ItemId;
    use rust_decimal_macros::dec;

    fn balance(key: BalanceKey, n: i64) -> InventoryBalance {
        InventoryBalance {
            key,
            quantity: Quantity::units(n),
            uom_id: UomId::new(),
            expiry_date: None,
            last_movement_at: Utc::now(),
        }
    }

    fn counting(location: LocationId, rows: Vec<InventoryBalance>) -> CycleCount {
        let mut count = CycleCount::new(location, Utc::now());
        count.start_counting(rows, Utc::now()).unwrap();
        count
    }

    #[test]
    fn snapshot_skips_empty_rows_and_other_locations() {
        let loc = LocationId::new();
        let item = ItemId::new();
        let count = counting(
            loc,
            vec![
                balance(BalanceKey::new(item, loc), 100),
                balance(BalanceKey::new(item, loc).with_quality(QualityStatus::Blocked), 0),
                balance(BalanceKey::new(item, LocationId::new()), 5),
            ],
        );
        assert_eq!(count.lines.len(), 1);
        assert_eq!(count.lines[0].baseline, Quantity::units(100));
    }

    #[test]
    fn variance_is_computed_from_frozen_baseline() {
        let loc = LocationId::new();
        let key = BalanceKey::new(ItemId::new(), loc);
        let mut count = counting(loc, vec![balance(key.clone(), 100)]);

        count.record_count(&key, Quantity::units(92)).unwrap();
        count.submit_for_review().unwrap();

        let lines = count.variance_lines(Utc::now()).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].kind, MovementKind::CycleCountVariance);
        assert_eq!(lines[0].adjustment, Some(AdjustmentKind::Decrease));
        assert_eq!(lines[0].quantity, Quantity::units(8));
        assert_eq!(lines[0].reference, Some(count.reference()));
        assert!(lines[0].validate().is_ok());

        count.complete(Utc::now()).unwrap();
        assert_eq!(count.status, CycleCountStatus::Completed);
    }

    #[test]
    fn accurate_lines_emit_nothing() {
        let loc = LocationId::new();
        let key = BalanceKey::new(ItemId::new(), loc);
        let mut count = counting(loc, vec![balance(key.clone(), 10)]);
        count.record_count(&key, Quantity::units(10)).unwrap();
        count.submit_for_review().unwrap();
        assert!(count.variance_lines(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn submit_requires_every_line_counted() {
        let loc = LocationId::new();
        let item = ItemId::new();
        let first = BalanceKey::new(item, loc);
        let mut count = counting(
            loc,
            vec![
                balance(first.clone(), 10),
                balance(BalanceKey::new(item, loc).with_quality(QualityStatus::Quarantine), 4),
            ],
        );
        count.record_count(&first, Quantity::units(10)).unwrap();
        assert!(matches!(count.submit_for_review(), Err(LedgerError::Validation(_))));
        assert_eq!(count.status, CycleCountStatus::Counting);
    }

    #[test]
    fn found_lines_start_from_zero_baseline() {
        let loc = LocationId::new();
        let mut count = counting(loc, vec![]);
        let key = BalanceKey::new(ItemId::new(), loc);
        count
            .add_found_line(key.clone(), UomId::new(), Quantity::units(3))
            .unwrap();
        assert!(
            count
                .add_found_line(key, UomId::new(), Quantity::units(1))
                .is_err()
        );
        count.submit_for_review().unwrap();

        let lines = count.variance_lines(Utc::now()).unwrap();
        assert_eq!(lines[0].adjustment, Some(AdjustmentKind::Increase));
        assert_eq!(lines[0].quantity, Quantity::units(3));
    }

    #[test]
    fn out_of_order_transitions_name_the_state() {
        let mut count = CycleCount::new(LocationId::new(), Utc::now());
        let err = count.submit_for_review().unwrap_err();
        assert!(err.to_string().contains("Setup"));
        assert!(count.variance_lines(Utc::now()).is_err());

        count.cancel(Utc::now()).unwrap();
        assert!(count.cancel(Utc::now()).is_err());
        assert!(count.start_counting(vec![], Utc::now()).is_err());
    }

    #[test]
    fn summary_reports_accuracy() {
        let loc = LocationId::new();
        let item = ItemId::new();
        let keys: Vec<BalanceKey> = ["A", "B", "C", "D"]
            .iter()
            .map(|b| BalanceKey::new(item, loc).with_batch(b.parse().unwrap()))
            .collect();
        let mut count = counting(loc, keys.iter().map(|k| balance(k.clone(), 10)).collect());

        count.record_count(&keys[0], Quantity::units(10)).unwrap();
        count.record_count(&keys[1], Quantity::units(10)).unwrap();
        count.record_count(&keys[2], Quantity::units(12)).unwrap();
        count
            .record_count(&keys[3], Quantity::new(dec!(9.5)).unwrap())
            .unwrap();

        let summary = count.summary();
        assert_eq!(summary.lines, 4);
        assert_eq!(summary.accurate_lines, 2);
        assert_eq!(summary.positive_variance_lines, 1);
        assert_eq!(summary.negative_variance_lines, 1);
        assert_eq!(summary.accuracy_percent, dec!(50));
        assert_eq!(summary.total_abs_variance, Quantity::new(dec!(2.5)).unwrap());
    }
}
