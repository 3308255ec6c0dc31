//! Stock movements: the append-only journal entries that balances derive from.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use lonerp_core::{
    BatchNumber, DocumentRef, ItemId, LedgerError, LedgerResult, LocationId, MovementId, Mrn,
    Quantity, QUANTITY_MAX, UomId,
};

use crate::balance::BalanceKey;
use crate::quality::QualityStatus;

/// Kind of stock movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Receipt,
    Shipment,
    Transfer,
    Adjustment,
    ProductionIssue,
    ProductionReceipt,
    CycleCountVariance,
    /// Customer return (inbound).
    Return,
    /// Quality re-classification of stock in place.
    StatusChange,
}

impl MovementKind {
    /// Integer code used by the legacy schema and reports.
    pub fn code(self) -> u8 {
        match self {
            MovementKind::Receipt => 1,
            MovementKind::Transfer => 3,
            MovementKind::Adjustment => 4,
            MovementKind::ProductionReceipt => 5,
            MovementKind::ProductionIssue => 6,
            MovementKind::Shipment => 7,
            MovementKind::Return => 8,
            MovementKind::CycleCountVariance => 9,
            MovementKind::StatusChange => 10,
        }
    }

    /// Legacy code 2 ("Issue") reads as a shipment.
    pub fn from_code(code: u8) -> LedgerResult<Self> {
        match code {
            1 => Ok(MovementKind::Receipt),
            2 | 7 => Ok(MovementKind::Shipment),
            3 => Ok(MovementKind::Transfer),
            4 => Ok(MovementKind::Adjustment),
            5 => Ok(MovementKind::ProductionReceipt),
            6 => Ok(MovementKind::ProductionIssue),
            8 => Ok(MovementKind::Return),
            9 => Ok(MovementKind::CycleCountVariance),
            10 => Ok(MovementKind::StatusChange),
            other => Err(LedgerError::validation(format!(
                "unknown movement type code {other}"
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MovementKind::Receipt => "Receipt",
            MovementKind::Shipment => "Shipment",
            MovementKind::Transfer => "Transfer",
            MovementKind::Adjustment => "Adjustment",
            MovementKind::ProductionIssue => "Production Issue",
            MovementKind::ProductionReceipt => "Production Receipt",
            MovementKind::CycleCountVariance => "Cycle Count Variance",
            MovementKind::Return => "Return",
            MovementKind::StatusChange => "Quality Status Change",
        }
    }

    /// Stock leaving the warehouse: requires OK quality and consumes MRN quantity.
    pub fn is_outbound(self) -> bool {
        matches!(self, MovementKind::Shipment | MovementKind::ProductionIssue)
    }

    fn is_inbound(self) -> bool {
        matches!(
            self,
            MovementKind::Receipt | MovementKind::ProductionReceipt | MovementKind::Return
        )
    }

    fn is_adjusting(self) -> bool {
        matches!(
            self,
            MovementKind::Adjustment | MovementKind::CycleCountVariance
        )
    }
}

impl core::fmt::Display for MovementKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

/// Direction of an adjustment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    Increase,
    Decrease,
    /// Overwrite the balance with the movement quantity.
    Set,
}

/// What a movement does to one balance row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BalanceChange {
    Increase(Quantity),
    /// Outbound/transfer withdrawal; shortfall is `InsufficientStock`.
    Withdraw(Quantity),
    /// Adjustment decrease; shortfall is `NegativeBalance`.
    Decrease(Quantity),
    Set(Quantity),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEffect {
    pub key: BalanceKey,
    pub change: BalanceChange,
}

/// A movement command, validated and applied as one journal line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementLine {
    pub kind: MovementKind,
    pub item_id: ItemId,
    pub batch: Option<BatchNumber>,
    pub mrn: Option<Mrn>,
    pub from_location: Option<LocationId>,
    pub to_location: Option<LocationId>,
    pub quantity: Quantity,
    pub uom_id: UomId,
    /// Status of the balance the movement touches (source for status changes).
    pub quality: QualityStatus,
    pub target_quality: Option<QualityStatus>,
    pub adjustment: Option<AdjustmentKind>,
    pub expiry_date: Option<NaiveDate>,
    pub reference: Option<DocumentRef>,
    pub notes: Option<String>,
    /// Consume the MRN even if it is past its expiry date (never bypasses the ceiling).
    #[serde(default)]
    pub override_mrn_expiry: bool,
    pub occurred_at: DateTime<Utc>,
}

impl MovementLine {
    fn base(
        kind: MovementKind,
        item_id: ItemId,
        quantity: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            item_id,
            batch: None,
            mrn: None,
            from_location: None,
            to_location: None,
            quantity,
            uom_id,
            quality: QualityStatus::Ok,
            target_quality: None,
            adjustment: None,
            expiry_date: None,
            reference: None,
            notes: None,
            override_mrn_expiry: false,
            occurred_at,
        }
    }

    pub fn receipt(
        item_id: ItemId,
        to: LocationId,
        quantity: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut line = Self::base(MovementKind::Receipt, item_id, quantity, uom_id, occurred_at);
        line.to_location = Some(to);
        line
    }

    pub fn customer_return(
        item_id: ItemId,
        to: LocationId,
        quantity: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut line = Self::base(MovementKind::Return, item_id, quantity, uom_id, occurred_at);
        line.to_location = Some(to);
        line
    }

    pub fn shipment(
        item_id: ItemId,
        from: LocationId,
        quantity: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut line = Self::base(MovementKind::Shipment, item_id, quantity, uom_id, occurred_at);
        line.from_location = Some(from);
        line
    }

    pub fn transfer(
        item_id: ItemId,
        from: LocationId,
        to: LocationId,
        quantity: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut line = Self::base(MovementKind::Transfer, item_id, quantity, uom_id, occurred_at);
        line.from_location = Some(from);
        line.to_location = Some(to);
        line
    }

    pub fn production_issue(
        item_id: ItemId,
        from: LocationId,
        quantity: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut line = Self::base(
            MovementKind::ProductionIssue,
            item_id,
            quantity,
            uom_id,
            occurred_at,
        );
        line.from_location = Some(from);
        line
    }

    pub fn production_receipt(
        item_id: ItemId,
        to: LocationId,
        quantity: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut line = Self::base(
            MovementKind::ProductionReceipt,
            item_id,
            quantity,
            uom_id,
            occurred_at,
        );
        line.to_location = Some(to);
        line
    }

    /// Increase/Set adjust into `location` (To); Decrease adjusts out of it (From).
    pub fn adjustment(
        item_id: ItemId,
        location: LocationId,
        kind: AdjustmentKind,
        quantity: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut line = Self::base(MovementKind::Adjustment, item_id, quantity, uom_id, occurred_at);
        line.adjustment = Some(kind);
        match kind {
            AdjustmentKind::Decrease => line.from_location = Some(location),
            AdjustmentKind::Increase | AdjustmentKind::Set => line.to_location = Some(location),
        }
        line
    }

    /// Variance `delta = counted - baseline` as an Increase or Decrease of `|delta|`.
    pub fn cycle_count_variance(
        item_id: ItemId,
        location: LocationId,
        delta: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let kind = if delta.is_negative() {
            AdjustmentKind::Decrease
        } else {
            AdjustmentKind::Increase
        };
        let mut line = Self::adjustment(item_id, location, kind, delta.abs(), uom_id, occurred_at);
        line.kind = MovementKind::CycleCountVariance;
        line
    }

    pub fn status_change(
        item_id: ItemId,
        location: LocationId,
        from: QualityStatus,
        to: QualityStatus,
        quantity: Quantity,
        uom_id: UomId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut line = Self::base(MovementKind::StatusChange, item_id, quantity, uom_id, occurred_at);
        line.from_location = Some(location);
        line.quality = from;
        line.target_quality = Some(to);
        line
    }

    pub fn with_batch(mut self, batch: BatchNumber) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn with_mrn(mut self, mrn: Mrn) -> Self {
        self.mrn = Some(mrn);
        self
    }

    pub fn with_quality(mut self, quality: QualityStatus) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_expiry(mut self, expiry: NaiveDate) -> Self {
        self.expiry_date = Some(expiry);
        self
    }

    pub fn with_reference(mut self, reference: DocumentRef) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn overriding_mrn_expiry(mut self) -> Self {
        self.override_mrn_expiry = true;
        self
    }

    /// Reject malformed or incomplete lines before any side effect.
    pub fn validate(&self) -> LedgerResult<()> {
        let (needs_from, needs_to) = self.required_locations()?;
        check_location("from", self.from_location, needs_from, self.kind)?;
        check_location("to", self.to_location, needs_to, self.kind)?;

        if self.kind == MovementKind::Transfer && self.from_location == self.to_location {
            return Err(LedgerError::validation(
                "transfer source and target location must differ",
            ));
        }

        if self.quantity.is_negative() {
            return Err(LedgerError::validation("quantity cannot be negative"));
        }
        if !self.quantity.is_within_bounds() {
            return Err(LedgerError::validation(format!(
                "quantity {} exceeds the maximum of {QUANTITY_MAX}",
                self.quantity
            )));
        }
        let allows_zero = self.adjustment == Some(AdjustmentKind::Set);
        if self.quantity.is_zero() && !allows_zero {
            return Err(LedgerError::validation(format!(
                "{} quantity must be positive",
                self.kind.label()
            )));
        }

        match (self.kind, self.target_quality) {
            (MovementKind::StatusChange, None) => {
                return Err(LedgerError::validation(
                    "status change requires a target quality status",
                ));
            }
            (MovementKind::StatusChange, Some(target)) if target == self.quality => {
                return Err(LedgerError::IdempotentChange {
                    status: target.to_string(),
                });
            }
            (MovementKind::StatusChange, Some(_)) | (_, None) => {}
            (_, Some(_)) => {
                return Err(LedgerError::validation(
                    "only status changes carry a target quality status",
                ));
            }
        }

        Ok(())
    }

    fn required_locations(&self) -> LedgerResult<(bool, bool)> {
        if self.kind.is_adjusting() {
            return match self.adjustment {
                Some(AdjustmentKind::Decrease) => Ok((true, false)),
                Some(AdjustmentKind::Increase) => Ok((false, true)),
                Some(AdjustmentKind::Set) if self.kind == MovementKind::Adjustment => {
                    Ok((false, true))
                }
                Some(AdjustmentKind::Set) => Err(LedgerError::validation(
                    "cycle count variances are deltas and cannot set a balance",
                )),
                None => Err(LedgerError::validation(format!(
                    "{} requires an adjustment kind",
                    self.kind.label()
                ))),
            };
        }
        if self.adjustment.is_some() {
            return Err(LedgerError::validation(format!(
                "{} cannot carry an adjustment kind",
                self.kind.label()
            )));
        }
        Ok(match self.kind {
            k if k.is_inbound() => (false, true),
            k if k.is_outbound() => (true, false),
            MovementKind::StatusChange => (true, false),
            _ => (true, true), // transfer
        })
    }

    fn key_at(&self, location: LocationId, quality: QualityStatus) -> BalanceKey {
        BalanceKey {
            item_id: self.item_id,
            location_id: location,
            batch: self.batch.clone(),
            mrn: self.mrn.clone(),
            quality,
        }
    }

    /// Balance rows this line touches (what the ledger must lock).
    pub fn balance_keys(&self) -> Vec<BalanceKey> {
        self.effects().into_iter().map(|e| e.key).collect()
    }

    /// Per-row effects of a (valid) line, in application order.
    pub fn effects(&self) -> Vec<BalanceEffect> {
        let q = self.quantity;
        let mut effects = Vec::with_capacity(2);

        if let (MovementKind::StatusChange, Some(from), Some(target)) =
            (self.kind, self.from_location, self.target_quality)
        {
            effects.push(BalanceEffect {
                key: self.key_at(from, self.quality),
                change: BalanceChange::Withdraw(q),
            });
            effects.push(BalanceEffect {
                key: self.key_at(from, target),
                change: BalanceChange::Increase(q),
            });
            return effects;
        }

        if let Some(from) = self.from_location {
            let change = match self.adjustment {
                Some(_) => BalanceChange::Decrease(q),
                None => BalanceChange::Withdraw(q),
            };
            effects.push(BalanceEffect {
                key: self.key_at(from, self.quality),
                change,
            });
        }
        if let Some(to) = self.to_location {
            let change = match self.adjustment {
                Some(AdjustmentKind::Set) => BalanceChange::Set(q),
                _ => BalanceChange::Increase(q),
            };
            effects.push(BalanceEffect {
                key: self.key_at(to, self.quality),
                change,
            });
        }
        effects
    }
}

fn check_location(
    side: &str,
    value: Option<LocationId>,
    required: bool,
    kind: MovementKind,
) -> LedgerResult<()> {
    match (value.is_some(), required) {
        (true, false) => Err(LedgerError::validation(format!(
            "{} must not have a {side} location",
            kind.label()
        ))),
        (false, true) => Err(LedgerError::validation(format!(
            "{} requires a {side} location",
            kind.label()
        ))),
        _ => Ok(()),
    }
}

/// A recorded movement (immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryMovement {
    pub id: MovementId,
    /// Gap-free sequence number, starting at 1.
    pub number: u64,
    #[serde(flatten)]
    pub line: MovementLine,
}

impl InventoryMovement {
    pub fn display_number(&self, prefix: &str) -> String {
        format_movement_number(prefix, self.number)
    }

    pub fn touches_location(&self, location: LocationId) -> bool {
        self.line.from_location == Some(location) || self.line.to_location == Some(location)
    }
}

pub fn format_movement_number(prefix: &str, number: u64) -> String {
    format!("{prefix}-{number:08}")
}

/// Query over the movement journal. All criteria are optional and combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovementFilter {
    pub item_id: Option<ItemId>,
    pub location_id: Option<LocationId>,
    pub kind: Option<MovementKind>,
    pub batch: Option<BatchNumber>,
    pub mrn: Option<Mrn>,
    /// Inclusive lower bound on `occurred_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`.
    pub until: Option<DateTime<Utc>>,
    pub reference: Option<DocumentRef>,
}

impl MovementFilter {
    pub fn for_item(item_id: ItemId) -> Self {
        Self {
            item_id: Some(item_id),
            ..Self::default()
        }
    }

    pub fn at_location(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn of_kind(mut self, kind: MovementKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }

    pub fn referencing(mut self, reference: DocumentRef) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn matches(&self, movement: &InventoryMovement) -> bool {
        let line = &movement.line;
        self.item_id.is_none_or(|id| line.item_id == id)
            && self.location_id.is_none_or(|loc| movement.touches_location(loc))
            && self.kind.is_none_or(|kind| line.kind == kind)
            && self.batch.as_ref().is_none_or(|b| line.batch.as_ref() == Some(b))
            && self.mrn.as_ref().is_none_or(|m| line.mrn.as_ref() == Some(m))
            && self.from.is_none_or(|from| line.occurred_at >= from)
            && self.until.is_none_or(|until| line.occurred_at < until)
            && self
                .reference
                .as_ref()
                .is_none_or(|r| line.reference.as_ref() == Some(r))
    }
}
