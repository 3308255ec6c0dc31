//! Balance store: the materialised view of the movement journal.
//!
//! Balances are keyed by item + location + batch + MRN + quality status and
//! are only ever changed by applying movements. Writers stage changes in a
//! [`BalanceDraft`] (a copy-on-write overlay over the committed rows) and
//! publish them with [`BalanceStore::commit`]; a draft that fails is simply
//! dropped, so a rejected movement leaves no trace.
//!
//! Because every row derives from the journal, the whole store can be
//! rebuilt with [`BalanceStore::replay`] and checked with [`BalanceStore::diff`].

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use lonerp_core::{
    BatchNumber, ItemId, LedgerError, LedgerResult, LocationId, Mrn, Quantity, UomId,
};

use crate::movement::{BalanceChange, InventoryMovement, MovementLine};
use crate::quality::QualityStatus;

/// Identity of one balance row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub batch: Option<BatchNumber>,
    pub mrn: Option<Mrn>,
    pub quality: QualityStatus,
}

impl BalanceKey {
    pub fn new(item_id: ItemId, location_id: LocationId) -> Self {
        Self {
            item_id,
            location_id,
            batch: None,
            mrn: None,
            quality: QualityStatus::Ok,
        }
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
}

impl core::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.item_id, self.location_id)?;
        if let Some(batch) = &self.batch {
            write!(f, " batch {batch}")?;
        }
        if let Some(mrn) = &self.mrn {
            write!(f, " mrn {mrn}")?;
        }
        write!(f, " [{}]", self.quality)
    }
}

/// Current quantity for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryBalance {
    pub key: BalanceKey,
    pub quantity: Quantity,
    pub uom_id: UomId,
    pub expiry_date: Option<NaiveDate>,
    pub last_movement_at: DateTime<Utc>,
}

impl InventoryBalance {
    /// Positive and OK: may be picked for outbound use.
    pub fn is_available(&self) -> bool {
        self.quantity.is_positive() && self.key.quality.is_outbound_eligible()
    }
}

/// Balance query. Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceFilter {
    pub item_id: Option<ItemId>,
    pub location_id: Option<LocationId>,
    pub batch: Option<BatchNumber>,
    pub mrn: Option<Mrn>,
    pub quality: Option<QualityStatus>,
    /// Skip retained zero-quantity rows.
    pub positive_only: bool,
}

impl BalanceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Quantity > 0 and quality OK.
    pub fn available() -> Self {
        Self {
            quality: Some(QualityStatus::Ok),
            positive_only: true,
            ..Self::default()
        }
    }

    pub fn item(mut self, item_id: ItemId) -> Self {
        self.item_id = Some(item_id);
        self
    }

    pub fn location(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn batch(mut self, batch: BatchNumber) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn mrn(mut self, mrn: Mrn) -> Self {
        self.mrn = Some(mrn);
        self
    }

    pub fn quality(mut self, quality: QualityStatus) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn matches(&self, balance: &InventoryBalance) -> bool {
        let key = &balance.key;
        self.item_id.is_none_or(|id| key.item_id == id)
            && self.location_id.is_none_or(|loc| key.location_id == loc)
            && self.batch.as_ref().is_none_or(|b| key.batch.as_ref() == Some(b))
            && self.mrn.as_ref().is_none_or(|m| key.mrn.as_ref() == Some(m))
            && self.quality.is_none_or(|q| key.quality == q)
            && (!self.positive_only || balance.quantity.is_positive())
    }
}

/// A key whose cached quantity differs from the replayed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMismatch {
    pub key: BalanceKey,
    pub cached: Option<Quantity>,
    pub replayed: Option<Quantity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceStore {
    rows: BTreeMap<BalanceKey, InventoryBalance>,
}

impl BalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &BalanceKey) -> Option<&InventoryBalance> {
        self.rows.get(key)
    }

    /// Quantity for `key`; zero when the row does not exist.
    pub fn quantity(&self, key: &BalanceKey) -> Quantity {
        self.rows.get(key).map(|b| b.quantity).unwrap_or(Quantity::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InventoryBalance> {
        self.rows.values()
    }

    /// Rows matching `filter`, in key order.
    pub fn list(&self, filter: &BalanceFilter) -> Vec<InventoryBalance> {
        self.rows
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect()
    }

    /// Total across every status (blocked and quarantined stock included).
    pub fn on_hand(&self, item_id: ItemId, location_id: Option<LocationId>) -> Quantity {
        self.rows
            .values()
            .filter(|b| b.key.item_id == item_id)
            .filter(|b| location_id.is_none_or(|loc| b.key.location_id == loc))
            .map(|b| b.quantity)
            .sum()
    }

    /// OK stock only.
    pub fn available(&self, item_id: ItemId, location_id: Option<LocationId>) -> Quantity {
        self.rows
            .values()
            .filter(|b| b.key.item_id == item_id && b.is_available())
            .filter(|b| location_id.is_none_or(|loc| b.key.location_id == loc))
            .map(|b| b.quantity)
            .sum()
    }

    /// Every row at `location_id` holding stock, any status.
    pub fn location_snapshot(&self, location_id: LocationId) -> Vec<InventoryBalance> {
        self.rows
            .values()
            .filter(|b| b.key.location_id == location_id && b.quantity.is_positive())
            .cloned()
            .collect()
    }

    pub fn totals_by_batch(&self, item_id: ItemId) -> BTreeMap<BatchNumber, Quantity> {
        let mut totals = BTreeMap::new();
        for b in self.rows.values().filter(|b| b.key.item_id == item_id) {
            if let Some(batch) = &b.key.batch {
                let entry = totals.entry(batch.clone()).or_insert(Quantity::ZERO);
                *entry = *entry + b.quantity;
            }
        }
        totals
    }

    pub fn totals_by_mrn(&self) -> BTreeMap<Mrn, Quantity> {
        let mut totals = BTreeMap::new();
        for b in self.rows.values() {
            if let Some(mrn) = &b.key.mrn {
                let entry = totals.entry(mrn.clone()).or_insert(Quantity::ZERO);
                *entry = *entry + b.quantity;
            }
        }
        totals
    }

    /// Positive Blocked/Quarantine rows.
    pub fn non_eligible(&self) -> Vec<InventoryBalance> {
        self.rows
            .values()
            .filter(|b| b.quantity.is_positive() && !b.key.quality.is_outbound_eligible())
            .cloned()
            .collect()
    }

    /// Start a draft over the committed rows.
    pub fn stage(&self) -> BalanceDraft<'_> {
        BalanceDraft {
            base: self,
            staged: BTreeMap::new(),
        }
    }

    /// Publish rows produced by [`BalanceDraft::into_rows`].
    pub fn commit(&mut self, rows: Vec<InventoryBalance>) {
        for row in rows {
            self.rows.insert(row.key.clone(), row);
        }
    }

    /// Apply a single line (stage + commit).
    pub fn apply(&mut self, line: &MovementLine) -> LedgerResult<()> {
        let mut draft = self.stage();
        draft.apply(line)?;
        let rows = draft.into_rows();
        self.commit(rows);
        Ok(())
    }

    /// Rebuild a store from a movement journal, in movement-number order.
    pub fn replay<'a>(
        journal: impl IntoIterator<Item = &'a InventoryMovement>,
    ) -> LedgerResult<Self> {
        let mut movements: Vec<&InventoryMovement> = journal.into_iter().collect();
        movements.sort_by_key(|m| m.number);

        let mut store = Self::new();
        for movement in movements {
            store.apply(&movement.line).map_err(|e| {
                LedgerError::storage(format!(
                    "journal replay failed at movement {}: {e}",
                    movement.number
                ))
            })?;
        }
        Ok(store)
    }

    /// Keys whose quantity differs between `self` (cached) and `replayed`.
    pub fn diff(&self, replayed: &BalanceStore) -> Vec<BalanceMismatch> {
        let mut mismatches = Vec::new();
        for (key, row) in &self.rows {
            let other = replayed.rows.get(key).map(|b| b.quantity);
            if other != Some(row.quantity) {
                mismatches.push(BalanceMismatch {
                    key: key.clone(),
                    cached: Some(row.quantity),
                    replayed: other,
                });
            }
        }
        for (key, row) in &replayed.rows {
            if !self.rows.contains_key(key) {
                mismatches.push(BalanceMismatch {
                    key: key.clone(),
                    cached: None,
                    replayed: Some(row.quantity),
                });
            }
        }
        mismatches
    }
}

/// Uncommitted balance changes layered over a [`BalanceStore`].
#[derive(Debug)]
pub struct BalanceDraft<'a> {
    base: &'a BalanceStore,
    staged: BTreeMap<BalanceKey, InventoryBalance>,
}

impl BalanceDraft<'_> {
    /// Row as it would be after the staged changes.
    pub fn current(&self, key: &BalanceKey) -> Option<&InventoryBalance> {
        self.staged.get(key).or_else(|| self.base.get(key))
    }

    pub fn quantity(&self, key: &BalanceKey) -> Quantity {
        self.current(key).map(|b| b.quantity).unwrap_or(Quantity::ZERO)
    }

    /// Stage the effects of one validated line.
    ///
    /// Outbound lines must come from OK stock; every touched row must share
    /// the line's unit of measure. On error the draft may hold partial
    /// changes and must be discarded.
    pub fn apply(&mut self, line: &MovementLine) -> LedgerResult<()> {
        if let (true, Some(location)) = (line.kind.is_outbound(), line.from_location) {
            if !line.quality.is_outbound_eligible() {
                return Err(LedgerError::QualityNotEligible {
                    item: line.item_id,
                    location,
                    status: line.quality.to_string(),
                });
            }
        }

        // Expiry follows the stock when it moves (transfers, status changes).
        let mut carried_expiry = line.expiry_date;

        for effect in line.effects() {
            let existing = self.current(&effect.key).cloned();
            if let Some(row) = &existing {
                if row.uom_id != line.uom_id {
                    return Err(LedgerError::validation(format!(
                        "unit of measure {} does not match balance {} ({})",
                        line.uom_id, effect.key, row.uom_id
                    )));
                }
            }
            let current = existing.as_ref().map(|b| b.quantity).unwrap_or(Quantity::ZERO);

            let quantity = match effect.change {
                BalanceChange::Increase(q) => current.checked_add(q).ok_or_else(|| {
                    LedgerError::validation(format!(
                        "receiving {q} on balance {} would exceed the maximum quantity",
                        effect.key
                    ))
                })?,
                BalanceChange::Set(q) => q,
                BalanceChange::Withdraw(q) => current.checked_sub_non_negative(q).ok_or_else(|| {
                    LedgerError::InsufficientStock {
                        item: effect.key.item_id,
                        location: effect.key.location_id,
                        available: current,
                        requested: q,
                    }
                })?,
                BalanceChange::Decrease(q) => current.checked_sub_non_negative(q).ok_or_else(|| {
                    LedgerError::NegativeBalance {
                        item: effect.key.item_id,
                        location: effect.key.location_id,
                        current,
                        decrease: q,
                    }
                })?,
            };

            let expiry_date = match (&effect.change, &existing) {
                (BalanceChange::Withdraw(_) | BalanceChange::Decrease(_), Some(row)) => {
                    carried_expiry = carried_expiry.or(row.expiry_date);
                    row.expiry_date
                }
                (_, Some(row)) => row.expiry_date.or(carried_expiry),
                (_, None) => carried_expiry,
            };

            self.staged.insert(
                effect.key.clone(),
                InventoryBalance {
                    key: effect.key,
                    quantity,
                    uom_id: line.uom_id,
                    expiry_date,
                    last_movement_at: line.occurred_at,
                },
            );
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Rows changed by this draft.
    pub fn into_rows(self) -> Vec<InventoryBalance> {
        self.staged.into_values().collect()
    }
}
