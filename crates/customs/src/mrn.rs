//! MRN registry: consumption of customs lots against a hard ceiling.
//!
//! Invariant: `0 <= used <= total` for every entry, at every point.
//! Every mutating operation validates first and mutates last, so a
//! rejected call leaves the entry untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lonerp_core::{LedgerError, LedgerResult, Mrn, Quantity, percent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrnRegistryEntry {
    pub mrn: Mrn,
    pub total: Quantity,
    pub used: Quantity,
    pub expiry_date: Option<NaiveDate>,
    pub is_active: bool,
    pub registered_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl MrnRegistryEntry {
    pub fn remaining(&self) -> Quantity {
        self.total - self.used
    }

    pub fn is_fully_used(&self) -> bool {
        !self.remaining().is_positive()
    }

    pub fn is_expired_on(&self, day: NaiveDate) -> bool {
        self.expiry_date.is_some_and(|expiry| day > expiry)
    }

    /// Increment usage, or explain why not. `override_expiry` bypasses the
    /// expiry check only, never the ceiling.
    pub fn consume(
        &mut self,
        quantity: Quantity,
        today: NaiveDate,
        override_expiry: bool,
    ) -> LedgerResult<()> {
        if !quantity.is_positive() {
            return Err(LedgerError::validation("MRN consumption must be positive"));
        }
        if !self.is_active {
            return Err(LedgerError::MrnInactive(self.mrn.clone()));
        }
        if let Some(expired_on) = self.expiry_date.filter(|_| self.is_expired_on(today)) {
            if !override_expiry {
                return Err(LedgerError::MrnExpired {
                    mrn: self.mrn.clone(),
                    expired_on,
                });
            }
        }
        match self.used.checked_add(quantity) {
            Some(used) if used <= self.total => {
                self.used = used;
                Ok(())
            }
            _ => Err(LedgerError::MrnExhausted {
                mrn: self.mrn.clone(),
                total: self.total,
                used: self.used,
                requested: quantity,
            }),
        }
    }

    /// Decrement usage, floored at zero.
    pub fn release(&mut self, quantity: Quantity) -> LedgerResult<()> {
        if !quantity.is_positive() {
            return Err(LedgerError::validation("MRN release must be positive"));
        }
        self.used = self.used.saturating_sub(quantity);
        Ok(())
    }

    pub fn utilization(&self) -> MrnUtilization {
        MrnUtilization {
            mrn: self.mrn.clone(),
            total: self.total,
            used: self.used,
            remaining: self.remaining(),
            percent_used: percent(self.used.value(), self.total.value()),
            fully_used: self.is_fully_used(),
            is_active: self.is_active,
            expiry_date: self.expiry_date,
        }
    }
}

/// Utilization report for one MRN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrnUtilization {
    pub mrn: Mrn,
    pub total: Quantity,
    pub used: Quantity,
    pub remaining: Quantity,
    pub percent_used: Decimal,
    pub fully_used: bool,
    pub is_active: bool,
    pub expiry_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MrnRegistry {
    entries: BTreeMap<Mrn, MrnRegistryEntry>,
}

impl MrnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mrn: &Mrn) -> Option<&MrnRegistryEntry> {
        self.entries.get(mrn)
    }

    pub fn require(&self, mrn: &Mrn) -> LedgerResult<&MrnRegistryEntry> {
        self.entries
            .get(mrn)
            .ok_or_else(|| LedgerError::not_found("MRN", mrn))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry a registration would create.
    ///
    /// Returns `Ok(None)` for an identical re-registration (idempotent) and
    /// `DuplicateMrn` when the MRN exists with a different total or expiry.
    pub fn plan_register(
        &self,
        mrn: Mrn,
        total: Quantity,
        expiry_date: Option<NaiveDate>,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<MrnRegistryEntry>> {
        if !total.is_positive() {
            return Err(LedgerError::validation("MRN total quantity must be positive"));
        }
        if !total.is_within_bounds() {
            return Err(LedgerError::validation(format!(
                "MRN total {total} exceeds the maximum quantity"
            )));
        }
        if let Some(existing) = self.entries.get(&mrn) {
            return if existing.total == total && existing.expiry_date == expiry_date {
                Ok(None)
            } else {
                Err(LedgerError::DuplicateMrn(mrn))
            };
        }
        Ok(Some(MrnRegistryEntry {
            mrn,
            total,
            used: Quantity::ZERO,
            expiry_date,
            is_active: true,
            registered_at: at,
            notes: None,
        }))
    }

    /// Register an MRN. Returns `false` when it was already registered identically.
    pub fn register(
        &mut self,
        mrn: Mrn,
        total: Quantity,
        expiry_date: Option<NaiveDate>,
        at: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        match self.plan_register(mrn, total, expiry_date, at)? {
            Some(entry) => {
                self.upsert(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn consume(
        &mut self,
        mrn: &Mrn,
        quantity: Quantity,
        today: NaiveDate,
        override_expiry: bool,
    ) -> LedgerResult<&MrnRegistryEntry> {
        let mut entry = self.require(mrn)?.clone();
        entry.consume(quantity, today, override_expiry)?;
        Ok(self.upsert(entry))
    }

    pub fn release(&mut self, mrn: &Mrn, quantity: Quantity) -> LedgerResult<&MrnRegistryEntry> {
        let mut entry = self.require(mrn)?.clone();
        entry.release(quantity)?;
        Ok(self.upsert(entry))
    }

    /// Stop further consumption. Release still works on an inactive MRN.
    pub fn deactivate(&mut self, mrn: &Mrn) -> LedgerResult<&MrnRegistryEntry> {
        let mut entry = self.require(mrn)?.clone();
        entry.is_active = false;
        Ok(self.upsert(entry))
    }

    /// Replace (or insert) a fully validated entry.
    pub fn upsert(&mut self, entry: MrnRegistryEntry) -> &MrnRegistryEntry {
        let key = entry.mrn.clone();
        self.entries.insert(key.clone(), entry);
        &self.entries[&key]
    }

    pub fn utilization(&self, mrn: &Mrn) -> LedgerResult<MrnUtilization> {
        Ok(self.require(mrn)?.utilization())
    }

    /// All entries, ordered by MRN.
    pub fn list(&self) -> Vec<MrnRegistryEntry> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lonerp_core::QUANTITY_MAX;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn mrn(code: &str) -> Mrn {
        Mrn::new(code).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn registry_with(code: &str, total: i64, expiry: Option<NaiveDate>) -> MrnRegistry {
        let mut registry = MrnRegistry::new();
        registry
            .register(mrn(code), Quantity::units(total), expiry, Utc::now())
            .unwrap();
        registry
    }

    #[test]
    fn registration_is_idempotent_on_identical_values() {
        let mut registry = registry_with("MRN-001", 100, None);
        let again = registry
            .register(mrn("MRN-001"), Quantity::units(100), None, Utc::now())
            .unwrap();
        assert!(!again);

        let conflict = registry.register(mrn("MRN-001"), Quantity::units(90), None, Utc::now());
        assert!(matches!(conflict, Err(LedgerError::DuplicateMrn(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn consumption_stops_at_the_ceiling() {
        let mut registry = registry_with("MRN-001", 100, None);
        let today = day(2026, 1, 1);
        registry
            .consume(&mrn("MRN-001"), Quantity::units(70), today, false)
            .unwrap();

        let err = registry
            .consume(&mrn("MRN-001"), Quantity::units(31), today, false)
            .unwrap_err();
        assert!(matches!(err, LedgerError::MrnExhausted { .. }));
        assert_eq!(registry.get(&mrn("MRN-001")).unwrap().used, Quantity::units(70));

        let entry = registry
            .consume(&mrn("MRN-001"), Quantity::units(30), today, false)
            .unwrap();
        assert!(entry.is_fully_used());
    }

    #[test]
    fn unknown_mrn_is_not_found() {
        let mut registry = MrnRegistry::new();
        let err = registry
            .consume(&mrn("NOPE"), Quantity::units(1), day(2026, 1, 1), false)
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "MRN", .. }));
    }

    #[test]
    fn expiry_can_be_overridden_but_not_the_ceiling() {
        let expiry = day(2025, 12, 31);
        let mut registry = registry_with("MRN-EXP", 10, Some(expiry));
        let late = day(2026, 1, 1);

        let err = registry
            .consume(&mrn("MRN-EXP"), Quantity::units(1), late, false)
            .unwrap_err();
        assert!(matches!(err, LedgerError::MrnExpired { expired_on, .. } if expired_on == expiry));

        // The expiry day itself is still valid.
        assert!(registry.consume(&mrn("MRN-EXP"), Quantity::units(1), expiry, false).is_ok());

        assert!(registry.consume(&mrn("MRN-EXP"), Quantity::units(9), late, true).is_ok());
        let err = registry
            .consume(&mrn("MRN-EXP"), Quantity::units(1), late, true)
            .unwrap_err();
        assert!(matches!(err, LedgerError::MrnExhausted { .. }));
    }

    #[test]
    fn release_is_floored_at_zero() {
        let mut registry = registry_with("MRN-001", 10, None);
        registry
            .consume(&mrn("MRN-001"), Quantity::units(4), day(2026, 1, 1), false)
            .unwrap();
        let entry = registry.release(&mrn("MRN-001"), Quantity::units(9)).unwrap();
        assert_eq!(entry.used, Quantity::ZERO);
    }

    #[test]
    fn inactive_mrn_rejects_consumption_but_allows_release() {
        let mut registry = registry_with("MRN-001", 10, None);
        let today = day(2026, 1, 1);
        registry
            .consume(&mrn("MRN-001"), Quantity::units(5), today, false)
            .unwrap();
        registry.deactivate(&mrn("MRN-001")).unwrap();

        let err = registry
            .consume(&mrn("MRN-001"), Quantity::units(1), today, false)
            .unwrap_err();
        assert!(matches!(err, LedgerError::MrnInactive(_)));
        assert!(registry.release(&mrn("MRN-001"), Quantity::units(2)).is_ok());
    }

    #[test]
    fn utilization_reports_percent() {
        let mut registry = registry_with("MRN-001", 200, None);
        registry
            .consume(&mrn("MRN-001"), Quantity::units(50), day(2026, 1, 1), false)
            .unwrap();
        let report = registry.utilization(&mrn("MRN-001")).unwrap();
        assert_eq!(report.remaining, Quantity::units(150));
        assert_eq!(report.percent_used, dec!(25));
        assert!(!report.fully_used);
    }

    #[test]
    fn consumption_at_the_quantity_cap_does_not_overflow() {
        let max = Quantity::new(QUANTITY_MAX).unwrap();
        let mut registry = MrnRegistry::new();
        registry
            .register(mrn("MRN-BIG"), max, None, Utc::now())
            .unwrap();
        let today = day(2026, 1, 1);
        registry.consume(&mrn("MRN-BIG"), max, today, false).unwrap();

        let err = registry
            .consume(&mrn("MRN-BIG"), Quantity::units(1), today, false)
            .unwrap_err();
        assert!(matches!(err, LedgerError::MrnExhausted { .. }));
        assert_eq!(registry.get(&mrn("MRN-BIG")).unwrap().used, max);
        assert!(matches!(
            registry.register(mrn("MRN-HUGE"), Quantity::units(i64::MAX), None, Utc::now()),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn non_positive_quantities_are_validation_errors() {
        let mut registry = MrnRegistry::new();
        assert!(matches!(
            registry.register(mrn("MRN-0"), Quantity::ZERO, None, Utc::now()),
            Err(LedgerError::Validation(_))
        ));
        let mut registry = registry_with("MRN-001", 10, None);
        assert!(matches!(
            registry.consume(&mrn("MRN-001"), Quantity::ZERO, day(2026, 1, 1), false),
            Err(LedgerError::Validation(_))
        ));
    }

    proptest! {
        #[test]
        fn usage_stays_within_bounds(
            total in 1i64..500,
            ops in prop::collection::vec((any::<bool>(), 1i64..120), 1..80)
        ) {
            let mut registry = registry_with("MRN-P", total, None);
            let key = mrn("MRN-P");
            let today = day(2026, 6, 1);

            for (consume, n) in ops {
                let before = registry.get(&key).unwrap().used;
                let q = Quantity::units(n);
                if consume {
                    let result = registry.consume(&key, q, today, false);
                    if before + q > Quantity::units(total) {
                        prop_assert!(result.is_err());
                        prop_assert_eq!(registry.get(&key).unwrap().used, before);
                    } else {
                        prop_assert!(result.is_ok());
                    }
                } else {
                    registry.release(&key, q).unwrap();
                }
                let used = registry.get(&key).unwrap().used;
                prop_assert!(!used.is_negative());
                prop_assert!(used <= Quantity::units(total));
            }
        }
    }
}
