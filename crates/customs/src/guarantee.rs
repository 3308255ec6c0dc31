//! Customs guarantee ledger.
//!
//! A guarantee account is a bank-backed credit line: every debit (duty that
//! is secured but not yet paid) raises exposure, every credit lowers it.
//! Entries are immutable apart from their release flag; corrections are new
//! entries. `current_balance` is a cache over the entries and can be
//! re-derived with [`GuaranteeLedger::recompute`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lonerp_core::{GuaranteeAccountId, GuaranteeEntryId, LedgerError, LedgerResult, Mrn, percent};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Debit,
    Credit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeAccount {
    pub id: GuaranteeAccountId,
    pub account_number: String,
    pub account_name: String,
    pub total_limit: Decimal,
    pub current_balance: Decimal,
    pub currency: String,
    pub is_active: bool,
    pub opened_at: DateTime<Utc>,
}

impl GuaranteeAccount {
    pub fn available_limit(&self) -> Decimal {
        self.total_limit - self.current_balance
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeLedgerEntry {
    pub id: GuaranteeEntryId,
    pub account_id: GuaranteeAccountId,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub mrn: Option<Mrn>,
    pub entry_date: DateTime<Utc>,
    pub description: Option<String>,
    pub expected_release_date: Option<NaiveDate>,
    pub is_released: bool,
    pub actual_release_date: Option<NaiveDate>,
    /// For credits: the debit this credit releases.
    pub related_entry: Option<GuaranteeEntryId>,
}

/// Posting request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuaranteePosting {
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub mrn: Option<Mrn>,
    pub description: Option<String>,
    pub expected_release_date: Option<NaiveDate>,
    pub related_entry: Option<GuaranteeEntryId>,
}

impl GuaranteePosting {
    pub fn debit(amount: Decimal) -> Self {
        Self {
            entry_type: EntryType::Debit,
            amount,
            mrn: None,
            description: None,
            expected_release_date: None,
            related_entry: None,
        }
    }

    pub fn credit(amount: Decimal) -> Self {
        Self {
            entry_type: EntryType::Credit,
            ..Self::debit(amount)
        }
    }

    pub fn with_mrn(mut self, mrn: Mrn) -> Self {
        self.mrn = Some(mrn);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn expected_release(mut self, date: NaiveDate) -> Self {
        self.expected_release_date = Some(date);
        self
    }

    /// Credit that releases (matches) a specific debit.
    pub fn releasing(mut self, debit: GuaranteeEntryId) -> Self {
        self.related_entry = Some(debit);
        self
    }
}

/// Exposure report for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeExposure {
    pub account_id: GuaranteeAccountId,
    pub total_limit: Decimal,
    pub current_balance: Decimal,
    pub available_limit: Decimal,
    pub utilization_percent: Decimal,
    pub open_debits: usize,
    pub open_debit_amount: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct GuaranteeLedger {
    accounts: BTreeMap<GuaranteeAccountId, GuaranteeAccount>,
    entries: Vec<GuaranteeLedgerEntry>,
    index: HashMap<GuaranteeEntryId, usize>,
}

impl GuaranteeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_account(
        &mut self,
        account_number: impl Into<String>,
        account_name: impl Into<String>,
        total_limit: Decimal,
        currency: impl Into<String>,
        at: DateTime<Utc>,
    ) -> LedgerResult<&GuaranteeAccount> {
        let account_number = account_number.into().trim().to_string();
        if account_number.is_empty() {
            return Err(LedgerError::validation("account number is required"));
        }
        if total_limit.is_sign_negative() {
            return Err(LedgerError::validation("guarantee limit cannot be negative"));
        }
        if self
            .accounts
            .values()
            .any(|a| a.account_number == account_number)
        {
            return Err(LedgerError::validation(format!(
                "guarantee account {account_number} already exists"
            )));
        }

        let account = GuaranteeAccount {
            id: GuaranteeAccountId::new(),
            account_number,
            account_name: account_name.into(),
            total_limit,
            current_balance: Decimal::ZERO,
            currency: currency.into(),
            is_active: true,
            opened_at: at,
        };
        let id = account.id;
        self.accounts.insert(id, account);
        Ok(&self.accounts[&id])
    }

    pub fn account(&self, id: GuaranteeAccountId) -> LedgerResult<&GuaranteeAccount> {
        self.accounts
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("guarantee account", id))
    }

    pub fn accounts(&self) -> impl Iterator<Item = &GuaranteeAccount> {
        self.accounts.values()
    }

    pub fn set_active(&mut self, id: GuaranteeAccountId, active: bool) -> LedgerResult<()> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("guarantee account", id))?;
        account.is_active = active;
        Ok(())
    }

    pub fn entry(&self, id: GuaranteeEntryId) -> LedgerResult<&GuaranteeLedgerEntry> {
        self.index
            .get(&id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| LedgerError::not_found("guarantee entry", id))
    }

    /// Entries of one account, oldest first.
    pub fn entries(&self, account_id: GuaranteeAccountId) -> Vec<GuaranteeLedgerEntry> {
        self.entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Post a debit or credit.
    ///
    /// A debit may not push the balance above the limit; a credit may not
    /// push it below zero. Credits are recorded already released, and a
    /// credit naming a related debit marks that debit released.
    pub fn post(
        &mut self,
        account_id: GuaranteeAccountId,
        posting: GuaranteePosting,
        at: DateTime<Utc>,
    ) -> LedgerResult<GuaranteeLedgerEntry> {
        if posting.amount <= Decimal::ZERO {
            return Err(LedgerError::validation("guarantee amount must be positive"));
        }
        let account = self.account(account_id)?;
        if !account.is_active {
            return Err(LedgerError::AccountInactive(account_id));
        }

        let balance = account.current_balance;
        let new_balance = match posting.entry_type {
            EntryType::Debit => {
                if posting.related_entry.is_some() {
                    return Err(LedgerError::validation("only credits may name a related debit"));
                }
                match balance.checked_add(posting.amount) {
                    Some(new_balance) if new_balance <= account.total_limit => new_balance,
                    _ => {
                        return Err(LedgerError::LimitExceeded {
                            account: account_id,
                            limit: account.total_limit,
                            balance,
                            amount: posting.amount,
                        });
                    }
                }
            }
            EntryType::Credit => {
                if let Some(debit_id) = posting.related_entry {
                    self.check_releasable_debit(account_id, debit_id)?;
                }
                self.credited_balance(account_id, balance, posting.amount)?
            }
        };

        let released_on = at.date_naive();
        let entry = GuaranteeLedgerEntry {
            id: GuaranteeEntryId::new(),
            account_id,
            entry_type: posting.entry_type,
            amount: posting.amount,
            mrn: posting.mrn,
            entry_date: at,
            description: posting.description,
            expected_release_date: posting.expected_release_date,
            is_released: posting.entry_type == EntryType::Credit,
            actual_release_date: (posting.entry_type == EntryType::Credit).then_some(released_on),
            related_entry: posting.related_entry,
        };

        if let Some(debit_id) = entry.related_entry {
            self.mark_released(debit_id, released_on);
        }
        self.push(entry.clone());
        self.set_balance(account_id, new_balance);
        Ok(entry)
    }

    /// Release an open debit, posting the offsetting credit.
    ///
    /// Fails with `AlreadyReleased` for credits (recorded released) and for
    /// debits already released directly or matched by a related credit.
    pub fn release(
        &mut self,
        entry_id: GuaranteeEntryId,
        at: DateTime<Utc>,
    ) -> LedgerResult<GuaranteeLedgerEntry> {
        let entry = self.entry(entry_id)?;
        if entry.is_released {
            return Err(LedgerError::AlreadyReleased(entry_id));
        }
        let account_id = entry.account_id;
        let amount = entry.amount;
        let mrn = entry.mrn.clone();
        let balance = self.account(account_id)?.current_balance;
        let new_balance = self.credited_balance(account_id, balance, amount)?;

        let released_on = at.date_naive();
        let credit = GuaranteeLedgerEntry {
            id: GuaranteeEntryId::new(),
            account_id,
            entry_type: EntryType::Credit,
            amount,
            mrn,
            entry_date: at,
            description: Some(format!("release of {entry_id}")),
            expected_release_date: None,
            is_released: true,
            actual_release_date: Some(released_on),
            related_entry: Some(entry_id),
        };

        self.mark_released(entry_id, released_on);
        self.push(credit.clone());
        self.set_balance(account_id, new_balance);
        Ok(credit)
    }

    pub fn exposure(&self, account_id: GuaranteeAccountId) -> LedgerResult<GuaranteeExposure> {
        let account = self.account(account_id)?;
        let open: Vec<&GuaranteeLedgerEntry> = self.open_debits(account_id).collect();
        Ok(GuaranteeExposure {
            account_id,
            total_limit: account.total_limit,
            current_balance: account.current_balance,
            available_limit: account.available_limit(),
            utilization_percent: percent(account.current_balance, account.total_limit),
            open_debits: open.len(),
            open_debit_amount: open.iter().map(|e| e.amount).sum(),
        })
    }

    /// Unreleased debits expected back before `as_of`.
    pub fn overdue_debits(
        &self,
        account_id: GuaranteeAccountId,
        as_of: NaiveDate,
    ) -> LedgerResult<Vec<GuaranteeLedgerEntry>> {
        self.account(account_id)?;
        Ok(self
            .open_debits(account_id)
            .filter(|e| e.expected_release_date.is_some_and(|d| d < as_of))
            .cloned()
            .collect())
    }

    /// Balance derived from the entries alone.
    pub fn recompute(&self, account_id: GuaranteeAccountId) -> LedgerResult<Decimal> {
        self.account(account_id)?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .map(|e| match e.entry_type {
                EntryType::Debit => e.amount,
                EntryType::Credit => -e.amount,
            })
            .sum())
    }

    fn open_debits(
        &self,
        account_id: GuaranteeAccountId,
    ) -> impl Iterator<Item = &GuaranteeLedgerEntry> {
        self.entries.iter().filter(move |e| {
            e.account_id == account_id && e.entry_type == EntryType::Debit && !e.is_released
        })
    }

    fn check_releasable_debit(
        &self,
        account_id: GuaranteeAccountId,
        debit_id: GuaranteeEntryId,
    ) -> LedgerResult<()> {
        let debit = self.entry(debit_id)?;
        if debit.account_id != account_id || debit.entry_type != EntryType::Debit {
            return Err(LedgerError::validation(format!(
                "entry {debit_id} is not a debit of account {account_id}"
            )));
        }
        if debit.is_released {
            return Err(LedgerError::AlreadyReleased(debit_id));
        }
        Ok(())
    }

    fn credited_balance(
        &self,
        account_id: GuaranteeAccountId,
        balance: Decimal,
        amount: Decimal,
    ) -> LedgerResult<Decimal> {
        balance
            .checked_sub(amount)
            .filter(|new_balance| *new_balance >= Decimal::ZERO)
            .ok_or(LedgerError::NegativeExposure {
                account: account_id,
                balance,
                amount,
            })
    }

    fn mark_released(&mut self, entry_id: GuaranteeEntryId, on: NaiveDate) {
        if let Some(&i) = self.index.get(&entry_id) {
            let entry = &mut self.entries[i];
            entry.is_released = true;
            entry.actual_release_date = Some(on);
        }
    }

    fn push(&mut self, entry: GuaranteeLedgerEntry) {
        self.index.insert(entry.id, self.entries.len());
        self.entries.push(entry);
    }

    fn set_balance(&mut self, account_id: GuaranteeAccountId, balance: Decimal) {
        if let Some(account) = self.accounts.get_mut(&account_id) {
            account.current_balance = balance;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger_with_account(limit: Decimal) -> (GuaranteeLedger, GuaranteeAccountId) {
        let mut ledger = GuaranteeLedger::new();
        let id = ledger
            .open_account("GA-1", "Main guarantee", limit, "EUR", Utc::now())
            .unwrap()
            .id;
        (ledger, id)
    }

    #[test]
    fn debit_beyond_limit_is_rejected_without_mutation() {
        let (mut ledger, id) = ledger_with_account(dec!(1000));
        ledger.post(id, GuaranteePosting::debit(dec!(600)), Utc::now()).unwrap();

        let err = ledger
            .post(id, GuaranteePosting::debit(dec!(500)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::LimitExceeded { balance, .. } if balance == dec!(600)));
        assert_eq!(ledger.account(id).unwrap().current_balance, dec!(600));
        assert_eq!(ledger.entries(id).len(), 1);
    }

    #[test]
    fn debit_up_to_the_limit_is_allowed() {
        let (mut ledger, id) = ledger_with_account(dec!(1000));
        ledger.post(id, GuaranteePosting::debit(dec!(1000)), Utc::now()).unwrap();
        assert_eq!(ledger.account(id).unwrap().available_limit(), Decimal::ZERO);
    }

    #[test]
    fn debit_on_a_maximal_limit_does_not_overflow() {
        let (mut ledger, id) = ledger_with_account(Decimal::MAX);
        ledger.post(id, GuaranteePosting::debit(Decimal::MAX), Utc::now()).unwrap();

        let err = ledger
            .post(id, GuaranteePosting::debit(dec!(1)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::LimitExceeded { .. }));
        assert_eq!(ledger.account(id).unwrap().current_balance, Decimal::MAX);
        assert_eq!(ledger.entries(id).len(), 1);
    }

    #[test]
    fn release_posts_offsetting_credit_once() {
        let (mut ledger, id) = ledger_with_account(dec!(1000));
        let debit = ledger
            .post(id, GuaranteePosting::debit(dec!(250)), Utc::now())
            .unwrap();

        let credit = ledger.release(debit.id, Utc::now()).unwrap();
        assert_eq!(credit.entry_type, EntryType::Credit);
        assert_eq!(credit.related_entry, Some(debit.id));
        assert_eq!(ledger.account(id).unwrap().current_balance, Decimal::ZERO);

        let err = ledger.release(debit.id, Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyReleased(e) if e == debit.id));
        assert_eq!(ledger.entries(id).len(), 2);
    }

    #[test]
    fn credit_matching_a_debit_releases_it() {
        let (mut ledger, id) = ledger_with_account(dec!(1000));
        let debit = ledger
            .post(id, GuaranteePosting::debit(dec!(300)), Utc::now())
            .unwrap();
        let credit = ledger
            .post(id, GuaranteePosting::credit(dec!(300)).releasing(debit.id), Utc::now())
            .unwrap();
        assert!(credit.is_released);
        assert!(ledger.entry(debit.id).unwrap().is_released);

        assert!(matches!(
            ledger.release(debit.id, Utc::now()),
            Err(LedgerError::AlreadyReleased(_))
        ));
        assert!(matches!(
            ledger.release(credit.id, Utc::now()),
            Err(LedgerError::AlreadyReleased(_))
        ));
        assert_eq!(ledger.account(id).unwrap().current_balance, Decimal::ZERO);
    }

    #[test]
    fn credit_cannot_drive_exposure_negative() {
        let (mut ledger, id) = ledger_with_account(dec!(1000));
        ledger.post(id, GuaranteePosting::debit(dec!(100)), Utc::now()).unwrap();
        let err = ledger
            .post(id, GuaranteePosting::credit(dec!(100.01)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::NegativeExposure { .. }));
    }

    #[test]
    fn inactive_accounts_reject_postings() {
        let (mut ledger, id) = ledger_with_account(dec!(1000));
        ledger.set_active(id, false).unwrap();
        let err = ledger
            .post(id, GuaranteePosting::debit(dec!(1)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountInactive(_)));
    }

    #[test]
    fn exposure_and_overdue_debits() {
        let (mut ledger, id) = ledger_with_account(dec!(1000));
        let due = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        ledger
            .post(
                id,
                GuaranteePosting::debit(dec!(200))
                    .with_mrn(Mrn::new("MRN-001").unwrap())
                    .expected_release(due),
                Utc::now(),
            )
            .unwrap();
        ledger.post(id, GuaranteePosting::debit(dec!(50)), Utc::now()).unwrap();

        let exposure = ledger.exposure(id).unwrap();
        assert_eq!(exposure.current_balance, dec!(250));
        assert_eq!(exposure.available_limit, dec!(750));
        assert_eq!(exposure.utilization_percent, dec!(25));
        assert_eq!(exposure.open_debits, 2);

        let as_of = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let overdue = ledger.overdue_debits(id, as_of).unwrap();
        assert_eq!(overdue.len(), 1);
        assert!(ledger.overdue_debits(id, due).unwrap().is_empty());
    }

    #[test]
    fn recompute_matches_cached_balance() {
        let (mut ledger, id) = ledger_with_account(dec!(5000));
        let d1 = ledger.post(id, GuaranteePosting::debit(dec!(1200.50)), Utc::now()).unwrap();
        ledger.post(id, GuaranteePosting::debit(dec!(300)), Utc::now()).unwrap();
        ledger.release(d1.id, Utc::now()).unwrap();
        ledger.post(id, GuaranteePosting::credit(dec!(100)), Utc::now()).unwrap();

        assert_eq!(ledger.recompute(id).unwrap(), dec!(200));
        assert_eq!(ledger.account(id).unwrap().current_balance, dec!(200));
    }

    #[test]
    fn unknown_account_is_not_found() {
        let mut ledger = GuaranteeLedger::new();
        let err = ledger
            .post(GuaranteeAccountId::new(), GuaranteePosting::debit(dec!(1)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }
}
