//! Keyed exclusive locks.
//!
//! A unit of work claims every key it touches at once: keys are sorted and
//! deduplicated, and the claim either takes all of them or none. A contended
//! claim sleeps per the [`RetryPolicy`] and tries again; once the attempts are
//! spent the caller gets `ConcurrencyConflict` and nothing is held.
//!
//! There is no global lock for business decisions: units of work on disjoint
//! keys proceed in parallel.

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;

use tracing::{debug, warn};

use lonerp_core::{CycleCountId, GuaranteeAccountId, LedgerError, LedgerResult, Mrn};
use lonerp_inventory::BalanceKey;

use crate::config::RetryPolicy;

/// Something a unit of work can hold exclusively.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Balance(BalanceKey),
    Mrn(Mrn),
    Account(GuaranteeAccountId),
    CycleCount(CycleCountId),
}

#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<LockKey>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `keys`, retrying with backoff while any of them is held.
    pub fn acquire(
        &self,
        mut keys: Vec<LockKey>,
        policy: &RetryPolicy,
    ) -> LedgerResult<KeyGuard<'_>> {
        keys.sort();
        keys.dedup();

        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.try_claim(&keys)? {
                return Ok(KeyGuard { locks: self, keys });
            }
            if !policy.should_retry(attempt) {
                warn!(attempt, keys = keys.len(), "lock acquisition exhausted");
                return Err(LedgerError::conflict(format!(
                    "could not lock {} key(s) after {attempt} attempt(s)",
                    keys.len()
                )));
            }
            let delay = policy.delay_for_attempt(attempt);
            debug!(attempt, delay_us = delay.as_micros() as u64, "lock contention, backing off");
            thread::sleep(delay);
        }
    }

    fn try_claim(&self, keys: &[LockKey]) -> LedgerResult<bool> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LedgerError::storage("lock table poisoned"))?;
        if keys.iter().any(|k| held.contains(k)) {
            return Ok(false);
        }
        held.extend(keys.iter().cloned());
        Ok(true)
    }

    /// Number of keys currently held.
    pub fn held(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    keys: Vec<LockKey>,
}

impl KeyGuard<'_> {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }

    pub fn covers(&self, key: &LockKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // A poisoned table still has to give the keys back.
        let mut held = match self.locks.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in &self.keys {
            held.remove(key);
        }
    }
}
