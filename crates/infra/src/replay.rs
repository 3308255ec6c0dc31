//! Journal import and balance rebuild.
//!
//! The exported journal is the recovery format: balances are a materialised
//! view over it and can always be rebuilt from it.

use lonerp_core::{LedgerError, LedgerResult};
use lonerp_inventory::{BalanceStore, InventoryMovement};
use tracing::info;

/// Parse an exported journal and check its numbering is gap-free from 1.
pub fn load_journal(json: &str) -> LedgerResult<Vec<InventoryMovement>> {
    let mut journal: Vec<InventoryMovement> = serde_json::from_str(json)
        .map_err(|e| LedgerError::validation(format!("malformed journal: {e}")))?;
    journal.sort_by_key(|m| m.number);

    for (expected, movement) in (1u64..).zip(&journal) {
        if movement.number != expected {
            return Err(LedgerError::validation(format!(
                "journal numbering breaks at movement {}: expected {expected}",
                movement.number
            )));
        }
        movement.line.validate()?;
    }
    Ok(journal)
}

/// Rebuild balances from an exported journal.
pub fn replay_journal_json(json: &str) -> LedgerResult<BalanceStore> {
    let journal = load_journal(json)?;
    let store = BalanceStore::replay(&journal)?;
    info!(movements = journal.len(), rows = store.len(), "journal replayed");
    Ok(store)
}
