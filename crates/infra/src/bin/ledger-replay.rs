//! Rebuild balances from an exported movement journal.
//!
//! Usage: `ledger-replay [journal.json | -]` (stdin when omitted). Prints the
//! rebuilt balance rows as JSON on stdout; logs go to stderr.

use std::io::Read;

use anyhow::{Context, Result};
use lonerp_infra::replay::replay_journal_json;
use lonerp_inventory::BalanceFilter;

fn main() -> Result<()> {
    lonerp_observability::init();

    let json = match std::env::args().nth(1).filter(|arg| arg != "-") {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read journal {path}"))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read journal from stdin")?;
            buf
        }
    };

    let store = replay_journal_json(&json).context("journal replay failed")?;
    let rows = store.list(&BalanceFilter::all());
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
