//! Process-wide logging setup for ledger binaries and tests.

/// Initialize process-wide logging (JSON, `RUST_LOG`, default `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub use crate::tracing::{LogFormat, init_with};

/// Tracing subscriber configuration (format, filters).
pub mod tracing;
