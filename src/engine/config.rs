//! Engine configuration options.

use crate::types::Quote;
use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of events to retain in memory.
    pub max_events: usize,
    /// Filled and cancelled orders kept for lookup after leaving the book.
    pub max_order_history: usize,
    /// Initial insurance fund balance.
    pub insurance_seed: Quote,
    /// Verify ledger and book invariants after every operation.
    pub check_invariants: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            max_order_history: 10_000,
            insurance_seed: Quote::zero(),
            check_invariants: true,
        }
    }
}
