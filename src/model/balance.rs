use serde::{Deserialize, Serialize};

/// Per-currency balance entry.
///
/// `available` and `reserved` are non-negative in steady state. They may go
/// transiently negative under concurrent partial updates and self-correct on
/// the next reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub available: f64,
    pub reserved: f64,
}

impl BalanceEntry {
    pub fn new(available: f64, reserved: f64) -> Self {
        Self {
            available,
            reserved,
        }
    }

    pub fn total(&self) -> f64 {
        self.available + self.reserved
    }
}
