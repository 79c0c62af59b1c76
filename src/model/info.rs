use serde::{Deserialize, Serialize};

/// Venue-reported trading filters for one pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PairInfo {
    /// Tick size: prices must be a multiple of this.
    #[serde(default)]
    pub price_filter: f64,
    /// Lot size: quantities must be a multiple of this.
    #[serde(default)]
    pub quantity_filter: f64,
    /// Minimum order quantity.
    #[serde(default)]
    pub minimum: f64,
}
