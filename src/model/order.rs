use serde::{Deserialize, Serialize};

/// Remaining quantities at or below this cutoff are treated as fully
/// filled/cancelled.
pub const DUST_QUANTITY: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The book side a resting order of this side lives on.
    pub fn book_side(&self) -> BookSide {
        match self {
            Side::Buy => BookSide::Bid,
            Side::Sell => BookSide::Ask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// How an order settles: against the spot balance or a margin position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleClass {
    Balance,
    Margin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

/// An open order as mirrored by the account ledger.
///
/// The `id` is venue-assigned and opaque. `quantity` is the remaining
/// (unfilled) quantity, not the original one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(default)]
    pub exchange: String,
    pub id: String,
    pub pair: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    #[serde(rename = "type")]
    pub class: SettleClass,
    /// Optional client-assigned tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Previous venue id, set when an amend replaced this order in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_id: Option<String>,
}

impl Order {
    pub fn new(
        id: impl Into<String>,
        pair: impl Into<String>,
        side: Side,
        price: f64,
        quantity: f64,
        class: SettleClass,
    ) -> Self {
        Self {
            exchange: String::new(),
            id: id.into(),
            pair: pair.into(),
            side,
            price,
            quantity,
            class,
            tag: None,
            old_id: None,
        }
    }

    /// Notional volume (price x remaining quantity) in the quote asset.
    pub fn volume(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Splits a "BASE/QUOTE" pair into its two assets.
pub fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let mut parts = pair.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(base), Some(quote)) if !base.is_empty() && !quote.is_empty() => Some((base, quote)),
        _ => None,
    }
}
