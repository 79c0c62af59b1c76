//! Common data types shared across the engine.

pub mod balance;
pub mod blueprint;
pub mod info;
pub mod order;

pub use balance::BalanceEntry;
pub use blueprint::{AccountPlan, Blueprint, Channel, ExchangeOptions, MarketdataPlan};
pub use info::PairInfo;
pub use order::{split_pair, BookSide, Order, OrderKind, SettleClass, Side, DUST_QUANTITY};
