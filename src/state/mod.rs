//! Locally maintained venue state: the account ledger and the market
//! snapshot. Both are updated optimistically from our own actions and
//! reconciled against venue snapshots.

pub mod account;
pub mod marketdata;

pub use account::{
    validate_balance, validate_orders, validate_position, AccountDump, AccountLedger, KeyRing,
    PairOrders,
};
pub use marketdata::{
    BookDelta, MarketSnapshot, MarketdataDump, TickerSheet, TickerUpdate, TopOfBook,
};
