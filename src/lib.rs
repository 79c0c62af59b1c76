//! # Venue Core Library
//!
//! Resilient exchange connectivity: supervised websockets, self-healing
//! pollers, a locally mirrored account ledger and market snapshot, and a
//! filtered notification fan-out, all behind a per-venue adapter trait.
//!
//! ## Modules
//! - `model`: Orders, balances, pair info and the connection blueprint.
//! - `runtime`: Self-healing periodic/triggered task execution.
//! - `transport`: REST client, websocket supervisor and the feed race selector.
//! - `state`: The account ledger and the market snapshot.
//! - `exchange`: The shared core, notifications, rate limiting and the venue
//!   registry.

pub mod exchange;
pub mod model;
pub mod runtime;
pub mod state;
pub mod transport;

pub use exchange::{
    EventKind, Exchange, Notification, NotificationFilter, Origin, PlacementRequest, VenueAdapter,
    VENUES,
};
pub use model::{Blueprint, ExchangeOptions, Order, OrderKind, SettleClass, Side};
