//! Venue adapter contract.
//!
//! Everything venue-specific lives behind this trait: wire formats, REST
//! paths, authentication, symbol conventions. The shared `Exchange` core
//! never branches on a venue name; it calls through the trait and the
//! adapter calls back into the core's state stores and notifiers. Defaults
//! are deliberately loud so a partially wired adapter shows up in the logs
//! instead of silently dropping data.
//!
//! Wiring methods (`*_websocket`, `*_poll`) receive the core as an `Arc` so
//! adapters can hold it weakly from spawned tasks; data methods only need a
//! reference.

use crate::exchange::{Exchange, MarketFeed};
use crate::model::{BalanceEntry, Order, OrderKind, PairInfo, Side};
use crate::runtime::TaskRunner;
use crate::state::TickerSheet;
use crate::transport::{ConnectionSupervisor, RestClient, TransportError};
use async_trait::async_trait;
use log::error;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything needed to place one order, already price/quantity filtered.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub pair: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub kind: OrderKind,
    pub leverage: Option<f64>,
}

impl PlacementRequest {
    pub fn limit(pair: impl Into<String>, side: Side, price: f64, quantity: f64) -> Self {
        Self {
            pair: pair.into(),
            side,
            price,
            quantity,
            kind: OrderKind::Limit,
            leverage: None,
        }
    }
}

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decodes one raw marketdata frame and feeds the core's stores. The
    /// default rejects everything loudly.
    fn marketdata_handler(&self, _core: &Exchange, raw: &str) {
        error!("[{}] unhandled marketdata message: {}", self.name(), raw);
    }

    /// Decodes one raw account frame and feeds the core's ledger.
    fn account_handler(&self, _core: &Exchange, raw: &str) {
        error!("[{}] unhandled account message: {}", self.name(), raw);
    }

    /// Builds the marketdata feed for the plan, racing connections when the
    /// options ask for it. `None` means this venue has no marketdata socket.
    fn marketdata_websocket(
        &self,
        _core: &Arc<Exchange>,
        _plan: &crate::model::MarketdataPlan,
    ) -> Option<MarketFeed> {
        None
    }

    fn account_websocket(
        &self,
        _core: &Arc<Exchange>,
        _pairs: &[String],
    ) -> Option<ConnectionSupervisor> {
        None
    }

    fn marketdata_rest(&self) -> Option<RestClient> {
        None
    }

    fn account_rest(&self) -> Option<RestClient> {
        None
    }

    /// Named polling tasks for marketdata, typically one per channel.
    fn marketdata_poll(
        &self,
        _core: &Arc<Exchange>,
        _plan: &crate::model::MarketdataPlan,
    ) -> HashMap<String, TaskRunner> {
        HashMap::new()
    }

    /// Named polling tasks for account state, typically bound to the core's
    /// refresh triggers.
    fn account_poll(&self, _core: &Arc<Exchange>) -> HashMap<String, TaskRunner> {
        HashMap::new()
    }

    async fn place_order(
        &self,
        _core: &Exchange,
        _request: &PlacementRequest,
    ) -> Result<Value, TransportError> {
        error!("[{}] place_order is not wired", self.name());
        Err(TransportError::Unsupported { call: "place_order" })
    }

    async fn cancel_order(&self, _core: &Exchange, _id: &str) -> Result<Value, TransportError> {
        error!("[{}] cancel_order is not wired", self.name());
        Err(TransportError::Unsupported { call: "cancel_order" })
    }

    /// Amends price and, when given, quantity of a resting order.
    async fn replace_order(
        &self,
        _core: &Exchange,
        _id: &str,
        _price: f64,
        _quantity: Option<f64>,
    ) -> Result<Value, TransportError> {
        error!("[{}] replace_order is not wired", self.name());
        Err(TransportError::Unsupported {
            call: "replace_order",
        })
    }

    /// Venue balance snapshot. `Ok(None)` means the venue has no such call.
    async fn balance_snapshot(
        &self,
        _core: &Exchange,
    ) -> Result<Option<HashMap<String, BalanceEntry>>, TransportError> {
        Ok(None)
    }

    async fn position_snapshot(
        &self,
        _core: &Exchange,
    ) -> Result<Option<HashMap<String, f64>>, TransportError> {
        Ok(None)
    }

    async fn open_orders_snapshot(
        &self,
        _core: &Exchange,
    ) -> Result<Option<Vec<Order>>, TransportError> {
        Ok(None)
    }

    async fn ticker_snapshot(
        &self,
        _core: &Exchange,
    ) -> Result<Option<TickerSheet>, TransportError> {
        Ok(None)
    }

    /// Pair trading rules: price and quantity steps, minimum size.
    async fn info_snapshot(
        &self,
        _core: &Exchange,
    ) -> Result<Option<HashMap<String, PairInfo>>, TransportError> {
        Ok(None)
    }

    async fn candles(
        &self,
        _core: &Exchange,
        _pair: &str,
        _window: u64,
    ) -> Result<Value, TransportError> {
        Err(TransportError::Unsupported { call: "candles" })
    }

    async fn trades(
        &self,
        _core: &Exchange,
        _pair: &str,
        _window: u64,
    ) -> Result<Value, TransportError> {
        Err(TransportError::Unsupported { call: "trades" })
    }

    /// Placement ceilings for the rate limiter. Empty disables limiting.
    fn rate_limit(&self) -> HashMap<String, u32> {
        HashMap::new()
    }
}
