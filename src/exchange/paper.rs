//! In-process paper venue.
//!
//! Fills market orders instantly at their request price, rests limit orders
//! in the core ledger, and answers snapshots from its own small stores. Used
//! for dry runs and as the harness venue in tests; it exercises the whole
//! core wiring without any network.

use crate::exchange::{rate_limit, Exchange, PlacementRequest, VenueAdapter};
use crate::model::{split_pair, BalanceEntry, Order, OrderKind, PairInfo, SettleClass, Side};
use crate::runtime::{job, TaskRunner, TaskSpec};
use crate::state::TickerSheet;
use crate::transport::TransportError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// Taker fee charged on market fills, in the received asset.
const PAPER_FEE_RATE: f64 = 0.001;
/// Poll cadence for the built-in account pollers, in Hz.
const POLL_FREQUENCY: f64 = 0.2;

pub struct PaperVenue {
    balances: Mutex<HashMap<String, BalanceEntry>>,
    marks: Mutex<HashMap<String, f64>>,
    fee_rate: f64,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            marks: Mutex::new(HashMap::new()),
            fee_rate: PAPER_FEE_RATE,
        }
    }

    pub fn with_balances(balances: HashMap<String, BalanceEntry>) -> Self {
        Self {
            balances: Mutex::new(balances),
            ..Self::new()
        }
    }

    /// Sets the mark price the ticker snapshot reports for a pair.
    pub fn set_mark(&self, pair: impl Into<String>, price: f64) {
        self.marks.lock().unwrap().insert(pair.into(), price);
    }

    fn all_pairs(core: &Exchange) -> Vec<String> {
        let blueprint = core.blueprint();
        let mut pairs: Vec<String> = blueprint
            .account
            .as_ref()
            .map(|a| a.pairs.clone())
            .unwrap_or_default();
        if let Some(plan) = &blueprint.marketdata {
            for pair in plan.all_pairs() {
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
        }
        pairs
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn rate_limit(&self) -> HashMap<String, u32> {
        HashMap::from([
            (rate_limit::WINDOW_GLOBAL.to_string(), 25),
            (rate_limit::WINDOW_SECOND.to_string(), 10),
            (rate_limit::WINDOW_HOUR.to_string(), 500),
        ])
    }

    async fn place_order(
        &self,
        core: &Exchange,
        request: &PlacementRequest,
    ) -> Result<Value, TransportError> {
        let id = Uuid::new_v4().to_string();
        let mut order = Order::new(
            id.clone(),
            request.pair.clone(),
            request.side,
            request.price,
            request.quantity,
            SettleClass::Balance,
        );
        order.exchange = self.name().to_string();
        core.account.insert_order(order.clone());

        let status = match request.kind {
            OrderKind::Limit => "open",
            OrderKind::Market => {
                let mut filled = order;
                filled.quantity = 0.0;
                let fee = match request.side {
                    Side::Buy => request.quantity * self.fee_rate,
                    Side::Sell => request.price * request.quantity * self.fee_rate,
                };
                core.account.update_order(&id, filled, true, None, fee);
                "filled"
            }
        };
        Ok(json!({ "id": id, "pair": request.pair, "status": status }))
    }

    async fn cancel_order(&self, core: &Exchange, id: &str) -> Result<Value, TransportError> {
        match core.account.remove_order(id, false, None, 0.0) {
            Some(order) => Ok(json!({ "id": id, "pair": order.pair, "status": "cancelled" })),
            None => Err(TransportError::Status {
                status: 404,
                body: format!("unknown order {}", id),
            }),
        }
    }

    async fn replace_order(
        &self,
        core: &Exchange,
        id: &str,
        price: f64,
        quantity: Option<f64>,
    ) -> Result<Value, TransportError> {
        let old = core
            .account
            .get_order(id)
            .ok_or_else(|| TransportError::Status {
                status: 404,
                body: format!("unknown order {}", id),
            })?;
        let mut order = old.clone();
        order.id = Uuid::new_v4().to_string();
        order.price = price;
        order.quantity = quantity.unwrap_or(old.quantity);
        let new_id = order.id.clone();
        core.account.update_order(id, order, false, None, 0.0);
        Ok(json!({ "id": new_id, "old_id": id, "status": "open" }))
    }

    /// Deposits adjusted for resting orders: funds covering an open order
    /// are reported as reserved, the way a real venue would.
    async fn balance_snapshot(
        &self,
        core: &Exchange,
    ) -> Result<Option<HashMap<String, BalanceEntry>>, TransportError> {
        let mut balances = self.balances.lock().unwrap().clone();
        let orders = core.account.dump().orders;
        for order in orders.values().flat_map(|p| p.bid.iter().chain(p.ask.iter())) {
            if order.class != SettleClass::Balance {
                continue;
            }
            let (base, quote) = match split_pair(&order.pair) {
                Some(parts) => parts,
                None => continue,
            };
            let (asset, amount) = match order.side {
                Side::Buy => (quote, order.volume()),
                Side::Sell => (base, order.quantity),
            };
            let entry = balances.entry(asset.to_string()).or_default();
            entry.available -= amount;
            entry.reserved += amount;
        }
        Ok(Some(balances))
    }

    async fn position_snapshot(
        &self,
        _core: &Exchange,
    ) -> Result<Option<HashMap<String, f64>>, TransportError> {
        Ok(Some(HashMap::new()))
    }

    async fn open_orders_snapshot(
        &self,
        core: &Exchange,
    ) -> Result<Option<Vec<Order>>, TransportError> {
        let dump = core.account.dump();
        let orders = dump
            .orders
            .into_values()
            .flat_map(|p| p.bid.into_iter().chain(p.ask))
            .collect();
        Ok(Some(orders))
    }

    async fn ticker_snapshot(
        &self,
        _core: &Exchange,
    ) -> Result<Option<TickerSheet>, TransportError> {
        let marks = self.marks.lock().unwrap().clone();
        if marks.is_empty() {
            return Ok(None);
        }
        Ok(Some(TickerSheet {
            last: Some(marks.clone()),
            bid: Some(marks.clone()),
            ask: Some(marks),
            ..TickerSheet::default()
        }))
    }

    async fn info_snapshot(
        &self,
        core: &Exchange,
    ) -> Result<Option<HashMap<String, PairInfo>>, TransportError> {
        let info = Self::all_pairs(core)
            .into_iter()
            .map(|pair| {
                (
                    pair,
                    PairInfo {
                        price_filter: 0.01,
                        quantity_filter: 0.0001,
                        minimum: 0.0001,
                    },
                )
            })
            .collect();
        Ok(Some(info))
    }

    fn account_poll(&self, core: &Arc<Exchange>) -> HashMap<String, TaskRunner> {
        let mut polls = HashMap::new();
        let refresh = core.refresh();
        let weak = Arc::downgrade(core);

        polls.insert(
            "open_orders".to_string(),
            poller(weak.clone(), refresh.open_orders.clone(), |core| async move {
                core.update_open_orders(None).await;
            }),
        );
        polls.insert(
            "balance".to_string(),
            poller(weak.clone(), refresh.balance.clone(), |core| async move {
                core.update_balance().await;
            }),
        );
        polls.insert(
            "position".to_string(),
            poller(weak.clone(), refresh.position.clone(), |core| async move {
                core.update_position().await;
            }),
        );
        polls.insert(
            "info".to_string(),
            poller(weak, refresh.info.clone(), |core| async move {
                core.update_info().await;
            }),
        );
        polls
    }

    fn marketdata_poll(
        &self,
        core: &Arc<Exchange>,
        _plan: &crate::model::MarketdataPlan,
    ) -> HashMap<String, TaskRunner> {
        let weak = Arc::downgrade(core);
        let ticker = poller(weak, core.refresh().ticker.clone(), |core| async move {
            core.update_ticker().await;
        });
        HashMap::from([("ticker".to_string(), ticker)])
    }
}

/// A low-frequency poller that also fires on its refresh trigger.
fn poller<F, Fut>(
    weak: Weak<Exchange>,
    trigger: Arc<tokio::sync::Notify>,
    run: F,
) -> TaskRunner
where
    F: Fn(Arc<Exchange>) -> Fut + Send + Sync + Copy + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let spec = TaskSpec {
        frequency: Some(POLL_FREQUENCY),
        trigger: Some(trigger),
        ..TaskSpec::default()
    };
    TaskRunner::new(
        job(move || {
            let weak = weak.clone();
            async move {
                if let Some(core) = weak.upgrade() {
                    run(core).await;
                }
            }
        }),
        spec,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Blueprint;
    use crate::model::ExchangeOptions;

    fn blueprint() -> Blueprint {
        serde_json::from_value(serde_json::json!({
            "account": {"keys": ["k"], "secrets": ["s"], "pairs": ["BTC/USD"]}
        }))
        .unwrap()
    }

    fn options() -> ExchangeOptions {
        ExchangeOptions {
            no_poll: true,
            ..ExchangeOptions::default()
        }
    }

    #[tokio::test]
    async fn market_orders_fill_immediately_with_fee() {
        let venue = PaperVenue::with_balances(HashMap::from([(
            "USD".to_string(),
            BalanceEntry::new(10_000.0, 0.0),
        )]));
        let core = Exchange::connect_with(Box::new(venue), blueprint(), options())
            .await
            .unwrap();

        let request = PlacementRequest {
            kind: OrderKind::Market,
            ..PlacementRequest::limit("BTC/USD", Side::Buy, 100.0, 2.0)
        };
        let response = core.place_order(request).await.unwrap().unwrap();
        assert_eq!(response["status"], "filled");

        assert!(!core.account.has_open_orders(None, None));
        let btc = core.account.balance_of("BTC");
        assert_eq!(btc.available, 2.0 - 2.0 * PAPER_FEE_RATE);
    }

    #[tokio::test]
    async fn cancelling_an_unknown_order_is_a_venue_error() {
        let core = Exchange::connect_with(Box::new(PaperVenue::new()), blueprint(), options())
            .await
            .unwrap();
        let err = core.cancel_order("nope").await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn replace_amends_in_place_and_links_ids() {
        let core = Exchange::connect_with(Box::new(PaperVenue::new()), blueprint(), options())
            .await
            .unwrap();
        let placed = core
            .place_order(PlacementRequest::limit("BTC/USD", Side::Buy, 100.0, 1.0))
            .await
            .unwrap()
            .unwrap();
        let id = placed["id"].as_str().unwrap();

        let replaced = core.replace_order(id, 101.0, None).await.unwrap();
        let new_id = replaced["id"].as_str().unwrap();
        let order = core.account.get_order(new_id).unwrap();
        assert_eq!(order.price, 101.0);
        assert_eq!(order.old_id.as_deref(), Some(id));
        assert!(core.account.get_order(id).is_none());
    }
}
