//! The shared exchange core.
//!
//! An [`Exchange`] wires one venue adapter to the local state stores, the
//! transports and the notification fan-out. Consumers subscribe with a
//! filter and receive every event with full account and market dumps
//! attached; order placement goes through price/quantity filtering and the
//! rate limiter before it reaches the adapter.

pub mod notify;
pub mod paper;
pub mod rate_limit;
pub mod registry;
pub mod venue;

pub use notify::{EventKind, Notification, NotificationFilter, Origin};
pub use paper::PaperVenue;
pub use rate_limit::RateLimiter;
pub use registry::{AdapterCtor, VenueRegistry, VENUES};
pub use venue::{PlacementRequest, VenueAdapter};

use crate::model::{Blueprint, Channel, ExchangeOptions, PairInfo};
use crate::runtime::TaskRunner;
use crate::state::{
    validate_balance, validate_orders, validate_position, AccountLedger, MarketSnapshot,
};
use crate::transport::{ConnectionSupervisor, FeedRaceSelector, MessageHandler, RestClient,
    TransportError};
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const BARRIER_INITIAL_WAIT: Duration = Duration::from_secs(2);
const BARRIER_RETRY: Duration = Duration::from_secs(5);
const CANCEL_ALL_BACKOFF: Duration = Duration::from_secs(2);

/// Callback invoked for every notification a subscriber's filter accepts.
pub type NotificationCallback = Arc<dyn Fn(Arc<Notification>) + Send + Sync>;

struct Subscriber {
    filter: NotificationFilter,
    callback: NotificationCallback,
}

/// The marketdata feed a venue brought up: one supervised connection or a
/// racing pool.
pub enum MarketFeed {
    Single(ConnectionSupervisor),
    Raced(FeedRaceSelector),
}

impl MarketFeed {
    fn close(&self) {
        match self {
            MarketFeed::Single(ws) => {
                ws.close();
                ws.shutdown();
            }
            MarketFeed::Raced(pool) => pool.close(),
        }
    }
}

/// Triggers that make the corresponding poller run out of schedule.
#[derive(Default)]
pub struct RefreshTriggers {
    pub open_orders: Arc<Notify>,
    pub balance: Arc<Notify>,
    pub position: Arc<Notify>,
    pub ticker: Arc<Notify>,
    pub info: Arc<Notify>,
}

/// Everything the core keeps alive: sockets, pollers and consumer tasks.
#[derive(Default)]
struct Links {
    marketdata_ws: Option<MarketFeed>,
    account_ws: Option<ConnectionSupervisor>,
    polls: HashMap<String, TaskRunner>,
    limiter_decay: Option<TaskRunner>,
    book_consumers: Vec<JoinHandle<()>>,
}

pub struct Exchange {
    name: String,
    adapter: Box<dyn VenueAdapter>,
    blueprint: Blueprint,
    options: ExchangeOptions,
    pub account: AccountLedger,
    pub marketdata: MarketSnapshot,
    info: Mutex<HashMap<String, PairInfo>>,
    limiter: RateLimiter,
    marketdata_rest: Option<Arc<RestClient>>,
    account_rest: Option<Arc<RestClient>>,
    subscribers: Mutex<Vec<Subscriber>>,
    refresh: RefreshTriggers,
    links: Mutex<Links>,
}

impl Exchange {
    /// Connects a venue by registry name.
    pub async fn connect(
        name: &str,
        blueprint: Blueprint,
        options: ExchangeOptions,
    ) -> Result<Arc<Self>> {
        let adapter = VENUES
            .build(name)
            .ok_or_else(|| anyhow!("unknown venue {}", name))?;
        Self::connect_with(adapter, blueprint, options).await
    }

    /// Connects with an explicit adapter, bringing up every transport the
    /// blueprint asks for and (unless `quick`) waiting for the account
    /// mirror to be seeded.
    pub async fn connect_with(
        adapter: Box<dyn VenueAdapter>,
        blueprint: Blueprint,
        options: ExchangeOptions,
    ) -> Result<Arc<Self>> {
        let (keys, secrets) = blueprint
            .account
            .as_ref()
            .map(|a| (a.keys.clone(), a.secrets.clone()))
            .unwrap_or_default();
        let limiter = RateLimiter::new(adapter.rate_limit());
        let core = Arc::new(Self {
            name: adapter.name().to_string(),
            marketdata_rest: adapter.marketdata_rest().map(Arc::new),
            account_rest: adapter.account_rest().map(Arc::new),
            adapter,
            blueprint,
            options,
            account: AccountLedger::new(keys, secrets),
            marketdata: MarketSnapshot::new(),
            info: Mutex::new(HashMap::new()),
            limiter,
            subscribers: Mutex::new(Vec::new()),
            refresh: RefreshTriggers::default(),
            links: Mutex::new(Links::default()),
        });
        info!("[{}] connecting", core.name);

        let mut links = Links::default();
        if let Some(plan) = core.blueprint.marketdata.clone().filter(|p| !p.is_empty()) {
            for pair in &plan.book {
                links
                    .book_consumers
                    .push(spawn_book_consumer(&core, pair.clone()));
            }
            links.marketdata_ws = core.adapter.marketdata_websocket(&core, &plan);
            if !core.options.no_poll {
                links.polls.extend(core.adapter.marketdata_poll(&core, &plan));
            }
        }
        if core.blueprint.has_account() {
            let pairs = core
                .blueprint
                .account
                .as_ref()
                .map(|a| a.pairs.clone())
                .unwrap_or_default();
            links.account_ws = core.adapter.account_websocket(&core, &pairs);
            if !core.options.no_poll {
                links.polls.extend(core.adapter.account_poll(&core));
            }
        }
        if core.limiter.is_enabled() {
            links.limiter_decay = Some(spawn_limiter_decay(&core));
        }
        *core.links.lock().unwrap() = links;

        if core.blueprint.has_account() && !core.options.quick {
            core.barrier().await;
        }
        Ok(core)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.options
    }

    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    pub fn refresh(&self) -> &RefreshTriggers {
        &self.refresh
    }

    pub fn marketdata_rest(&self) -> Option<Arc<RestClient>> {
        self.marketdata_rest.clone()
    }

    pub fn account_rest(&self) -> Option<Arc<RestClient>> {
        self.account_rest.clone()
    }

    pub fn has_account(&self) -> bool {
        self.blueprint.has_account()
    }

    pub fn has_marketdata_channel(&self, channel: Channel, pair: Option<&str>) -> bool {
        self.blueprint.has_marketdata_channel(channel, pair)
    }

    pub fn info(&self, pair: &str) -> Option<PairInfo> {
        self.info.lock().unwrap().get(pair).copied()
    }

    /// Handler closure for the venue's marketdata socket. Holds the core
    /// weakly so a dropped exchange stops its sockets.
    pub fn handler_for_marketdata(core: &Arc<Self>) -> MessageHandler {
        let weak = Arc::downgrade(core);
        Arc::new(move |raw| {
            if let Some(core) = weak.upgrade() {
                core.adapter.marketdata_handler(&core, raw);
            }
        })
    }

    pub fn handler_for_account(core: &Arc<Self>) -> MessageHandler {
        let weak = Arc::downgrade(core);
        Arc::new(move |raw| {
            if let Some(core) = weak.upgrade() {
                core.adapter.account_handler(&core, raw);
            }
        })
    }

    /// Registers a subscriber and acknowledges it with a subscription event.
    pub fn subscribe(&self, filter: NotificationFilter, callback: NotificationCallback) {
        let count = {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.push(Subscriber { filter, callback });
            subscribers.len()
        };
        self.notify(
            EventKind::Subscription,
            Some(json!({ "subscribers": count })),
            Origin::Rest,
            0.0,
            "",
        );
    }

    /// Builds a notification with full state dumps and fans it out to every
    /// matching subscriber, synchronously and in registration order.
    pub fn notify(
        &self,
        event: EventKind,
        update: Option<Value>,
        from: Origin,
        elapsed: f64,
        raw: impl Into<String>,
    ) {
        let info = serde_json::to_value(&*self.info.lock().unwrap()).unwrap_or(Value::Null);
        let notification = Arc::new(Notification {
            timestamp: Notification::now(),
            exchange: self.name.clone(),
            event,
            update,
            from,
            elapsed,
            account: self.account.dump(),
            marketdata: self.marketdata.dump(),
            info,
            raw: raw.into(),
        });
        {
            let subscribers = self.subscribers.lock().unwrap();
            for subscriber in subscribers.iter() {
                if subscriber.filter.accepts(&notification) {
                    (subscriber.callback)(notification.clone());
                }
            }
        }
        match event {
            EventKind::Error => error!(
                "[{}] {:?}: {}",
                self.name,
                event,
                notification.update.as_ref().unwrap_or(&Value::Null)
            ),
            EventKind::Verify | EventKind::Subscription => {}
            _ => debug!("[{}] {:?} notified", self.name, event),
        }
    }

    pub fn notify_error(&self, call: &str, inputs: Value, error: &TransportError) {
        self.notify(
            EventKind::Error,
            Some(json!({
                "call": call,
                "inputs": inputs,
                "message": error.to_string(),
            })),
            Origin::Rest,
            0.0,
            "",
        );
    }

    /// Refreshes pair trading rules from the venue. Returns whether
    /// anything was stored.
    pub async fn update_info(&self) -> bool {
        match self.adapter.info_snapshot(self).await {
            Ok(Some(info)) => {
                *self.info.lock().unwrap() = info;
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.notify_error("info", Value::Null, &e);
                false
            }
        }
    }

    /// Refreshes the ticker sheet from the venue and notifies with the
    /// affected tops of book.
    pub async fn update_ticker(&self) -> bool {
        let sheet = match self.adapter.ticker_snapshot(self).await {
            Ok(Some(sheet)) => sheet,
            Ok(None) => return false,
            Err(e) => {
                self.notify_error("ticker", Value::Null, &e);
                return false;
            }
        };
        let mut pairs: Vec<String> = Vec::new();
        for map in [&sheet.last, &sheet.bid, &sheet.ask] {
            if let Some(map) = map {
                for pair in map.keys() {
                    if !pairs.contains(pair) {
                        pairs.push(pair.clone());
                    }
                }
            }
        }
        self.marketdata.set_market_data(sheet);

        let mut update = serde_json::Map::new();
        for pair in pairs {
            if let Some(top) = self.marketdata.top_of_book(&pair) {
                update.insert(pair, serde_json::to_value(top).unwrap_or(Value::Null));
            }
        }
        self.notify(
            EventKind::Quote,
            Some(Value::Object(update)),
            Origin::Rest,
            0.0,
            "",
        );
        true
    }

    pub async fn update_balance(&self) -> bool {
        match self.adapter.balance_snapshot(self).await {
            Ok(Some(balance)) => {
                let update = serde_json::to_value(&balance).unwrap_or(Value::Null);
                self.account.set_balance(balance);
                self.notify(EventKind::Balance, Some(update), Origin::Rest, 0.0, "");
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.notify_error("balance", Value::Null, &e);
                false
            }
        }
    }

    pub async fn update_position(&self) -> bool {
        match self.adapter.position_snapshot(self).await {
            Ok(Some(position)) => {
                let update = serde_json::to_value(&position).unwrap_or(Value::Null);
                self.account.set_position(position);
                self.notify(EventKind::Position, Some(update), Origin::Rest, 0.0, "");
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.notify_error("position", Value::Null, &e);
                false
            }
        }
    }

    /// Refreshes the open-order mirror, optionally scoped to one pair.
    pub async fn update_open_orders(&self, pair: Option<&str>) -> bool {
        match self.adapter.open_orders_snapshot(self).await {
            Ok(Some(orders)) => {
                let update = serde_json::to_value(&orders).unwrap_or(Value::Null);
                self.account.set_open_orders(orders, pair);
                self.notify(EventKind::Orders, Some(update), Origin::Rest, 0.0, "");
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.notify_error("open_orders", Value::Null, &e);
                false
            }
        }
    }

    /// Compares the local mirror against fresh venue snapshots without
    /// overwriting anything, and reports each comparison as a verify event.
    /// Returns whether every available comparison came back clean.
    pub async fn verify_account_data(&self) -> bool {
        let dump = self.account.dump();
        let mut clean = true;

        match self.adapter.balance_snapshot(self).await {
            Ok(Some(external)) => {
                let mismatched = validate_balance(&dump.balance, &external);
                clean &= mismatched.is_empty();
                self.notify(
                    EventKind::Verify,
                    Some(json!({ "target": "balance", "mismatched": mismatched })),
                    Origin::Rest,
                    0.0,
                    "",
                );
            }
            Ok(None) => {}
            Err(e) => {
                clean = false;
                self.notify_error("verify_balance", Value::Null, &e);
            }
        }
        match self.adapter.position_snapshot(self).await {
            Ok(Some(external)) => {
                let mismatched = validate_position(&dump.position, &external);
                clean &= mismatched.is_empty();
                self.notify(
                    EventKind::Verify,
                    Some(json!({ "target": "position", "mismatched": mismatched })),
                    Origin::Rest,
                    0.0,
                    "",
                );
            }
            Ok(None) => {}
            Err(e) => {
                clean = false;
                self.notify_error("verify_position", Value::Null, &e);
            }
        }
        match self.adapter.open_orders_snapshot(self).await {
            Ok(Some(external)) => {
                let ours: Vec<_> = dump
                    .orders
                    .values()
                    .flat_map(|p| p.bid.iter().chain(p.ask.iter()).cloned())
                    .collect();
                let mismatched = validate_orders(&ours, &external);
                clean &= mismatched.is_empty();
                self.notify(
                    EventKind::Verify,
                    Some(json!({ "target": "orders", "mismatched": mismatched })),
                    Origin::Rest,
                    0.0,
                    "",
                );
            }
            Ok(None) => {}
            Err(e) => {
                clean = false;
                self.notify_error("verify_orders", Value::Null, &e);
            }
        }
        clean
    }

    /// Rounds a price down to the pair's tick size, fetching trading rules
    /// on first use.
    pub async fn filter_price(&self, pair: &str, price: f64) -> f64 {
        let info = self.pair_info_lazy(pair).await;
        floor_to_step(price, info.map(|i| i.price_filter).unwrap_or(0.0))
    }

    /// Rounds a quantity down to the pair's lot size.
    pub async fn filter_quantity(&self, pair: &str, quantity: f64) -> f64 {
        let info = self.pair_info_lazy(pair).await;
        floor_to_step(quantity, info.map(|i| i.quantity_filter).unwrap_or(0.0))
    }

    async fn pair_info_lazy(&self, pair: &str) -> Option<PairInfo> {
        if let Some(info) = self.info(pair) {
            return Some(info);
        }
        self.update_info().await;
        self.info(pair)
    }

    /// Places an order through the adapter, rounding price and quantity to
    /// the pair's filters first. `Ok(None)` means the rate limiter refused
    /// the placement; that refusal is itself notified.
    pub async fn place_order(
        &self,
        request: PlacementRequest,
    ) -> Result<Option<Value>, TransportError> {
        let mut request = request;
        request.price = self.filter_price(&request.pair, request.price).await;
        request.quantity = self.filter_quantity(&request.pair, request.quantity).await;

        let inputs = json!({
            "pair": request.pair,
            "side": request.side,
            "price": request.price,
            "quantity": request.quantity,
        });
        if !self.limiter.can_place(&request.pair) {
            warn!("[{}] rate limiter refused placement on {}", self.name, request.pair);
            self.notify(
                EventKind::RateLimit,
                Some(json!({
                    "call": "place_order",
                    "inputs": inputs,
                    "counters": self.limiter.counters(),
                })),
                Origin::Rest,
                0.0,
                "",
            );
            return Ok(None);
        }
        self.limiter.record(&request.pair);

        match self.adapter.place_order(self, &request).await {
            Ok(response) => {
                self.notify(
                    EventKind::Place,
                    Some(json!({
                        "pair": request.pair,
                        "side": request.side,
                        "price": request.price,
                        "quantity": request.quantity,
                        "response": response,
                    })),
                    Origin::Rest,
                    0.0,
                    "",
                );
                Ok(Some(response))
            }
            Err(e) => {
                self.notify_error("place_order", inputs, &e);
                Err(e)
            }
        }
    }

    pub async fn cancel_order(&self, id: &str) -> Result<Value, TransportError> {
        let pair = self.account.get_order(id).map(|o| o.pair);
        match self.adapter.cancel_order(self, id).await {
            Ok(response) => {
                self.notify(
                    EventKind::Cancel,
                    Some(json!({ "id": id, "pair": pair, "response": response })),
                    Origin::Rest,
                    0.0,
                    "",
                );
                Ok(response)
            }
            Err(e) => {
                self.notify_error("cancel_order", json!({ "id": id }), &e);
                Err(e)
            }
        }
    }

    pub async fn replace_order(
        &self,
        id: &str,
        price: f64,
        quantity: Option<f64>,
    ) -> Result<Value, TransportError> {
        let pair = self.account.get_order(id).map(|o| o.pair);
        let price = match &pair {
            Some(pair) => self.filter_price(pair, price).await,
            None => price,
        };
        match self.adapter.replace_order(self, id, price, quantity).await {
            Ok(response) => {
                self.notify(
                    EventKind::Replace,
                    Some(json!({
                        "id": id,
                        "pair": pair,
                        "price": price,
                        "quantity": quantity,
                        "response": response,
                    })),
                    Origin::Rest,
                    0.0,
                    "",
                );
                Ok(response)
            }
            Err(e) => {
                self.notify_error("replace_order", json!({ "id": id, "price": price }), &e);
                Err(e)
            }
        }
    }

    /// Cancels until the open-order mirror is empty, scoped to one pair when
    /// given, backing off between rounds so fills and venue confirmations
    /// can land.
    pub async fn cancel_all_orders(&self, pair: Option<&str>) {
        loop {
            let ids = self.account.open_order_ids(pair);
            if ids.is_empty() {
                return;
            }
            info!("[{}] cancelling {} open orders", self.name, ids.len());
            for id in ids {
                let _ = self.cancel_order(&id).await;
            }
            self.refresh.open_orders.notify_one();
            tokio::time::sleep(CANCEL_ALL_BACKOFF).await;
        }
    }

    /// Blocks until the account mirror has been seeded by venue snapshots,
    /// kicking the account pollers while it waits.
    pub async fn barrier(&self) {
        tokio::time::sleep(BARRIER_INITIAL_WAIT).await;
        while !self.account.is_ready() {
            debug!("[{}] waiting for account snapshots", self.name);
            self.refresh.open_orders.notify_one();
            self.refresh.balance.notify_one();
            self.refresh.position.notify_one();
            tokio::time::sleep(BARRIER_RETRY).await;
        }
        info!("[{}] account mirror ready", self.name);
    }

    /// Tears down sockets, pollers and consumer tasks.
    pub fn shutdown(&self) {
        let mut links = self.links.lock().unwrap();
        if let Some(feed) = links.marketdata_ws.take() {
            feed.close();
        }
        if let Some(ws) = links.account_ws.take() {
            ws.close();
            ws.shutdown();
        }
        for (_, poll) in links.polls.drain() {
            poll.shutdown();
        }
        if let Some(decay) = links.limiter_decay.take() {
            decay.shutdown();
        }
        for task in links.book_consumers.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drains one pair's book-delta queue, applies each delta and notifies on
/// top-of-book changes (or every touch with `book_depth`).
fn spawn_book_consumer(core: &Arc<Exchange>, pair: String) -> JoinHandle<()> {
    let weak = Arc::downgrade(core);
    tokio::spawn(async move {
        let mut rx = match weak.upgrade().and_then(|c| c.marketdata.take_book_consumer(&pair)) {
            Some(rx) => rx,
            None => return,
        };
        while let Some(delta) = rx.recv().await {
            let core = match weak.upgrade() {
                Some(core) => core,
                None => return,
            };
            let changed = core.marketdata.apply(delta);
            if !changed && !core.options().book_depth {
                continue;
            }
            let mut update = serde_json::Map::new();
            if let Some(top) = core.marketdata.top_of_book(&pair) {
                update.insert(
                    pair.clone(),
                    serde_json::to_value(top).unwrap_or(Value::Null),
                );
            }
            if core.options().book_depth {
                if let Some(book) = core.marketdata.book(&pair) {
                    update.insert(
                        format!("{}:depth", pair),
                        serde_json::to_value(book).unwrap_or(Value::Null),
                    );
                }
            }
            core.notify(
                EventKind::Book,
                Some(Value::Object(update)),
                Origin::Websocket,
                0.0,
                "",
            );
        }
    })
}

/// 1 Hz decay tick for the rate limiter.
fn spawn_limiter_decay(core: &Arc<Exchange>) -> TaskRunner {
    use crate::runtime::{job, TaskSpec};
    let weak = Arc::downgrade(core);
    TaskRunner::new(
        job(move || {
            let weak = weak.clone();
            async move {
                if let Some(core) = weak.upgrade() {
                    core.limiter.decay();
                }
            }
        }),
        TaskSpec::periodic(1.0),
    )
}

/// Rounds down to a multiple of `step`. A zero or negative step leaves the
/// value untouched. Decimal arithmetic avoids float residue like
/// `0.30000000000000004`.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 || value <= 0.0 {
        return value;
    }
    let (value_d, step_d) = match (Decimal::from_f64(value), Decimal::from_f64(step)) {
        (Some(v), Some(s)) if !s.is_zero() => (v, s),
        _ => return value,
    };
    ((value_d / step_d).floor() * step_d)
        .to_f64()
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_to_venue_steps_without_float_residue() {
        assert_eq!(floor_to_step(100.07, 0.05), 100.05);
        assert_eq!(floor_to_step(0.123456, 0.0001), 0.1234);
        assert_eq!(floor_to_step(42.0, 0.0), 42.0);
        assert_eq!(floor_to_step(0.3, 0.1), 0.3);
    }
}
