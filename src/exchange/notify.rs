//! Outbound notifications and per-subscriber filtering.
//!
//! Every notification carries the event-specific update plus a full dump of
//! the account ledger and the market snapshot, so subscribers never need a
//! follow-up query to see the state the event produced.

use crate::state::{AccountDump, MarketdataDump};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A subscriber was registered; always delivered.
    Subscription,
    Trade,
    Book,
    Quote,
    Orders,
    Balance,
    Position,
    /// Our own order traded.
    Buy,
    /// Our own order traded.
    Sell,
    Place,
    Replace,
    Cancel,
    RateLimit,
    Verify,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Websocket,
    Rest,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Unix timestamp in seconds.
    pub timestamp: f64,
    pub exchange: String,
    pub event: EventKind,
    pub update: Option<Value>,
    pub from: Origin,
    /// Round-trip seconds for REST-born events, zero otherwise.
    pub elapsed: f64,
    pub account: AccountDump,
    pub marketdata: MarketdataDump,
    pub info: Value,
    /// The raw venue payload the event was decoded from.
    pub raw: String,
}

impl Notification {
    pub fn now() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

/// What a subscriber wants to hear about. Each field is `None` when the
/// subscriber did not ask for that class at all, otherwise the set of pairs
/// it cares about.
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub trade: Option<HashSet<String>>,
    pub book: Option<HashSet<String>>,
    pub quote: Option<HashSet<String>>,
    /// Account events, scoped to these pairs where the event names one.
    pub account: Option<HashSet<String>>,
}

impl NotificationFilter {
    pub fn all(pairs: impl IntoIterator<Item = String>) -> Self {
        let set: HashSet<String> = pairs.into_iter().collect();
        Self {
            trade: Some(set.clone()),
            book: Some(set.clone()),
            quote: Some(set.clone()),
            account: Some(set),
        }
    }

    pub fn accepts(&self, notification: &Notification) -> bool {
        match notification.event {
            EventKind::Subscription => true,
            EventKind::Trade => self
                .trade
                .as_ref()
                .map(|set| update_pair_in(notification, set))
                .unwrap_or(false),
            // Book and quote updates are keyed by pair in the update map.
            EventKind::Book => self
                .book
                .as_ref()
                .map(|set| any_update_key_in(notification, set))
                .unwrap_or(false),
            EventKind::Quote => self
                .quote
                .as_ref()
                .map(|set| any_update_key_in(notification, set))
                .unwrap_or(false),
            _ => match &self.account {
                None => false,
                Some(set) => match notification.event {
                    EventKind::Buy
                    | EventKind::Sell
                    | EventKind::Place
                    | EventKind::Replace
                    | EventKind::Cancel => update_pair_in(notification, set),
                    EventKind::RateLimit => notification
                        .update
                        .as_ref()
                        .and_then(|u| u.get("inputs"))
                        .and_then(|inputs| inputs.get("pair"))
                        .and_then(Value::as_str)
                        .map(|pair| set.contains(pair))
                        .unwrap_or(true),
                    // Orders, balance, position, verify and error events are
                    // not pair-scoped.
                    _ => true,
                },
            },
        }
    }
}

fn update_pair_in(notification: &Notification, set: &HashSet<String>) -> bool {
    notification
        .update
        .as_ref()
        .and_then(|u| u.get("pair"))
        .and_then(Value::as_str)
        .map(|pair| set.contains(pair))
        .unwrap_or(false)
}

fn any_update_key_in(notification: &Notification, set: &HashSet<String>) -> bool {
    notification
        .update
        .as_ref()
        .and_then(Value::as_object)
        .map(|map| map.keys().any(|key| set.contains(key)))
        .unwrap_or(false)
}
