//! Market snapshot: last trades, top of book and full price-level books.
//!
//! Book deltas arrive on websocket handler threads and are queued per pair
//! into unbounded channels; a consumer task per pair drains its channel and
//! applies the deltas, so slow consumers never stall the socket. Trade
//! notifications are deduplicated with a relative tolerance so a stream of
//! near-identical prints does not flood subscribers.

use crate::model::{BookSide, Side};
use log::warn;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// One change to a pair's book: a full snapshot or a single level.
#[derive(Debug, Clone)]
pub enum BookDelta {
    Snapshot {
        pair: String,
        bid: Vec<(Decimal, f64)>,
        ask: Vec<(Decimal, f64)>,
    },
    /// A quantity of zero deletes the level.
    Level {
        pair: String,
        side: BookSide,
        price: Decimal,
        quantity: f64,
    },
}

impl BookDelta {
    pub fn pair(&self) -> &str {
        match self {
            BookDelta::Snapshot { pair, .. } => pair,
            BookDelta::Level { pair, .. } => pair,
        }
    }
}

/// Ticker fields a venue message may carry; absent fields keep their
/// previous values.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickerUpdate {
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_quantity: Option<f64>,
    pub ask_quantity: Option<f64>,
}

/// Bulk ticker snapshot from a REST poll, one map per field.
#[derive(Debug, Clone, Default)]
pub struct TickerSheet {
    pub last: Option<HashMap<String, f64>>,
    pub bid: Option<HashMap<String, f64>>,
    pub ask: Option<HashMap<String, f64>>,
    pub bid_quantity: Option<HashMap<String, f64>>,
    pub ask_quantity: Option<HashMap<String, f64>>,
}

/// Top of book for one pair, as carried in book notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TopOfBook {
    pub bid: f64,
    pub ask: f64,
    pub bid_quantity: f64,
    pub ask_quantity: f64,
}

/// Full price-level book for one pair. Bids and asks are keyed by price so
/// the best bid is the last key and the best ask the first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PairBook {
    pub bid: BTreeMap<Decimal, f64>,
    pub ask: BTreeMap<Decimal, f64>,
}

/// Point-in-time copy of the whole snapshot, attached to every outbound
/// notification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketdataDump {
    pub last: HashMap<String, f64>,
    pub bid: HashMap<String, f64>,
    pub ask: HashMap<String, f64>,
    pub bid_quantity: HashMap<String, f64>,
    pub ask_quantity: HashMap<String, f64>,
    pub last_buy: HashMap<String, f64>,
    pub last_sell: HashMap<String, f64>,
    pub book: HashMap<String, PairBook>,
}

#[derive(Debug, Default)]
struct TickerState {
    last: HashMap<String, f64>,
    bid: HashMap<String, f64>,
    ask: HashMap<String, f64>,
    bid_quantity: HashMap<String, f64>,
    ask_quantity: HashMap<String, f64>,
    /// Last trade price per pair that was actually notified, per side.
    last_notified_buy: HashMap<String, f64>,
    last_notified_sell: HashMap<String, f64>,
}

struct BookQueue {
    tx: UnboundedSender<BookDelta>,
    rx: Option<UnboundedReceiver<BookDelta>>,
}

impl BookQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
pub struct MarketSnapshot {
    ticker: Mutex<TickerState>,
    books: Mutex<HashMap<String, PairBook>>,
    queues: Mutex<HashMap<String, BookQueue>>,
}

impl MarketSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a ticker update and decides whether to notify. Trades
    /// (`side` present) are deduplicated: a print within `tolerance`
    /// relative distance of the last notified price on that side is
    /// absorbed silently. Quote updates always notify.
    pub fn update_ticker(
        &self,
        pair: &str,
        update: TickerUpdate,
        side: Option<Side>,
        tolerance: f64,
    ) -> bool {
        let mut state = self.ticker.lock().unwrap();
        if let Some(last) = update.last {
            state.last.insert(pair.to_string(), last);
        }
        if let Some(bid) = update.bid {
            state.bid.insert(pair.to_string(), bid);
        }
        if let Some(ask) = update.ask {
            state.ask.insert(pair.to_string(), ask);
        }
        if let Some(q) = update.bid_quantity {
            state.bid_quantity.insert(pair.to_string(), q);
        }
        if let Some(q) = update.ask_quantity {
            state.ask_quantity.insert(pair.to_string(), q);
        }

        let (side, price) = match (side, update.last) {
            (Some(side), Some(price)) if price > 0.0 => (side, price),
            _ => return true,
        };
        let notified = match side {
            Side::Buy => &mut state.last_notified_buy,
            Side::Sell => &mut state.last_notified_sell,
        };
        match notified.get(pair) {
            Some(previous) if (previous / price - 1.0).abs() <= tolerance => false,
            _ => {
                notified.insert(pair.to_string(), price);
                true
            }
        }
    }

    /// Merges a bulk REST ticker snapshot.
    pub fn set_market_data(&self, sheet: TickerSheet) {
        let mut guard = self.ticker.lock().unwrap();
        let state = &mut *guard;
        for (target, source) in [
            (&mut state.last, sheet.last),
            (&mut state.bid, sheet.bid),
            (&mut state.ask, sheet.ask),
            (&mut state.bid_quantity, sheet.bid_quantity),
            (&mut state.ask_quantity, sheet.ask_quantity),
        ] {
            if let Some(source) = source {
                target.extend(source);
            }
        }
    }

    /// Queues a book delta for the pair's consumer task. Never blocks.
    pub fn queue_entry(&self, delta: BookDelta) {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues
            .entry(delta.pair().to_string())
            .or_insert_with(BookQueue::new);
        if queue.tx.send(delta).is_err() {
            warn!("[marketdata] book consumer gone, delta dropped");
        }
    }

    /// Hands out the consumer end of a pair's book queue. Each pair's queue
    /// can be claimed once.
    pub fn take_book_consumer(&self, pair: &str) -> Option<UnboundedReceiver<BookDelta>> {
        self.queues
            .lock()
            .unwrap()
            .entry(pair.to_string())
            .or_insert_with(BookQueue::new)
            .rx
            .take()
    }

    /// Overwrites one side of a pair's book from a snapshot, leaving the
    /// other side in place. Returns whether the top of book changed.
    pub fn set_book(&self, pair: &str, side: BookSide, levels: Vec<(Decimal, f64)>) -> bool {
        {
            let mut books = self.books.lock().unwrap();
            let book = books.entry(pair.to_string()).or_default();
            let target = match side {
                BookSide::Bid => &mut book.bid,
                BookSide::Ask => &mut book.ask,
            };
            *target = levels.into_iter().collect();
        }
        self.update_book_top(pair)
    }

    /// Applies a book delta to the stored book. Returns whether the top of
    /// book changed.
    pub fn apply(&self, delta: BookDelta) -> bool {
        match delta {
            BookDelta::Snapshot { pair, bid, ask } => {
                {
                    let mut books = self.books.lock().unwrap();
                    let book = books.entry(pair.clone()).or_default();
                    book.bid = bid.into_iter().collect();
                    book.ask = ask.into_iter().collect();
                }
                self.update_book_top(&pair)
            }
            BookDelta::Level {
                pair,
                side,
                price,
                quantity,
            } => {
                {
                    let mut books = self.books.lock().unwrap();
                    let book = books.entry(pair.clone()).or_default();
                    let levels = match side {
                        BookSide::Bid => &mut book.bid,
                        BookSide::Ask => &mut book.ask,
                    };
                    if quantity == 0.0 {
                        levels.remove(&price);
                    } else {
                        levels.insert(price, quantity);
                    }
                }
                self.update_book_top(&pair)
            }
        }
    }

    /// Recomputes the top of book from the stored levels. An empty side
    /// keeps its previous (stale) top and never reports a change.
    fn update_book_top(&self, pair: &str) -> bool {
        let (bid, ask) = {
            let books = self.books.lock().unwrap();
            let book = match books.get(pair) {
                Some(book) => book,
                None => return false,
            };
            let bid = book.bid.iter().next_back().map(|(p, q)| (*p, *q));
            let ask = book.ask.iter().next().map(|(p, q)| (*p, *q));
            (bid, ask)
        };

        let mut state = self.ticker.lock().unwrap();
        let mut changed = false;
        if let Some((price, quantity)) = bid {
            let price = price.to_f64().unwrap_or_default();
            if state.bid.insert(pair.to_string(), price) != Some(price) {
                changed = true;
            }
            state.bid_quantity.insert(pair.to_string(), quantity);
        }
        if let Some((price, quantity)) = ask {
            let price = price.to_f64().unwrap_or_default();
            if state.ask.insert(pair.to_string(), price) != Some(price) {
                changed = true;
            }
            state.ask_quantity.insert(pair.to_string(), quantity);
        }
        changed
    }

    pub fn top_of_book(&self, pair: &str) -> Option<TopOfBook> {
        let state = self.ticker.lock().unwrap();
        if !state.bid.contains_key(pair) && !state.ask.contains_key(pair) {
            return None;
        }
        Some(TopOfBook {
            bid: state.bid.get(pair).copied().unwrap_or_default(),
            ask: state.ask.get(pair).copied().unwrap_or_default(),
            bid_quantity: state.bid_quantity.get(pair).copied().unwrap_or_default(),
            ask_quantity: state.ask_quantity.get(pair).copied().unwrap_or_default(),
        })
    }

    pub fn last(&self, pair: &str) -> Option<f64> {
        self.ticker.lock().unwrap().last.get(pair).copied()
    }

    pub fn book(&self, pair: &str) -> Option<PairBook> {
        self.books.lock().unwrap().get(pair).cloned()
    }

    pub fn dump(&self) -> MarketdataDump {
        let state = self.ticker.lock().unwrap();
        MarketdataDump {
            last: state.last.clone(),
            bid: state.bid.clone(),
            ask: state.ask.clone(),
            bid_quantity: state.bid_quantity.clone(),
            ask_quantity: state.ask_quantity.clone(),
            last_buy: state.last_notified_buy.clone(),
            last_sell: state.last_notified_sell.clone(),
            book: self.books.lock().unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(pair: &str, side: BookSide, price: Decimal, quantity: f64) -> BookDelta {
        BookDelta::Level {
            pair: pair.to_string(),
            side,
            price,
            quantity,
        }
    }

    #[test]
    fn level_updates_move_the_top_of_book() {
        let snapshot = MarketSnapshot::new();
        assert!(snapshot.apply(level("BTC/USD", BookSide::Bid, dec!(10.0), 1.0)));
        assert!(snapshot.apply(level("BTC/USD", BookSide::Bid, dec!(10.5), 2.0)));
        // A level behind the top changes nothing.
        assert!(!snapshot.apply(level("BTC/USD", BookSide::Bid, dec!(9.0), 5.0)));

        let top = snapshot.top_of_book("BTC/USD").unwrap();
        assert_eq!(top.bid, 10.5);
        assert_eq!(top.bid_quantity, 2.0);

        // Deleting the best bid falls back to the next level.
        assert!(snapshot.apply(level("BTC/USD", BookSide::Bid, dec!(10.5), 0.0)));
        assert_eq!(snapshot.top_of_book("BTC/USD").unwrap().bid, 10.0);
    }

    #[test]
    fn emptying_a_side_keeps_the_stale_top() {
        let snapshot = MarketSnapshot::new();
        snapshot.apply(level("BTC/USD", BookSide::Ask, dec!(11.0), 1.0));
        assert!(!snapshot.apply(level("BTC/USD", BookSide::Ask, dec!(11.0), 0.0)));
        assert_eq!(snapshot.top_of_book("BTC/USD").unwrap().ask, 11.0);
    }

    #[test]
    fn snapshot_replaces_the_whole_book() {
        let snapshot = MarketSnapshot::new();
        snapshot.apply(level("BTC/USD", BookSide::Bid, dec!(9.0), 1.0));
        assert!(snapshot.apply(BookDelta::Snapshot {
            pair: "BTC/USD".to_string(),
            bid: vec![(dec!(10.0), 1.0)],
            ask: vec![(dec!(11.0), 2.0)],
        }));
        let book = snapshot.book("BTC/USD").unwrap();
        assert_eq!(book.bid.len(), 1);
        let top = snapshot.top_of_book("BTC/USD").unwrap();
        assert_eq!((top.bid, top.ask), (10.0, 11.0));

        // A snapshot with the same top reports no change.
        assert!(!snapshot.apply(BookDelta::Snapshot {
            pair: "BTC/USD".to_string(),
            bid: vec![(dec!(10.0), 4.0)],
            ask: vec![(dec!(11.0), 5.0)],
        }));
    }

    #[test]
    fn side_snapshot_overwrites_only_that_side() {
        let snapshot = MarketSnapshot::new();
        snapshot.apply(level("BTC/USD", BookSide::Bid, dec!(9.0), 1.0));
        snapshot.apply(level("BTC/USD", BookSide::Ask, dec!(11.0), 1.0));

        assert!(snapshot.set_book(
            "BTC/USD",
            BookSide::Bid,
            vec![(dec!(10.0), 1.0), (dec!(9.5), 2.0)],
        ));
        let book = snapshot.book("BTC/USD").unwrap();
        assert_eq!(book.bid.len(), 2);
        assert_eq!(book.ask.len(), 1, "asks untouched");
        let top = snapshot.top_of_book("BTC/USD").unwrap();
        assert_eq!((top.bid, top.ask), (10.0, 11.0));

        // Same top again: no change reported.
        assert!(!snapshot.set_book("BTC/USD", BookSide::Bid, vec![(dec!(10.0), 3.0)]));
    }

    #[test]
    fn trade_notifications_respect_the_tolerance() {
        let snapshot = MarketSnapshot::new();
        let tolerance = 0.01;
        let trade = |price| TickerUpdate {
            last: Some(price),
            ..TickerUpdate::default()
        };
        assert!(snapshot.update_ticker("BTC/USD", trade(100.0), Some(Side::Buy), tolerance));
        // Within one percent of the last notified print: absorbed.
        assert!(!snapshot.update_ticker("BTC/USD", trade(100.05), Some(Side::Buy), tolerance));
        // The price is still recorded even when the notification is absorbed.
        assert_eq!(snapshot.last("BTC/USD"), Some(100.05));
        assert!(snapshot.update_ticker("BTC/USD", trade(102.0), Some(Side::Buy), tolerance));
        // Sides deduplicate independently.
        assert!(snapshot.update_ticker("BTC/USD", trade(100.0), Some(Side::Sell), tolerance));
    }

    #[test]
    fn book_queue_is_claimed_once_and_preserves_order() {
        let snapshot = MarketSnapshot::new();
        snapshot.queue_entry(level("BTC/USD", BookSide::Bid, dec!(10.0), 1.0));
        snapshot.queue_entry(level("BTC/USD", BookSide::Bid, dec!(10.5), 1.0));

        let mut rx = snapshot.take_book_consumer("BTC/USD").unwrap();
        assert!(snapshot.take_book_consumer("BTC/USD").is_none());
        let first = rx.try_recv().unwrap();
        assert!(matches!(first, BookDelta::Level { price, .. } if price == dec!(10.0)));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
