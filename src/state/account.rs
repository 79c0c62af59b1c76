//! Account ledger: the locally maintained mirror of open orders, balances
//! and positions.
//!
//! The ledger is updated optimistically the moment we act (place, amend,
//! cancel) and corrected as venue messages and snapshots arrive. Every
//! mutation that touches an order of the balance settle class also moves the
//! corresponding balance entries, so the quote reservation of a resting bid
//! is visible immediately, before the venue confirms anything.

use crate::model::{split_pair, BalanceEntry, Order, SettleClass, Side, DUST_QUANTITY};
use log::warn;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Relative tolerance for reconciliation. Venue numbers that differ from
/// ours by less than this are treated as rounding noise.
const RECONCILE_TOLERANCE: f64 = 0.01;

/// Rotating set of API credentials. Splitting request load over several keys
/// multiplies the per-key rate budget.
#[derive(Debug, Default)]
pub struct KeyRing {
    creds: Mutex<(Vec<String>, Vec<String>)>,
    cursor: AtomicUsize,
}

impl KeyRing {
    pub fn new(keys: Vec<String>, secrets: Vec<String>) -> Self {
        Self {
            creds: Mutex::new((keys, secrets)),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Replaces the credential set and restarts the rotation.
    pub fn set_keys(&self, keys: Vec<String>, secrets: Vec<String>) {
        *self.creds.lock().unwrap() = (keys, secrets);
        self.cursor.store(0, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.creds.lock().unwrap().0.is_empty()
    }

    /// Next (key, secret) in round-robin order.
    pub fn next_key(&self) -> Option<(String, String)> {
        let creds = self.creds.lock().unwrap();
        let (keys, secrets) = &*creds;
        if keys.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % keys.len();
        let secret = secrets.get(i).cloned().unwrap_or_default();
        Some((keys[i].clone(), secret))
    }
}

/// Resting orders for one pair, bucketed by book side.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PairOrders {
    pub bid: Vec<Order>,
    pub ask: Vec<Order>,
}

impl PairOrders {
    fn side(&self, side: Side) -> &[Order] {
        match side {
            Side::Buy => &self.bid,
            Side::Sell => &self.ask,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut Vec<Order> {
        match side {
            Side::Buy => &mut self.bid,
            Side::Sell => &mut self.ask,
        }
    }

    fn is_empty(&self) -> bool {
        self.bid.is_empty() && self.ask.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &Order> {
        self.bid.iter().chain(self.ask.iter())
    }
}

/// Point-in-time copy of the whole ledger, attached to every outbound
/// notification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountDump {
    pub orders: HashMap<String, PairOrders>,
    pub balance: HashMap<String, BalanceEntry>,
    pub position: HashMap<String, f64>,
    pub position_base: HashMap<String, f64>,
}

#[derive(Default)]
pub struct AccountLedger {
    keyring: KeyRing,
    orders: Mutex<HashMap<String, PairOrders>>,
    balance: Mutex<HashMap<String, BalanceEntry>>,
    position: Mutex<HashMap<String, f64>>,
    position_base: Mutex<HashMap<String, f64>>,
    orders_seeded: AtomicBool,
    balance_seeded: AtomicBool,
    position_seeded: AtomicBool,
    position_base_seeded: AtomicBool,
}

impl AccountLedger {
    pub fn new(keys: Vec<String>, secrets: Vec<String>) -> Self {
        Self {
            keyring: KeyRing::new(keys, secrets),
            ..Self::default()
        }
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    pub fn set_keys(&self, keys: Vec<String>, secrets: Vec<String>) {
        self.keyring.set_keys(keys, secrets);
    }

    /// True once the open-order mirror has been seeded and at least one of
    /// the funding stores (balance, position, base position) has too. A
    /// spot-only or margin-only venue never fills the other stores.
    pub fn is_ready(&self) -> bool {
        self.orders_seeded.load(Ordering::Relaxed)
            && (self.balance_seeded.load(Ordering::Relaxed)
                || self.position_seeded.load(Ordering::Relaxed)
                || self.position_base_seeded.load(Ordering::Relaxed))
    }

    pub fn orders_seeded(&self) -> bool {
        self.orders_seeded.load(Ordering::Relaxed)
    }

    pub fn balance_seeded(&self) -> bool {
        self.balance_seeded.load(Ordering::Relaxed)
    }

    pub fn position_seeded(&self) -> bool {
        self.position_seeded.load(Ordering::Relaxed)
    }

    /// Records a newly placed order and, for balance-settled orders, moves
    /// the covering funds from available to reserved. Rejects duplicate ids.
    pub fn insert_order(&self, order: Order) -> bool {
        {
            let mut orders = self.orders.lock().unwrap();
            let exists = orders.values().any(|p| p.iter().any(|o| o.id == order.id));
            if exists {
                warn!("[account] duplicate order id {} ignored", order.id);
                return false;
            }
            orders
                .entry(order.pair.clone())
                .or_default()
                .side_mut(order.side)
                .push(order.clone());
        }
        if order.class == SettleClass::Balance {
            self.apply_balance(None, &order, false, None, 0.0);
        }
        true
    }

    /// Replaces the order identified by `id` with `order`. `from_trade`
    /// marks a fill (quantity shrank because it traded) as opposed to an
    /// amend. Remaining quantity at or below dust removes the order. Returns
    /// false when `id` is unknown.
    pub fn update_order(
        &self,
        id: &str,
        mut order: Order,
        from_trade: bool,
        fee_currency: Option<&str>,
        fee: f64,
    ) -> bool {
        let old = {
            let mut orders = self.orders.lock().unwrap();
            let old = match take_order(&mut orders, id) {
                Some(old) => old,
                None => {
                    warn!("[account] update for unknown order id {}", id);
                    return false;
                }
            };
            if order.quantity > DUST_QUANTITY {
                if !from_trade && order.id != old.id {
                    order.old_id = Some(old.id.clone());
                }
                orders
                    .entry(order.pair.clone())
                    .or_default()
                    .side_mut(order.side)
                    .push(order.clone());
            }
            old
        };
        match old.class {
            SettleClass::Balance => {
                self.apply_balance(Some(&old), &order, from_trade, fee_currency, fee)
            }
            SettleClass::Margin => {
                if from_trade {
                    self.apply_position(&old, &order);
                }
            }
        }
        true
    }

    /// Removes an order outright. Cancels (`from_trade` false) release the
    /// balance reservation; fill-driven removals settle it as a trade with
    /// the given fee, so a venue "removed: filled" message maps straight
    /// here.
    pub fn remove_order(
        &self,
        id: &str,
        from_trade: bool,
        fee_currency: Option<&str>,
        fee: f64,
    ) -> Option<Order> {
        let old = take_order(&mut self.orders.lock().unwrap(), id)?;
        let mut gone = old.clone();
        gone.quantity = 0.0;
        match old.class {
            SettleClass::Balance => {
                self.apply_balance(Some(&old), &gone, from_trade, fee_currency, fee)
            }
            SettleClass::Margin => {
                if from_trade {
                    self.apply_position(&old, &gone);
                }
            }
        }
        Some(old)
    }

    pub fn get_order(&self, id: &str) -> Option<Order> {
        self.orders
            .lock()
            .unwrap()
            .values()
            .flat_map(|p| p.iter())
            .find(|o| o.id == id)
            .cloned()
    }

    /// Resting orders on one side of one pair.
    pub fn get_orders(&self, pair: &str, side: Side) -> Vec<Order> {
        self.orders
            .lock()
            .unwrap()
            .get(pair)
            .map(|p| p.side(side).to_vec())
            .unwrap_or_default()
    }

    /// With both a pair and a side, checks that bucket; otherwise checks the
    /// whole mirror.
    pub fn has_open_orders(&self, pair: Option<&str>, side: Option<Side>) -> bool {
        let orders = self.orders.lock().unwrap();
        match (pair, side) {
            (Some(pair), Some(side)) => orders
                .get(pair)
                .map(|p| !p.side(side).is_empty())
                .unwrap_or(false),
            _ => orders.values().any(|p| !p.is_empty()),
        }
    }

    pub fn open_order_ids(&self, pair: Option<&str>) -> Vec<String> {
        let orders = self.orders.lock().unwrap();
        match pair {
            Some(pair) => orders
                .get(pair)
                .map(|p| p.iter().map(|o| o.id.clone()).collect())
                .unwrap_or_default(),
            None => orders
                .values()
                .flat_map(|p| p.iter())
                .map(|o| o.id.clone())
                .collect(),
        }
    }

    /// Seeds or corrects the open-order mirror from a venue snapshot. With a
    /// pair the replacement is scoped to that pair; without, the whole
    /// mirror is replaced.
    pub fn set_open_orders(&self, snapshot: Vec<Order>, pair: Option<&str>) {
        let mut buckets: HashMap<String, PairOrders> = HashMap::new();
        for order in snapshot {
            buckets
                .entry(order.pair.clone())
                .or_default()
                .side_mut(order.side)
                .push(order);
        }
        let mut orders = self.orders.lock().unwrap();
        match pair {
            Some(pair) => {
                let bucket = buckets.remove(pair).unwrap_or_default();
                orders.insert(pair.to_string(), bucket);
            }
            None => *orders = buckets,
        }
        self.orders_seeded.store(true, Ordering::Relaxed);
    }

    /// Overwrites the entries named by a venue balance snapshot. Assets the
    /// snapshot omits keep their local values.
    pub fn set_balance(&self, snapshot: HashMap<String, BalanceEntry>) {
        let mut balance = self.balance.lock().unwrap();
        for (asset, entry) in snapshot {
            balance.insert(asset, entry);
        }
        self.balance_seeded.store(true, Ordering::Relaxed);
    }

    pub fn set_position(&self, snapshot: HashMap<String, f64>) {
        let mut position = self.position.lock().unwrap();
        for (pair, size) in snapshot {
            position.insert(pair, size);
        }
        self.position_seeded.store(true, Ordering::Relaxed);
    }

    /// Position denominated in the base asset, for venues that report both.
    pub fn set_position_base(&self, snapshot: HashMap<String, f64>) {
        let mut position = self.position_base.lock().unwrap();
        for (pair, size) in snapshot {
            position.insert(pair, size);
        }
        self.position_base_seeded.store(true, Ordering::Relaxed);
    }

    pub fn balance_of(&self, asset: &str) -> BalanceEntry {
        self.balance
            .lock()
            .unwrap()
            .get(asset)
            .copied()
            .unwrap_or_default()
    }

    pub fn position_of(&self, pair: &str) -> f64 {
        self.position
            .lock()
            .unwrap()
            .get(pair)
            .copied()
            .unwrap_or_default()
    }

    pub fn dump(&self) -> AccountDump {
        AccountDump {
            orders: self.orders.lock().unwrap().clone(),
            balance: self.balance.lock().unwrap().clone(),
            position: self.position.lock().unwrap().clone(),
            position_base: self.position_base.lock().unwrap().clone(),
        }
    }

    /// Moves balance entries for a change of one balance-settled order.
    ///
    /// Fills (`from_trade`) convert reserved quote into available base for
    /// buys and reserved base into available quote for sells, minus the fee.
    /// Amends, inserts (`old` absent) and cancels (zero-quantity `new`) only
    /// shift the delta between available and reserved on the funding asset.
    fn apply_balance(
        &self,
        old: Option<&Order>,
        new: &Order,
        from_trade: bool,
        fee_currency: Option<&str>,
        fee: f64,
    ) {
        let (base, quote) = match split_pair(&new.pair) {
            Some(parts) => parts,
            None => {
                warn!("[account] cannot split pair {}", new.pair);
                return;
            }
        };
        let dq = new.quantity - old.map(|o| o.quantity).unwrap_or(0.0);
        let dvol = new.volume() - old.map(|o| o.volume()).unwrap_or(0.0);

        let mut balance = self.balance.lock().unwrap();
        if from_trade {
            match new.side {
                Side::Buy => {
                    balance.entry(base.to_string()).or_default().available += dq.abs();
                    balance.entry(quote.to_string()).or_default().reserved -= dvol.abs();
                }
                Side::Sell => {
                    balance.entry(base.to_string()).or_default().reserved -= dq.abs();
                    balance.entry(quote.to_string()).or_default().available += dvol.abs();
                }
            }
            if fee != 0.0 {
                let asset = fee_currency.unwrap_or(match new.side {
                    Side::Buy => base,
                    Side::Sell => quote,
                });
                balance.entry(asset.to_string()).or_default().available -= fee.abs();
            }
        } else {
            match new.side {
                Side::Buy => {
                    let entry = balance.entry(quote.to_string()).or_default();
                    entry.available -= dvol;
                    entry.reserved += dvol;
                }
                Side::Sell => {
                    let entry = balance.entry(base.to_string()).or_default();
                    entry.available -= dq;
                    entry.reserved += dq;
                }
            }
        }
    }

    /// A margin fill moves the net position by the filled quantity, signed
    /// by side.
    fn apply_position(&self, old: &Order, new: &Order) {
        let filled = (old.quantity - new.quantity).abs();
        let direction = match new.side {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        };
        *self
            .position
            .lock()
            .unwrap()
            .entry(new.pair.clone())
            .or_default() += direction * filled;
    }
}

fn take_order(orders: &mut HashMap<String, PairOrders>, id: &str) -> Option<Order> {
    for bucket in orders.values_mut() {
        for list in [&mut bucket.bid, &mut bucket.ask] {
            if let Some(i) = list.iter().position(|o| o.id == id) {
                return Some(list.remove(i));
            }
        }
    }
    None
}

/// Whether a local and a venue figure disagree beyond rounding noise. Zero
/// against non-zero always disagrees.
fn materially_different(internal: f64, external: f64) -> bool {
    if (internal == 0.0) != (external == 0.0) {
        return true;
    }
    if external == 0.0 {
        return false;
    }
    (1.0 - internal / external).abs() > RECONCILE_TOLERANCE
}

/// Assets whose local available or reserved figure disagrees with the venue
/// snapshot. The fields are checked independently so funds shifted between
/// them do not cancel out.
pub fn validate_balance(
    internal: &HashMap<String, BalanceEntry>,
    external: &HashMap<String, BalanceEntry>,
) -> Vec<String> {
    let mut mismatched: Vec<String> = internal
        .keys()
        .chain(external.keys())
        .filter(|asset| {
            let ours = internal.get(*asset).copied().unwrap_or_default();
            let theirs = external.get(*asset).copied().unwrap_or_default();
            materially_different(ours.available, theirs.available)
                || materially_different(ours.reserved, theirs.reserved)
        })
        .cloned()
        .collect();
    mismatched.sort();
    mismatched.dedup();
    mismatched
}

/// Pairs whose local position disagrees with the venue snapshot.
pub fn validate_position(
    internal: &HashMap<String, f64>,
    external: &HashMap<String, f64>,
) -> Vec<String> {
    let mut mismatched: Vec<String> = internal
        .keys()
        .chain(external.keys())
        .filter(|pair| {
            let ours = internal.get(*pair).copied().unwrap_or_default();
            let theirs = external.get(*pair).copied().unwrap_or_default();
            materially_different(ours, theirs)
        })
        .cloned()
        .collect();
    mismatched.sort();
    mismatched.dedup();
    mismatched
}

/// Pairs carrying an order present on one side only, or a shared id whose
/// price or quantity disagrees. Returning pairs lets the caller refresh the
/// affected mirrors with a pair-scoped snapshot.
pub fn validate_orders(internal: &[Order], external: &[Order]) -> Vec<String> {
    let ours: HashMap<&str, &Order> = internal.iter().map(|o| (o.id.as_str(), o)).collect();
    let theirs: HashMap<&str, &Order> = external.iter().map(|o| (o.id.as_str(), o)).collect();

    let mut mismatched: Vec<String> = Vec::new();
    let ids: HashSet<&str> = ours.keys().chain(theirs.keys()).copied().collect();
    for id in ids {
        match (ours.get(id), theirs.get(id)) {
            (Some(mine), Some(other)) => {
                if mine.price != other.price
                    || materially_different(mine.quantity, other.quantity)
                {
                    mismatched.push(mine.pair.clone());
                }
            }
            (Some(mine), None) => mismatched.push(mine.pair.clone()),
            (None, Some(other)) => mismatched.push(other.pair.clone()),
            (None, None) => {}
        }
    }
    mismatched.sort();
    mismatched.dedup();
    mismatched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str, side: Side, price: f64, quantity: f64) -> Order {
        Order::new(id, "BTC/USD", side, price, quantity, SettleClass::Balance)
    }

    #[test]
    fn insert_reserves_quote_and_rejects_duplicates() {
        let ledger = AccountLedger::default();
        assert!(ledger.insert_order(order("1", Side::Buy, 100.0, 2.0)));
        assert!(!ledger.insert_order(order("1", Side::Buy, 50.0, 1.0)));

        let usd = ledger.balance_of("USD");
        assert_eq!(usd.available, -200.0);
        assert_eq!(usd.reserved, 200.0);
        assert!(ledger.get_order("1").is_some());
    }

    #[test]
    fn full_fill_credits_base_and_consumes_reserved_quote() {
        let ledger = AccountLedger::default();
        ledger.set_balance(HashMap::from([(
            "USD".to_string(),
            BalanceEntry::new(1000.0, 0.0),
        )]));
        ledger.insert_order(order("1", Side::Buy, 100.0, 2.0));

        let filled = order("1", Side::Buy, 100.0, 0.0);
        assert!(ledger.update_order("1", filled, true, None, 0.1));

        assert!(ledger.get_order("1").is_none(), "dust quantity removes it");
        let usd = ledger.balance_of("USD");
        assert_eq!(usd.available, 800.0);
        assert_eq!(usd.reserved, 0.0);
        let btc = ledger.balance_of("BTC");
        assert_eq!(btc.available, 2.0 - 0.1, "fee defaults to the base asset");
    }

    #[test]
    fn cancel_releases_the_reservation() {
        let ledger = AccountLedger::default();
        ledger.insert_order(order("1", Side::Sell, 100.0, 2.0));
        let btc = ledger.balance_of("BTC");
        assert_eq!((btc.available, btc.reserved), (-2.0, 2.0));

        assert!(ledger.remove_order("1", false, None, 0.0).is_some());
        let btc = ledger.balance_of("BTC");
        assert_eq!((btc.available, btc.reserved), (0.0, 0.0));
        assert!(ledger.remove_order("1", false, None, 0.0).is_none());
    }

    #[test]
    fn fill_driven_removal_settles_as_a_trade() {
        let ledger = AccountLedger::default();
        ledger.set_balance(HashMap::from([(
            "USD".to_string(),
            BalanceEntry::new(1000.0, 0.0),
        )]));
        ledger.insert_order(order("1", Side::Buy, 100.0, 2.0));

        assert!(ledger.remove_order("1", true, Some("USD"), 0.2).is_some());
        let usd = ledger.balance_of("USD");
        assert_eq!(usd.available, 800.0 - 0.2);
        assert_eq!(usd.reserved, 0.0);
        assert_eq!(ledger.balance_of("BTC").available, 2.0);

        // A filled margin order moves the position instead.
        let mut short = order("2", Side::Sell, 100.0, 3.0);
        short.class = SettleClass::Margin;
        ledger.insert_order(short);
        ledger.remove_order("2", true, None, 0.0);
        assert_eq!(ledger.position_of("BTC/USD"), -3.0);
    }

    #[test]
    fn amend_records_the_previous_id() {
        let ledger = AccountLedger::default();
        ledger.insert_order(order("1", Side::Buy, 100.0, 1.0));
        ledger.update_order("1", order("2", Side::Buy, 101.0, 1.0), false, None, 0.0);

        let amended = ledger.get_order("2").unwrap();
        assert_eq!(amended.old_id.as_deref(), Some("1"));
        let usd = ledger.balance_of("USD");
        assert_eq!(usd.reserved, 101.0);
    }

    #[test]
    fn margin_fills_move_the_position() {
        let ledger = AccountLedger::default();
        let mut sell = order("1", Side::Sell, 100.0, 3.0);
        sell.class = SettleClass::Margin;
        ledger.insert_order(sell.clone());

        let mut partial = sell.clone();
        partial.quantity = 1.0;
        ledger.update_order("1", partial, true, None, 0.0);
        assert_eq!(ledger.position_of("BTC/USD"), -2.0);
    }

    #[test]
    fn snapshot_seeding_flips_readiness() {
        let ledger = AccountLedger::default();
        assert!(!ledger.is_ready());
        ledger.set_balance(HashMap::new());
        assert!(!ledger.is_ready(), "orders must be seeded too");
        ledger.set_open_orders(Vec::new(), None);
        assert!(ledger.is_ready(), "one funding store suffices");

        // A margin-only venue seeds positions instead of balances.
        let margin = AccountLedger::default();
        margin.set_open_orders(Vec::new(), None);
        assert!(!margin.is_ready());
        margin.set_position_base(HashMap::new());
        assert!(margin.is_ready());
    }

    #[test]
    fn keyring_rotates_and_can_be_replaced() {
        let ring = KeyRing::new(
            vec!["a".to_string(), "b".to_string()],
            vec!["sa".to_string(), "sb".to_string()],
        );
        assert_eq!(ring.next_key(), Some(("a".to_string(), "sa".to_string())));
        assert_eq!(ring.next_key(), Some(("b".to_string(), "sb".to_string())));
        assert_eq!(ring.next_key(), Some(("a".to_string(), "sa".to_string())));

        ring.set_keys(vec!["c".to_string()], vec!["sc".to_string()]);
        assert_eq!(ring.next_key(), Some(("c".to_string(), "sc".to_string())));

        assert!(KeyRing::default().next_key().is_none());
    }

    #[test]
    fn order_accessors_scope_by_pair_and_side() {
        let ledger = AccountLedger::default();
        ledger.insert_order(order("1", Side::Buy, 100.0, 1.0));
        ledger.insert_order(order("2", Side::Sell, 110.0, 1.0));

        assert!(ledger.has_open_orders(None, None));
        assert!(ledger.has_open_orders(Some("BTC/USD"), Some(Side::Buy)));
        assert!(!ledger.has_open_orders(Some("ETH/USD"), Some(Side::Buy)));

        let asks = ledger.get_orders("BTC/USD", Side::Sell);
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].id, "2");
        assert!(ledger.get_orders("ETH/USD", Side::Sell).is_empty());

        assert_eq!(ledger.open_order_ids(Some("BTC/USD")).len(), 2);
        assert!(ledger.open_order_ids(Some("ETH/USD")).is_empty());
    }

    #[test]
    fn pair_scoped_order_snapshot_leaves_other_pairs_alone() {
        let ledger = AccountLedger::default();
        ledger.insert_order(order("1", Side::Buy, 100.0, 1.0));
        let mut eth = order("2", Side::Buy, 10.0, 1.0);
        eth.pair = "ETH/USD".to_string();
        ledger.insert_order(eth);

        ledger.set_open_orders(Vec::new(), Some("BTC/USD"));
        assert!(ledger.get_order("1").is_none());
        assert!(ledger.get_order("2").is_some());
    }

    #[test]
    fn validators_flag_material_differences_only() {
        let ours = HashMap::from([("USD".to_string(), BalanceEntry::new(100.0, 0.0))]);
        let theirs = HashMap::from([("USD".to_string(), BalanceEntry::new(100.5, 0.0))]);
        assert!(validate_balance(&ours, &theirs).is_empty());

        let theirs = HashMap::from([("USD".to_string(), BalanceEntry::new(110.0, 0.0))]);
        assert_eq!(validate_balance(&ours, &theirs), vec!["USD".to_string()]);

        // Zero against non-zero always counts.
        let ours = HashMap::from([("BTC/USD".to_string(), 0.0)]);
        let theirs = HashMap::from([("BTC/USD".to_string(), 0.0001)]);
        assert_eq!(validate_position(&ours, &theirs), vec!["BTC/USD".to_string()]);
    }

    #[test]
    fn balance_validation_checks_available_and_reserved_separately() {
        // Same total, but the venue has everything reserved while we think
        // it is all free. The fields must not cancel out.
        let ours = HashMap::from([("USD".to_string(), BalanceEntry::new(100.0, 0.0))]);
        let theirs = HashMap::from([("USD".to_string(), BalanceEntry::new(0.0, 100.0))]);
        assert_eq!(validate_balance(&ours, &theirs), vec!["USD".to_string()]);

        // Both fields within tolerance: clean.
        let theirs = HashMap::from([("USD".to_string(), BalanceEntry::new(100.5, 0.0))]);
        assert!(validate_balance(&ours, &theirs).is_empty());
    }

    #[test]
    fn order_validation_reports_the_affected_pairs() {
        let mut eth = order("3", Side::Buy, 98.0, 1.0);
        eth.pair = "ETH/USD".to_string();
        let ours = vec![order("1", Side::Buy, 100.0, 1.0), order("2", Side::Buy, 99.0, 1.0)];
        let theirs = vec![order("1", Side::Buy, 100.0, 1.0), eth];
        // One of ours is missing and the venue has an extra on another pair.
        assert_eq!(validate_orders(&ours, &theirs), vec!["BTC/USD", "ETH/USD"]);

        let theirs = vec![order("1", Side::Buy, 100.5, 1.0), order("2", Side::Buy, 99.0, 1.0)];
        assert_eq!(validate_orders(&ours, &theirs), vec!["BTC/USD"]);

        let theirs = vec![order("1", Side::Buy, 100.0, 1.0), order("2", Side::Buy, 99.0, 1.0)];
        assert!(validate_orders(&ours, &theirs).is_empty());
    }
}
