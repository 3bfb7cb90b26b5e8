// ===============================
// src/gateway.rs (mock venue)
// ===============================
//
// In-memory venue: resting orders, scripted fills, balances and an account
// stream. The binary's mock mode runs it with a random-walk feed and
// auto-fills after a delay; tests drive it by hand.
//
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::{now_ms, AccountEvent, BalanceUpdate, OrderSnapshot, OrderStatus, Side};
use crate::error::{lock, VenueError, VenueResult};
use crate::hub::VenueApi;
use crate::instruments::Instrument;
use crate::market::{MarketChannel, MarketSession};
use crate::order::{OrderRef, OrderRequest, OrderVenue, PlaceAck};

/// Venue code for an unknown or already closed order on cancel.
pub const MOCK_UNKNOWN_ORDER: i64 = -2011;
/// Venue code for an unknown order on query.
pub const MOCK_NO_SUCH_ORDER: i64 = -2013;

#[derive(Debug, Clone)]
struct MockOrder {
    venue_id: String,
    client_id: String,
    instrument: String,
    side: Side,
    price: Decimal,
    size: Decimal,
    filled: Decimal,
    notional: Decimal,
    status: OrderStatus,
    update_time: i64,
}

impl MockOrder {
    fn snapshot(&self) -> OrderSnapshot {
        let avg = if self.filled > Decimal::ZERO { self.notional / self.filled } else { Decimal::ZERO };
        OrderSnapshot::new(self.instrument.clone(), self.status, self.filled, avg, self.update_time)
            .with_client_id(self.client_id.clone())
            .with_venue_id(self.venue_id.clone())
            .with_side(self.side)
            .with_price_size(self.price, self.size)
    }
}

#[derive(Default)]
struct MockState {
    orders: HashMap<String, MockOrder>,
    next_id: u64,
    clock: i64,
    balances: HashMap<String, BalanceUpdate>,
    cancel_all_calls: Vec<Vec<String>>,
    place_failures: Vec<VenueError>,
    push_enabled: bool,
}

impl MockState {
    // strictly increasing venue time
    fn tick(&mut self) -> i64 {
        self.clock = self.clock.max(now_ms()).max(self.clock + 1);
        self.clock
    }

    fn find(&self, order: &OrderRef) -> Option<String> {
        if let Some(v) = order.venue_id.as_ref().filter(|v| self.orders.contains_key(*v)) {
            return Some(v.clone());
        }
        self.orders.values().find(|o| o.client_id == order.client_id).map(|o| o.venue_id.clone())
    }
}

pub struct MockVenue {
    name: String,
    instruments: Vec<Instrument>,
    state: Mutex<MockState>,
    events: Mutex<Option<mpsc::UnboundedSender<AccountEvent>>>,
    auto_fill: Option<Duration>,
    random_walk: Option<Duration>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    resubscribes: Arc<Mutex<Vec<(String, MarketChannel)>>>,
    subscriptions: Mutex<Vec<String>>,
    subscribe_delay: Option<Duration>,
}

impl MockVenue {
    pub fn new(name: impl Into<String>, instruments: Vec<Instrument>) -> Self {
        Self {
            name: name.into(),
            instruments,
            state: Mutex::new(MockState { push_enabled: true, ..Default::default() }),
            events: Mutex::new(None),
            auto_fill: None,
            random_walk: None,
            tasks: Mutex::new(Vec::new()),
            resubscribes: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Mutex::new(Vec::new()),
            subscribe_delay: None,
        }
    }

    /// Hold every market subscription for `delay` before it completes.
    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = Some(delay);
        self
    }

    /// Fill every new order completely at its price after `delay`.
    pub fn with_auto_fill(mut self, delay: Duration) -> Self {
        self.auto_fill = Some(delay);
        self
    }

    /// Feed subscribed markets with a random walk every `every`.
    pub fn with_random_walk(mut self, every: Duration) -> Self {
        self.random_walk = Some(every);
        self
    }

    pub fn set_balance(&self, ccy: &str, rights: Decimal, frozen: Decimal) {
        let mut st = lock(&self.state);
        let ts = st.tick();
        st.balances.insert(ccy.to_string(), BalanceUpdate { ccy: ccy.to_string(), rights, frozen, ts });
    }

    /// Disable push to exercise poll-only reconciliation.
    pub fn set_push(&self, enabled: bool) {
        lock(&self.state).push_enabled = enabled;
    }

    pub fn fail_next_place(&self, err: VenueError) {
        lock(&self.state).place_failures.push(err);
    }

    /// A resting order left over from an earlier process.
    pub fn seed_resting(&self, client_id: &str, instrument: &str, side: Side, price: Decimal, size: Decimal) -> String {
        let mut st = lock(&self.state);
        st.next_id += 1;
        let venue_id = format!("M{}", st.next_id);
        let ts = st.tick();
        st.orders.insert(
            venue_id.clone(),
            MockOrder {
                venue_id: venue_id.clone(),
                client_id: client_id.to_string(),
                instrument: instrument.to_string(),
                side,
                price,
                size,
                filled: Decimal::ZERO,
                notional: Decimal::ZERO,
                status: OrderStatus::New,
                update_time: ts,
            },
        );
        venue_id
    }

    pub fn cancel_all_calls(&self) -> Vec<Vec<String>> {
        lock(&self.state).cancel_all_calls.clone()
    }

    pub fn resubscribes(&self) -> Vec<(String, MarketChannel)> {
        lock(&self.resubscribes).clone()
    }

    /// Instrument ids in subscription order.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn order_snapshot(&self, client_id: &str) -> Option<OrderSnapshot> {
        lock(&self.state).orders.values().find(|o| o.client_id == client_id).map(MockOrder::snapshot)
    }

    fn push(&self, ev: AccountEvent) {
        if !lock(&self.state).push_enabled {
            return;
        }
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(ev);
        }
    }

    /// Execute `amount` of an order at `price`; pushes a snapshot carrying
    /// the explicit last fill.
    pub fn fill(&self, client_id: &str, amount: Decimal, price: Decimal) -> VenueResult<OrderSnapshot> {
        let snap = {
            let mut st = lock(&self.state);
            let ts = st.tick();
            let order = st
                .orders
                .values_mut()
                .find(|o| o.client_id == client_id)
                .ok_or_else(|| VenueError::business(MOCK_NO_SUCH_ORDER, "Order does not exist."))?;
            if order.status.is_terminal() {
                return Err(VenueError::business(MOCK_UNKNOWN_ORDER, "Order is closed."));
            }
            let amount = amount.min(order.size - order.filled);
            order.filled += amount;
            order.notional += amount * price;
            order.status = if order.filled >= order.size { OrderStatus::Filled } else { OrderStatus::Partial };
            order.update_time = ts;
            order.snapshot().with_last_fill(price, amount)
        };
        debug!(client_id, %amount, %price, "mock fill");
        self.push(AccountEvent::Order(snap.clone()));
        Ok(snap)
    }

    /// Quote a subscribed market: one-level book around `bid`/`ask`.
    pub fn quote(market: &MarketSession, bid: Decimal, ask: Decimal) {
        let ts = now_ms();
        market.on_depth(&[(ask, Decimal::ONE)], &[(bid, Decimal::ONE)], ts);
        market.on_ticker((bid + ask) / Decimal::TWO, ts);
    }

    fn spawn_random_walk(&self, market: Arc<MarketSession>, every: Duration) {
        let tick = market.instrument().map_or(Decimal::new(1, 2), |i| i.tick_size);
        let weak = Arc::downgrade(&market);
        drop(market);
        let handle = tokio::spawn(async move {
            let mut bid = Decimal::from(100);
            loop {
                let Some(market) = weak.upgrade() else { break };
                // no ThreadRng across .await
                let step = rand::thread_rng().gen_range(-3..=3);
                bid = (bid + tick * Decimal::from(step)).max(tick * Decimal::from(10));
                MockVenue::quote(&market, bid, bid + tick);
                drop(market);
                tokio::time::sleep(every).await;
            }
        });
        lock(&self.tasks).push(handle);
    }
}

impl MockVenue {
    // The venue record is final at once; the push lands after `delay`.
    fn schedule_fill(&self, placed: &OrderSnapshot, size: Decimal, price: Decimal, delay: Duration) {
        let filled = {
            let mut st = lock(&self.state);
            let ts = st.tick().max(placed.update_time + 1) + delay.as_millis() as i64;
            st.clock = ts;
            let Some(o) = placed.venue_id.as_ref().and_then(|id| st.orders.get_mut(id)) else {
                return;
            };
            o.filled = size;
            o.notional = size * price;
            o.status = OrderStatus::Filled;
            o.update_time = ts;
            o.snapshot().with_last_fill(price, size)
        };
        let events = lock(&self.events).clone();
        let push_enabled = lock(&self.state).push_enabled;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let (true, Some(tx)) = (push_enabled, events) {
                let _ = tx.send(AccountEvent::Order(filled));
            }
        });
        lock(&self.tasks).push(handle);
    }
}

#[async_trait]
impl OrderVenue for MockVenue {
    fn venue_name(&self) -> &str {
        &self.name
    }

    async fn place_order(&self, req: &OrderRequest) -> VenueResult<PlaceAck> {
        let snap = {
            let mut st = lock(&self.state);
            if let Some(err) = st.place_failures.pop() {
                return Err(err);
            }
            st.next_id += 1;
            let venue_id = format!("M{}", st.next_id);
            let ts = st.tick();
            let order = MockOrder {
                venue_id: venue_id.clone(),
                client_id: req.client_id.clone(),
                instrument: req.instrument.clone(),
                side: req.side,
                price: req.price,
                size: req.size,
                filled: Decimal::ZERO,
                notional: Decimal::ZERO,
                status: OrderStatus::New,
                update_time: ts,
            };
            let snap = order.snapshot();
            st.orders.insert(venue_id, order);
            snap
        };
        self.push(AccountEvent::Order(snap.clone()));

        if let Some(delay) = self.auto_fill {
            self.schedule_fill(&snap, req.size, req.price, delay);
        }

        Ok(PlaceAck { venue_id: snap.venue_id.clone(), client_id: snap.client_id.clone(), snapshot: None })
    }

    async fn cancel_order(&self, order: &OrderRef) -> VenueResult<Option<OrderSnapshot>> {
        let snap = {
            let mut st = lock(&self.state);
            let ts = st.tick();
            let id = st.find(order).ok_or_else(|| VenueError::business(MOCK_UNKNOWN_ORDER, "Unknown order sent."))?;
            let Some(o) = st.orders.get_mut(&id) else {
                return Err(VenueError::business(MOCK_UNKNOWN_ORDER, "Unknown order sent."));
            };
            if o.status.is_terminal() {
                return Err(VenueError::business(MOCK_UNKNOWN_ORDER, "Unknown order sent."));
            }
            o.status = OrderStatus::Canceled;
            o.update_time = ts;
            o.snapshot()
        };
        self.push(AccountEvent::Order(snap.clone()));
        Ok(Some(snap))
    }

    async fn query_order(&self, order: &OrderRef) -> VenueResult<OrderSnapshot> {
        let st = lock(&self.state);
        st.find(order)
            .and_then(|id| st.orders.get(&id))
            .map(MockOrder::snapshot)
            .ok_or_else(|| VenueError::business(MOCK_NO_SUCH_ORDER, "Order does not exist."))
    }

    fn is_benign_cancel_error(&self, err: &VenueError) -> bool {
        err.code() == Some(MOCK_UNKNOWN_ORDER)
    }
}

#[async_trait]
impl VenueApi for MockVenue {
    async fn server_time(&self) -> VenueResult<i64> {
        Ok(now_ms())
    }

    async fn load_instruments(&self) -> VenueResult<Vec<Instrument>> {
        Ok(self.instruments.clone())
    }

    async fn open_orders(&self) -> VenueResult<Vec<OrderSnapshot>> {
        let st = lock(&self.state);
        let mut open: Vec<OrderSnapshot> =
            st.orders.values().filter(|o| !o.status.is_terminal()).map(MockOrder::snapshot).collect();
        open.sort_by_key(|s| s.update_time);
        Ok(open)
    }

    async fn cancel_all(&self, symbols: &[String]) -> VenueResult<()> {
        let canceled: Vec<OrderSnapshot> = {
            let mut st = lock(&self.state);
            st.cancel_all_calls.push(symbols.to_vec());
            let ts = st.tick();
            let known: HashMap<String, String> =
                self.instruments.iter().map(|i| (i.id.clone(), i.symbol.clone())).collect();
            st.orders
                .values_mut()
                .filter(|o| !o.status.is_terminal())
                .filter(|o| {
                    let sym = known.get(&o.instrument).unwrap_or(&o.instrument);
                    symbols.iter().any(|s| s == sym)
                })
                .map(|o| {
                    o.status = OrderStatus::Canceled;
                    o.update_time = ts;
                    o.snapshot()
                })
                .collect()
        };
        info!(venue = %self.name, count = canceled.len(), "mock cancel all");
        for s in canceled {
            self.push(AccountEvent::Order(s));
        }
        Ok(())
    }

    async fn account_snapshot(&self) -> VenueResult<Vec<BalanceUpdate>> {
        let mut list: Vec<BalanceUpdate> = lock(&self.state).balances.values().cloned().collect();
        list.sort_by(|a, b| a.ccy.cmp(&b.ccy));
        Ok(list)
    }

    async fn start_account_stream(&self, events: mpsc::UnboundedSender<AccountEvent>) -> VenueResult<()> {
        let _ = events.send(AccountEvent::Resynced);
        *lock(&self.events) = Some(events);
        Ok(())
    }

    async fn subscribe_market(&self, market: Arc<MarketSession>) -> VenueResult<()> {
        if let Some(delay) = self.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        market.set_connected(true);
        let id = market.instrument_id().to_string();
        lock(&self.subscriptions).push(id.clone());
        let sink = self.resubscribes.clone();
        market.set_resubscribe_hook(Arc::new(move |ch| lock(&sink).push((id.clone(), ch))));
        if let Some(every) = self.random_walk {
            self.spawn_random_walk(market, every);
        }
        Ok(())
    }

    async fn stop(&self) {
        *lock(&self.events) = None;
        for t in lock(&self.tasks).drain(..) {
            t.abort();
        }
    }
}
