// ===============================
// src/gateway_broker.rs
// ===============================
//
// Venue over a local broker gateway session (gateway_tcp.rs).
//
// The gateway has no order query and no timestamps on order status, so:
// - every status message gets a strictly increasing local timestamp
// - last fill amount is the filled delta since the previous status
// - a poll refreshes open orders (the gateway re-sends their status) and
//   answers from the latest known state
//
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::{now_ms, AccountEvent, BalanceUpdate, Kline, OrderSnapshot, OrderStatus, Side, SnapshotSource};
use crate::error::{lock, VenueError, VenueResult};
use crate::gateway_tcp::{
    tick, FramedTcpClient, GatewayContract, GatewayMessage, HistoricalBar, OpenOrderMsg, OrderStatusMsg, OrderTicket,
};
use crate::hub::VenueApi;
use crate::instruments::{Instrument, InstrumentKind};
use crate::market::{MarketChannel, MarketSession};
use crate::order::{OrderRef, OrderRequest, OrderVenue, PlaceAck};
use crate::series::{interval_ms, Klines, SeriesSource};

/// Gateway code: order to cancel was not found.
pub const CODE_CANCEL_NOT_FOUND: i64 = 10147;
/// Gateway code: order not in a cancellable state.
pub const CODE_NOT_CANCELLABLE: i64 = 161;
/// Gateway code: order canceled (sent as an error message).
pub const CODE_ORDER_CANCELED: i64 = 202;

pub fn parse_status(s: &str) -> OrderStatus {
    match s {
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "ApiCancelled" => OrderStatus::Canceled,
        "Inactive" => OrderStatus::Rejected,
        _ => OrderStatus::New,
    }
}

pub fn instrument_kind(sec_type: &str) -> InstrumentKind {
    match sec_type {
        "STK" => InstrumentKind::Stock,
        "FUT" => InstrumentKind::Future,
        _ => InstrumentKind::Spot,
    }
}

/// Zone of a gateway `time_zone_id`. IANA names parse directly; the
/// gateway's short abbreviations map to the zone that observes them.
/// Unknown ids count as UTC.
pub fn time_zone(id: &str) -> Tz {
    let id = id.trim();
    let name = match id {
        "EST" | "EDT" | "EST5EDT" => "America/New_York",
        "CST" | "CDT" | "CST6CDT" => "America/Chicago",
        "MST" | "MDT" => "America/Denver",
        "PST" | "PDT" | "PST8PDT" => "America/Los_Angeles",
        "MET" | "CET" | "CEST" => "Europe/Berlin",
        "GMT" | "BST" | "GB" => "Europe/London",
        "JST" => "Asia/Tokyo",
        "HKT" => "Asia/Hong_Kong",
        "AEST" | "AEDT" => "Australia/Sydney",
        other => other,
    };
    name.parse::<Tz>().unwrap_or_else(|_| {
        if !id.is_empty() {
            debug!(tz = id, "unknown gateway time zone, using UTC");
        }
        Tz::UTC
    })
}

/// Gateway bar size for a `1m` / `1h` / `1d` style interval.
pub fn bar_size(interval: &str) -> Option<&'static str> {
    Some(match interval {
        "1m" => "1 min",
        "5m" => "5 mins",
        "15m" => "15 mins",
        "30m" => "30 mins",
        "1h" => "1 hour",
        "1d" => "1 day",
        _ => return None,
    })
}

/// Request span covering `[start, end)`: seconds up to a day, whole days beyond.
fn duration_str(start: i64, end: i64) -> String {
    let secs = ((end - start).max(1_000) + 999) / 1_000;
    if secs <= 86_400 {
        format!("{secs} S")
    } else {
        format!("{} D", (secs + 86_399) / 86_400)
    }
}

/// Bar stamps come as epoch seconds (intraday) or `YYYYMMDD` (daily).
fn bar_time_ms(date: &str) -> Option<i64> {
    if let Ok(secs) = date.trim().parse::<i64>() {
        return Some(secs * 1000);
    }
    let day = NaiveDate::parse_from_str(date.trim(), "%Y%m%d").ok()?;
    Some(day.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

fn to_kline(b: &HistoricalBar) -> Option<Kline> {
    Some(Kline { open_time: bar_time_ms(&b.date)?, open: b.open, high: b.high, low: b.low, close: b.close, volume: b.volume })
}

#[derive(Debug, Clone)]
struct TrackedOrder {
    client_id: String,
    instrument: String,
    side: Side,
    price: Decimal,
    size: Decimal,
    filled: Decimal,
    avg_price: Decimal,
    status: OrderStatus,
    update_time: i64,
}

impl TrackedOrder {
    fn snapshot(&self, order_id: i64) -> OrderSnapshot {
        OrderSnapshot::new(self.instrument.clone(), self.status, self.filled, self.avg_price, self.update_time)
            .with_client_id(self.client_id.clone())
            .with_venue_id(order_id.to_string())
            .with_side(self.side)
            .with_price_size(self.price, self.size)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TopOfBook {
    bid: Option<(Decimal, Decimal)>,
    ask: Option<(Decimal, Decimal)>,
}

#[derive(Default)]
struct BrokerState {
    orders: HashMap<i64, TrackedOrder>,
    by_client: HashMap<String, i64>,
    clock: i64,
    balances: HashMap<String, BalanceUpdate>,
    catalog: HashMap<String, GatewayContract>,
    by_symbol: HashMap<String, String>,
    markets: HashMap<i64, (Weak<MarketSession>, GatewayContract, TopOfBook)>,
}

impl BrokerState {
    fn tick(&mut self) -> i64 {
        self.clock = self.clock.max(now_ms()).max(self.clock + 1);
        self.clock
    }

    fn instrument_id(&self, symbol: &str) -> String {
        self.by_symbol.get(symbol).cloned().unwrap_or_else(|| symbol.to_string())
    }
}

struct Shared {
    name: String,
    state: Mutex<BrokerState>,
    events: Mutex<Option<mpsc::UnboundedSender<AccountEvent>>>,
}

impl Shared {
    fn emit(&self, ev: AccountEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(ev);
        }
    }

    fn on_message(&self, msg: &GatewayMessage) {
        match msg {
            GatewayMessage::OrderStatus(s) => {
                if let Some(snap) = self.on_order_status(s) {
                    self.emit(AccountEvent::Order(snap));
                }
            }
            GatewayMessage::Error { req_id, code, msg } if *req_id >= 0 => {
                if let Some(snap) = self.on_order_error(*req_id, *code, msg) {
                    self.emit(AccountEvent::Order(snap));
                }
            }
            GatewayMessage::AccountValue { key, value, currency, .. } if key == "CashBalance" => {
                let Ok(rights) = value.parse::<Decimal>() else {
                    warn!(venue = %self.name, %key, %value, "unparseable account value");
                    return;
                };
                let update = {
                    let mut st = lock(&self.state);
                    let ts = st.tick();
                    let b = BalanceUpdate { ccy: currency.clone(), rights, frozen: Decimal::ZERO, ts };
                    st.balances.insert(currency.clone(), b.clone());
                    b
                };
                self.emit(AccountEvent::Balance(update));
            }
            GatewayMessage::TickPrice { req_id, tick_type, price, size } => {
                self.on_tick(*req_id, *tick_type, *price, *size);
            }
            GatewayMessage::TickSize { req_id, tick_type, size } => {
                self.on_tick(*req_id, *tick_type, None, *size);
            }
            _ => {}
        }
    }

    fn on_order_status(&self, s: &OrderStatusMsg) -> Option<OrderSnapshot> {
        let mut st = lock(&self.state);
        let ts = st.tick();
        let Some(o) = st.orders.get_mut(&s.order_id) else {
            debug!(venue = %self.name, order_id = s.order_id, "status for untracked order");
            return None;
        };
        let delta = s.filled - o.filled;
        o.filled = o.filled.max(s.filled);
        if s.filled > Decimal::ZERO {
            o.avg_price = s.avg_fill_price;
        }
        o.status = parse_status(&s.status);
        o.update_time = ts;
        let mut snap = o.snapshot(s.order_id);
        if let (true, Some(px)) = (delta > Decimal::ZERO, s.last_fill_price) {
            snap = snap.with_last_fill(px, delta);
        }
        Some(snap)
    }

    fn on_order_error(&self, order_id: i64, code: i64, text: &str) -> Option<OrderSnapshot> {
        let status = match code {
            CODE_ORDER_CANCELED => OrderStatus::Canceled,
            CODE_CANCEL_NOT_FOUND | CODE_NOT_CANCELLABLE => return None,
            // 2100..2200 are warnings
            c if (2100..2200).contains(&c) => return None,
            _ => OrderStatus::Rejected,
        };
        let mut st = lock(&self.state);
        let ts = st.tick();
        let o = st.orders.get_mut(&order_id)?;
        if o.status.is_terminal() {
            return None;
        }
        warn!(venue = %self.name, order_id, code, msg = %text, "order ended by gateway error");
        o.status = status;
        o.update_time = ts;
        Some(o.snapshot(order_id))
    }

    fn on_tick(&self, req_id: i64, tick_type: i64, price: Option<Decimal>, size: Option<Decimal>) {
        let (market, top, last) = {
            let mut st = lock(&self.state);
            let Some((weak, _, top)) = st.markets.get_mut(&req_id) else { return };
            let mut last = None;
            let (bid_sz, ask_sz) = (top.bid.map(|b| b.1), top.ask.map(|a| a.1));
            match tick_type {
                tick::BID => top.bid = price.map(|p| (p, size.or(bid_sz).unwrap_or_default())),
                tick::ASK => top.ask = price.map(|p| (p, size.or(ask_sz).unwrap_or_default())),
                tick::BID_SIZE => top.bid = top.bid.map(|(p, s)| (p, size.unwrap_or(s))),
                tick::ASK_SIZE => top.ask = top.ask.map(|(p, s)| (p, size.unwrap_or(s))),
                tick::LAST => last = price,
                _ => return,
            }
            (weak.upgrade(), *top, last)
        };
        let Some(market) = market else { return };
        let ts = now_ms();
        if let Some(px) = last {
            market.on_ticker(px, ts);
            return;
        }
        let bids: Vec<(Decimal, Decimal)> = top.bid.into_iter().collect();
        let asks: Vec<(Decimal, Decimal)> = top.ask.into_iter().collect();
        market.on_depth(&asks, &bids, ts);
    }
}

pub struct BrokerVenue {
    client: Arc<FramedTcpClient>,
    contracts: Vec<GatewayContract>,
    time_in_force: String,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ready_timeout: Duration,
}

impl BrokerVenue {
    /// `contracts` are the configured instruments; only those are loaded.
    pub fn new(name: impl Into<String>, client: Arc<FramedTcpClient>, contracts: Vec<GatewayContract>, time_in_force: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(BrokerState::default()),
            events: Mutex::new(None),
        });
        let weak = Arc::downgrade(&shared);
        client.subscribe(Arc::new(move |msg: &GatewayMessage| {
            if let Some(s) = weak.upgrade() {
                s.on_message(msg);
            }
        }));

        // subscriptions do not survive a new session
        let weak = Arc::downgrade(&shared);
        let weak_client = Arc::downgrade(&client);
        client.on_connect(Arc::new(move || {
            let (Some(s), Some(c)) = (weak.upgrade(), weak_client.upgrade()) else { return };
            s.emit(AccountEvent::Resynced);
            let subs: Vec<(i64, GatewayContract)> =
                lock(&s.state).markets.iter().map(|(id, (_, c, _))| (*id, c.clone())).collect();
            let account = c.accounts().into_iter().next().unwrap_or_default();
            let has_stream = lock(&s.events).is_some();
            tokio::spawn(async move {
                if has_stream {
                    if let Err(e) = c.request_account_updates(true, &account).await {
                        warn!(error = %e, "account updates re-request failed");
                    }
                }
                for (id, contract) in subs {
                    if let Err(e) = c.request_market_data(id, &contract).await {
                        warn!(req_id = id, error = %e, "market data re-request failed");
                    }
                }
            });
        }));

        Self {
            client,
            contracts,
            time_in_force: time_in_force.into(),
            shared,
            tasks: Mutex::new(Vec::new()),
            ready_timeout: Duration::from_secs(10),
        }
    }

    pub fn client(&self) -> &Arc<FramedTcpClient> {
        &self.client
    }

    async fn ready(&self) -> VenueResult<()> {
        self.client.start();
        if self.client.wait_ready(self.ready_timeout).await {
            Ok(())
        } else {
            Err(VenueError::NotReady(format!("{} gateway not ready", self.shared.name)))
        }
    }

    fn contract_for(&self, instrument: &str) -> VenueResult<GatewayContract> {
        lock(&self.shared.state)
            .catalog
            .get(instrument)
            .cloned()
            .ok_or_else(|| VenueError::InvalidRequest(format!("{instrument} not in catalog")))
    }

    fn order_id(&self, order: &OrderRef) -> Option<i64> {
        order
            .venue_id
            .as_deref()
            .and_then(|v| v.parse().ok())
            .or_else(|| lock(&self.shared.state).by_client.get(&order.client_id).copied())
    }

    async fn describe(&self, contract: &GatewayContract) -> VenueResult<Instrument> {
        let details = self.client.contract_details(contract).await?;
        let d = details
            .into_iter()
            .next()
            .ok_or_else(|| VenueError::Decode(format!("{}: no contract details", contract.symbol)))?;
        let mut tick = d.min_tick;
        if let Some(rule) = d.market_rule_ids.split(',').next().and_then(|r| r.trim().parse::<i64>().ok()) {
            match self.client.market_rule(rule).await {
                Ok(increments) => {
                    if let Some((_, inc)) = increments.first() {
                        tick = *inc;
                    }
                }
                Err(e) => warn!(venue = %self.shared.name, rule, error = %e, "market rule lookup failed, using min tick"),
            }
        }
        let lot = d.size_increment.filter(|s| *s > Decimal::ZERO).unwrap_or(Decimal::ONE);
        let min = d.min_size.filter(|s| *s > Decimal::ZERO).unwrap_or(lot);
        let hours = if d.liquid_hours.is_empty() { d.trading_hours.clone() } else { d.liquid_hours.clone() };
        let inst = Instrument::new(
            &d.contract.symbol,
            &d.contract.symbol,
            &d.contract.currency,
            instrument_kind(&d.contract.sec_type),
            tick,
            lot,
            min,
            Decimal::ZERO,
        )?;
        let inst = if hours.is_empty() { inst } else { inst.with_trading_hours(hours, time_zone(&d.time_zone_id)) };
        let mut st = lock(&self.shared.state);
        st.catalog.insert(inst.id.clone(), GatewayContract { exchange: contract.exchange.clone(), ..d.contract });
        st.by_symbol.insert(inst.symbol.clone(), inst.id.clone());
        Ok(inst)
    }

    fn open_order_snapshot(&self, o: &OpenOrderMsg) -> OrderSnapshot {
        let mut st = lock(&self.shared.state);
        let ts = st.tick();
        if let Some(t) = st.orders.get(&o.order_id) {
            return t.snapshot(o.order_id).from_source(SnapshotSource::Poll);
        }
        let side = if o.action == "SELL" { Side::Sell } else { Side::Buy };
        let instrument = st.instrument_id(&o.contract.symbol);
        let mut snap = OrderSnapshot::new(instrument, parse_status(&o.status), Decimal::ZERO, Decimal::ZERO, ts)
            .with_client_id(o.order_id.to_string())
            .with_venue_id(o.order_id.to_string())
            .with_side(side)
            .from_source(SnapshotSource::Poll);
        if let Some(px) = o.limit_price {
            snap = snap.with_price_size(px, o.total_qty);
        }
        snap
    }
}

#[async_trait]
impl OrderVenue for BrokerVenue {
    fn venue_name(&self) -> &str {
        &self.shared.name
    }

    async fn place_order(&self, req: &OrderRequest) -> VenueResult<PlaceAck> {
        let contract = self.contract_for(&req.instrument)?;
        let order_id = self.client.next_order_id();
        {
            let mut st = lock(&self.shared.state);
            let ts = st.tick();
            st.orders.insert(
                order_id,
                TrackedOrder {
                    client_id: req.client_id.clone(),
                    instrument: req.instrument.clone(),
                    side: req.side,
                    price: req.price,
                    size: req.size,
                    filled: Decimal::ZERO,
                    avg_price: Decimal::ZERO,
                    status: OrderStatus::New,
                    update_time: ts,
                },
            );
            st.by_client.insert(req.client_id.clone(), order_id);
        }
        let ticket = OrderTicket {
            side: req.side,
            quantity: req.size,
            limit_price: Some(req.price),
            time_in_force: self.time_in_force.clone(),
            outside_rth: false,
        };
        if let Err(e) = self.client.place_order(order_id, &contract, &ticket).await {
            let mut st = lock(&self.shared.state);
            st.orders.remove(&order_id);
            st.by_client.remove(&req.client_id);
            return Err(e);
        }
        Ok(PlaceAck { venue_id: Some(order_id.to_string()), client_id: Some(req.client_id.clone()), snapshot: None })
    }

    async fn cancel_order(&self, order: &OrderRef) -> VenueResult<Option<OrderSnapshot>> {
        let order_id = self
            .order_id(order)
            .ok_or_else(|| VenueError::business(CODE_CANCEL_NOT_FOUND, "order to cancel not found"))?;
        let terminal = lock(&self.shared.state).orders.get(&order_id).map_or(false, |o| o.status.is_terminal());
        if terminal {
            return Err(VenueError::business(CODE_NOT_CANCELLABLE, "order not in a cancellable state"));
        }
        self.client.cancel_order(order_id).await?;
        Ok(None)
    }

    async fn query_order(&self, order: &OrderRef) -> VenueResult<OrderSnapshot> {
        let order_id = self
            .order_id(order)
            .ok_or_else(|| VenueError::business(CODE_CANCEL_NOT_FOUND, "order not found"))?;
        // statuses of open orders are re-sent as a side effect
        let open = self.client.open_orders().await?;
        if let Some(o) = open.iter().find(|o| o.order_id == order_id) {
            return Ok(self.open_order_snapshot(o));
        }
        lock(&self.shared.state)
            .orders
            .get(&order_id)
            .map(|t| t.snapshot(order_id).from_source(SnapshotSource::Poll))
            .ok_or_else(|| VenueError::business(CODE_CANCEL_NOT_FOUND, "order not found"))
    }

    fn is_benign_cancel_error(&self, err: &VenueError) -> bool {
        matches!(err.code(), Some(CODE_CANCEL_NOT_FOUND) | Some(CODE_NOT_CANCELLABLE))
    }
}

#[async_trait]
impl VenueApi for BrokerVenue {
    async fn server_time(&self) -> VenueResult<i64> {
        self.ready().await?;
        Ok(self.client.current_time().await? * 1000)
    }

    async fn load_instruments(&self) -> VenueResult<Vec<Instrument>> {
        self.ready().await?;
        let mut out = Vec::with_capacity(self.contracts.len());
        for c in &self.contracts {
            match self.describe(c).await {
                Ok(i) => out.push(i),
                Err(e) if e.is_business() => {
                    warn!(venue = %self.shared.name, symbol = %c.symbol, error = %e, "contract skipped")
                }
                Err(e) => return Err(e),
            }
        }
        info!(venue = %self.shared.name, count = out.len(), "catalog loaded");
        Ok(out)
    }

    async fn open_orders(&self) -> VenueResult<Vec<OrderSnapshot>> {
        self.ready().await?;
        let open = self.client.open_orders().await?;
        Ok(open
            .iter()
            .filter(|o| !parse_status(&o.status).is_terminal())
            .map(|o| self.open_order_snapshot(o))
            .collect())
    }

    /// Global cancel: the gateway has no per-symbol variant.
    async fn cancel_all(&self, symbols: &[String]) -> VenueResult<()> {
        self.ready().await?;
        info!(venue = %self.shared.name, ?symbols, "global cancel");
        self.client.global_cancel().await
    }

    async fn account_snapshot(&self) -> VenueResult<Vec<BalanceUpdate>> {
        self.ready().await?;
        let account = self.client.accounts().into_iter().next().unwrap_or_default();
        self.client.request_account_updates(true, &account).await?;
        let deadline = Instant::now() + self.client.config().request_timeout;
        while lock(&self.shared.state).balances.is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        let mut list: Vec<BalanceUpdate> = lock(&self.shared.state).balances.values().cloned().collect();
        list.sort_by(|a, b| a.ccy.cmp(&b.ccy));
        Ok(list)
    }

    async fn start_account_stream(&self, events: mpsc::UnboundedSender<AccountEvent>) -> VenueResult<()> {
        self.ready().await?;
        let _ = events.send(AccountEvent::Resynced);
        *lock(&self.shared.events) = Some(events);
        let account = self.client.accounts().into_iter().next().unwrap_or_default();
        self.client.request_account_updates(true, &account).await
    }

    async fn subscribe_market(&self, market: Arc<MarketSession>) -> VenueResult<()> {
        self.ready().await?;
        let contract = self.contract_for(market.instrument_id())?;
        let req_id = self.client.next_request_id();
        lock(&self.shared.state)
            .markets
            .insert(req_id, (Arc::downgrade(&market), contract.clone(), TopOfBook::default()));
        self.client.request_market_data(req_id, &contract).await?;

        let client = Arc::downgrade(&self.client);
        market.set_resubscribe_hook(Arc::new(move |ch: MarketChannel| {
            let Some(c) = client.upgrade() else { return };
            let contract = contract.clone();
            debug!(req_id, channel = ch.as_str(), "re-requesting market data");
            tokio::spawn(async move {
                let _ = c.cancel_market_data(req_id).await;
                if let Err(e) = c.request_market_data(req_id, &contract).await {
                    warn!(req_id, error = %e, "market data re-request failed");
                }
            });
        }));

        // session state drives the market's connected flag
        let client = Arc::downgrade(&self.client);
        let weak = Arc::downgrade(&market);
        let handle = tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let (Some(m), Some(c)) = (weak.upgrade(), client.upgrade()) else { return };
                m.set_connected(c.is_ready());
            }
        });
        lock(&self.tasks).push(handle);
        Ok(())
    }

    async fn stop(&self) {
        *lock(&self.shared.events) = None;
        for t in lock(&self.tasks).drain(..) {
            t.abort();
        }
        self.client.close().await;
    }
}

#[async_trait]
impl SeriesSource<Klines> for BrokerVenue {
    /// `instrument` is a catalog id or a configured symbol.
    async fn fetch_page(&self, instrument: &str, interval: Option<&str>, start: i64, end: i64) -> VenueResult<Vec<Kline>> {
        let interval = interval.ok_or_else(|| VenueError::InvalidRequest("bars need an interval".into()))?;
        let size = bar_size(interval).ok_or_else(|| VenueError::InvalidRequest(format!("unsupported bar size {interval}")))?;
        self.ready().await?;
        let id = lock(&self.shared.state).instrument_id(instrument);
        let contract = self.contract_for(&id)?;
        let end_str = Utc
            .timestamp_millis_opt(end)
            .single()
            .ok_or_else(|| VenueError::InvalidRequest(format!("bad end time {end}")))?
            .format("%Y%m%d-%H:%M:%S")
            .to_string();
        let bars = self.client.historical_data(&contract, &end_str, &duration_str(start, end), size, "TRADES").await?;
        let step = interval_ms(interval).unwrap_or(1);
        let mut out: Vec<Kline> = bars
            .iter()
            .filter_map(|b| {
                let k = to_kline(b);
                if k.is_none() {
                    debug!(date = %b.date, "unparseable bar time, dropped");
                }
                k
            })
            .filter(|k| k.open_time >= start && k.open_time < end && k.open_time % step == 0)
            .collect();
        out.sort_by_key(|k| k.open_time);
        out.truncate(self.page_limit());
        Ok(out)
    }

    fn page_limit(&self) -> usize {
        2_000
    }
}
