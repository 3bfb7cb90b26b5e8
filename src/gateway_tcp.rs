// ===============================
// src/gateway_tcp.rs
// ===============================
//
// Session with a local broker gateway over the framed token wire (see wire.rs).
//
// connect -> "API\0" + version range -> version reply -> StartApi
// ready   <- NextValidId + ManagedAccounts (typed requests fail with NotReady before)
//
// One reader task per connection. Writes happen on the caller's task and are
// serialized by the writer mutex. Request/reply pairs are bridged with a
// one-shot channel and a timeout. Fatal gateway codes, IO errors and frame
// overflow all lead to a reconnect after `reconnect_backoff`.
//
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::domain::Side;
use crate::error::{lock, VenueError, VenueResult};
use crate::metrics::{GATEWAY_CONNECTED, GATEWAY_RECONNECTS};
use crate::wire::{handshake_prefix, take_frame, FieldReader, FieldWriter};

/// Outgoing message ids (gateway's published table).
pub mod msg_out {
    pub const REQ_MKT_DATA: i64 = 1;
    pub const CANCEL_MKT_DATA: i64 = 2;
    pub const PLACE_ORDER: i64 = 3;
    pub const CANCEL_ORDER: i64 = 4;
    pub const REQ_OPEN_ORDERS: i64 = 5;
    pub const REQ_ACCT_DATA: i64 = 6;
    pub const REQ_IDS: i64 = 8;
    pub const REQ_CONTRACT_DATA: i64 = 9;
    pub const REQ_HISTORICAL_DATA: i64 = 20;
    pub const REQ_CURRENT_TIME: i64 = 49;
    pub const REQ_GLOBAL_CANCEL: i64 = 58;
    pub const REQ_POSITIONS: i64 = 61;
    pub const START_API: i64 = 71;
    pub const REQ_MARKET_RULE: i64 = 91;
}

/// Incoming message ids.
pub mod msg_in {
    pub const TICK_PRICE: i64 = 1;
    pub const TICK_SIZE: i64 = 2;
    pub const ORDER_STATUS: i64 = 3;
    pub const ERR_MSG: i64 = 4;
    pub const OPEN_ORDER: i64 = 5;
    pub const ACCT_VALUE: i64 = 6;
    pub const PORTFOLIO_VALUE: i64 = 7;
    pub const NEXT_VALID_ID: i64 = 9;
    pub const CONTRACT_DATA: i64 = 10;
    pub const MANAGED_ACCTS: i64 = 15;
    pub const HISTORICAL_DATA: i64 = 17;
    pub const CURRENT_TIME: i64 = 49;
    pub const CONTRACT_DATA_END: i64 = 52;
    pub const OPEN_ORDER_END: i64 = 53;
    pub const MARKET_RULE: i64 = 93;
}

/// Tick types carried by TickPrice / TickSize.
pub mod tick {
    pub const BID_SIZE: i64 = 0;
    pub const BID: i64 = 1;
    pub const ASK: i64 = 2;
    pub const ASK_SIZE: i64 = 3;
    pub const LAST: i64 = 4;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayContract {
    pub con_id: Option<i64>,
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
}

impl GatewayContract {
    pub fn write(&self, w: &mut FieldWriter) {
        w.push_opt_int(self.con_id)
            .push_str(&self.symbol)
            .push_str(&self.sec_type)
            .push_str(&self.exchange)
            .push_str(&self.currency);
    }

    pub fn read(r: &mut FieldReader) -> VenueResult<Self> {
        Ok(Self {
            con_id: r.next_opt_int()?,
            symbol: r.next_str()?,
            sec_type: r.next_str()?,
            exchange: r.next_str()?,
            currency: r.next_str()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractDetails {
    pub contract: GatewayContract,
    pub market_name: String,
    pub min_tick: Decimal,
    pub long_name: String,
    pub time_zone_id: String,
    pub trading_hours: String,
    pub liquid_hours: String,
    /// Comma separated, one per valid exchange.
    pub market_rule_ids: String,
    pub min_size: Option<Decimal>,
    pub size_increment: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusMsg {
    pub order_id: i64,
    pub status: String,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub avg_fill_price: Decimal,
    pub perm_id: i64,
    pub parent_id: i64,
    pub last_fill_price: Option<Decimal>,
    pub client_id: i64,
    pub why_held: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrderMsg {
    pub order_id: i64,
    pub contract: GatewayContract,
    pub action: String,
    pub total_qty: Decimal,
    pub order_type: String,
    pub limit_price: Option<Decimal>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalBar {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMessage {
    TickPrice { req_id: i64, tick_type: i64, price: Option<Decimal>, size: Option<Decimal> },
    TickSize { req_id: i64, tick_type: i64, size: Option<Decimal> },
    OrderStatus(OrderStatusMsg),
    Error { req_id: i64, code: i64, msg: String },
    OpenOrder(OpenOrderMsg),
    OpenOrderEnd,
    AccountValue { key: String, value: String, currency: String, account: String },
    PortfolioValue { contract: GatewayContract, position: Decimal, market_price: f64, account: String },
    NextValidId(i64),
    ManagedAccounts(Vec<String>),
    ContractData { req_id: i64, details: ContractDetails },
    ContractDataEnd { req_id: i64 },
    HistoricalData { req_id: i64, bars: Vec<HistoricalBar> },
    CurrentTime(i64),
    MarketRule { id: i64, increments: Vec<(Decimal, Decimal)> },
    Other { msg_id: i64, fields: Vec<String> },
}

impl GatewayMessage {
    pub fn decode(payload: &[u8]) -> VenueResult<Self> {
        let mut r = FieldReader::from_payload(payload);
        let msg_id = r.next_int()?;
        let msg = match msg_id {
            msg_in::TICK_PRICE => {
                r.skip(1); // version
                GatewayMessage::TickPrice {
                    req_id: r.next_int()?,
                    tick_type: r.next_int()?,
                    price: r.next_opt_decimal()?,
                    size: r.next_opt_decimal()?,
                }
            }
            msg_in::TICK_SIZE => {
                r.skip(1);
                GatewayMessage::TickSize { req_id: r.next_int()?, tick_type: r.next_int()?, size: r.next_opt_decimal()? }
            }
            msg_in::ORDER_STATUS => GatewayMessage::OrderStatus(OrderStatusMsg {
                order_id: r.next_int()?,
                status: r.next_str()?,
                filled: r.next_decimal()?,
                remaining: r.next_decimal()?,
                avg_fill_price: r.next_decimal()?,
                perm_id: r.next_int()?,
                parent_id: r.next_int()?,
                last_fill_price: r.next_opt_decimal()?,
                client_id: r.next_int()?,
                why_held: r.next_str()?,
            }),
            msg_in::ERR_MSG => {
                r.skip(1);
                GatewayMessage::Error { req_id: r.next_int()?, code: r.next_int()?, msg: r.next_str()? }
            }
            msg_in::OPEN_ORDER => GatewayMessage::OpenOrder(OpenOrderMsg {
                order_id: r.next_int()?,
                contract: GatewayContract::read(&mut r)?,
                action: r.next_str()?,
                total_qty: r.next_decimal()?,
                order_type: r.next_str()?,
                limit_price: r.next_opt_decimal()?,
                status: r.next_str()?,
            }),
            msg_in::OPEN_ORDER_END => GatewayMessage::OpenOrderEnd,
            msg_in::ACCT_VALUE => {
                r.skip(1);
                GatewayMessage::AccountValue {
                    key: r.next_str()?,
                    value: r.next_str()?,
                    currency: r.next_str()?,
                    account: r.next_str()?,
                }
            }
            msg_in::PORTFOLIO_VALUE => {
                r.skip(1);
                GatewayMessage::PortfolioValue {
                    contract: GatewayContract::read(&mut r)?,
                    position: r.next_decimal()?,
                    market_price: r.next_f64()?,
                    account: r.next_str()?,
                }
            }
            msg_in::NEXT_VALID_ID => {
                r.skip(1);
                GatewayMessage::NextValidId(r.next_int()?)
            }
            msg_in::MANAGED_ACCTS => {
                r.skip(1);
                let list = r.next_str()?;
                GatewayMessage::ManagedAccounts(
                    list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect(),
                )
            }
            msg_in::CONTRACT_DATA => {
                let req_id = r.next_int()?;
                let details = ContractDetails {
                    contract: GatewayContract::read(&mut r)?,
                    market_name: r.next_str()?,
                    min_tick: r.next_decimal()?,
                    long_name: r.next_str()?,
                    time_zone_id: r.next_str()?,
                    trading_hours: r.next_str()?,
                    liquid_hours: r.next_str()?,
                    market_rule_ids: r.next_str()?,
                    min_size: r.next_opt_decimal()?,
                    size_increment: r.next_opt_decimal()?,
                };
                GatewayMessage::ContractData { req_id, details }
            }
            msg_in::CONTRACT_DATA_END => {
                r.skip(1);
                GatewayMessage::ContractDataEnd { req_id: r.next_int()? }
            }
            msg_in::HISTORICAL_DATA => {
                let req_id = r.next_int()?;
                r.skip(2); // start, end
                let n = r.next_int()?.max(0) as usize;
                // a bar spans 8 fields; the count itself is untrusted
                let mut bars = Vec::with_capacity(n.min(r.remaining() / 8));
                for _ in 0..n {
                    let bar = HistoricalBar {
                        date: r.next_str()?,
                        open: r.next_f64()?,
                        high: r.next_f64()?,
                        low: r.next_f64()?,
                        close: r.next_f64()?,
                        volume: r.next_f64()?,
                    };
                    r.skip(2); // wap, bar count
                    bars.push(bar);
                }
                GatewayMessage::HistoricalData { req_id, bars }
            }
            msg_in::CURRENT_TIME => {
                r.skip(1);
                GatewayMessage::CurrentTime(r.next_int()?)
            }
            msg_in::MARKET_RULE => {
                let id = r.next_int()?;
                let n = r.next_int()?.max(0) as usize;
                let mut increments = Vec::with_capacity(n.min(r.remaining() / 2));
                for _ in 0..n {
                    increments.push((r.next_decimal()?, r.next_decimal()?));
                }
                GatewayMessage::MarketRule { id, increments }
            }
            other => {
                let mut fields = Vec::with_capacity(r.remaining());
                while r.remaining() > 0 {
                    fields.push(r.next_str()?);
                }
                GatewayMessage::Other { msg_id: other, fields }
            }
        };
        Ok(msg)
    }

    /// Gateway-side encoding; the inverse of [`GatewayMessage::decode`].
    pub fn encode(&self) -> FieldWriter {
        let mut w = FieldWriter::new();
        match self {
            GatewayMessage::TickPrice { req_id, tick_type, price, size } => {
                w.push_int(msg_in::TICK_PRICE).push_int(6).push_int(*req_id).push_int(*tick_type);
                w.push_opt_decimal(*price).push_opt_decimal(*size);
            }
            GatewayMessage::TickSize { req_id, tick_type, size } => {
                w.push_int(msg_in::TICK_SIZE).push_int(6).push_int(*req_id).push_int(*tick_type);
                w.push_opt_decimal(*size);
            }
            GatewayMessage::OrderStatus(s) => {
                w.push_int(msg_in::ORDER_STATUS)
                    .push_int(s.order_id)
                    .push_str(&s.status)
                    .push_decimal(s.filled)
                    .push_decimal(s.remaining)
                    .push_decimal(s.avg_fill_price)
                    .push_int(s.perm_id)
                    .push_int(s.parent_id)
                    .push_opt_decimal(s.last_fill_price)
                    .push_int(s.client_id)
                    .push_str(&s.why_held);
            }
            GatewayMessage::Error { req_id, code, msg } => {
                w.push_int(msg_in::ERR_MSG).push_int(2).push_int(*req_id).push_int(*code).push_str(msg);
            }
            GatewayMessage::OpenOrder(o) => {
                w.push_int(msg_in::OPEN_ORDER).push_int(o.order_id);
                o.contract.write(&mut w);
                w.push_str(&o.action)
                    .push_decimal(o.total_qty)
                    .push_str(&o.order_type)
                    .push_opt_decimal(o.limit_price)
                    .push_str(&o.status);
            }
            GatewayMessage::OpenOrderEnd => {
                w.push_int(msg_in::OPEN_ORDER_END).push_int(1);
            }
            GatewayMessage::AccountValue { key, value, currency, account } => {
                w.push_int(msg_in::ACCT_VALUE).push_int(2).push_str(key).push_str(value).push_str(currency).push_str(account);
            }
            GatewayMessage::PortfolioValue { contract, position, market_price, account } => {
                w.push_int(msg_in::PORTFOLIO_VALUE).push_int(8);
                contract.write(&mut w);
                w.push_decimal(*position).push_f64(*market_price).push_str(account);
            }
            GatewayMessage::NextValidId(id) => {
                w.push_int(msg_in::NEXT_VALID_ID).push_int(1).push_int(*id);
            }
            GatewayMessage::ManagedAccounts(list) => {
                w.push_int(msg_in::MANAGED_ACCTS).push_int(1).push_str(&list.join(","));
            }
            GatewayMessage::ContractData { req_id, details: d } => {
                w.push_int(msg_in::CONTRACT_DATA).push_int(*req_id);
                d.contract.write(&mut w);
                w.push_str(&d.market_name)
                    .push_decimal(d.min_tick)
                    .push_str(&d.long_name)
                    .push_str(&d.time_zone_id)
                    .push_str(&d.trading_hours)
                    .push_str(&d.liquid_hours)
                    .push_str(&d.market_rule_ids)
                    .push_opt_decimal(d.min_size)
                    .push_opt_decimal(d.size_increment);
            }
            GatewayMessage::ContractDataEnd { req_id } => {
                w.push_int(msg_in::CONTRACT_DATA_END).push_int(1).push_int(*req_id);
            }
            GatewayMessage::HistoricalData { req_id, bars } => {
                w.push_int(msg_in::HISTORICAL_DATA).push_int(*req_id).push_str("").push_str("");
                w.push_int(bars.len() as i64);
                for b in bars {
                    w.push_str(&b.date)
                        .push_f64(b.open)
                        .push_f64(b.high)
                        .push_f64(b.low)
                        .push_f64(b.close)
                        .push_f64(b.volume)
                        .push_str("")
                        .push_str("");
                }
            }
            GatewayMessage::CurrentTime(t) => {
                w.push_int(msg_in::CURRENT_TIME).push_int(1).push_int(*t);
            }
            GatewayMessage::MarketRule { id, increments } => {
                w.push_int(msg_in::MARKET_RULE).push_int(*id).push_int(increments.len() as i64);
                for (edge, inc) in increments {
                    w.push_decimal(*edge).push_decimal(*inc);
                }
            }
            GatewayMessage::Other { msg_id, fields } => {
                w.push_int(*msg_id);
                for f in fields {
                    w.push_str(f);
                }
            }
        }
        w
    }
}

/// Limit or market order as the gateway takes it.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTicket {
    pub side: Side,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub time_in_force: String,
    pub outside_rth: bool,
}

impl OrderTicket {
    pub fn order_type(&self) -> &'static str {
        if self.limit_price.is_some() { "LMT" } else { "MKT" }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub address: String,
    pub port: u16,
    pub client_id: i64,
    pub request_timeout: Duration,
    pub reconnect_backoff: Duration,
    /// Gateway error codes that force a reconnect.
    pub fatal_codes: Vec<i64>,
    pub optional_caps: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 4002,
            client_id: 1,
            request_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(3),
            fatal_codes: vec![507, 509, 1300],
            optional_caps: None,
        }
    }
}

pub type MessageHandler = Arc<dyn Fn(&GatewayMessage) + Send + Sync>;
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

enum WaitEvent<'a> {
    Message(&'a GatewayMessage),
    Closed,
}

/// Returns true once the waiter is done and can be dropped.
type Waiter = Box<dyn FnMut(WaitEvent<'_>) -> bool + Send>;

struct Inner {
    cfg: GatewayConfig,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    handlers: Mutex<Vec<MessageHandler>>,
    connect_cbs: Mutex<Vec<ConnectCallback>>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_waiter: AtomicU64,
    got_next_id: AtomicBool,
    got_accounts: AtomicBool,
    ready_tx: watch::Sender<bool>,
    next_order_id: AtomicI64,
    next_req_id: AtomicI64,
    accounts: Mutex<Vec<String>>,
    server_version: AtomicI64,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    kill: Notify,
}

impl Inner {
    fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    async fn wait_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn fail_waiters(&self) {
        let drained: Vec<Waiter> = lock(&self.waiters).drain().map(|(_, w)| w).collect();
        for mut w in drained {
            w(WaitEvent::Closed);
        }
    }

    /// Returns the error code when the message demands a reconnect.
    fn on_message(&self, msg: GatewayMessage) -> Option<i64> {
        let mut fatal = None;
        match &msg {
            GatewayMessage::NextValidId(id) => {
                self.next_order_id.fetch_max(*id, Ordering::AcqRel);
                self.got_next_id.store(true, Ordering::Release);
            }
            GatewayMessage::ManagedAccounts(list) => {
                *lock(&self.accounts) = list.clone();
                self.got_accounts.store(true, Ordering::Release);
            }
            GatewayMessage::Error { req_id, code, msg: text } => {
                if self.cfg.fatal_codes.contains(code) {
                    warn!(code, msg = %text, "gateway signalled fatal error");
                    fatal = Some(*code);
                } else if *req_id < 0 {
                    debug!(code, msg = %text, "gateway notice");
                } else {
                    warn!(req_id, code, msg = %text, "gateway error");
                }
            }
            _ => {}
        }

        {
            let mut waiters = lock(&self.waiters);
            waiters.retain(|_, w| !w(WaitEvent::Message(&msg)));
        }

        let handlers: Vec<MessageHandler> = lock(&self.handlers).clone();
        for h in handlers {
            h(&msg);
        }

        if !self.is_ready()
            && self.got_next_id.load(Ordering::Acquire)
            && self.got_accounts.load(Ordering::Acquire)
        {
            self.ready_tx.send_replace(true);
            GATEWAY_CONNECTED.set(1);
            info!(
                next_order_id = self.next_order_id.load(Ordering::Relaxed),
                accounts = ?lock(&self.accounts),
                "gateway session ready"
            );
            let cbs: Vec<ConnectCallback> = lock(&self.connect_cbs).clone();
            for cb in cbs {
                cb();
            }
        }
        fatal
    }

    fn reset_session(&self) {
        self.ready_tx.send_replace(false);
        self.got_next_id.store(false, Ordering::Release);
        self.got_accounts.store(false, Ordering::Release);
        GATEWAY_CONNECTED.set(0);
        self.fail_waiters();
    }
}

pub struct FramedTcpClient {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FramedTcpClient {
    pub fn new(cfg: GatewayConfig) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cfg,
                writer: tokio::sync::Mutex::new(None),
                handlers: Mutex::new(Vec::new()),
                connect_cbs: Mutex::new(Vec::new()),
                waiters: Mutex::new(HashMap::new()),
                next_waiter: AtomicU64::new(1),
                got_next_id: AtomicBool::new(false),
                got_accounts: AtomicBool::new(false),
                ready_tx,
                next_order_id: AtomicI64::new(0),
                next_req_id: AtomicI64::new(1),
                accounts: Mutex::new(Vec::new()),
                server_version: AtomicI64::new(0),
                closed: AtomicBool::new(false),
                shutdown_tx,
                kill: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.cfg
    }

    /// Spawn the session task. Idempotent.
    pub fn start(&self) {
        let mut task = lock(&self.task);
        if task.is_none() {
            *task = Some(tokio::spawn(run(self.inner.clone())));
        }
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_tx.send_replace(true);
        if let Some(mut w) = self.inner.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        let handle = lock(&self.task).take();
        if let Some(h) = handle {
            if timeout(Duration::from_secs(2), h).await.is_err() {
                warn!("gateway session task did not stop in time");
            }
        }
        self.inner.reset_session();
        info!("gateway client closed");
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub async fn wait_ready(&self, within: Duration) -> bool {
        let mut rx = self.inner.ready_tx.subscribe();
        let fut = async {
            loop {
                if *rx.borrow() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        timeout(within, fut).await.unwrap_or(false)
    }

    pub fn server_version(&self) -> i64 {
        self.inner.server_version.load(Ordering::Relaxed)
    }

    pub fn accounts(&self) -> Vec<String> {
        lock(&self.inner.accounts).clone()
    }

    pub fn subscribe(&self, handler: MessageHandler) {
        lock(&self.inner.handlers).push(handler);
    }

    /// Fired in registration order each time a session becomes ready.
    pub fn on_connect(&self, cb: ConnectCallback) {
        lock(&self.inner.connect_cbs).push(cb);
    }

    pub fn next_order_id(&self) -> i64 {
        self.inner.next_order_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn next_request_id(&self) -> i64 {
        self.inner.next_req_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Drop the socket; the session task reconnects.
    pub fn force_reconnect(&self) {
        self.inner.kill.notify_waiters();
    }

    fn ensure_ready(&self) -> VenueResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(VenueError::ConnectionClosed);
        }
        if !self.is_ready() {
            return Err(VenueError::NotReady("gateway handshake incomplete".into()));
        }
        Ok(())
    }

    async fn send(&self, w: &FieldWriter) -> VenueResult<()> {
        let bytes = w.finish()?;
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(VenueError::ConnectionClosed)?;
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(?e, "gateway write failed");
            *guard = None;
            drop(guard);
            self.force_reconnect();
            return Err(VenueError::from(e));
        }
        Ok(())
    }

    /// Send a request and wait for `on_msg` to produce a result.
    async fn request<T, F>(&self, w: FieldWriter, mut on_msg: F) -> VenueResult<T>
    where
        T: Send + 'static,
        F: FnMut(&GatewayMessage) -> Option<VenueResult<T>> + Send + 'static,
    {
        self.ensure_ready()?;
        let (tx, rx) = oneshot::channel::<VenueResult<T>>();
        let mut slot = Some(tx);
        let waiter: Waiter = Box::new(move |ev: WaitEvent<'_>| {
            let outcome = match ev {
                WaitEvent::Message(m) => on_msg(m),
                WaitEvent::Closed => Some(Err(VenueError::ConnectionClosed)),
            };
            match outcome {
                Some(res) => {
                    if let Some(tx) = slot.take() {
                        let _ = tx.send(res);
                    }
                    true
                }
                None => false,
            }
        });
        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.waiters).insert(id, waiter);

        if let Err(e) = self.send(&w).await {
            lock(&self.inner.waiters).remove(&id);
            return Err(e);
        }
        match timeout(self.inner.cfg.request_timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(VenueError::ConnectionClosed),
            Err(_) => {
                lock(&self.inner.waiters).remove(&id);
                Err(VenueError::Timeout("gateway request".into()))
            }
        }
    }

    pub async fn current_time(&self) -> VenueResult<i64> {
        let mut w = FieldWriter::new();
        w.push_int(msg_out::REQ_CURRENT_TIME).push_int(1);
        self.request(w, |m| match m {
            GatewayMessage::CurrentTime(t) => Some(Ok(*t)),
            _ => None,
        })
        .await
    }

    pub async fn contract_details(&self, contract: &GatewayContract) -> VenueResult<Vec<ContractDetails>> {
        let req_id = self.next_request_id();
        let mut w = FieldWriter::new();
        w.push_int(msg_out::REQ_CONTRACT_DATA).push_int(8).push_int(req_id);
        contract.write(&mut w);
        let mut found = Vec::new();
        self.request(w, move |m| match m {
            GatewayMessage::ContractData { req_id: id, details } if *id == req_id => {
                found.push(details.clone());
                None
            }
            GatewayMessage::ContractDataEnd { req_id: id } if *id == req_id => Some(Ok(std::mem::take(&mut found))),
            GatewayMessage::Error { req_id: id, code, msg } if *id == req_id => {
                Some(Err(VenueError::business(*code, msg.clone())))
            }
            _ => None,
        })
        .await
    }

    pub async fn market_rule(&self, rule_id: i64) -> VenueResult<Vec<(Decimal, Decimal)>> {
        let mut w = FieldWriter::new();
        w.push_int(msg_out::REQ_MARKET_RULE).push_int(rule_id);
        self.request(w, move |m| match m {
            GatewayMessage::MarketRule { id, increments } if *id == rule_id => Some(Ok(increments.clone())),
            _ => None,
        })
        .await
    }

    pub async fn historical_data(
        &self,
        contract: &GatewayContract,
        end: &str,
        duration: &str,
        bar_size: &str,
        what_to_show: &str,
    ) -> VenueResult<Vec<HistoricalBar>> {
        let req_id = self.next_request_id();
        let mut w = FieldWriter::new();
        w.push_int(msg_out::REQ_HISTORICAL_DATA).push_int(req_id);
        contract.write(&mut w);
        w.push_str(end)
            .push_str(bar_size)
            .push_str(duration)
            .push_bool(false)
            .push_str(what_to_show)
            .push_int(2);
        self.request(w, move |m| match m {
            GatewayMessage::HistoricalData { req_id: id, bars } if *id == req_id => Some(Ok(bars.clone())),
            GatewayMessage::Error { req_id: id, code, msg } if *id == req_id => {
                Some(Err(VenueError::business(*code, msg.clone())))
            }
            _ => None,
        })
        .await
    }

    pub async fn open_orders(&self) -> VenueResult<Vec<OpenOrderMsg>> {
        let mut w = FieldWriter::new();
        w.push_int(msg_out::REQ_OPEN_ORDERS).push_int(1);
        let mut found = Vec::new();
        self.request(w, move |m| match m {
            GatewayMessage::OpenOrder(o) => {
                found.push(o.clone());
                None
            }
            GatewayMessage::OpenOrderEnd => Some(Ok(std::mem::take(&mut found))),
            _ => None,
        })
        .await
    }

    /// Fire and forget; rejections arrive as `Error { req_id: order_id }`.
    pub async fn place_order(&self, order_id: i64, contract: &GatewayContract, ticket: &OrderTicket) -> VenueResult<()> {
        self.ensure_ready()?;
        let mut w = FieldWriter::new();
        w.push_int(msg_out::PLACE_ORDER).push_int(order_id);
        contract.write(&mut w);
        w.push_str(ticket.side.as_str())
            .push_decimal(ticket.quantity)
            .push_str(ticket.order_type())
            .push_opt_decimal(ticket.limit_price)
            .push_opt_f64(None)
            .push_str(&ticket.time_in_force)
            .push_bool(ticket.outside_rth);
        self.send(&w).await
    }

    pub async fn cancel_order(&self, order_id: i64) -> VenueResult<()> {
        self.ensure_ready()?;
        let mut w = FieldWriter::new();
        w.push_int(msg_out::CANCEL_ORDER).push_int(1).push_int(order_id);
        self.send(&w).await
    }

    pub async fn global_cancel(&self) -> VenueResult<()> {
        self.ensure_ready()?;
        let mut w = FieldWriter::new();
        w.push_int(msg_out::REQ_GLOBAL_CANCEL).push_int(1);
        self.send(&w).await
    }

    pub async fn request_account_updates(&self, subscribe: bool, account: &str) -> VenueResult<()> {
        self.ensure_ready()?;
        let mut w = FieldWriter::new();
        w.push_int(msg_out::REQ_ACCT_DATA).push_int(2).push_bool(subscribe).push_str(account);
        self.send(&w).await
    }

    pub async fn request_positions(&self) -> VenueResult<()> {
        self.ensure_ready()?;
        let mut w = FieldWriter::new();
        w.push_int(msg_out::REQ_POSITIONS).push_int(1);
        self.send(&w).await
    }

    pub async fn request_market_data(&self, req_id: i64, contract: &GatewayContract) -> VenueResult<()> {
        self.ensure_ready()?;
        let mut w = FieldWriter::new();
        w.push_int(msg_out::REQ_MKT_DATA).push_int(11).push_int(req_id);
        contract.write(&mut w);
        w.push_str("").push_bool(false);
        self.send(&w).await
    }

    pub async fn cancel_market_data(&self, req_id: i64) -> VenueResult<()> {
        self.ensure_ready()?;
        let mut w = FieldWriter::new();
        w.push_int(msg_out::CANCEL_MKT_DATA).push_int(2).push_int(req_id);
        self.send(&w).await
    }
}

impl Drop for FramedTcpClient {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.shutdown_tx.send_replace(true);
        self.inner.fail_waiters();
        if let Some(h) = lock(&self.task).take() {
            h.abort();
        }
    }
}

async fn read_frame(rd: &mut OwnedReadHalf, buf: &mut Vec<u8>) -> VenueResult<Vec<u8>> {
    let mut chunk = [0u8; 8192];
    loop {
        if let Some(f) = take_frame(buf)? {
            return Ok(f);
        }
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            return Err(VenueError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn handshake(inner: &Inner, stream: TcpStream, buf: &mut Vec<u8>) -> VenueResult<OwnedReadHalf> {
    let (mut rd, mut wr) = stream.into_split();
    wr.write_all(&handshake_prefix(inner.cfg.optional_caps.as_deref())?).await?;

    let reply = timeout(inner.cfg.request_timeout, read_frame(&mut rd, buf))
        .await
        .map_err(|_| VenueError::Timeout("gateway version reply".into()))??;
    let mut r = FieldReader::from_payload(&reply);
    let version = r.next_int()?;
    let conn_time = r.next_str().unwrap_or_default();
    inner.server_version.store(version, Ordering::Relaxed);
    info!(server_version = version, %conn_time, "gateway handshake accepted");

    let mut w = FieldWriter::new();
    w.push_int(msg_out::START_API)
        .push_int(2)
        .push_int(inner.cfg.client_id)
        .push_str(inner.cfg.optional_caps.as_deref().unwrap_or(""));
    wr.write_all(&w.finish()?).await?;
    *inner.writer.lock().await = Some(wr);
    Ok(rd)
}

async fn run(inner: Arc<Inner>) {
    let addr = format!("{}:{}", inner.cfg.address, inner.cfg.port);
    while !inner.closed.load(Ordering::Acquire) {
        info!(%addr, client_id = inner.cfg.client_id, "connecting gateway");
        let reason = match session(&inner, &addr).await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(%addr, error = %e, "gateway session failed");
                "io"
            }
        };
        *inner.writer.lock().await = None;
        inner.reset_session();
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        GATEWAY_RECONNECTS.with_label_values(&[reason]).inc();
        info!(reason, backoff = ?inner.cfg.reconnect_backoff, "gateway reconnect scheduled");
        tokio::select! {
            _ = sleep(inner.cfg.reconnect_backoff) => {}
            _ = inner.wait_shutdown() => break,
        }
    }
}

async fn session(inner: &Arc<Inner>, addr: &str) -> VenueResult<&'static str> {
    let stream = tokio::select! {
        s = TcpStream::connect(addr) => s?,
        _ = inner.wait_shutdown() => return Ok("shutdown"),
    };
    stream.set_nodelay(true)?;
    let mut buf = Vec::with_capacity(16 * 1024);
    let mut rd = handshake(inner, stream, &mut buf).await?;

    loop {
        let frame = tokio::select! {
            f = read_frame(&mut rd, &mut buf) => f,
            _ = inner.kill.notified() => return Ok("forced"),
            _ = inner.wait_shutdown() => return Ok("shutdown"),
        };
        let payload = match frame {
            Ok(p) => p,
            Err(VenueError::ProtocolFatal(m)) => {
                warn!(msg = %m, "gateway frame overflow");
                return Ok("overflow");
            }
            Err(e) => return Err(e),
        };
        match GatewayMessage::decode(&payload) {
            Ok(msg) => {
                if let Some(code) = inner.on_message(msg) {
                    debug!(code, "dropping session on fatal code");
                    return Ok("fatal_code");
                }
            }
            Err(e) => warn!(error = %e, "gateway message decode failed, dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn decode_roundtrip(m: GatewayMessage) -> GatewayMessage {
        GatewayMessage::decode(m.encode().payload()).unwrap()
    }

    #[test]
    fn contract_data_layout() {
        let m = GatewayMessage::ContractData {
            req_id: 7,
            details: ContractDetails {
                contract: GatewayContract {
                    con_id: Some(265598),
                    symbol: "AAPL".into(),
                    sec_type: "STK".into(),
                    exchange: "SMART".into(),
                    currency: "USD".into(),
                },
                min_tick: dec!(0.01),
                trading_hours: "20240102:0400-20240102:2000;20240103:CLOSED".into(),
                market_rule_ids: "26,26".into(),
                min_size: Some(dec!(1)),
                ..Default::default()
            },
        };
        assert_eq!(decode_roundtrip(m.clone()), m);
    }

    #[test]
    fn order_status_keeps_unset_last_fill() {
        let m = GatewayMessage::OrderStatus(OrderStatusMsg {
            order_id: 12,
            status: "Submitted".into(),
            filled: dec!(0),
            remaining: dec!(100),
            avg_fill_price: dec!(0),
            perm_id: 99,
            parent_id: 0,
            last_fill_price: None,
            client_id: 1,
            why_held: String::new(),
        });
        assert_eq!(decode_roundtrip(m.clone()), m);
    }

    #[test]
    fn unknown_ids_are_kept_raw() {
        let mut w = FieldWriter::new();
        w.push_int(999).push_str("a").push_str("");
        let m = GatewayMessage::decode(w.payload()).unwrap();
        assert_eq!(m, GatewayMessage::Other { msg_id: 999, fields: vec!["a".into(), "".into()] });
    }

    #[test]
    fn oversized_counts_fail_as_decode_errors() {
        let mut w = FieldWriter::new();
        w.push_int(msg_in::HISTORICAL_DATA).push_int(1).push_str("").push_str("").push_int(i64::MAX);
        assert!(matches!(GatewayMessage::decode(w.payload()), Err(VenueError::Decode(_))));

        let mut w = FieldWriter::new();
        w.push_int(msg_in::MARKET_RULE).push_int(26).push_int(1_000_000_000_000).push_str("0").push_str("0.01");
        assert!(matches!(GatewayMessage::decode(w.payload()), Err(VenueError::Decode(_))));
    }

    #[tokio::test]
    async fn requests_fail_fast_before_ready() {
        let client = FramedTcpClient::new(GatewayConfig::default());
        assert!(matches!(client.current_time().await, Err(VenueError::NotReady(_))));
        assert!(matches!(client.cancel_order(1).await, Err(VenueError::NotReady(_))));
    }
}
