// ===============================
// src/gateway_binance.rs
// ===============================
//
// Binance-style venue (REST + user data stream + combined market streams).
//
// - orders: LIMIT GTC, or LIMIT_MAKER when post-only
// - account: listenKey user stream, keepalive every 10 min, re-acquired on
//   keepalive failure or `listenKeyExpired`
// - market: one combined socket, `<sym>@ticker` + `<sym>@depth20@100ms`
// - history: klines and funding rates as series sources
//
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::binance::{
    depth_stream, parse_kline_row, parse_user_event, ticker_stream, AccountInfo, DepthEvent, ExchangeInfo,
    FundingRow, ListenKey, RestOrder, ServerTime, TickerEvent, UserEvent, CODE_UNKNOWN_ORDER,
};
use crate::clock::Clock;
use crate::domain::{now_ms, AccountEvent, BalanceUpdate, FundingRate, Kline, OrderSnapshot, SnapshotSource};
use crate::error::{lock, ErrorReporter, VenueError, VenueResult};
use crate::hub::VenueApi;
use crate::instruments::{Instrument, InstrumentKind};
use crate::market::{MarketChannel, MarketSession};
use crate::metrics::{LISTEN_KEEPALIVE_ERR, LISTEN_KEEPALIVE_OK};
use crate::order::{OrderRef, OrderRequest, OrderVenue, PlaceAck};
use crate::rest::{RestCaller, RestRequest};
use crate::series::{FundingFees, Klines, SeriesSource};
use crate::signer::{Credentials, Signer};
use crate::ws::{FrameHandler, Subscriber, WsConfig, WsConnection, WsState};
use crate::ws_router::WsStreamRouter;

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub rest_url: String,
    /// Socket host, e.g. `wss://stream.binance.com:9443`; `/ws` and `/stream`
    /// are appended.
    pub ws_url: String,
    pub futures_rest_url: String,
    pub recv_window: u64,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub kline_page_limit: usize,
    pub funding_page_limit: usize,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://testnet.binance.vision".to_string(),
            ws_url: "wss://testnet.binance.vision".to_string(),
            futures_rest_url: "https://testnet.binancefuture.com".to_string(),
            recv_window: 5000,
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(600),
            kline_page_limit: 1000,
            funding_page_limit: 1000,
        }
    }
}

#[derive(Default)]
struct SymbolMap {
    by_symbol: HashMap<String, String>,
    by_id: HashMap<String, String>,
}

struct Inner {
    name: String,
    cfg: BinanceConfig,
    rest: RestCaller,
    signer: Signer,
    symbols: Mutex<SymbolMap>,
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.rest_url.trim_end_matches('/'), path)
    }

    fn instrument_id(&self, symbol: &str) -> String {
        lock(&self.symbols).by_symbol.get(symbol).cloned().unwrap_or_else(|| symbol.to_string())
    }

    fn symbol_of(&self, id: &str) -> String {
        lock(&self.symbols).by_id.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    async fn signed<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> VenueResult<T> {
        let (headers, query) = self.signer.sign(params)?;
        self.rest.call(RestRequest::new(method, self.url(path)).query(query).headers(headers)).await
    }

    async fn new_listen_key(&self) -> VenueResult<String> {
        let req = RestRequest::post(self.url("/api/v3/userDataStream")).headers(self.signer.auth_headers()?);
        let key: ListenKey = self.rest.call(req).await?;
        Ok(key.listen_key)
    }

    async fn keepalive(&self, key: &str) -> VenueResult<()> {
        let req = RestRequest::put(self.url("/api/v3/userDataStream"))
            .query(format!("listenKey={}", urlencoding::encode(key)))
            .headers(self.signer.auth_headers()?);
        self.rest.call_raw(req).await.map(|_| ())
    }

    fn user_url(&self, key: &str) -> String {
        format!("{}/ws/{}", self.cfg.ws_url.trim_end_matches('/'), key)
    }
}

fn p(k: &str, v: impl ToString) -> (String, String) {
    (k.to_string(), v.to_string())
}

pub struct BinanceVenue {
    inner: Arc<Inner>,
    router: Arc<WsStreamRouter>,
    market_ws: Mutex<Option<Arc<WsConnection>>>,
    user_ws: Mutex<Option<Arc<WsConnection>>>,
    next_sub_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BinanceVenue {
    pub fn new(
        name: impl Into<String>,
        cfg: BinanceConfig,
        creds: Option<Credentials>,
        clock: Arc<Clock>,
        reporter: Arc<ErrorReporter>,
    ) -> VenueResult<Self> {
        let name = name.into();
        let rest = RestCaller::new(name.clone(), cfg.request_timeout, reporter)?
            .with_rate_limit_headers(&["x-mbx-used-weight", "x-mbx-order-count"]);
        let signer = Signer::new(creds, clock, cfg.recv_window);
        Ok(Self {
            router: Arc::new(WsStreamRouter::new(format!("{name}-market"))),
            inner: Arc::new(Inner { name, cfg, rest, signer, symbols: Mutex::new(SymbolMap::default()) }),
            market_ws: Mutex::new(None),
            user_ws: Mutex::new(None),
            next_sub_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn market_ws(&self) -> Arc<WsConnection> {
        let mut slot = lock(&self.market_ws);
        if let Some(ws) = slot.as_ref() {
            return ws.clone();
        }
        let url = format!("{}/stream", self.inner.cfg.ws_url.trim_end_matches('/'));
        let ws = Arc::new(WsConnection::spawn(
            WsConfig::new(url, format!("{}-market", self.inner.name)),
            self.router.handler(),
        ));
        *slot = Some(ws.clone());
        ws
    }

    fn spawn(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).push(handle);
    }

    async fn klines_page(&self, instrument: &str, interval: &str, start: i64, end: i64) -> VenueResult<Vec<Kline>> {
        let query = format!(
            "symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.inner.symbol_of(instrument),
            interval,
            start,
            end - 1,
            self.inner.cfg.kline_page_limit
        );
        let rows: Vec<Vec<Value>> = self.inner.rest.call(RestRequest::get(self.inner.url("/api/v3/klines")).query(query)).await?;
        rows.iter().map(|r| parse_kline_row(r)).filter(|k| k.as_ref().map_or(true, |k| k.open_time < end)).collect()
    }

    async fn funding_page(&self, instrument: &str, start: i64, end: i64) -> VenueResult<Vec<FundingRate>> {
        let url = format!("{}/fapi/v1/fundingRate", self.inner.cfg.futures_rest_url.trim_end_matches('/'));
        let query = format!(
            "symbol={}&startTime={}&endTime={}&limit={}",
            self.inner.symbol_of(instrument),
            start,
            end - 1,
            self.inner.cfg.funding_page_limit
        );
        let rows: Vec<FundingRow> = self.inner.rest.call(RestRequest::get(url).query(query)).await?;
        rows.iter().map(FundingRow::to_point).collect()
    }
}

fn user_handler(inner: Weak<Inner>, events: mpsc::UnboundedSender<AccountEvent>, expired: Arc<Notify>) -> FrameHandler {
    Arc::new(move |frame: &str| {
        let Some(inner) = inner.upgrade() else { return };
        match parse_user_event(frame) {
            Ok(UserEvent::Execution(er)) => {
                let snap = er.to_snapshot(&inner.instrument_id(&er.symbol));
                let _ = events.send(AccountEvent::Order(snap));
            }
            Ok(UserEvent::Position(pos)) => {
                for b in pos.to_updates() {
                    let _ = events.send(AccountEvent::Balance(b));
                }
            }
            Ok(UserEvent::ListenKeyExpired) => {
                warn!(venue = %inner.name, "listenKey expired");
                expired.notify_one();
            }
            Ok(UserEvent::Other(kind)) => debug!(venue = %inner.name, kind, "user stream event ignored"),
            Err(e) => warn!(venue = %inner.name, error = %e, "undecodable user stream frame"),
        }
    })
}

/// Keep the listen key alive; on failure or expiry get a new one and point
/// the socket at it.
async fn keepalive_loop(inner: Arc<Inner>, ws: Weak<WsConnection>, mut key: String, expired: Arc<Notify>) {
    let mut tick = interval(inner.cfg.keepalive_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        let must_renew = tokio::select! {
            _ = tick.tick() => match inner.keepalive(&key).await {
                Ok(()) => {
                    LISTEN_KEEPALIVE_OK.with_label_values(&[&inner.name]).inc();
                    debug!(venue = %inner.name, "listenKey keepalive ok");
                    false
                }
                Err(e) => {
                    LISTEN_KEEPALIVE_ERR.with_label_values(&[&inner.name]).inc();
                    warn!(venue = %inner.name, error = %e, "listenKey keepalive failed");
                    true
                }
            },
            _ = expired.notified() => true,
        };
        let Some(socket) = ws.upgrade() else { return };
        if !must_renew {
            continue;
        }
        match inner.new_listen_key().await {
            Ok(k) => {
                info!(venue = %inner.name, "listenKey re-acquired");
                key = k;
                socket.set_url(inner.user_url(&key));
                socket.force_reconnect();
            }
            Err(e) => error!(venue = %inner.name, error = %e, "listenKey re-acquire failed"),
        }
    }
}

/// Every transition into Open is a resync point for the account stream.
async fn resync_on_open(mut state: tokio::sync::watch::Receiver<WsState>, events: mpsc::UnboundedSender<AccountEvent>) {
    let mut was_open = false;
    loop {
        let open = *state.borrow_and_update() == WsState::Open;
        if open && !was_open && events.send(AccountEvent::Resynced).is_err() {
            return;
        }
        was_open = open;
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn track_connection(mut state: tokio::sync::watch::Receiver<WsState>, market: Weak<MarketSession>) {
    loop {
        let open = *state.borrow_and_update() == WsState::Open;
        let Some(m) = market.upgrade() else { return };
        m.set_connected(open);
        drop(m);
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl OrderVenue for BinanceVenue {
    fn venue_name(&self) -> &str {
        &self.inner.name
    }

    async fn place_order(&self, req: &OrderRequest) -> VenueResult<PlaceAck> {
        let mut params = vec![
            p("symbol", &req.symbol),
            p("side", req.side.as_str()),
            p("quantity", req.size.normalize()),
            p("price", req.price.normalize()),
            p("newClientOrderId", &req.client_id),
            p("newOrderRespType", "RESULT"),
        ];
        if req.post_only {
            params.push(p("type", "LIMIT_MAKER"));
        } else {
            params.push(p("type", "LIMIT"));
            params.push(p("timeInForce", "GTC"));
        }
        let order: RestOrder = self.inner.signed(Method::POST, "/api/v3/order", &params).await?;
        let snap = order.to_snapshot(&req.instrument, SnapshotSource::Response);
        Ok(PlaceAck { venue_id: Some(order.order_id.to_string()), client_id: Some(req.client_id.clone()), snapshot: Some(snap) })
    }

    async fn cancel_order(&self, order: &OrderRef) -> VenueResult<Option<OrderSnapshot>> {
        let mut params = vec![p("symbol", &order.symbol)];
        match &order.venue_id {
            Some(id) => params.push(p("orderId", id)),
            None => params.push(p("origClientOrderId", &order.client_id)),
        }
        let resp: RestOrder = self.inner.signed(Method::DELETE, "/api/v3/order", &params).await?;
        Ok(Some(resp.to_snapshot(&order.instrument, SnapshotSource::Response)))
    }

    async fn query_order(&self, order: &OrderRef) -> VenueResult<OrderSnapshot> {
        let mut params = vec![p("symbol", &order.symbol)];
        match &order.venue_id {
            Some(id) => params.push(p("orderId", id)),
            None => params.push(p("origClientOrderId", &order.client_id)),
        }
        let resp: RestOrder = self.inner.signed(Method::GET, "/api/v3/order", &params).await?;
        Ok(resp.to_snapshot(&order.instrument, SnapshotSource::Poll))
    }

    fn is_benign_cancel_error(&self, err: &VenueError) -> bool {
        err.code() == Some(CODE_UNKNOWN_ORDER)
    }
}

#[async_trait]
impl VenueApi for BinanceVenue {
    async fn server_time(&self) -> VenueResult<i64> {
        let t: ServerTime = self.inner.rest.call(RestRequest::get(self.inner.url("/api/v3/time"))).await?;
        Ok(t.server_time)
    }

    async fn load_instruments(&self) -> VenueResult<Vec<Instrument>> {
        let info: ExchangeInfo = self.inner.rest.call(RestRequest::get(self.inner.url("/api/v3/exchangeInfo"))).await?;
        let mut out = Vec::new();
        for s in info.symbols.iter().filter(|s| s.is_trading()) {
            match s.to_instrument(InstrumentKind::Spot) {
                Ok(i) => out.push(i),
                Err(e) => warn!(venue = %self.inner.name, symbol = %s.symbol, error = %e, "symbol skipped"),
            }
        }
        let mut map = SymbolMap::default();
        for i in &out {
            map.by_symbol.insert(i.symbol.clone(), i.id.clone());
            map.by_id.insert(i.id.clone(), i.symbol.clone());
        }
        *lock(&self.inner.symbols) = map;
        info!(venue = %self.inner.name, count = out.len(), "catalog loaded");
        Ok(out)
    }

    async fn open_orders(&self) -> VenueResult<Vec<OrderSnapshot>> {
        let list: Vec<RestOrder> = self.inner.signed(Method::GET, "/api/v3/openOrders", &[]).await?;
        Ok(list
            .iter()
            .map(|o| o.to_snapshot(&self.inner.instrument_id(&o.symbol), SnapshotSource::Poll))
            .collect())
    }

    async fn cancel_all(&self, symbols: &[String]) -> VenueResult<()> {
        for sym in symbols {
            let res: VenueResult<Value> =
                self.inner.signed(Method::DELETE, "/api/v3/openOrders", &[p("symbol", sym)]).await;
            match res {
                Ok(_) => info!(venue = %self.inner.name, symbol = %sym, "open orders canceled"),
                Err(e) if self.is_benign_cancel_error(&e) => debug!(venue = %self.inner.name, symbol = %sym, "nothing to cancel"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn account_snapshot(&self) -> VenueResult<Vec<BalanceUpdate>> {
        let acct: AccountInfo = self.inner.signed(Method::GET, "/api/v3/account", &[]).await?;
        let mut ups = acct.to_updates();
        if acct.update_time == 0 {
            let ts = now_ms();
            ups.iter_mut().for_each(|u| u.ts = ts);
        }
        Ok(ups)
    }

    async fn start_account_stream(&self, events: mpsc::UnboundedSender<AccountEvent>) -> VenueResult<()> {
        let key = self.inner.new_listen_key().await?;
        let expired = Arc::new(Notify::new());
        let handler = user_handler(Arc::downgrade(&self.inner), events.clone(), expired.clone());
        let ws = Arc::new(WsConnection::spawn(
            WsConfig::new(self.inner.user_url(&key), format!("{}-user", self.inner.name)),
            handler,
        ));
        self.spawn(tokio::spawn(resync_on_open(ws.state_rx(), events)));
        self.spawn(tokio::spawn(keepalive_loop(self.inner.clone(), Arc::downgrade(&ws), key, expired)));
        if let Some(old) = lock(&self.user_ws).replace(ws) {
            old.force_reconnect();
        }
        info!(venue = %self.inner.name, "user data stream started");
        Ok(())
    }

    async fn subscribe_market(&self, market: Arc<MarketSession>) -> VenueResult<()> {
        let inst = market
            .instrument()
            .ok_or_else(|| VenueError::NotReady(format!("{} not in catalog", market.instrument_id())))?;
        let ws = self.market_ws();
        let (ticker, depth) = (ticker_stream(&inst.symbol), depth_stream(&inst.symbol));

        let m = Arc::downgrade(&market);
        self.router.subscribe(&ticker, move |t: TickerEvent| {
            if let Some(m) = m.upgrade() {
                m.on_ticker(t.last, t.event_time);
            }
        });
        let m = Arc::downgrade(&market);
        self.router.subscribe(&depth, move |d: DepthEvent| {
            if let Some(m) = m.upgrade() {
                m.on_depth(&d.asks, &d.bids, now_ms());
            }
        });
        ws.subscribe(Subscriber::json_stream(&ticker, self.next_sub_id.fetch_add(1, Ordering::Relaxed)));
        ws.subscribe(Subscriber::json_stream(&depth, self.next_sub_id.fetch_add(1, Ordering::Relaxed)));

        let weak_ws = Arc::downgrade(&ws);
        market.set_resubscribe_hook(Arc::new(move |ch: MarketChannel| {
            let Some(ws) = weak_ws.upgrade() else { return };
            match ch {
                MarketChannel::Ticker => ws.reset(&ticker),
                MarketChannel::Depth => ws.reset(&depth),
            }
        }));
        self.spawn(tokio::spawn(track_connection(ws.state_rx(), Arc::downgrade(&market))));
        Ok(())
    }

    async fn stop(&self) {
        let user = lock(&self.user_ws).take();
        let market = lock(&self.market_ws).take();
        for t in lock(&self.tasks).drain(..) {
            t.abort();
        }
        if let Some(ws) = user {
            ws.close().await;
        }
        if let Some(ws) = market {
            ws.close().await;
        }
        info!(venue = %self.inner.name, "venue stopped");
    }
}

#[async_trait]
impl SeriesSource<Klines> for BinanceVenue {
    async fn fetch_page(&self, instrument: &str, interval: Option<&str>, start: i64, end: i64) -> VenueResult<Vec<Kline>> {
        let interval = interval.ok_or_else(|| VenueError::InvalidRequest("klines need an interval".into()))?;
        self.klines_page(instrument, interval, start, end).await
    }

    fn page_limit(&self) -> usize {
        self.inner.cfg.kline_page_limit
    }
}

#[async_trait]
impl SeriesSource<FundingFees> for BinanceVenue {
    async fn fetch_page(&self, instrument: &str, _interval: Option<&str>, start: i64, end: i64) -> VenueResult<Vec<FundingRate>> {
        self.funding_page(instrument, start, end).await
    }

    fn page_limit(&self) -> usize {
        self.inner.cfg.funding_page_limit
    }
}
