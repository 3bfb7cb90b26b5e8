// ===============================
// src/binance.rs
// ===============================
//
// Binance-style wire models (REST + user data stream + market streams) and
// their mapping onto the crate's snapshot / balance / catalog types.
//
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::domain::{BalanceUpdate, FundingRate, Kline, OrderSnapshot, OrderStatus, SnapshotSource, Side};
use crate::error::{VenueError, VenueResult};
use crate::instruments::{Instrument, InstrumentKind};

/// Cancel of an unknown or already closed order.
pub const CODE_UNKNOWN_ORDER: i64 = -2011;
/// Query of an order the venue does not know.
pub const CODE_NO_SUCH_ORDER: i64 = -2013;

pub fn parse_status(s: &str) -> OrderStatus {
    match s {
        "NEW" | "PENDING_NEW" | "PENDING_CANCEL" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::Partial,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        other => {
            warn!(status = other, "unknown order status, treated as NEW");
            OrderStatus::New
        }
    }
}

pub fn parse_side(s: &str) -> Option<Side> {
    match s {
        "BUY" => Some(Side::Buy),
        "SELL" => Some(Side::Sell),
        _ => None,
    }
}

fn avg_price(cum_quote: Decimal, filled: Decimal) -> Decimal {
    if filled > Decimal::ZERO {
        cum_quote / filled
    } else {
        Decimal::ZERO
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub server_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKey {
    pub listen_key: String,
}

// ---- exchangeInfo ----

#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub filters: Vec<Value>,
}

fn filter_decimal(filters: &[Value], kind: &str, field: &str) -> Option<Decimal> {
    filters
        .iter()
        .find(|f| f.get("filterType").and_then(Value::as_str) == Some(kind))
        .and_then(|f| f.get(field))
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }

    pub fn to_instrument(&self, kind: InstrumentKind) -> VenueResult<Instrument> {
        let f = &self.filters;
        let tick = filter_decimal(f, "PRICE_FILTER", "tickSize")
            .ok_or_else(|| VenueError::Decode(format!("{}: no PRICE_FILTER", self.symbol)))?;
        let step = filter_decimal(f, "LOT_SIZE", "stepSize")
            .ok_or_else(|| VenueError::Decode(format!("{}: no LOT_SIZE", self.symbol)))?;
        let min_qty = filter_decimal(f, "LOT_SIZE", "minQty").filter(|q| *q > Decimal::ZERO).unwrap_or(step);
        let min_notional = filter_decimal(f, "NOTIONAL", "minNotional")
            .or_else(|| filter_decimal(f, "MIN_NOTIONAL", "minNotional"))
            .unwrap_or(Decimal::ZERO);
        Instrument::new(
            &self.symbol,
            &self.base_asset,
            &self.quote_asset,
            kind,
            tick.normalize(),
            step.normalize(),
            min_qty.normalize(),
            min_notional.normalize(),
        )
    }
}

// ---- orders ----

/// Order as returned by `POST/GET/DELETE /api/v3/order` and `openOrders`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestOrder {
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    /// Set on cancel responses, where `client_order_id` is the cancel's own id.
    #[serde(default)]
    pub orig_client_order_id: Option<String>,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    #[serde(default)]
    pub cummulative_quote_qty: Decimal,
    pub status: String,
    pub side: String,
    #[serde(default)]
    pub update_time: Option<i64>,
    #[serde(default)]
    pub transact_time: Option<i64>,
    #[serde(default)]
    pub time: Option<i64>,
}

impl RestOrder {
    pub fn client_id(&self) -> &str {
        self.orig_client_order_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.client_order_id)
    }

    pub fn to_snapshot(&self, instrument: &str, source: SnapshotSource) -> OrderSnapshot {
        let ts = self.update_time.or(self.transact_time).or(self.time).unwrap_or(0);
        let mut snap = OrderSnapshot::new(
            instrument,
            parse_status(&self.status),
            self.executed_qty,
            avg_price(self.cummulative_quote_qty, self.executed_qty),
            ts,
        )
        .with_client_id(self.client_id())
        .with_venue_id(self.order_id.to_string())
        .with_price_size(self.price, self.orig_qty)
        .from_source(source);
        if let Some(side) = parse_side(&self.side) {
            snap = snap.with_side(side);
        }
        snap
    }
}

// ---- account ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default)]
    pub update_time: i64,
    pub balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl AccountInfo {
    /// Rights are free + locked; frozen is locked.
    pub fn to_updates(&self) -> Vec<BalanceUpdate> {
        self.balances
            .iter()
            .map(|b| BalanceUpdate { ccy: b.asset.clone(), rights: b.free + b.locked, frozen: b.locked, ts: self.update_time })
            .collect()
    }
}

// ---- user data stream ----

#[derive(Debug, Deserialize)]
pub struct ExecutionReport {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "C", default)]
    pub orig_client_order_id: Option<String>,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "q")]
    pub orig_qty: Decimal,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "x")]
    pub exec_type: String,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "l")]
    pub last_qty: Decimal,
    #[serde(rename = "z")]
    pub cum_qty: Decimal,
    #[serde(rename = "L")]
    pub last_price: Decimal,
    #[serde(rename = "T", default)]
    pub transact_time: Option<i64>,
    #[serde(rename = "Z", default)]
    pub cum_quote: Decimal,
}

impl ExecutionReport {
    pub fn to_snapshot(&self, instrument: &str) -> OrderSnapshot {
        let client_id = self
            .orig_client_order_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.client_order_id);
        let mut snap = OrderSnapshot::new(
            instrument,
            parse_status(&self.status),
            self.cum_qty,
            avg_price(self.cum_quote, self.cum_qty),
            self.transact_time.unwrap_or(self.event_time),
        )
        .with_client_id(client_id)
        .with_venue_id(self.order_id.to_string())
        .with_price_size(self.price, self.orig_qty)
        .from_source(SnapshotSource::Push);
        if let Some(side) = parse_side(&self.side) {
            snap = snap.with_side(side);
        }
        if self.exec_type == "TRADE" && self.last_qty > Decimal::ZERO {
            snap = snap.with_last_fill(self.last_price, self.last_qty);
        }
        snap
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountPosition {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "u", default)]
    pub last_update: Option<i64>,
    #[serde(rename = "B")]
    pub balances: Vec<PositionBalance>,
}

#[derive(Debug, Deserialize)]
pub struct PositionBalance {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "f")]
    pub free: Decimal,
    #[serde(rename = "l")]
    pub locked: Decimal,
}

impl AccountPosition {
    pub fn to_updates(&self) -> Vec<BalanceUpdate> {
        let ts = self.last_update.unwrap_or(self.event_time);
        self.balances
            .iter()
            .map(|b| BalanceUpdate { ccy: b.asset.clone(), rights: b.free + b.locked, frozen: b.locked, ts })
            .collect()
    }
}

/// One decoded user-stream frame.
#[derive(Debug)]
pub enum UserEvent {
    Execution(ExecutionReport),
    Position(AccountPosition),
    ListenKeyExpired,
    Other(String),
}

pub fn parse_user_event(frame: &str) -> VenueResult<UserEvent> {
    let v: Value = serde_json::from_str(frame)?;
    let kind = v.get("e").and_then(Value::as_str).unwrap_or_default().to_string();
    Ok(match kind.as_str() {
        "executionReport" => UserEvent::Execution(serde_json::from_value(v)?),
        "outboundAccountPosition" => UserEvent::Position(serde_json::from_value(v)?),
        "listenKeyExpired" => UserEvent::ListenKeyExpired,
        _ => UserEvent::Other(kind),
    })
}

// ---- market streams ----

/// `<symbol>@ticker` payload, only the fields used.
#[derive(Debug, Deserialize)]
pub struct TickerEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "c")]
    pub last: Decimal,
}

/// `<symbol>@depth<N>@100ms` partial book payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthEvent {
    #[serde(default)]
    pub last_update_id: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

pub fn ticker_stream(symbol: &str) -> String {
    format!("{}@ticker", symbol.to_ascii_lowercase())
}

pub fn depth_stream(symbol: &str) -> String {
    format!("{}@depth20@100ms", symbol.to_ascii_lowercase())
}

// ---- historical series ----

fn num(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        other => other.as_f64(),
    }
}

/// One `/api/v3/klines` row: `[openTime, open, high, low, close, volume, ...]`.
pub fn parse_kline_row(row: &[Value]) -> VenueResult<Kline> {
    let bad = || VenueError::Decode(format!("kline row {row:?}"));
    if row.len() < 6 {
        return Err(bad());
    }
    Ok(Kline {
        open_time: row[0].as_i64().ok_or_else(bad)?,
        open: num(&row[1]).ok_or_else(bad)?,
        high: num(&row[2]).ok_or_else(bad)?,
        low: num(&row[3]).ok_or_else(bad)?,
        close: num(&row[4]).ok_or_else(bad)?,
        volume: num(&row[5]).ok_or_else(bad)?,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRow {
    pub funding_time: i64,
    pub funding_rate: String,
    #[serde(default)]
    pub mark_price: Option<String>,
}

impl FundingRow {
    pub fn to_point(&self) -> VenueResult<FundingRate> {
        let rate = self
            .funding_rate
            .parse()
            .map_err(|_| VenueError::Decode(format!("funding rate '{}'", self.funding_rate)))?;
        Ok(FundingRate {
            funding_time: self.funding_time,
            rate,
            mark_price: self.mark_price.as_deref().and_then(|s| s.parse().ok()),
        })
    }
}
