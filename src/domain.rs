// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn sign(&self) -> i64 { match self { Side::Buy => 1, Side::Sell => -1 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus { New, Partial, Filled, Canceled, Rejected }

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected)
    }
    pub fn label(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

/// Where an order observation came from. Push and poll feed the same
/// reconciliation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotSource { Push, Poll, Response }

/// One venue observation of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub venue_id: Option<String>,
    pub client_id: Option<String>,
    pub instrument: String,
    pub side: Option<Side>,
    pub price: Option<Decimal>,
    pub size: Option<Decimal>,
    pub filled: Decimal,
    pub avg_price: Decimal,
    pub status: OrderStatus,
    pub update_time: i64,
    /// Explicit last fill `(lastPx, lastSz)` when the venue reports it.
    pub last_fill: Option<(Decimal, Decimal)>,
    pub source: SnapshotSource,
}

impl OrderSnapshot {
    pub fn new(instrument: impl Into<String>, status: OrderStatus, filled: Decimal, avg_price: Decimal, update_time: i64) -> Self {
        Self {
            venue_id: None,
            client_id: None,
            instrument: instrument.into(),
            side: None,
            price: None,
            size: None,
            filled,
            avg_price,
            status,
            update_time,
            last_fill: None,
            source: SnapshotSource::Push,
        }
    }
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self { self.client_id = Some(id.into()); self }
    pub fn with_venue_id(mut self, id: impl Into<String>) -> Self { self.venue_id = Some(id.into()); self }
    pub fn with_last_fill(mut self, px: Decimal, sz: Decimal) -> Self { self.last_fill = Some((px, sz)); self }
    pub fn with_price_size(mut self, price: Decimal, size: Decimal) -> Self { self.price = Some(price); self.size = Some(size); self }
    pub fn with_side(mut self, side: Side) -> Self { self.side = Some(side); self }
    pub fn from_source(mut self, source: SnapshotSource) -> Self { self.source = source; self }
}

/// Incremental fill derived from reconciliation. Never stored long-term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub client_id: String,
    pub venue_id: Option<String>,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub venue_time: i64,
    pub local_time: i64,
}

/// Authoritative per-currency balance as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub ccy: String,
    pub rights: Decimal,
    pub frozen: Decimal,
    pub ts: i64,
}

/// Everything the account-wide stream of a venue can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountEvent {
    Order(OrderSnapshot),
    Balance(BalanceUpdate),
    /// The account stream was (re)established; engines should poll.
    Resynced,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub funding_time: i64,
    pub rate: f64,
    #[serde(default)]
    pub mark_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PitchEvent { pub ccy: String, pub pitch: Decimal, pub ts: i64 }

/// Journal entries written by the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Deal(Deal), Pitch(PitchEvent), Note(String) }

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
