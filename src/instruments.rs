// ===============================
// src/instruments.rs
// ===============================
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::Side;
use crate::error::{lock, VenueError, VenueResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    Spot,
    Perp,
    Future,
    Stock,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Spot => "SPOT",
            InstrumentKind::Perp => "PERP",
            InstrumentKind::Future => "FUT",
            InstrumentKind::Stock => "STK",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    /// Symbol as the venue spells it.
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub kind: InstrumentKind,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_size: Decimal,
    /// Zero disables the notional rule.
    pub min_notional: Decimal,
    /// Raw catalog text, e.g. `20240102:0930-20240102:1600;20240103:CLOSED`.
    pub trading_hours: Option<String>,
    /// Zone the trading hours are written in.
    pub time_zone: Tz,
}

pub fn canonical_id(base: &str, quote: &str, kind: InstrumentKind) -> String {
    let pair = format!("{}{}", base.to_ascii_uppercase(), quote.to_ascii_uppercase());
    match kind {
        InstrumentKind::Spot => pair,
        other => format!("{pair}-{}", other.as_str()),
    }
}

pub fn floor_to(x: Decimal, step: Decimal) -> Decimal {
    ((x / step).floor() * step).normalize()
}

pub fn ceil_to(x: Decimal, step: Decimal) -> Decimal {
    ((x / step).ceil() * step).normalize()
}

impl Instrument {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        base: &str,
        quote: &str,
        kind: InstrumentKind,
        tick_size: Decimal,
        lot_size: Decimal,
        min_size: Decimal,
        min_notional: Decimal,
    ) -> VenueResult<Self> {
        if tick_size <= Decimal::ZERO || lot_size <= Decimal::ZERO || min_size <= Decimal::ZERO {
            return Err(VenueError::InvalidRequest(format!(
                "{symbol}: tick/lot/min size must be positive (tick={tick_size} lot={lot_size} min={min_size})"
            )));
        }
        if min_notional < Decimal::ZERO {
            return Err(VenueError::InvalidRequest(format!("{symbol}: negative min notional")));
        }
        Ok(Self {
            id: canonical_id(base, quote, kind),
            symbol: symbol.to_string(),
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
            kind,
            tick_size,
            lot_size,
            min_size,
            min_notional,
            trading_hours: None,
            time_zone: Tz::UTC,
        })
    }

    pub fn with_trading_hours(mut self, hours: impl Into<String>, time_zone: Tz) -> Self {
        self.trading_hours = Some(hours.into());
        self.time_zone = time_zone;
        self
    }

    /// Round toward the passive side (buy down, sell up). With `post_only`
    /// a crossing price is pulled back to the nearest grid price strictly
    /// inside the opposite best. Zero stays zero.
    pub fn align_price(
        &self,
        px: Decimal,
        side: Side,
        post_only: bool,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
    ) -> Decimal {
        if px.is_zero() {
            return Decimal::ZERO;
        }
        let tick = self.tick_size;
        match side {
            Side::Buy => {
                let p = floor_to(px, tick);
                match best_ask {
                    Some(ask) if post_only && p >= ask => ceil_to(ask, tick) - tick,
                    _ => p,
                }
            }
            Side::Sell => {
                let p = ceil_to(px, tick);
                match best_bid {
                    Some(bid) if post_only && p <= bid => floor_to(bid, tick) + tick,
                    _ => p,
                }
            }
        }
    }

    /// Smallest lot multiple at or above the declared minimum.
    pub fn lot_min(&self) -> Decimal {
        ceil_to(self.min_size, self.lot_size)
    }

    /// Floor to the lot, then clamp up to the lot-aligned minimum.
    pub fn align_size(&self, qty: Decimal) -> Decimal {
        floor_to(qty, self.lot_size).max(self.lot_min())
    }

    /// Minimum size at `ref_price`, honoring the notional rule.
    pub fn min_size_at(&self, ref_price: Decimal) -> Decimal {
        if self.min_notional > Decimal::ZERO && ref_price > Decimal::ZERO {
            let by_notional = ceil_to(self.min_notional / ref_price / self.lot_size, Decimal::ONE) * self.lot_size;
            self.lot_min().max(by_notional.normalize())
        } else {
            self.lot_min()
        }
    }
}

#[derive(Default)]
struct Catalog {
    by_id: HashMap<String, Arc<Instrument>>,
    symbol_to_id: HashMap<String, String>,
}

/// Authoritative per-venue catalog. Readers get `Arc` snapshots.
pub struct InstrumentRegistry {
    venue: String,
    catalog: Mutex<Catalog>,
    version: AtomicU64,
    refreshed_on: Mutex<Option<NaiveDate>>,
}

impl InstrumentRegistry {
    pub fn new(venue: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            catalog: Mutex::new(Catalog::default()),
            version: AtomicU64::new(0),
            refreshed_on: Mutex::new(None),
        }
    }

    /// Swap in a fresh catalog. Returns the new version.
    pub fn replace_all(&self, list: Vec<Instrument>) -> u64 {
        let mut next = Catalog::default();
        for inst in list {
            next.symbol_to_id.insert(inst.symbol.to_ascii_uppercase(), inst.id.clone());
            next.by_id.insert(inst.id.clone(), Arc::new(inst));
        }
        let count = next.by_id.len();
        *lock(&self.catalog) = next;
        *lock(&self.refreshed_on) = Some(chrono::Local::now().date_naive());
        let v = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(venue = %self.venue, count, version = v, "instrument catalog loaded");
        v
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// True when the catalog was never loaded or was loaded on an earlier day.
    pub fn needs_refresh(&self, today: NaiveDate) -> bool {
        match *lock(&self.refreshed_on) {
            Some(d) => d < today,
            None => true,
        }
    }

    /// Lookup by canonical id, falling back to the venue symbol.
    pub fn get(&self, id: &str) -> Option<Arc<Instrument>> {
        let cat = lock(&self.catalog);
        if let Some(i) = cat.by_id.get(id) {
            return Some(i.clone());
        }
        cat.symbol_to_id.get(&id.to_ascii_uppercase()).and_then(|k| cat.by_id.get(k)).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<Instrument>> {
        let mut all: Vec<_> = lock(&self.catalog).by_id.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        lock(&self.catalog).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn must_get(&self, id: &str) -> VenueResult<Arc<Instrument>> {
        self.get(id).ok_or_else(|| VenueError::InvalidRequest(format!("unknown instrument {id}")))
    }

    pub fn align_price(
        &self,
        id: &str,
        px: Decimal,
        side: Side,
        post_only: bool,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
    ) -> VenueResult<Decimal> {
        Ok(self.must_get(id)?.align_price(px, side, post_only, best_bid, best_ask))
    }

    pub fn align_size(&self, id: &str, qty: Decimal) -> VenueResult<Decimal> {
        Ok(self.must_get(id)?.align_size(qty))
    }

    pub fn min_size(&self, id: &str, ref_price: Decimal) -> VenueResult<Decimal> {
        Ok(self.must_get(id)?.min_size_at(ref_price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> Instrument {
        Instrument::new("BTCUSDT", "btc", "usdt", InstrumentKind::Spot, dec!(0.01), dec!(0.00001), dec!(0.00001), dec!(5))
            .unwrap()
    }

    #[test]
    fn canonical_ids() {
        assert_eq!(btc().id, "BTCUSDT");
        assert_eq!(canonical_id("btc", "usdt", InstrumentKind::Perp), "BTCUSDT-PERP");
    }

    #[test]
    fn rejects_bad_rules() {
        assert!(Instrument::new("X", "a", "b", InstrumentKind::Spot, dec!(0), dec!(1), dec!(1), dec!(0)).is_err());
        assert!(Instrument::new("X", "a", "b", InstrumentKind::Spot, dec!(1), dec!(1), dec!(1), dec!(-1)).is_err());
    }

    #[test]
    fn price_rounds_to_passive_side() {
        let i = btc();
        assert_eq!(i.align_price(dec!(20000.019), Side::Buy, false, None, None), dec!(20000.01));
        assert_eq!(i.align_price(dec!(20000.011), Side::Sell, false, None, None), dec!(20000.02));
        assert_eq!(i.align_price(dec!(0), Side::Sell, true, Some(dec!(1)), Some(dec!(2))), dec!(0));
    }

    #[test]
    fn post_only_pulls_back_inside_best() {
        let i = btc();
        let (bid, ask) = (Some(dec!(19999.99)), Some(dec!(20000.00)));
        assert_eq!(i.align_price(dec!(20000.50), Side::Buy, true, bid, ask), dec!(19999.99));
        assert_eq!(i.align_price(dec!(19990.00), Side::Sell, true, bid, ask), dec!(20000.00));
        // off-grid best quotes
        assert_eq!(i.align_price(dec!(101), Side::Buy, true, None, Some(dec!(100.005))), dec!(100.00));
        assert_eq!(i.align_price(dec!(99), Side::Sell, true, Some(dec!(100.005)), None), dec!(100.01));
    }

    #[test]
    fn post_only_never_crosses_and_is_idempotent() {
        let i = btc();
        let bid = dec!(100.00);
        let ask = dec!(100.03);
        let mut px = dec!(99.90);
        while px < dec!(100.20) {
            for side in [Side::Buy, Side::Sell] {
                let a = i.align_price(px, side, true, Some(bid), Some(ask));
                match side {
                    Side::Buy => assert!(a < ask, "{px} -> {a}"),
                    Side::Sell => assert!(a > bid, "{px} -> {a}"),
                }
                assert_eq!(i.align_price(a, side, true, Some(bid), Some(ask)), a);
                assert_eq!((a / i.tick_size).fract(), Decimal::ZERO);
            }
            px += dec!(0.003);
        }
    }

    #[test]
    fn size_floors_then_clamps() {
        let i = btc();
        assert_eq!(i.align_size(dec!(0.123456)), dec!(0.12345));
        assert_eq!(i.align_size(dec!(0.000001)), dec!(0.00001));
        assert_eq!(i.align_size(i.align_size(dec!(0.123456))), dec!(0.12345));
    }

    #[test]
    fn off_lot_minimum_rounds_up_to_the_lot() {
        let i = Instrument::new("ES", "es", "usd", InstrumentKind::Future, dec!(0.25), dec!(5), dec!(7), dec!(0)).unwrap();
        assert_eq!(i.lot_min(), dec!(10));
        assert_eq!(i.align_size(dec!(1)), dec!(10));
        assert_eq!(i.align_size(dec!(23)), dec!(20));
        assert_eq!(i.min_size_at(dec!(4000)), dec!(10));
        for q in [dec!(0), dec!(6), dec!(9.9), dec!(51)] {
            assert_eq!((i.align_size(q) / i.lot_size).fract(), Decimal::ZERO);
        }
    }

    #[test]
    fn min_size_honors_notional() {
        let i = btc();
        // 5 / 20000 = 0.00025
        assert_eq!(i.min_size_at(dec!(20000)), dec!(0.00025));
        // 5 / 30000 = 0.0001666.. -> 0.00017
        assert_eq!(i.min_size_at(dec!(30000)), dec!(0.00017));
        assert_eq!(i.min_size_at(dec!(0)), dec!(0.00001));
    }

    #[test]
    fn registry_versions_and_lookup() {
        let r = InstrumentRegistry::new("t");
        assert!(r.needs_refresh(chrono::Local::now().date_naive()));
        assert_eq!(r.replace_all(vec![btc()]), 1);
        assert_eq!(r.replace_all(vec![btc()]), 2);
        assert!(!r.needs_refresh(chrono::Local::now().date_naive()));
        assert!(r.get("BTCUSDT").is_some());
        assert!(r.get("btcusdt").is_some());
        assert!(r.align_size("nope", dec!(1)).is_err());
    }
}
