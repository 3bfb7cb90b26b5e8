// ===============================
// src/balance.rs
// ===============================
//
// Per-currency rights as the venue reports them, plus two local layers:
// - temp rights: fill deltas projected since the last venue refresh
// - client frozen: per-order reservations for venues that hide frozen funds
//
// pitch = reported - (previous + sum(temp since previous refresh))
//
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::lock;
use crate::metrics::{BALANCE_PITCH, PITCH_ALERTS};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Balance {
    pub ccy: String,
    pub rights: Decimal,
    /// Frozen as reported by the venue (zero when it does not report one).
    pub frozen: Decimal,
    pub last_update: i64,
    pub temp_rights: Decimal,
    seeded: bool,
}

impl Balance {
    pub fn projected_rights(&self) -> Decimal {
        self.rights + self.temp_rights
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PitchReport {
    pub ccy: String,
    pub pitch: Decimal,
    /// Above tolerance and not the first refresh.
    pub alert: bool,
    pub seed: bool,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Tolerance per currency; missing means any non-zero pitch alerts.
    pub max_pitch: HashMap<String, Decimal>,
    pub track_client_frozen: bool,
    /// Spot accounts cannot hold negative rights.
    pub spot: bool,
    pub ready_window: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_pitch: HashMap::new(),
            track_client_frozen: false,
            spot: true,
            ready_window: Duration::from_secs(600),
        }
    }
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<String, Balance>,
    // order id -> (ccy -> reserved)
    order_frozen: HashMap<String, HashMap<String, Decimal>>,
}

impl LedgerState {
    fn client_frozen(&self, ccy: &str) -> Decimal {
        self.order_frozen.values().filter_map(|m| m.get(ccy)).copied().sum()
    }
}

pub struct BalanceLedger {
    venue: String,
    cfg: LedgerConfig,
    state: Mutex<LedgerState>,
}

impl BalanceLedger {
    pub fn new(venue: impl Into<String>, cfg: LedgerConfig) -> Self {
        Self { venue: venue.into(), cfg, state: Mutex::new(LedgerState::default()) }
    }

    pub fn tracks_client_frozen(&self) -> bool {
        self.cfg.track_client_frozen
    }

    /// Authoritative update. `None` when `ts` is older than the stored record.
    pub fn refresh(&self, ccy: &str, rights: Decimal, frozen: Decimal, ts: i64) -> Option<PitchReport> {
        let ccy = ccy.to_ascii_uppercase();
        let mut rights = rights;
        if self.cfg.spot && rights < Decimal::ZERO {
            warn!(venue = %self.venue, %ccy, %rights, "negative spot rights reported, clamped to zero");
            rights = Decimal::ZERO;
        }

        let mut st = lock(&self.state);
        let entry = st.balances.entry(ccy.clone()).or_insert_with(|| Balance { ccy: ccy.clone(), ..Default::default() });
        if entry.seeded && ts < entry.last_update {
            debug!(venue = %self.venue, %ccy, ts, last = entry.last_update, "stale balance refresh discarded");
            return None;
        }
        let seed = !entry.seeded;
        let prev = if seed { Decimal::ZERO } else { entry.rights };
        let pitch = rights - (prev + entry.temp_rights);

        entry.rights = rights;
        entry.frozen = frozen;
        entry.last_update = ts;
        entry.temp_rights = Decimal::ZERO;
        entry.seeded = true;
        drop(st);

        let tolerance = self.cfg.max_pitch.get(&ccy).copied().unwrap_or(Decimal::ZERO);
        let alert = !seed && pitch.abs() > tolerance;
        let micros = (pitch * Decimal::from(1_000_000)).trunc().to_i64().unwrap_or(i64::MAX);
        BALANCE_PITCH.with_label_values(&[&ccy]).set(micros);
        if alert {
            PITCH_ALERTS.with_label_values(&[&ccy]).inc();
            warn!(venue = %self.venue, %ccy, %pitch, %tolerance, "balance pitch above tolerance");
        } else if !pitch.is_zero() {
            debug!(venue = %self.venue, %ccy, %pitch, seed, "balance pitch");
        }
        Some(PitchReport { ccy, pitch, alert, seed })
    }

    /// Local projection after a fill; folded away by the next refresh.
    pub fn record_temp_rights(&self, ccy: &str, delta: Decimal, ts: i64) {
        let ccy = ccy.to_ascii_uppercase();
        let mut st = lock(&self.state);
        let entry = st.balances.entry(ccy.clone()).or_insert_with(|| Balance { ccy: ccy.clone(), ..Default::default() });
        entry.temp_rights += delta;
        debug!(venue = %self.venue, %ccy, %delta, ts, temp = %entry.temp_rights, "temp rights");
    }

    pub fn available(&self, ccy: &str) -> Decimal {
        let ccy = ccy.to_ascii_uppercase();
        let st = lock(&self.state);
        let Some(b) = st.balances.get(&ccy) else { return Decimal::ZERO };
        let frozen = if self.cfg.track_client_frozen { st.client_frozen(&ccy) } else { b.frozen };
        b.rights - frozen
    }

    pub fn projected_rights(&self, ccy: &str) -> Decimal {
        lock(&self.state)
            .balances
            .get(&ccy.to_ascii_uppercase())
            .map(Balance::projected_rights)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn client_frozen(&self, ccy: &str) -> Decimal {
        lock(&self.state).client_frozen(&ccy.to_ascii_uppercase())
    }

    /// Replace the reservation of `order_id` in `ccy`. Zero clears it.
    pub fn set_order_frozen(&self, order_id: &str, ccy: &str, amount: Decimal) {
        let ccy = ccy.to_ascii_uppercase();
        let mut st = lock(&self.state);
        let per_order = st.order_frozen.entry(order_id.to_string()).or_default();
        if amount > Decimal::ZERO {
            per_order.insert(ccy, amount);
        } else {
            per_order.remove(&ccy);
        }
        if per_order.is_empty() {
            st.order_frozen.remove(order_id);
        }
    }

    pub fn clear_order_frozen(&self, order_id: &str) {
        lock(&self.state).order_frozen.remove(order_id);
    }

    /// Seeded and refreshed within the recency window.
    pub fn is_ready(&self, ccy: &str, now_ms: i64) -> bool {
        let window = self.cfg.ready_window.as_millis() as i64;
        lock(&self.state)
            .balances
            .get(&ccy.to_ascii_uppercase())
            .map_or(false, |b| b.seeded && now_ms - b.last_update <= window)
    }

    pub fn snapshot(&self, ccy: &str) -> Option<Balance> {
        lock(&self.state).balances.get(&ccy.to_ascii_uppercase()).cloned()
    }

    pub fn all(&self) -> Vec<Balance> {
        let mut v: Vec<Balance> = lock(&self.state).balances.values().cloned().collect();
        v.sort_by(|a, b| a.ccy.cmp(&b.ccy));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger(track: bool) -> BalanceLedger {
        let mut cfg = LedgerConfig { track_client_frozen: track, ..Default::default() };
        cfg.max_pitch.insert("USDT".into(), dec!(0.5));
        BalanceLedger::new("t", cfg)
    }

    #[test]
    fn seed_reports_but_never_alerts() {
        let l = ledger(false);
        let r = l.refresh("usdt", dec!(1000), dec!(0), 10).unwrap();
        assert!(r.seed);
        assert!(!r.alert);
        assert_eq!(r.pitch, dec!(1000));
    }

    #[test]
    fn pitch_is_reported_minus_projection() {
        let l = ledger(false);
        l.refresh("USDT", dec!(100), dec!(0), 1);
        l.record_temp_rights("USDT", dec!(5), 2);
        l.record_temp_rights("USDT", dec!(-2), 3);
        assert_eq!(l.projected_rights("USDT"), dec!(103));
        let r = l.refresh("USDT", dec!(104), dec!(0), 4).unwrap();
        assert_eq!(r.pitch, dec!(1));
        assert!(r.alert);
        // temp is folded away
        assert_eq!(l.projected_rights("USDT"), dec!(104));
        let r = l.refresh("USDT", dec!(104.4), dec!(0), 5).unwrap();
        assert!(!r.alert);
    }

    #[test]
    fn stale_refresh_is_discarded() {
        let l = ledger(false);
        l.refresh("USDT", dec!(100), dec!(0), 10);
        assert!(l.refresh("USDT", dec!(50), dec!(0), 9).is_none());
        assert_eq!(l.snapshot("USDT").unwrap().rights, dec!(100));
        assert!(l.refresh("USDT", dec!(100), dec!(0), 10).is_some());
    }

    #[test]
    fn available_uses_client_frozen_when_tracking() {
        let l = ledger(true);
        l.refresh("USDT", dec!(1000), dec!(999), 1);
        l.set_order_frozen("a", "USDT", dec!(200));
        l.set_order_frozen("b", "USDT", dec!(50));
        assert_eq!(l.available("USDT"), dec!(750));
        l.clear_order_frozen("a");
        assert_eq!(l.available("USDT"), dec!(950));
        l.set_order_frozen("b", "USDT", dec!(0));
        assert_eq!(l.client_frozen("USDT"), dec!(0));

        let venue = ledger(false);
        venue.refresh("USDT", dec!(1000), dec!(300), 1);
        venue.set_order_frozen("a", "USDT", dec!(200));
        assert_eq!(venue.available("USDT"), dec!(700));
    }

    #[test]
    fn negative_spot_rights_clamped() {
        let l = ledger(false);
        l.refresh("BTC", dec!(-0.1), dec!(0), 1);
        assert_eq!(l.snapshot("BTC").unwrap().rights, dec!(0));
    }

    #[test]
    fn readiness_window() {
        let l = ledger(false);
        assert!(!l.is_ready("USDT", 1_000));
        l.refresh("USDT", dec!(1), dec!(0), 1_000);
        assert!(l.is_ready("USDT", 1_000 + 600_000));
        assert!(!l.is_ready("USDT", 1_000 + 600_001));
    }
}
