// ===============================
// src/market.rs
// ===============================
//
// Live view of one instrument: last price, depth mirror, trading hours and
// the readiness gate traders check before placing anything.
//
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{now_ms, Side};
use crate::error::{lock, VenueError, VenueResult};
use crate::instruments::{Instrument, InstrumentRegistry};
use crate::orderbook::OrderBookMirror;

/// Open intervals parsed from catalog text like
/// `20240102:0930-20240102:1600;20240103:CLOSED`.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingHours {
    intervals: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

// Resolved per date, so DST transitions move the UTC bounds. A wall time
// repeated at the fall-back takes its first occurrence.
fn parse_local(s: &str, tz: &Tz) -> VenueResult<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), "%Y%m%d:%H%M")
        .map_err(|e| VenueError::Decode(format!("trading hours '{s}': {e}")))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
        .ok_or_else(|| VenueError::Decode(format!("trading hours '{s}': no such local time in {tz}")))
}

impl TradingHours {
    pub fn parse(text: &str, tz: Tz) -> VenueResult<Self> {
        let mut intervals = Vec::new();
        for seg in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if seg.ends_with(":CLOSED") {
                continue;
            }
            let (open, close) = seg
                .split_once('-')
                .ok_or_else(|| VenueError::Decode(format!("trading hours segment '{seg}'")))?;
            let (open, close) = (parse_local(open, &tz)?, parse_local(close, &tz)?);
            if close > open {
                intervals.push((open, close));
            }
        }
        intervals.sort();
        Ok(Self { intervals })
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.intervals.iter().any(|(o, c)| *o <= now && now < *c)
    }

    pub fn intervals(&self) -> &[(DateTime<Utc>, DateTime<Utc>)] {
        &self.intervals
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketChannel {
    Ticker,
    Depth,
}

impl MarketChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketChannel::Ticker => "ticker",
            MarketChannel::Depth => "depth",
        }
    }
}

/// Installed by the venue adapter: resubscribe one channel of a market.
pub type ResubscribeHook = Arc<dyn Fn(MarketChannel) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub ticker_timeout: Duration,
    pub depth_timeout: Duration,
    /// Minimum spacing between resubscribe attempts per channel.
    pub recovery_interval: Duration,
    pub watchdog_tick: Duration,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            ticker_timeout: Duration::from_secs(30),
            depth_timeout: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(60),
            watchdog_tick: Duration::from_secs(1),
        }
    }
}

struct Feed {
    ok: AtomicBool,
    last_at: AtomicI64,
    last_recovery: Mutex<Option<i64>>,
}

impl Feed {
    fn new() -> Self {
        Self { ok: AtomicBool::new(false), last_at: AtomicI64::new(0), last_recovery: Mutex::new(None) }
    }

    fn touch(&self, now: i64) {
        self.last_at.store(now, Ordering::Release);
        self.ok.store(true, Ordering::Release);
    }
}

enum Hours {
    Unparsed,
    AlwaysOpen,
    Parsed(TradingHours),
    Invalid(String),
}

pub struct MarketSession {
    instrument_id: String,
    registry: Arc<InstrumentRegistry>,
    cfg: MarketConfig,
    book: OrderBookMirror,
    last_price: Mutex<Option<(Decimal, i64)>>,
    connected: AtomicBool,
    ticker: Feed,
    depth: Feed,
    started_at: i64,
    hours: Mutex<(u64, Hours)>,
    resubscribe: Mutex<Option<ResubscribeHook>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MarketSession {
    pub fn new(instrument_id: impl Into<String>, registry: Arc<InstrumentRegistry>, cfg: MarketConfig) -> Arc<Self> {
        Arc::new(Self {
            instrument_id: instrument_id.into(),
            registry,
            cfg,
            book: OrderBookMirror::new(),
            last_price: Mutex::new(None),
            connected: AtomicBool::new(false),
            ticker: Feed::new(),
            depth: Feed::new(),
            started_at: now_ms(),
            hours: Mutex::new((0, Hours::Unparsed)),
            resubscribe: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    pub fn instrument(&self) -> Option<Arc<Instrument>> {
        self.registry.get(&self.instrument_id)
    }

    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    pub fn book(&self) -> &OrderBookMirror {
        &self.book
    }

    pub fn set_resubscribe_hook(&self, hook: ResubscribeHook) {
        *lock(&self.resubscribe) = Some(hook);
    }

    fn feed(&self, ch: MarketChannel) -> &Feed {
        match ch {
            MarketChannel::Ticker => &self.ticker,
            MarketChannel::Depth => &self.depth,
        }
    }

    fn timeout_ms(&self, ch: MarketChannel) -> i64 {
        let t = match ch {
            MarketChannel::Ticker => self.cfg.ticker_timeout,
            MarketChannel::Depth => self.cfg.depth_timeout,
        };
        t.as_millis() as i64
    }

    pub fn on_ticker(&self, price: Decimal, ts: i64) {
        if price <= Decimal::ZERO {
            return;
        }
        *lock(&self.last_price) = Some((price, ts));
        self.ticker.touch(now_ms());
    }

    /// Full depth snapshot.
    pub fn on_depth(&self, asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)], ts: i64) {
        self.book.rebuild(asks, bids, ts);
        self.mark_depth();
    }

    /// Incremental level change.
    pub fn on_depth_level(&self, side: Side, price: Decimal, size: Decimal, ts: i64) {
        self.book.update_level(side, price, size, ts);
        self.mark_depth();
    }

    fn mark_depth(&self) {
        let (bid, ask) = self.book.best_bid_ask();
        if bid.is_some() && ask.is_some() {
            self.depth.touch(now_ms());
        } else {
            self.depth.ok.store(false, Ordering::Release);
        }
    }

    pub fn set_connected(&self, up: bool) {
        let was = self.connected.swap(up, Ordering::AcqRel);
        if was != up {
            info!(instrument = %self.instrument_id, connected = up, "market connection");
        }
        if !up {
            self.ticker.ok.store(false, Ordering::Release);
            self.depth.ok.store(false, Ordering::Release);
        }
    }

    pub fn last_price(&self) -> Option<Decimal> {
        lock(&self.last_price).map(|(p, _)| p)
    }

    pub fn best_bid_ask(&self) -> (Option<Decimal>, Option<Decimal>) {
        self.book.best_bid_ask()
    }

    /// Re-parse trading hours when the catalog version moved.
    fn with_hours<R>(&self, f: impl FnOnce(&Hours) -> R) -> R {
        let version = self.registry.version();
        let mut slot = lock(&self.hours);
        if version != slot.0 || matches!(slot.1, Hours::Unparsed) {
            let parsed = match self.instrument().and_then(|i| i.trading_hours.clone().map(|h| (h, i.time_zone))) {
                None => Hours::AlwaysOpen,
                Some((text, tz)) => match TradingHours::parse(&text, tz) {
                    Ok(h) => Hours::Parsed(h),
                    Err(e) => {
                        warn!(instrument = %self.instrument_id, error = %e, "unparseable trading hours");
                        Hours::Invalid(e.to_string())
                    }
                },
            };
            *slot = (version, parsed);
        }
        f(&slot.1)
    }

    pub fn is_open(&self, now_ms: i64) -> bool {
        let Some(now) = Utc.timestamp_millis_opt(now_ms).single() else { return false };
        self.with_hours(|h| match h {
            Hours::AlwaysOpen => true,
            Hours::Parsed(th) => th.is_open(now),
            Hours::Unparsed | Hours::Invalid(_) => false,
        })
    }

    fn fresh(&self, ch: MarketChannel, now: i64) -> bool {
        let feed = self.feed(ch);
        feed.ok.load(Ordering::Acquire) && now - feed.last_at.load(Ordering::Acquire) <= self.timeout_ms(ch)
    }

    /// `Ok` when orders may be placed; otherwise the first failing reason.
    pub fn readiness(&self, now_ms: i64) -> Result<(), String> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(format!("{}: market connection down", self.instrument_id));
        }
        if self.instrument().is_none() {
            return Err(format!("{}: not in catalog", self.instrument_id));
        }
        if let Some(reason) = self.with_hours(|h| match h {
            Hours::Invalid(e) => Some(e.clone()),
            _ => None,
        }) {
            return Err(format!("{}: {reason}", self.instrument_id));
        }
        if !self.is_open(now_ms) {
            return Err(format!("{}: market closed", self.instrument_id));
        }
        if !self.fresh(MarketChannel::Ticker, now_ms) {
            return Err(format!("{}: price stale", self.instrument_id));
        }
        if !self.fresh(MarketChannel::Depth, now_ms) {
            return Err(format!("{}: depth stale", self.instrument_id));
        }
        Ok(())
    }

    /// One watchdog pass over a channel. Returns true when a resubscribe was
    /// requested.
    pub fn watchdog_check(&self, ch: MarketChannel, now: i64) -> bool {
        let feed = self.feed(ch);
        let last = feed.last_at.load(Ordering::Acquire).max(self.started_at);
        if now - last <= self.timeout_ms(ch) {
            return false;
        }
        if feed.ok.swap(false, Ordering::AcqRel) {
            warn!(instrument = %self.instrument_id, channel = ch.as_str(), "feed inactive");
        }
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        if ch == MarketChannel::Depth && !self.is_open(now) {
            return false;
        }

        let mut last_recovery = lock(&feed.last_recovery);
        let due = last_recovery.map_or(true, |t| now - t >= self.cfg.recovery_interval.as_millis() as i64);
        if !due {
            return false;
        }
        let hook = lock(&self.resubscribe).clone();
        let Some(hook) = hook else { return false };
        *last_recovery = Some(now);
        drop(last_recovery);
        info!(instrument = %self.instrument_id, channel = ch.as_str(), "resubscribing");
        hook(ch);
        true
    }

    /// One watchdog task per channel. Tasks hold a weak reference and end
    /// with the session.
    pub fn start_watchdogs(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            return;
        }
        for ch in [MarketChannel::Ticker, MarketChannel::Depth] {
            let weak: Weak<Self> = Arc::downgrade(self);
            let tick = self.cfg.watchdog_tick;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(tick).await;
                    let Some(me) = weak.upgrade() else { break };
                    me.watchdog_check(ch, now_ms());
                }
                debug!(channel = ch.as_str(), "market watchdog exit");
            }));
        }
    }

    pub fn stop(&self) {
        for t in lock(&self.tasks).drain(..) {
            t.abort();
        }
    }
}

impl Drop for MarketSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::InstrumentKind;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp_millis()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn trading_hours_parse_and_gate() {
        let th = TradingHours::parse(
            "20240102:0930-20240102:1600;20240103:CLOSED;20240104:0930-20240104:1600",
            chrono_tz::US::Eastern,
        )
        .unwrap();
        assert_eq!(th.intervals().len(), 2);
        // EST, UTC-5
        assert!(th.is_open(at(ms(2024, 1, 2, 15, 0))));
        assert!(!th.is_open(at(ms(2024, 1, 2, 21, 0))));
        assert!(!th.is_open(at(ms(2024, 1, 3, 17, 0))));
        assert!(th.is_open(at(ms(2024, 1, 4, 14, 30))));
        assert!(TradingHours::parse("garbage", Tz::UTC).is_err());
    }

    #[test]
    fn summer_sessions_follow_daylight_time() {
        let th = TradingHours::parse("20240701:0930-20240701:1600", chrono_tz::US::Eastern).unwrap();
        // EDT, UTC-4: open 13:30Z to 20:00Z
        assert!(!th.is_open(at(ms(2024, 7, 1, 13, 29))));
        assert!(th.is_open(at(ms(2024, 7, 1, 13, 30))));
        assert!(th.is_open(at(ms(2024, 7, 1, 13, 45))));
        assert!(th.is_open(at(ms(2024, 7, 1, 19, 59))));
        assert!(!th.is_open(at(ms(2024, 7, 1, 20, 30))));

        let sydney = TradingHours::parse("20240102:1000-20240102:1600", chrono_tz::Australia::Sydney).unwrap();
        // AEDT, UTC+11
        assert_eq!(sydney.intervals()[0].0, at(ms(2024, 1, 1, 23, 0)));
    }

    #[test]
    fn spring_forward_gap_is_rejected() {
        assert!(TradingHours::parse("20240310:0230-20240310:0400", chrono_tz::US::Eastern).is_err());
    }

    fn session(hours: Option<&str>) -> Arc<MarketSession> {
        let registry = Arc::new(InstrumentRegistry::new("t"));
        let mut inst = Instrument::new("AAPL", "AAPL", "USD", InstrumentKind::Stock, dec!(0.01), dec!(1), dec!(1), dec!(0)).unwrap();
        if let Some(h) = hours {
            inst = inst.with_trading_hours(h, Tz::UTC);
        }
        registry.replace_all(vec![inst]);
        MarketSession::new("AAPLUSD-STK", registry, MarketConfig::default())
    }

    #[test]
    fn readiness_reports_first_failing_gate() {
        let m = session(None);
        let now = now_ms();
        assert!(m.readiness(now).unwrap_err().contains("connection"));
        m.set_connected(true);
        assert!(m.readiness(now).unwrap_err().contains("price"));
        m.on_ticker(dec!(190.5), now);
        assert!(m.readiness(now).unwrap_err().contains("depth"));
        m.on_depth(&[(dec!(190.6), dec!(10))], &[(dec!(190.4), dec!(5))], now);
        assert_eq!(m.readiness(now_ms()), Ok(()));
        assert!(m.readiness(now_ms() + 31_000).unwrap_err().contains("stale"));
    }

    #[test]
    fn closed_market_is_not_ready_and_hours_follow_catalog_version() {
        let m = session(Some("20200101:0000-20200101:2359"));
        m.set_connected(true);
        let now = now_ms();
        m.on_ticker(dec!(1), now);
        m.on_depth(&[(dec!(2), dec!(1))], &[(dec!(1), dec!(1))], now);
        assert!(m.readiness(now).unwrap_err().contains("closed"));

        // a catalog refresh without hours opens it again
        let inst = Instrument::new("AAPL", "AAPL", "USD", InstrumentKind::Stock, dec!(0.01), dec!(1), dec!(1), dec!(0)).unwrap();
        m.registry().replace_all(vec![inst]);
        assert!(m.is_open(now));
    }

    #[test]
    fn watchdog_resubscribes_at_most_once_per_interval() {
        let m = session(None);
        m.set_connected(true);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        m.set_resubscribe_hook(Arc::new(move |ch| {
            assert_eq!(ch, MarketChannel::Ticker);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let t0 = now_ms();
        m.on_ticker(dec!(1), t0);
        assert!(!m.watchdog_check(MarketChannel::Ticker, t0 + 1_000));
        assert!(m.watchdog_check(MarketChannel::Ticker, t0 + 31_000));
        assert!(!m.watchdog_check(MarketChannel::Ticker, t0 + 40_000));
        assert!(m.watchdog_check(MarketChannel::Ticker, t0 + 91_000));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(m.readiness(t0 + 91_000).is_err());
    }
}
