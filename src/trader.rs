// ===============================
// src/trader.rs
// ===============================
//
// Per-instrument order entry: readiness gate, price envelope around the
// best, grid alignment, roster of live orders and the sweeper that retires
// finished ones.
//
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balance::BalanceLedger;
use crate::domain::{now_ms, Deal, Side};
use crate::error::{lock, ErrorReporter};
use crate::instruments::floor_to;
use crate::market::MarketSession;
use crate::order::{OrderEngine, OrderEngineConfig, OrderIndex, OrderObserver, OrderRequest, OrderState, OrderVenue};

#[derive(Debug, Clone)]
pub struct TraderConfig {
    /// Envelope around the best: max(abs, best * rel).
    pub max_price_dist_abs: Decimal,
    pub max_price_dist_rel: Decimal,
    pub client_prefix: String,
    pub sweep_interval: Duration,
    pub order: OrderEngineConfig,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            max_price_dist_abs: Decimal::ZERO,
            max_price_dist_rel: Decimal::new(5, 2),
            client_prefix: "dvc".to_string(),
            sweep_interval: Duration::from_secs(5),
            order: OrderEngineConfig::default(),
        }
    }
}

/// Runs once per order after it finished and left the roster.
pub type UninitHook = Arc<dyn Fn(&OrderState) + Send + Sync>;

/// Pushes fills and reservations of one instrument into the ledger.
struct LedgerObserver {
    ledger: Arc<BalanceLedger>,
    base: String,
    quote: String,
}

impl OrderObserver for LedgerObserver {
    fn on_deal(&self, _order: &OrderState, deal: &Deal) {
        let signed = deal.amount * Decimal::from(deal.side.sign());
        let (base_delta, quote_delta) = (signed, -signed * deal.price);
        self.ledger.record_temp_rights(&self.base, base_delta, deal.venue_time);
        self.ledger.record_temp_rights(&self.quote, quote_delta, deal.venue_time);
    }

    fn on_update(&self, order: &OrderState) {
        if !self.ledger.tracks_client_frozen() {
            return;
        }
        let remaining = order.remaining();
        match order.side {
            Side::Buy => self.ledger.set_order_frozen(&order.client_id, &self.quote, order.price * remaining),
            Side::Sell => self.ledger.set_order_frozen(&order.client_id, &self.base, remaining),
        }
    }
}

pub struct TraderSession {
    market: Arc<MarketSession>,
    venue: Arc<dyn OrderVenue>,
    ledger: Arc<BalanceLedger>,
    index: Arc<OrderIndex>,
    reporter: Arc<ErrorReporter>,
    cfg: TraderConfig,
    accepting: AtomicBool,
    seq: AtomicU64,
    roster: Mutex<HashMap<String, Arc<OrderEngine>>>,
    uninit: Mutex<UninitHook>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TraderSession {
    pub fn new(
        market: Arc<MarketSession>,
        venue: Arc<dyn OrderVenue>,
        ledger: Arc<BalanceLedger>,
        index: Arc<OrderIndex>,
        reporter: Arc<ErrorReporter>,
        cfg: TraderConfig,
    ) -> Arc<Self> {
        let release = ledger.clone();
        let uninit: UninitHook = Arc::new(move |o: &OrderState| release.clear_order_frozen(&o.client_id));
        Arc::new(Self {
            market,
            venue,
            ledger,
            index,
            reporter,
            cfg,
            accepting: AtomicBool::new(true),
            seq: AtomicU64::new(0),
            roster: Mutex::new(HashMap::new()),
            uninit: Mutex::new(uninit),
            sweeper: Mutex::new(None),
        })
    }

    pub fn market(&self) -> &Arc<MarketSession> {
        &self.market
    }

    pub fn set_uninit_hook(&self, hook: UninitHook) {
        *lock(&self.uninit) = hook;
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn resume_accepting(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn readiness(&self, now: i64) -> Result<(), String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(format!("{}: trader not accepting orders", self.market.instrument_id()));
        }
        self.market.readiness(now)
    }

    fn next_client_id(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{}{}", self.cfg.client_prefix, now_ms(), n)
    }

    /// Checks the price against the envelope around the best price.
    pub fn price_in_range(&self, side: Side, price: Decimal) -> Result<(), String> {
        let (bid, ask) = self.market.best_bid_ask();
        let envelope = |best: Decimal| self.cfg.max_price_dist_abs.max(best * self.cfg.max_price_dist_rel);
        match side {
            Side::Buy => {
                let bid = bid.ok_or("no best bid")?;
                let floor = bid - envelope(bid);
                if price < floor {
                    return Err(format!("buy {price} below {floor} (bid {bid})"));
                }
            }
            Side::Sell => {
                let ask = ask.ok_or("no best ask")?;
                let cap = ask + envelope(ask);
                if price > cap {
                    return Err(format!("sell {price} above {cap} (ask {ask})"));
                }
            }
        }
        Ok(())
    }

    /// Place an order. `None` (with the reason logged) when the session is
    /// not ready or the order fails a local check.
    #[allow(clippy::too_many_arguments)]
    pub fn make_order(
        &self,
        price: Decimal,
        size: Decimal,
        side: Side,
        post_only: bool,
        reduce_only: bool,
        purpose: &str,
        observer: Option<Arc<dyn OrderObserver>>,
    ) -> Option<Arc<OrderEngine>> {
        let id = self.market.instrument_id().to_string();
        if let Err(reason) = self.readiness(now_ms()) {
            warn!(instrument = %id, %reason, purpose, "order refused: not ready");
            return None;
        }
        let Some(inst) = self.market.instrument() else {
            warn!(instrument = %id, "order refused: unknown instrument");
            return None;
        };
        if let Err(reason) = self.price_in_range(side, price) {
            warn!(instrument = %id, %reason, purpose, "order refused: price out of range");
            return None;
        }

        let (bid, ask) = self.market.best_bid_ask();
        let px = inst.align_price(price, side, post_only, bid, ask);
        let sz = floor_to(size, inst.lot_size);
        let min = inst.min_size_at(px);
        if px <= Decimal::ZERO || sz < min {
            warn!(instrument = %id, %px, %sz, %min, purpose, "order refused: below minimum");
            return None;
        }

        let req = OrderRequest {
            client_id: self.next_client_id(),
            instrument: inst.id.clone(),
            symbol: inst.symbol.clone(),
            side,
            price: px,
            size: sz,
            post_only,
            reduce_only,
            purpose: purpose.to_string(),
        };
        info!(
            instrument = %id,
            client_id = %req.client_id,
            side = side.as_str(),
            price = %px,
            size = %sz,
            purpose,
            "make order"
        );
        let engine = OrderEngine::new(
            req,
            self.venue.clone(),
            self.market.registry().clone(),
            self.cfg.order.clone(),
            self.reporter.clone(),
        );
        engine.add_observer(Arc::new(LedgerObserver {
            ledger: self.ledger.clone(),
            base: inst.base.clone(),
            quote: inst.quote.clone(),
        }));
        if let Some(obs) = observer {
            engine.add_observer(obs);
        }
        self.index.insert(engine.clone());
        lock(&self.roster).insert(engine.client_id().to_string(), engine.clone());
        engine.start();
        Some(engine)
    }

    pub fn orders(&self) -> Vec<Arc<OrderEngine>> {
        lock(&self.roster).values().cloned().collect()
    }

    pub fn live_orders(&self) -> Vec<Arc<OrderEngine>> {
        self.orders().into_iter().filter(|o| !o.is_finished()).collect()
    }

    /// Retire finished orders. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let done: Vec<Arc<OrderEngine>> = {
            let mut roster = lock(&self.roster);
            let ids: Vec<String> = roster.iter().filter(|(_, o)| o.is_finished()).map(|(k, _)| k.clone()).collect();
            ids.iter().filter_map(|k| roster.remove(k)).collect()
        };
        let hook = lock(&self.uninit).clone();
        for o in &done {
            self.index.remove(o.client_id());
            hook(&o.state());
            debug!(client_id = %o.client_id(), "order retired");
        }
        done.len()
    }

    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = lock(&self.sweeper);
        if slot.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = self.cfg.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let Some(me) = weak.upgrade() else { break };
                me.sweep();
            }
        }));
    }

    /// Cancel every live order of this trader and wait for the venue calls.
    pub async fn cancel_all(&self) {
        let live = self.live_orders();
        if live.is_empty() {
            return;
        }
        info!(instrument = %self.market.instrument_id(), count = live.len(), "cancel all");
        let results = join_all(live.iter().map(|o| o.cancel())).await;
        for (o, r) in live.iter().zip(results) {
            if let Err(e) = r {
                warn!(client_id = %o.client_id(), error = %e, "cancel failed");
            }
        }
    }

    pub fn stop(&self) {
        self.stop_accepting();
        if let Some(t) = lock(&self.sweeper).take() {
            t.abort();
        }
    }
}

impl Drop for TraderSession {
    fn drop(&mut self) {
        if let Some(t) = lock(&self.sweeper).take() {
            t.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::LedgerConfig;
    use crate::instruments::{Instrument, InstrumentKind, InstrumentRegistry};
    use crate::market::MarketConfig;
    use crate::order::{OrderRef, PlaceAck};
    use crate::domain::{OrderSnapshot, OrderStatus};
    use crate::error::{VenueError, VenueResult};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct Silent;

    #[async_trait]
    impl OrderVenue for Silent {
        fn venue_name(&self) -> &str {
            "silent"
        }
        async fn place_order(&self, _r: &OrderRequest) -> VenueResult<PlaceAck> {
            Ok(PlaceAck { venue_id: Some("1".into()), client_id: None, snapshot: None })
        }
        async fn cancel_order(&self, _o: &OrderRef) -> VenueResult<Option<OrderSnapshot>> {
            Ok(None)
        }
        async fn query_order(&self, _o: &OrderRef) -> VenueResult<OrderSnapshot> {
            Err(VenueError::Timeout("quiet".into()))
        }
    }

    fn trader(track_frozen: bool) -> (Arc<TraderSession>, Arc<BalanceLedger>) {
        let registry = Arc::new(InstrumentRegistry::new("t"));
        registry.replace_all(vec![Instrument::new(
            "BTCUSDT", "BTC", "USDT", InstrumentKind::Spot, dec!(0.01), dec!(0.001), dec!(0.001), dec!(5),
        )
        .unwrap()]);
        let market = MarketSession::new("BTCUSDT", registry, MarketConfig::default());
        market.set_connected(true);
        market.on_ticker(dec!(100), now_ms());
        market.on_depth(&[(dec!(100.5), dec!(1))], &[(dec!(100), dec!(1))], now_ms());
        let ledger = Arc::new(BalanceLedger::new("t", LedgerConfig { track_client_frozen: track_frozen, ..Default::default() }));
        let cfg = TraderConfig { max_price_dist_abs: dec!(1), max_price_dist_rel: dec!(0.01), ..Default::default() };
        let t = TraderSession::new(market, Arc::new(Silent), ledger.clone(), Arc::new(OrderIndex::new()), Arc::new(ErrorReporter::default()), cfg);
        (t, ledger)
    }

    #[test]
    fn price_envelope_uses_larger_of_abs_and_rel() {
        let (t, _) = trader(false);
        // bid 100: envelope max(1, 1.00) = 1
        assert!(t.price_in_range(Side::Buy, dec!(99)).is_ok());
        assert!(t.price_in_range(Side::Buy, dec!(98.99)).is_err());
        // ask 100.5: envelope max(1, 1.005) = 1.005
        assert!(t.price_in_range(Side::Sell, dec!(101.505)).is_ok());
        assert!(t.price_in_range(Side::Sell, dec!(101.51)).is_err());
    }

    #[tokio::test]
    async fn make_order_aligns_and_refuses_when_unready() {
        let (t, _) = trader(false);
        let o = t.make_order(dec!(100.009), dec!(0.0509), Side::Buy, true, false, "t", None).unwrap();
        assert_eq!(o.request().price, dec!(100));
        assert_eq!(o.request().size, dec!(0.05));
        assert!(o.client_id().starts_with("dvc"));

        // below min notional (5 / 100 = 0.05)
        assert!(t.make_order(dec!(100), dec!(0.04), Side::Buy, false, false, "t", None).is_none());

        t.stop_accepting();
        assert!(t.make_order(dec!(100), dec!(1), Side::Buy, false, false, "t", None).is_none());
    }

    #[tokio::test]
    async fn frozen_reservation_follows_updates_and_is_released_on_sweep() {
        let (t, ledger) = trader(true);
        let o = t.make_order(dec!(100), dec!(0.1), Side::Buy, false, false, "t", None).unwrap();
        let cid = o.client_id().to_string();
        o.apply(&OrderSnapshot::new("BTCUSDT", OrderStatus::Partial, dec!(0.04), dec!(100), 1).with_client_id(&cid));
        assert_eq!(ledger.client_frozen("USDT"), dec!(6));
        assert_eq!(ledger.projected_rights("BTC"), dec!(0.04));
        assert_eq!(ledger.projected_rights("USDT"), dec!(-4));

        o.apply(&OrderSnapshot::new("BTCUSDT", OrderStatus::Canceled, dec!(0.04), dec!(100), 2).with_client_id(&cid));
        assert!(o.is_finished());
        assert_eq!(t.sweep(), 1);
        assert_eq!(ledger.client_frozen("USDT"), dec!(0));
        assert!(t.orders().is_empty());
    }
}
