// ===============================
// src/hub.rs
// ===============================
//
// Facade over one venue connection. Startup order:
//   clock -> catalog -> cancel-all -> balances -> account stream -> ready
// Shutdown: stop accepting -> cancel-all -> close.
//
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::balance::{BalanceLedger, LedgerConfig};
use crate::clock::Clock;
use crate::domain::{now_ms, AccountEvent, BalanceUpdate, Event, OrderSnapshot, PitchEvent};
use crate::error::{backoff_delay, lock, ErrorReporter, VenueError, VenueResult};
use crate::instruments::{Instrument, InstrumentRegistry};
use crate::market::{MarketConfig, MarketSession};
use crate::order::{OrderIndex, OrderVenue};
use crate::recorder::Journal;
use crate::trader::{TraderConfig, TraderSession};

/// Everything the hub needs from a venue beyond order entry.
#[async_trait]
pub trait VenueApi: OrderVenue {
    async fn server_time(&self) -> VenueResult<i64>;

    async fn load_instruments(&self) -> VenueResult<Vec<Instrument>>;

    /// Open orders of the account, all symbols.
    async fn open_orders(&self) -> VenueResult<Vec<OrderSnapshot>>;

    async fn cancel_all(&self, symbols: &[String]) -> VenueResult<()>;

    async fn account_snapshot(&self) -> VenueResult<Vec<BalanceUpdate>>;

    /// Start pushing order and balance events. Reconnects are the venue's
    /// business; it sends `AccountEvent::Resynced` after each one.
    async fn start_account_stream(&self, events: mpsc::UnboundedSender<AccountEvent>) -> VenueResult<()>;

    /// Feed ticker and depth of one market and install its resubscribe hook.
    async fn subscribe_market(&self, market: Arc<MarketSession>) -> VenueResult<()>;

    async fn stop(&self);
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Attempts per startup step; 0 retries forever.
    pub startup_attempts: u32,
    /// How often to check whether the daily catalog refresh is due.
    pub catalog_check_interval: Duration,
    pub account_refresh_interval: Duration,
    pub ledger: LedgerConfig,
    pub market: MarketConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            startup_attempts: 8,
            catalog_check_interval: Duration::from_secs(3600),
            account_refresh_interval: Duration::from_secs(60),
            ledger: LedgerConfig::default(),
            market: MarketConfig::default(),
        }
    }
}

pub struct VenueHub<V: VenueApi + 'static> {
    api: Arc<V>,
    clock: Arc<Clock>,
    registry: Arc<InstrumentRegistry>,
    ledger: Arc<BalanceLedger>,
    index: Arc<OrderIndex>,
    reporter: Arc<ErrorReporter>,
    journal: Option<Journal>,
    cfg: HubConfig,
    ready: AtomicBool,
    markets: Mutex<HashMap<String, Arc<MarketSession>>>,
    // serializes first subscriptions so one instrument subscribes once
    subscribing: tokio::sync::Mutex<()>,
    traders: Mutex<HashMap<String, Arc<TraderSession>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

async fn sync_clock<V: VenueApi>(api: &V, clock: &Clock) -> VenueResult<()> {
    let sent = now_ms();
    let server = api.server_time().await?;
    clock.update_from_server(server, sent, now_ms());
    Ok(())
}

fn seed_balances(ledger: &BalanceLedger, journal: Option<&Journal>, balances: Vec<BalanceUpdate>) {
    for b in balances {
        apply_balance(ledger, journal, &b);
    }
}

fn apply_balance(ledger: &BalanceLedger, journal: Option<&Journal>, b: &BalanceUpdate) {
    let Some(report) = ledger.refresh(&b.ccy, b.rights, b.frozen, b.ts) else { return };
    if report.alert {
        if let Some(j) = journal {
            j.record(Event::Pitch(PitchEvent { ccy: report.ccy, pitch: report.pitch, ts: b.ts }));
        }
    }
}

impl<V: VenueApi + 'static> VenueHub<V> {
    pub fn new(
        api: Arc<V>,
        clock: Arc<Clock>,
        reporter: Arc<ErrorReporter>,
        journal: Option<Journal>,
        cfg: HubConfig,
    ) -> Arc<Self> {
        let name = api.venue_name().to_string();
        Arc::new(Self {
            registry: Arc::new(InstrumentRegistry::new(name.clone())),
            ledger: Arc::new(BalanceLedger::new(name, cfg.ledger.clone())),
            index: Arc::new(OrderIndex::new()),
            api,
            clock,
            reporter,
            journal,
            cfg,
            ready: AtomicBool::new(false),
            markets: Mutex::new(HashMap::new()),
            subscribing: tokio::sync::Mutex::new(()),
            traders: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn api(&self) -> &Arc<V> {
        &self.api
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<BalanceLedger> {
        &self.ledger
    }

    pub fn index(&self) -> &Arc<OrderIndex> {
        &self.index
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn retry<T, F, Fut>(&self, what: &str, mut f: F) -> VenueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VenueResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    self.reporter.report(what, &e);
                    if self.cfg.startup_attempts != 0 && attempt >= self.cfg.startup_attempts {
                        error!(venue = %self.api.venue_name(), step = what, attempts = attempt, error = %e, "startup step failed");
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt);
                    warn!(venue = %self.api.venue_name(), step = what, attempt, ?delay, error = %e, "startup step retry");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Cancel everything the account has open and confirm the book is empty.
    async fn cancel_leftovers(&self) -> VenueResult<()> {
        let open = self.api.open_orders().await?;
        if open.is_empty() {
            return Ok(());
        }
        let symbols: Vec<String> = open
            .iter()
            .map(|o| self.registry.get(&o.instrument).map_or_else(|| o.instrument.clone(), |i| i.symbol.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        warn!(venue = %self.api.venue_name(), count = open.len(), ?symbols, "open orders found at startup, canceling");
        self.api.cancel_all(&symbols).await?;
        let left = self.api.open_orders().await?;
        if left.is_empty() {
            Ok(())
        } else {
            Err(VenueError::NotReady(format!("{} orders still open after cancel-all", left.len())))
        }
    }

    pub async fn start(self: &Arc<Self>) -> VenueResult<()> {
        let venue = self.api.venue_name().to_string();
        info!(%venue, "hub starting");

        self.retry("server_time", || sync_clock(self.api.as_ref(), &self.clock)).await?;

        let list = self.retry("load_instruments", || self.api.load_instruments()).await?;
        self.registry.replace_all(list);

        self.retry("cancel_all", || self.cancel_leftovers()).await?;

        let balances = self.retry("account_snapshot", || self.api.account_snapshot()).await?;
        seed_balances(&self.ledger, self.journal.as_ref(), balances);

        let (tx, rx) = mpsc::unbounded_channel();
        self.retry("account_stream", || self.api.start_account_stream(tx.clone())).await?;
        drop(tx);
        self.spawn_dispatcher(rx);
        self.spawn_refreshers();

        {
            // same lock as trader(): a trader is either seen here or sees ready
            let traders = lock(&self.traders);
            self.ready.store(true, Ordering::SeqCst);
            for t in traders.values() {
                t.resume_accepting();
            }
        }
        info!(%venue, instruments = self.registry.len(), "hub ready");
        Ok(())
    }

    fn spawn_dispatcher(&self, mut rx: mpsc::UnboundedReceiver<AccountEvent>) {
        let (ledger, index, journal) = (self.ledger.clone(), self.index.clone(), self.journal.clone());
        let handle = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                match ev {
                    AccountEvent::Order(snap) => {
                        if !index.route(&snap) {
                            debug!(client_id = ?snap.client_id, venue_id = ?snap.venue_id, "snapshot for untracked order");
                        }
                    }
                    AccountEvent::Balance(b) => apply_balance(&ledger, journal.as_ref(), &b),
                    AccountEvent::Resynced => {
                        info!(orders = index.len(), "account stream resynced, polling live orders");
                        index.poll_all();
                    }
                }
            }
            debug!("account dispatcher exit");
        });
        lock(&self.tasks).push(handle);
    }

    fn spawn_refreshers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let every = self.cfg.catalog_check_interval;
        let daily = tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let Some(hub) = weak.upgrade() else { break };
                if hub.registry.needs_refresh(chrono::Local::now().date_naive()) {
                    hub.refresh_catalog().await;
                }
            }
        });

        let weak = Arc::downgrade(self);
        let every = self.cfg.account_refresh_interval;
        let account = tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let Some(hub) = weak.upgrade() else { break };
                match hub.api.account_snapshot().await {
                    Ok(list) => seed_balances(&hub.ledger, hub.journal.as_ref(), list),
                    Err(e) => {
                        hub.reporter.report("account_snapshot", &e);
                    }
                }
            }
        });
        lock(&self.tasks).extend([daily, account]);
    }

    /// Reload the catalog and re-measure the clock. Errors are logged and
    /// retried on the next tick.
    pub async fn refresh_catalog(&self) {
        if let Err(e) = sync_clock(self.api.as_ref(), &self.clock).await {
            self.reporter.report("server_time", &e);
        }
        match self.api.load_instruments().await {
            Ok(list) if !list.is_empty() => {
                self.registry.replace_all(list);
            }
            Ok(_) => warn!(venue = %self.api.venue_name(), "empty catalog ignored"),
            Err(e) => {
                self.reporter.report("load_instruments", &e);
            }
        }
    }

    /// Market session for an instrument, subscribed on first use.
    pub async fn market(&self, instrument_id: &str) -> VenueResult<Arc<MarketSession>> {
        let inst = self
            .registry
            .get(instrument_id)
            .ok_or_else(|| VenueError::InvalidRequest(format!("unknown instrument {instrument_id}")))?;
        if let Some(m) = lock(&self.markets).get(&inst.id) {
            return Ok(m.clone());
        }
        let _subscribing = self.subscribing.lock().await;
        if let Some(m) = lock(&self.markets).get(&inst.id) {
            return Ok(m.clone());
        }
        let market = MarketSession::new(inst.id.clone(), self.registry.clone(), self.cfg.market.clone());
        self.api.subscribe_market(market.clone()).await?;
        market.start_watchdogs();
        lock(&self.markets).insert(inst.id.clone(), market.clone());
        Ok(market)
    }

    /// Trader for an instrument. Refuses orders until the hub is ready.
    pub async fn trader(&self, instrument_id: &str, cfg: TraderConfig) -> VenueResult<Arc<TraderSession>> {
        let market = self.market(instrument_id).await?;
        let mut traders = lock(&self.traders);
        if let Some(t) = traders.get(market.instrument_id()) {
            return Ok(t.clone());
        }
        let venue: Arc<dyn OrderVenue> = self.api.clone();
        let trader = TraderSession::new(
            market.clone(),
            venue,
            self.ledger.clone(),
            self.index.clone(),
            self.reporter.clone(),
            cfg,
        );
        if !self.is_ready() {
            trader.stop_accepting();
        }
        trader.start_sweeper();
        traders.insert(market.instrument_id().to_string(), trader.clone());
        Ok(trader)
    }

    pub fn traders(&self) -> Vec<Arc<TraderSession>> {
        lock(&self.traders).values().cloned().collect()
    }

    pub async fn shutdown(&self) {
        let venue = self.api.venue_name().to_string();
        info!(%venue, "hub shutting down");
        let traders = {
            let traders = lock(&self.traders);
            self.ready.store(false, Ordering::SeqCst);
            for t in traders.values() {
                t.stop_accepting();
            }
            traders.values().cloned().collect::<Vec<_>>()
        };
        for t in &traders {
            t.cancel_all().await;
        }
        if let Err(e) = self.cancel_leftovers().await {
            warn!(%venue, error = %e, "cancel-all at shutdown incomplete");
        }
        for t in &traders {
            t.stop();
        }
        for m in lock(&self.markets).values() {
            m.stop();
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.api.stop().await;
        info!(%venue, "hub stopped");
    }
}
