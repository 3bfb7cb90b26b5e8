// ===============================
// src/main.rs
// ===============================
/*
 # which venue is active
 curl -s localhost:9898/metrics | grep '^config_venue_mode'

 # connectivity
 curl -s localhost:9898/metrics | egrep '^(ws_connected|gateway_connected|clock_skew_ms)'

 # orders / deals per instrument
 curl -s localhost:9898/metrics | egrep '^(orders_created_total|orders_finished_total|deals_total)'
*/
/*
=============================================================================
Project : dma_venue_core — multi-venue trading connectivity core in Rust
Module  : main.rs
Version : 0.6.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Connects to a venue (mock / Binance-style REST+WS / broker
          gateway over framed TCP), keeps instruments, books, balances and
          orders reconciled, caches historical series on disk, exposes
          Prometheus metrics, and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rust_decimal::Decimal;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dma_venue_core::balance::LedgerConfig;
use dma_venue_core::clock::Clock;
use dma_venue_core::config::{self, ContractConfig, Settings, VenueMode};
use dma_venue_core::domain::{now_ms, Event, Side};
use dma_venue_core::error::{ErrorReporter, VenueError};
use dma_venue_core::gateway::MockVenue;
use dma_venue_core::gateway_binance::BinanceVenue;
use dma_venue_core::gateway_broker::BrokerVenue;
use dma_venue_core::gateway_tcp::FramedTcpClient;
use dma_venue_core::hub::{HubConfig, VenueApi, VenueHub};
use dma_venue_core::instruments::{Instrument, InstrumentKind};
use dma_venue_core::metrics;
use dma_venue_core::order::OrderObserver;
use dma_venue_core::recorder::{Journal, RecordingObserver};
use dma_venue_core::series::{KlineCache, Klines, SeriesSource};

#[derive(Parser, Debug)]
#[command(name = "dma_venue_core", version, about = "Venue connectivity core")]
struct Cli {
    /// Env file to load instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// mock | binance_sandbox | binance_mainnet | broker (overrides VENUE_MODE)
    #[arg(long)]
    mode: Option<String>,
    /// Place one small post-only order per contract once ready, then cancel it
    #[arg(long)]
    probe: bool,
}

// Mock catalog derived from the configured contracts
fn mock_instruments(contracts: &[ContractConfig]) -> Vec<Instrument> {
    contracts
        .iter()
        .filter_map(|c| {
            let base = c.symbol.strip_suffix(c.currency.as_str()).unwrap_or(&c.symbol);
            Instrument::new(
                &c.symbol,
                base,
                &c.currency,
                InstrumentKind::Spot,
                Decimal::new(1, 2),
                Decimal::new(1, 4),
                Decimal::new(1, 4),
                Decimal::ZERO,
            )
            .map_err(|e| warn!(symbol = %c.symbol, error = %e, "mock instrument skipped"))
            .ok()
        })
        .collect()
}

fn hub_config(settings: &Settings) -> HubConfig {
    HubConfig {
        ledger: LedgerConfig { max_pitch: settings.max_pitch.clone(), ..LedgerConfig::default() },
        ..HubConfig::default()
    }
}

// Last hour of 1m bars per contract, so the first analytics read hits disk.
async fn warm_klines(cache: &KlineCache, contracts: &[ContractConfig]) {
    let t1 = now_ms();
    for c in contracts {
        match cache.get_kline(&c.symbol, "1m", t1 - 3_600_000, t1).await {
            Ok(rows) => info!(symbol = %c.symbol, rows = rows.len(), "kline cache warm"),
            Err(e) => warn!(symbol = %c.symbol, error = %e, "kline warmup failed"),
        }
    }
}

async fn probe_order<V: VenueApi + 'static>(hub: &VenueHub<V>, symbol: &str, journal: Option<&Journal>) {
    let Some(inst) = hub.registry().get_all().into_iter().find(|i| i.symbol == symbol) else { return };
    let Ok(trader) = hub.trader(&inst.id, Default::default()).await else { return };

    // wait for a usable book
    let mut waited = 0;
    while trader.readiness(now_ms()).is_err() && waited < 20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        waited += 1;
    }
    let (Some(bid), _) = trader.market().best_bid_ask() else {
        warn!(%symbol, "probe skipped: no bid");
        return;
    };
    let price = bid - inst.tick_size * Decimal::from(5);
    let size = inst.min_size_at(price);
    let observer = journal.map(|j| RecordingObserver::new(j.clone()) as Arc<dyn OrderObserver>);
    let Some(order) = trader.make_order(price, size, Side::Buy, true, false, "probe", observer) else {
        warn!(%symbol, "probe order refused");
        return;
    };
    tokio::time::sleep(Duration::from_secs(3)).await;
    if let Err(e) = order.cancel().await {
        warn!(%symbol, error = %e, "probe cancel failed");
    }
    let done = order.wait_finished(Duration::from_secs(10)).await;
    info!(%symbol, client_id = %order.client_id(), finished = done, state = ?order.state().status, "probe done");
}

async fn run<V: VenueApi + 'static>(
    api: Arc<V>,
    clock: Arc<Clock>,
    reporter: Arc<ErrorReporter>,
    journal: Option<Journal>,
    settings: &Settings,
    klines: Option<KlineCache>,
    probe: bool,
) -> Result<(), VenueError> {
    let hub = VenueHub::new(api, clock, reporter, journal.clone(), hub_config(settings));
    hub.start().await?;

    if let Some(cache) = &klines {
        warm_klines(cache, &settings.contracts).await;
    }

    for c in &settings.contracts {
        let Some(inst) = hub.registry().get_all().into_iter().find(|i| i.symbol == c.symbol) else {
            warn!(symbol = %c.symbol, "contract not in catalog, skipped");
            continue;
        };
        hub.market(&inst.id).await?;
        hub.trader(&inst.id, c.trader_config()).await?;
        info!(symbol = %c.symbol, instrument = %inst.id, "trader up");
    }

    if probe {
        for c in &settings.contracts {
            probe_order(&hub, &c.symbol, journal.as_ref()).await;
        }
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let clock = hub.clock();
                info!(venue_time = clock.now_ms_lossy(), skew_ms = clock.skew_ms(), "clock");
                for t in hub.traders() {
                    let (bid, ask) = t.market().best_bid_ask();
                    info!(
                        instrument = %t.market().instrument_id(),
                        ?bid,
                        ?ask,
                        live = t.live_orders().len(),
                        ready = t.readiness(now_ms()).is_ok(),
                        "heartbeat"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received");
                break;
            }
        }
    }
    hub.shutdown().await;
    if let Some(j) = &journal {
        j.record(Event::Note("shutdown".into()));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), VenueError> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = config::load(cli.env_file.as_deref(), cli.mode.as_deref())?;

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(settings.metrics_port));
    metrics::CONFIG_VENUE_MODE.with_label_values(&[settings.mode.as_str()]).set(1);

    info!(
        mode = %settings.mode.as_str(),
        contracts = ?settings.contracts.iter().map(|c| c.symbol.as_str()).collect::<Vec<_>>(),
        rest = %settings.binance.rest_url,
        ws = %settings.binance.ws_url,
        gateway = %format!("{}:{}", settings.gateway.address, settings.gateway.port),
        "startup config"
    );

    let reporter = Arc::new(ErrorReporter::default());
    reporter.set_callback(Arc::new(|ctx: &str, err: &VenueError| {
        warn!(context = ctx, code = ?err.code(), error = %err, "venue business error");
    }));

    // ---- Recorder (optional) ----
    let journal = settings.record_file.clone().map(|path| Journal::spawn(path).0);

    match settings.mode {
        VenueMode::Mock => {
            let venue = MockVenue::new("mock", mock_instruments(&settings.contracts))
                .with_random_walk(Duration::from_secs(1))
                .with_auto_fill(Duration::from_millis(500));
            for c in &settings.contracts {
                venue.set_balance(&c.currency, Decimal::from(100_000), Decimal::ZERO);
            }
            let clock = Arc::new(Clock::new("mock", 0, false));
            run(Arc::new(venue), clock, reporter, journal, &settings, None, cli.probe).await
        }
        VenueMode::BinanceSandbox | VenueMode::BinanceMainnet => {
            let clock = Arc::new(Clock::new("binance", 0, true));
            let venue = Arc::new(BinanceVenue::new(
                "binance",
                settings.binance.clone(),
                settings.credentials.clone(),
                clock.clone(),
                reporter.clone(),
            )?);
            let klines = settings.cache_enabled.then(|| {
                let source: Arc<dyn SeriesSource<Klines>> = venue.clone();
                KlineCache::new("binance", source, settings.series_config())
            });
            run(venue, clock, reporter, journal, &settings, klines, cli.probe).await
        }
        VenueMode::Broker => {
            let client = Arc::new(FramedTcpClient::new(settings.gateway.clone()));
            let contracts = settings.contracts.iter().map(ContractConfig::gateway_contract).collect();
            let tif = settings.contracts.first().map_or("GTC", |c| c.time_in_force.as_str());
            let venue = Arc::new(BrokerVenue::new("broker", client, contracts, tif));
            let klines = settings.cache_enabled.then(|| {
                let source: Arc<dyn SeriesSource<Klines>> = venue.clone();
                KlineCache::new("broker", source, settings.series_config())
            });
            let clock = Arc::new(Clock::new("broker", 0, false));
            run(venue, clock, reporter, journal, &settings, klines, cli.probe).await
        }
    }
}
