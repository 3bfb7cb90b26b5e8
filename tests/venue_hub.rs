// ===============================
// tests/venue_hub.rs
// ===============================
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use dma_venue_core::balance::LedgerConfig;
use dma_venue_core::clock::Clock;
use dma_venue_core::domain::{Event, OrderStatus, Side};
use dma_venue_core::error::ErrorReporter;
use dma_venue_core::gateway::MockVenue;
use dma_venue_core::hub::{HubConfig, VenueApi, VenueHub};
use dma_venue_core::instruments::{Instrument, InstrumentKind};
use dma_venue_core::market::MarketChannel;
use dma_venue_core::recorder::Journal;
use dma_venue_core::trader::TraderConfig;

fn catalog() -> Vec<Instrument> {
    vec![
        Instrument::new("BTCUSDT", "BTC", "USDT", InstrumentKind::Spot, dec!(0.01), dec!(0.0001), dec!(0.0001), dec!(5))
            .unwrap(),
        Instrument::new("ETHUSDT", "ETH", "USDT", InstrumentKind::Spot, dec!(0.01), dec!(0.001), dec!(0.001), dec!(5))
            .unwrap(),
    ]
}

fn hub_with(venue: Arc<MockVenue>, journal: Option<Journal>, cfg: HubConfig) -> Arc<VenueHub<MockVenue>> {
    VenueHub::new(venue, Arc::new(Clock::new("mock", 0, false)), Arc::new(ErrorReporter::default()), journal, cfg)
}

#[tokio::test]
async fn startup_cancels_leftovers_and_seeds_balances() -> anyhow::Result<()> {
    let venue = Arc::new(MockVenue::new("mock", catalog()));
    venue.set_balance("USDT", dec!(500), dec!(20));
    venue.seed_resting("old-1", "BTCUSDT", Side::Buy, dec!(90), dec!(0.1));
    venue.seed_resting("old-2", "BTCUSDT", Side::Sell, dec!(110), dec!(0.1));

    let hub = hub_with(venue.clone(), None, HubConfig::default());
    assert!(!hub.is_ready());
    hub.start().await?;
    assert!(hub.is_ready());

    assert_eq!(venue.cancel_all_calls(), vec![vec!["BTCUSDT".to_string()]]);
    assert!(venue.open_orders().await?.is_empty());
    assert_eq!(venue.order_snapshot("old-1").map(|s| s.status), Some(OrderStatus::Canceled));

    assert_eq!(hub.registry().len(), 2);
    let usdt = hub.ledger().snapshot("USDT").expect("seeded");
    assert_eq!((usdt.rights, usdt.frozen), (dec!(500), dec!(20)));
    assert_eq!(hub.ledger().available("USDT"), dec!(480));
    Ok(())
}

#[tokio::test]
async fn clean_start_skips_cancel_all() -> anyhow::Result<()> {
    let venue = Arc::new(MockVenue::new("mock", catalog()));
    let hub = hub_with(venue.clone(), None, HubConfig::default());
    hub.start().await?;
    assert!(venue.cancel_all_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn balance_pitch_above_tolerance_is_journaled() -> anyhow::Result<()> {
    let venue = Arc::new(MockVenue::new("mock", catalog()));
    venue.set_balance("USDT", dec!(1000), dec!(0));
    venue.set_balance("BTC", dec!(1), dec!(0));

    let (tx, mut rx) = mpsc::channel(16);
    let cfg = HubConfig {
        account_refresh_interval: Duration::from_millis(30),
        ledger: LedgerConfig {
            max_pitch: HashMap::from([("BTC".to_string(), dec!(0.5))]),
            ..LedgerConfig::default()
        },
        ..HubConfig::default()
    };
    let hub = hub_with(venue.clone(), Some(Journal::from_sender(tx)), cfg);
    hub.start().await?;

    // seeding never alerts
    assert!(rx.try_recv().is_err());

    // within the BTC tolerance: no alert; USDT has none, any change alerts
    venue.set_balance("BTC", dec!(1.2), dec!(0));
    venue.set_balance("USDT", dec!(990), dec!(0));

    let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.expect("journal open");
    match ev {
        Event::Pitch(p) => {
            assert_eq!(p.ccy, "USDT");
            assert_eq!(p.pitch, dec!(-10));
        }
        other => panic!("unexpected event {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(hub.ledger().snapshot("BTC").map(|b| b.rights), Some(dec!(1.2)));
    Ok(())
}

#[tokio::test]
async fn markets_are_shared_and_traders_wait_for_ready() -> anyhow::Result<()> {
    let venue = Arc::new(MockVenue::new("mock", catalog()));
    let hub = hub_with(venue.clone(), None, HubConfig::default());
    hub.start().await?;

    let a = hub.market("ETHUSDT").await?;
    let b = hub.market("ETHUSDT").await?;
    assert!(Arc::ptr_eq(&a, &b));
    assert!(hub.market("DOGEUSDT").await.is_err());

    let trader = hub.trader("ETHUSDT", TraderConfig::default()).await?;
    MockVenue::quote(trader.market(), dec!(2000), dec!(2000.5));
    assert!(trader.readiness(dma_venue_core::domain::now_ms()).is_ok());

    // min notional 5 at 1999: 0.001 is too small, 0.003 passes
    assert!(trader.make_order(dec!(1999), dec!(0.001), Side::Buy, false, false, "n", None).is_none());
    assert!(trader.make_order(dec!(1999), dec!(0.003), Side::Buy, false, false, "n", None).is_some());
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_live_orders_and_stops_accepting() -> anyhow::Result<()> {
    let venue = Arc::new(MockVenue::new("mock", catalog()));
    let hub = hub_with(venue.clone(), None, HubConfig::default());
    hub.start().await?;
    let trader = hub.trader("BTCUSDT", TraderConfig::default()).await?;
    MockVenue::quote(trader.market(), dec!(100), dec!(100.01));

    let order = trader.make_order(dec!(99), dec!(0.1), Side::Buy, true, false, "rest", None).expect("accepted");
    for _ in 0..100 {
        if order.state().created {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    hub.shutdown().await;
    assert!(!hub.is_ready());
    assert!(order.wait_finished(Duration::from_secs(2)).await);
    assert_eq!(order.state().status, OrderStatus::Canceled);
    assert!(venue.open_orders().await?.is_empty());
    assert!(trader.make_order(dec!(99), dec!(0.1), Side::Buy, true, false, "late", None).is_none());
    Ok(())
}

#[tokio::test]
async fn stale_feed_triggers_resubscribe() -> anyhow::Result<()> {
    let venue = Arc::new(MockVenue::new("mock", catalog()));
    let hub = hub_with(venue.clone(), None, HubConfig::default());
    hub.start().await?;
    let market = hub.market("BTCUSDT").await?;
    MockVenue::quote(&market, dec!(100), dec!(100.01));

    let later = dma_venue_core::domain::now_ms() + 31_000;
    assert!(market.watchdog_check(MarketChannel::Ticker, later));
    // throttled within the recovery interval
    assert!(!market.watchdog_check(MarketChannel::Ticker, later + 1_000));
    assert!(market.readiness(later).is_err());
    assert_eq!(venue.resubscribes(), vec![("BTCUSDT".to_string(), MarketChannel::Ticker)]);
    Ok(())
}

#[tokio::test]
async fn concurrent_market_calls_subscribe_once() -> anyhow::Result<()> {
    let venue = Arc::new(MockVenue::new("mock", catalog()).with_subscribe_delay(Duration::from_millis(50)));
    let hub = hub_with(venue.clone(), None, HubConfig::default());
    hub.start().await?;

    let (a, b, c) = tokio::join!(hub.market("BTCUSDT"), hub.market("BTCUSDT"), hub.trader("BTCUSDT", TraderConfig::default()));
    let (a, b, c) = (a?, b?, c?);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, c.market()));
    assert_eq!(venue.subscriptions(), vec!["BTCUSDT".to_string()]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn traders_created_during_startup_accept_once_ready() -> anyhow::Result<()> {
    for _ in 0..50 {
        let venue = Arc::new(MockVenue::new("mock", catalog()));
        let hub = hub_with(venue, None, HubConfig::default());
        let starting = tokio::spawn({
            let hub = hub.clone();
            async move { hub.start().await }
        });
        // the catalog loads early in startup; keep asking until it does
        let trader = loop {
            match hub.trader("BTCUSDT", TraderConfig::default()).await {
                Ok(t) => break t,
                Err(_) => tokio::task::yield_now().await,
            }
        };
        starting.await??;
        MockVenue::quote(trader.market(), dec!(100), dec!(100.01));
        assert_eq!(trader.readiness(dma_venue_core::domain::now_ms()), Ok(()));
    }
    Ok(())
}
