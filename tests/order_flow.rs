// ===============================
// tests/order_flow.rs
// ===============================
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use dma_venue_core::clock::Clock;
use dma_venue_core::domain::{Deal, OrderStatus, Side};
use dma_venue_core::error::{ErrorReporter, VenueError};
use dma_venue_core::gateway::MockVenue;
use dma_venue_core::hub::{HubConfig, VenueHub};
use dma_venue_core::instruments::{Instrument, InstrumentKind};
use dma_venue_core::order::{OrderEngine, OrderObserver, OrderState};
use dma_venue_core::trader::{TraderConfig, TraderSession};

#[derive(Default)]
struct Deals(Mutex<Vec<Deal>>);

impl Deals {
    fn total(&self) -> Decimal {
        self.0.lock().unwrap().iter().map(|d| d.amount).sum()
    }
    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl OrderObserver for Deals {
    fn on_deal(&self, _order: &OrderState, deal: &Deal) {
        self.0.lock().unwrap().push(deal.clone());
    }
}

fn btc() -> Instrument {
    Instrument::new("BTCUSDT", "BTC", "USDT", InstrumentKind::Spot, dec!(0.01), dec!(0.0001), dec!(0.0001), dec!(0))
        .unwrap()
}

async fn setup(venue: MockVenue) -> (Arc<MockVenue>, Arc<VenueHub<MockVenue>>, Arc<TraderSession>) {
    venue.set_balance("USDT", dec!(1000), dec!(0));
    venue.set_balance("BTC", dec!(0), dec!(0));
    let venue = Arc::new(venue);
    let hub = VenueHub::new(
        venue.clone(),
        Arc::new(Clock::new("mock", 0, false)),
        Arc::new(ErrorReporter::default()),
        None,
        HubConfig::default(),
    );
    hub.start().await.unwrap();
    let cfg = TraderConfig {
        order: dma_venue_core::order::OrderEngineConfig { poll_interval: Duration::from_millis(50), poll_fatal_after: 3 },
        ..TraderConfig::default()
    };
    let trader = hub.trader("BTCUSDT", cfg).await.unwrap();
    MockVenue::quote(trader.market(), dec!(100), dec!(100.01));
    (venue, hub, trader)
}

async fn wait_created(order: &OrderEngine) {
    for _ in 0..100 {
        if order.state().created {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("order {} never created", order.client_id());
}

#[tokio::test]
async fn partial_then_full_fill_emits_exact_deals() -> anyhow::Result<()> {
    let (venue, hub, trader) = setup(MockVenue::new("mock", vec![btc()])).await;
    let deals = Arc::new(Deals::default());
    let order = trader
        .make_order(dec!(99.5), dec!(0.5), Side::Buy, false, false, "test", Some(deals.clone() as Arc<dyn OrderObserver>))
        .expect("order accepted");
    wait_created(&order).await;

    venue.fill(order.client_id(), dec!(0.2), dec!(99.5))?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(order.state().status, OrderStatus::Partial);
    assert_eq!(deals.total(), dec!(0.2));

    venue.fill(order.client_id(), dec!(0.3), dec!(99.5))?;
    assert!(order.wait_finished(Duration::from_secs(2)).await);

    let st = order.state();
    assert_eq!(st.status, OrderStatus::Filled);
    assert_eq!(st.filled, dec!(0.5));
    assert_eq!(deals.count(), 2);
    assert_eq!(deals.total(), st.filled);

    // fills are projected into the ledger until the next refresh
    assert_eq!(hub.ledger().projected_rights("BTC"), dec!(0.5));
    assert_eq!(hub.ledger().projected_rights("USDT"), dec!(1000) - dec!(49.75));
    Ok(())
}

#[tokio::test]
async fn cancel_racing_a_fill_resolves_by_poll() -> anyhow::Result<()> {
    let (venue, _hub, trader) = setup(MockVenue::new("mock", vec![btc()])).await;
    let deals = Arc::new(Deals::default());
    let order = trader
        .make_order(dec!(99.5), dec!(0.5), Side::Buy, false, false, "race", Some(deals.clone() as Arc<dyn OrderObserver>))
        .expect("order accepted");
    wait_created(&order).await;

    // the fill never reaches the push stream
    venue.set_push(false);
    venue.fill(order.client_id(), dec!(0.5), dec!(99.5))?;

    // the venue answers "unknown order"; the engine polls instead of failing
    order.cancel().await?;
    assert!(order.wait_finished(Duration::from_secs(2)).await);
    let st = order.state();
    assert_eq!(st.status, OrderStatus::Filled);
    assert_eq!(deals.total(), dec!(0.5));
    assert!(st.fatal_error.is_none());
    Ok(())
}

#[tokio::test]
async fn cancel_of_resting_order_is_final() -> anyhow::Result<()> {
    let (venue, _hub, trader) = setup(MockVenue::new("mock", vec![btc()])).await;
    let order = trader.make_order(dec!(99), dec!(0.01), Side::Buy, true, false, "rest", None).expect("accepted");
    wait_created(&order).await;
    order.cancel().await?;
    assert!(order.wait_finished(Duration::from_secs(2)).await);
    assert_eq!(order.state().status, OrderStatus::Canceled);

    // a late fill on a finished order is refused by the venue and changes nothing
    assert!(venue.fill(order.client_id(), dec!(0.01), dec!(99)).is_err());
    assert_eq!(order.state().filled, dec!(0));
    Ok(())
}

#[tokio::test]
async fn rejected_place_finishes_with_fatal_error() -> anyhow::Result<()> {
    let (venue, _hub, trader) = setup(MockVenue::new("mock", vec![btc()])).await;
    venue.fail_next_place(VenueError::business(-1013, "Filter failure: PRICE_FILTER"));
    let order = trader.make_order(dec!(99), dec!(0.01), Side::Buy, false, false, "bad", None).expect("accepted");
    assert!(order.wait_finished(Duration::from_secs(2)).await);
    let st = order.state();
    assert_eq!(st.status, OrderStatus::Rejected);
    assert!(st.fatal_error.as_deref().unwrap_or("").contains("-1013"));
    Ok(())
}

#[tokio::test]
async fn poll_only_reconciliation() -> anyhow::Result<()> {
    let (venue, _hub, trader) = setup(MockVenue::new("mock", vec![btc()])).await;
    venue.set_push(false);
    let deals = Arc::new(Deals::default());
    let order = trader
        .make_order(dec!(100.5), dec!(1), Side::Sell, false, false, "poll", Some(deals.clone() as Arc<dyn OrderObserver>))
        .expect("accepted");
    wait_created(&order).await;

    venue.fill(order.client_id(), dec!(0.4), dec!(100.5))?;
    order.poll().await?;
    assert_eq!(order.state().filled, dec!(0.4));
    // repeated polls of the same venue state add nothing
    order.poll().await?;
    assert_eq!(deals.total(), dec!(0.4));

    venue.fill(order.client_id(), dec!(0.6), dec!(100.5))?;
    assert!(order.wait_finished(Duration::from_secs(2)).await);
    assert_eq!(deals.total(), dec!(1));
    Ok(())
}

#[tokio::test]
async fn auto_fill_venue_completes_orders() -> anyhow::Result<()> {
    let (_venue, _hub, trader) =
        setup(MockVenue::new("mock", vec![btc()]).with_auto_fill(Duration::from_millis(30))).await;
    let deals = Arc::new(Deals::default());
    let order = trader
        .make_order(dec!(99.99), dec!(0.25), Side::Buy, false, false, "auto", Some(deals.clone() as Arc<dyn OrderObserver>))
        .expect("accepted");
    assert!(order.wait_finished(Duration::from_secs(2)).await);
    assert_eq!(order.state().status, OrderStatus::Filled);
    assert_eq!(deals.total(), dec!(0.25));
    Ok(())
}

#[tokio::test]
async fn local_checks_refuse_orders() -> anyhow::Result<()> {
    let (_venue, _hub, trader) = setup(MockVenue::new("mock", vec![btc()])).await;
    // below the lot minimum after flooring
    assert!(trader.make_order(dec!(99), dec!(0.00009), Side::Buy, false, false, "tiny", None).is_none());
    // far outside the 5% envelope around the bid
    assert!(trader.make_order(dec!(50), dec!(0.01), Side::Buy, false, false, "far", None).is_none());
    // sells are checked against the ask
    assert!(trader.make_order(dec!(200), dec!(0.01), Side::Sell, false, false, "far", None).is_none());
    assert!(trader.live_orders().is_empty());
    Ok(())
}
