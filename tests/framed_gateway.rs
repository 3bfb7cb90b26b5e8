// ===============================
// tests/framed_gateway.rs
// ===============================
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use dma_venue_core::clock::Clock;
use dma_venue_core::domain::{now_ms, OrderStatus, Side};
use dma_venue_core::error::ErrorReporter;
use dma_venue_core::gateway_broker::BrokerVenue;
use dma_venue_core::gateway_tcp::{
    tick, ContractDetails, FramedTcpClient, GatewayConfig, GatewayContract, GatewayMessage, HistoricalBar, OrderStatusMsg,
};
use dma_venue_core::hub::{HubConfig, VenueApi, VenueHub};
use dma_venue_core::series::SeriesSource;
use dma_venue_core::trader::TraderConfig;
use dma_venue_core::wire::{split_fields, take_frame, FieldWriter};

const EPOCH_2024: i64 = 1_704_067_200;

async fn read_frame(sock: &mut TcpStream, buf: &mut Vec<u8>) -> anyhow::Result<Vec<u8>> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(f) = take_frame(buf)? {
            return Ok(f);
        }
        let n = sock.read(&mut chunk).await?;
        anyhow::ensure!(n > 0, "client went away");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn aapl_details(req_id: i64) -> ContractDetails {
    ContractDetails {
        contract: GatewayContract {
            con_id: Some(265598),
            symbol: "AAPL".into(),
            sec_type: "STK".into(),
            exchange: "NASDAQ".into(),
            currency: "USD".into(),
        },
        market_name: "NMS".into(),
        min_tick: dec!(0.0001),
        long_name: format!("APPLE INC ({req_id})"),
        time_zone_id: "US/Eastern".into(),
        trading_hours: String::new(),
        liquid_hours: String::new(),
        market_rule_ids: "26".into(),
        min_size: Some(dec!(1)),
        size_increment: Some(dec!(1)),
    }
}

fn status(order_id: i64, st: &str, filled: Decimal, remaining: Decimal, px: Decimal) -> GatewayMessage {
    GatewayMessage::OrderStatus(OrderStatusMsg {
        order_id,
        status: st.into(),
        filled,
        remaining,
        avg_fill_price: if filled > Decimal::ZERO { px } else { Decimal::ZERO },
        perm_id: 9000 + order_id,
        parent_id: 0,
        last_fill_price: (filled > Decimal::ZERO).then_some(px),
        client_id: 1,
        why_held: String::new(),
    })
}

/// Replies of a scripted gateway to one request frame.
fn respond(f: &[String]) -> Vec<GatewayMessage> {
    let int = |i: usize| f.get(i).and_then(|s| s.parse::<i64>().ok()).unwrap_or_default();
    let dec_at = |i: usize| f.get(i).and_then(|s| s.parse::<Decimal>().ok()).unwrap_or_default();
    match int(0) {
        // START_API
        71 => vec![GatewayMessage::NextValidId(100), GatewayMessage::ManagedAccounts(vec!["DU123".into()])],
        // REQ_CURRENT_TIME
        49 => vec![GatewayMessage::CurrentTime(EPOCH_2024)],
        // REQ_CONTRACT_DATA: [9, 8, req_id, con_id, symbol, ...]
        9 => {
            let req_id = int(2);
            if f.get(4).map(String::as_str) == Some("AAPL") {
                vec![
                    GatewayMessage::ContractData { req_id, details: aapl_details(req_id) },
                    GatewayMessage::ContractDataEnd { req_id },
                ]
            } else {
                vec![GatewayMessage::Error { req_id, code: 200, msg: "No security definition has been found".into() }]
            }
        }
        // REQ_HISTORICAL_DATA: [20, req_id, ...]; 1 min bars out of order, one off-grid
        20 => {
            let bar = |t: i64, c: f64| HistoricalBar {
                date: t.to_string(),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 1000.0,
            };
            vec![GatewayMessage::HistoricalData {
                req_id: int(1),
                bars: vec![bar(EPOCH_2024 + 60, 190.0), bar(EPOCH_2024, 189.0), bar(EPOCH_2024 + 90, 1.0), bar(EPOCH_2024 + 120, 191.0)],
            }]
        }
        // REQ_MARKET_RULE
        91 => vec![GatewayMessage::MarketRule { id: int(1), increments: vec![(dec!(0), dec!(0.01))] }],
        // REQ_OPEN_ORDERS
        5 => vec![GatewayMessage::OpenOrderEnd],
        // REQ_ACCT_DATA
        6 => vec![GatewayMessage::AccountValue {
            key: "CashBalance".into(),
            value: "25000".into(),
            currency: "USD".into(),
            account: "DU123".into(),
        }],
        // REQ_MKT_DATA: [1, 11, req_id, ...]
        1 => {
            let req_id = int(2);
            vec![
                GatewayMessage::TickPrice { req_id, tick_type: tick::BID, price: Some(dec!(189.5)), size: Some(dec!(300)) },
                GatewayMessage::TickPrice { req_id, tick_type: tick::ASK, price: Some(dec!(189.6)), size: Some(dec!(200)) },
                GatewayMessage::TickPrice { req_id, tick_type: tick::LAST, price: Some(dec!(189.55)), size: Some(dec!(5)) },
            ]
        }
        // PLACE_ORDER: [3, order_id, contract x5, action, qty, type, lmt, ...]; marketable buys fill
        3 => {
            let (order_id, qty, lmt) = (int(1), dec_at(8), dec_at(10));
            let mut out = vec![status(order_id, "Submitted", dec!(0), qty, lmt)];
            if f.get(7).map(String::as_str) == Some("BUY") && lmt >= dec!(189.6) {
                out.push(status(order_id, "Filled", qty, dec!(0), dec!(189.6)));
            }
            out
        }
        // CANCEL_ORDER: [4, 1, order_id]
        4 => vec![GatewayMessage::Error { req_id: int(2), code: 202, msg: "Order Canceled - reason:".into() }],
        // REQ_POSITIONS: this gateway answers with a session-ending code
        61 => vec![GatewayMessage::Error { req_id: -1, code: 1300, msg: "socket port has been reset".into() }],
        _ => vec![],
    }
}

/// One accepted connection: handshake, then scripted replies.
async fn session(mut sock: TcpStream, seen: mpsc::UnboundedSender<Vec<String>>) -> anyhow::Result<()> {
    let mut prefix = [0u8; 4];
    sock.read_exact(&mut prefix).await?;
    anyhow::ensure!(&prefix == b"API\0", "bad prefix");
    let mut buf = Vec::new();
    let version = read_frame(&mut sock, &mut buf).await?;
    anyhow::ensure!(version.starts_with(b"v"), "bad version range");

    let mut hello = FieldWriter::new();
    hello.push_int(176).push_str("20240101 00:00:00 UTC");
    sock.write_all(&hello.finish()?).await?;

    loop {
        let payload = read_frame(&mut sock, &mut buf).await?;
        let fields = split_fields(&payload);
        let replies = respond(&fields);
        let _ = seen.send(fields);
        for m in replies {
            sock.write_all(&m.encode().finish()?).await?;
        }
    }
}

struct FakeGateway {
    port: u16,
    seen: mpsc::UnboundedReceiver<Vec<String>>,
    accepted: Arc<AtomicUsize>,
}

impl FakeGateway {
    async fn spawn() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let (tx, seen) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let count = accepted.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(session(sock, tx.clone()));
            }
        });
        Ok(Self { port, seen, accepted })
    }

    fn config(&self) -> GatewayConfig {
        GatewayConfig {
            address: "127.0.0.1".into(),
            port: self.port,
            client_id: 7,
            request_timeout: Duration::from_secs(2),
            reconnect_backoff: Duration::from_millis(50),
            ..GatewayConfig::default()
        }
    }

    fn drain(&mut self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        while let Ok(f) = self.seen.try_recv() {
            out.push(f);
        }
        out
    }
}

fn aapl() -> GatewayContract {
    GatewayContract { con_id: None, symbol: "AAPL".into(), sec_type: "STK".into(), exchange: "SMART".into(), currency: "USD".into() }
}

#[tokio::test]
async fn handshake_then_request_reply() -> anyhow::Result<()> {
    let mut gw = FakeGateway::spawn().await?;
    let client = FramedTcpClient::new(gw.config());

    // requests before the session is up are refused locally
    assert!(client.current_time().await.is_err());

    client.start();
    assert!(client.wait_ready(Duration::from_secs(5)).await);
    assert_eq!(client.server_version(), 176);
    assert_eq!(client.accounts(), vec!["DU123".to_string()]);
    assert_eq!(client.next_order_id(), 100);
    assert_eq!(client.next_order_id(), 101);

    assert_eq!(client.current_time().await?, EPOCH_2024);

    let details = client.contract_details(&aapl()).await?;
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].contract.con_id, Some(265598));
    assert_eq!(client.market_rule(26).await?, vec![(dec!(0), dec!(0.01))]);

    let missing = GatewayContract { symbol: "NOPE".into(), ..aapl() };
    let err = client.contract_details(&missing).await.unwrap_err();
    assert_eq!(err.code(), Some(200));

    let frames = gw.drain();
    let start = frames.first().expect("start api sent");
    assert_eq!(start[0], "71");
    assert_eq!(start[2], "7");

    client.close().await;
    assert!(!client.is_ready());
    assert!(client.current_time().await.is_err());
    Ok(())
}

#[tokio::test]
async fn fatal_codes_and_forced_drops_reconnect() -> anyhow::Result<()> {
    let gw = FakeGateway::spawn().await?;
    let client = Arc::new(FramedTcpClient::new(gw.config()));
    let connects = Arc::new(AtomicUsize::new(0));
    let c = connects.clone();
    client.on_connect(Arc::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
    }));

    client.start();
    assert!(client.wait_ready(Duration::from_secs(5)).await);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    async fn wait_connects(n: usize, connects: &AtomicUsize, client: &FramedTcpClient) {
        for _ in 0..200 {
            if connects.load(Ordering::SeqCst) >= n && client.is_ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reconnected ({} connects)", connects.load(Ordering::SeqCst));
    }

    // the gateway answers with a session-ending code
    client.request_positions().await?;
    wait_connects(2, &connects, &client).await;

    client.force_reconnect();
    wait_connects(3, &connects, &client).await;
    assert_eq!(gw.accepted.load(Ordering::SeqCst), 3);
    assert_eq!(client.current_time().await?, EPOCH_2024);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn broker_venue_trades_through_the_hub() -> anyhow::Result<()> {
    let gw = FakeGateway::spawn().await?;
    let client = Arc::new(FramedTcpClient::new(gw.config()));
    let venue = Arc::new(BrokerVenue::new("broker", client, vec![aapl()], "DAY"));
    let hub = VenueHub::new(
        venue,
        Arc::new(Clock::new("broker", 0, false)),
        Arc::new(ErrorReporter::default()),
        None,
        HubConfig::default(),
    );
    hub.start().await?;

    let inst = hub.registry().get("AAPLUSD-STK").expect("catalog entry");
    // the market rule wins over the contract's min tick
    assert_eq!(inst.tick_size, dec!(0.01));
    assert_eq!(inst.lot_size, dec!(1));
    assert_eq!(hub.ledger().snapshot("USD").map(|b| b.rights), Some(dec!(25000)));

    let trader = hub.trader(&inst.id, TraderConfig::default()).await?;
    let mut ready = false;
    for _ in 0..60 {
        if trader.readiness(now_ms()).is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(ready, "market never became ready: {:?}", trader.readiness(now_ms()));
    assert_eq!(trader.market().best_bid_ask(), (Some(dec!(189.5)), Some(dec!(189.6))));

    let taker = trader.make_order(dec!(189.6), dec!(10), Side::Buy, false, false, "take", None).expect("accepted");
    assert!(taker.wait_finished(Duration::from_secs(3)).await);
    let st = taker.state();
    assert_eq!(st.status, OrderStatus::Filled);
    assert_eq!(st.filled, dec!(10));

    let maker = trader.make_order(dec!(185), dec!(5), Side::Buy, false, false, "rest", None).expect("accepted");
    for _ in 0..100 {
        if maker.state().created {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    maker.cancel().await?;
    assert!(maker.wait_finished(Duration::from_secs(3)).await);
    assert_eq!(maker.state().status, OrderStatus::Canceled);
    assert!(maker.state().fatal_error.is_none());

    hub.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn historical_bars_feed_the_series_source() -> anyhow::Result<()> {
    let gw = FakeGateway::spawn().await?;
    let client = Arc::new(FramedTcpClient::new(gw.config()));
    let venue = BrokerVenue::new("broker", client, vec![aapl()], "DAY");
    assert_eq!(venue.load_instruments().await?.len(), 1);

    let t0 = EPOCH_2024 * 1000;
    let bars = venue.fetch_page("AAPL", Some("1m"), t0, t0 + 3 * 60_000).await?;
    let times: Vec<i64> = bars.iter().map(|k| k.open_time).collect();
    // sorted, off-grid and out-of-range bars dropped
    assert_eq!(times, vec![t0, t0 + 60_000, t0 + 120_000]);
    assert_eq!(bars[1].close, 190.0);

    assert!(venue.fetch_page("AAPL", Some("7x"), t0, t0 + 60_000).await.is_err());
    venue.stop().await;
    Ok(())
}
