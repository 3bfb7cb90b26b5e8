// ===============================
// tests/ws_reconnect.rs
// ===============================
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use dma_venue_core::error::VenueError;
use dma_venue_core::ws::{Subscriber, WsConfig, WsConnection, WsState};

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> anyhow::Result<Value> {
    let text = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await?.expect("handler alive");
    Ok(serde_json::from_str(&text)?)
}

#[tokio::test]
async fn subscriptions_replay_after_server_drop() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        for round in 0..2 {
            let Ok((tcp, _)) = listener.accept().await else { return };
            let Ok(mut ws) = accept_async(tcp).await else { return };
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(t) = msg else { continue };
                let _ = seen_tx.send(t.clone());
                let v: Value = serde_json::from_str(&t).unwrap_or_default();
                if v["method"] == "SUBSCRIBE" {
                    let _ = ws.send(Message::Text(json!({ "result": null, "id": v["id"] }).to_string())).await;
                    let data = json!({ "stream": "btcusdt@ticker", "data": { "round": round } });
                    let _ = ws.send(Message::Text(data.to_string())).await;
                    if round == 0 {
                        // vanish without a close handshake
                        break;
                    }
                }
            }
        }
    });

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
    let conn = WsConnection::spawn(
        WsConfig::new(format!("ws://{addr}"), "test"),
        Arc::new(move |text: &str| {
            let _ = frames_tx.send(text.to_string());
        }),
    );
    conn.subscribe(Subscriber::json_stream("btcusdt@ticker", 1));

    // acks are consumed; only stream data reaches the handler
    let first = next_frame(&mut frames_rx).await?;
    assert_eq!(first["data"]["round"], 0);
    let second = next_frame(&mut frames_rx).await?;
    assert_eq!(second["data"]["round"], 1);

    assert!(conn.wait_open(Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conn.healthy("btcusdt@ticker"));

    let mut subscribes = 0;
    while let Ok(t) = seen_rx.try_recv() {
        if t.contains("SUBSCRIBE") {
            subscribes += 1;
        }
    }
    assert_eq!(subscribes, 2);

    conn.close().await;
    assert_eq!(conn.state(), WsState::Closed);
    Ok(())
}

#[tokio::test]
async fn requests_match_replies_and_close_is_final() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((tcp, _)) = listener.accept().await else { return };
        let Ok(mut ws) = accept_async(tcp).await else { return };
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(t) = msg else { continue };
            let v: Value = serde_json::from_str(&t).unwrap_or_default();
            // unrelated traffic first, then the reply
            let _ = ws.send(Message::Text(json!({ "e": "noise" }).to_string())).await;
            let _ = ws.send(Message::Text(json!({ "result": ["a@ticker"], "id": v["id"] }).to_string())).await;
        }
    });

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
    let conn = WsConnection::spawn(
        WsConfig::new(format!("ws://{addr}"), "req"),
        Arc::new(move |text: &str| {
            let _ = frames_tx.send(text.to_string());
        }),
    );
    assert!(conn.wait_open(Duration::from_secs(5)).await);

    let reply = conn
        .request(
            json!({ "method": "LIST_SUBSCRIPTIONS", "id": 7 }).to_string(),
            Arc::new(|t: &str| t.contains("\"id\":7")),
            Duration::from_secs(2),
        )
        .await?;
    let v: Value = serde_json::from_str(&reply)?;
    assert_eq!(v["result"][0], "a@ticker");
    assert_eq!(next_frame(&mut frames_rx).await?["e"], "noise");

    conn.close().await;
    assert_eq!(conn.state(), WsState::Closed);
    assert!(matches!(conn.send("{}"), Err(VenueError::ConnectionClosed)));
    Ok(())
}
