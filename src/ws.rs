// ===============================
// src/ws.rs
// ===============================
//
// Single websocket carrier.
//
// Connecting -> Open -> Closing -> Closed, with automatic return to
// Connecting after any abnormal close. While Open there is exactly one
// reader task and one writer task:
// - writer: queued frames, ping when idle, subscription resends on ack timeout
// - reader: read timeout, ack matching, request replies, frame handler
//
// Subscriptions are replayed in insertion order after every reconnect and stay
// unhealthy until their ack predicate matches an incoming frame.
//
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{backoff_delay, lock, VenueError, VenueResult};
use crate::metrics::{WS_CONNECTED, WS_LAST_EVENT_TS, WS_RECONNECTS, WS_RESUBSCRIBES};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type FrameHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type AckPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Clone)]
pub struct Subscriber {
    pub key: String,
    pub subscribe_frame: String,
    pub unsubscribe_frame: Option<String>,
    pub ack: AckPredicate,
}

impl Subscriber {
    pub fn new(
        key: impl Into<String>,
        subscribe_frame: impl Into<String>,
        unsubscribe_frame: Option<String>,
        ack: AckPredicate,
    ) -> Self {
        Self { key: key.into(), subscribe_frame: subscribe_frame.into(), unsubscribe_frame, ack }
    }

    /// `{"method":"SUBSCRIBE","params":[stream],"id":id}`, acked by a frame
    /// carrying the same id and `"result":null`.
    pub fn json_stream(stream: &str, id: u64) -> Self {
        let sub = json!({ "method": "SUBSCRIBE", "params": [stream], "id": id }).to_string();
        let unsub = json!({ "method": "UNSUBSCRIBE", "params": [stream], "id": id }).to_string();
        Self::new(stream, sub, Some(unsub), Arc::new(move |frame: &str| is_result_ack(frame, id)))
    }
}

/// True for `{"result":null,"id":<id>}` style acks.
pub fn is_result_ack(frame: &str, id: u64) -> bool {
    match serde_json::from_str::<Value>(frame) {
        Ok(v) => v.get("id").and_then(Value::as_u64) == Some(id) && v.get("result").map_or(false, Value::is_null),
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    /// Metrics / log label.
    pub label: String,
    /// Ping after this much outbound silence.
    pub heartbeat: Duration,
    /// Reconnect after this much inbound silence.
    pub read_timeout: Duration,
    /// Resend a subscribe frame not acked within this.
    pub ack_timeout: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
            heartbeat: Duration::from_secs(20),
            read_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

struct SubEntry {
    sub: Subscriber,
    healthy: bool,
    sent_at: Option<Instant>,
}

struct Pending {
    id: u64,
    matches: AckPredicate,
    tx: oneshot::Sender<VenueResult<String>>,
}

struct Shared {
    cfg: WsConfig,
    url: Mutex<String>,
    handler: FrameHandler,
    subs: Mutex<Vec<SubEntry>>,
    pending: Mutex<Vec<Pending>>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    state_tx: watch::Sender<WsState>,
    shutdown_tx: watch::Sender<bool>,
    kill: Notify,
    closed: AtomicBool,
    next_pending: AtomicU64,
}

impl Shared {
    fn set_state(&self, s: WsState) {
        self.state_tx.send_replace(s);
    }

    fn state(&self) -> WsState {
        *self.state_tx.borrow()
    }

    fn queue(&self, msg: Message) -> bool {
        match lock(&self.out_tx).as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    async fn wait_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Session just opened: everything goes out again, nothing is healthy.
    fn replay_all(&self) {
        let frames: Vec<String> = {
            let mut subs = lock(&self.subs);
            let now = Instant::now();
            subs.iter_mut()
                .map(|e| {
                    e.healthy = false;
                    e.sent_at = Some(now);
                    e.sub.subscribe_frame.clone()
                })
                .collect()
        };
        if !frames.is_empty() {
            info!(conn = %self.cfg.label, count = frames.len(), "replaying subscriptions");
        }
        for f in frames {
            WS_RESUBSCRIBES.with_label_values(&[&self.cfg.label]).inc();
            self.queue(Message::Text(f));
        }
    }

    fn due_resends(&self) -> Vec<String> {
        let mut subs = lock(&self.subs);
        let now = Instant::now();
        let mut out = Vec::new();
        for e in subs.iter_mut().filter(|e| !e.healthy) {
            let due = match e.sent_at {
                Some(t) => now.duration_since(t) >= self.cfg.ack_timeout,
                None => true,
            };
            if due {
                warn!(conn = %self.cfg.label, key = %e.sub.key, "subscription not acked, resending");
                e.sent_at = Some(now);
                out.push(e.sub.subscribe_frame.clone());
            }
        }
        out
    }

    fn on_text(&self, text: &str) {
        let mut consumed = false;
        {
            let mut subs = lock(&self.subs);
            for e in subs.iter_mut().filter(|e| !e.healthy) {
                if (e.sub.ack)(text) {
                    e.healthy = true;
                    consumed = true;
                    debug!(conn = %self.cfg.label, key = %e.sub.key, "subscription acked");
                }
            }
        }
        let replies: Vec<Pending> = {
            let mut pending = lock(&self.pending);
            let (hit, keep): (Vec<Pending>, Vec<Pending>) =
                pending.drain(..).partition(|p| (p.matches)(text));
            *pending = keep;
            hit
        };
        for p in replies {
            consumed = true;
            let _ = p.tx.send(Ok(text.to_string()));
        }
        if !consumed {
            (self.handler)(text);
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<Pending> = lock(&self.pending).drain(..).collect();
        for p in drained {
            let _ = p.tx.send(Err(VenueError::ConnectionClosed));
        }
    }
}

pub struct WsConnection {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WsConnection {
    /// Spawn the supervisor; the first connect starts immediately.
    pub fn spawn(cfg: WsConfig, handler: FrameHandler) -> Self {
        let (state_tx, _) = watch::channel(WsState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            url: Mutex::new(cfg.url.clone()),
            cfg,
            handler,
            subs: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            out_tx: Mutex::new(None),
            state_tx,
            shutdown_tx,
            kill: Notify::new(),
            closed: AtomicBool::new(false),
            next_pending: AtomicU64::new(1),
        });
        let handle = tokio::spawn(supervise(shared.clone()));
        Self { shared, supervisor: Mutex::new(Some(handle)) }
    }

    pub fn label(&self) -> &str {
        &self.shared.cfg.label
    }

    pub fn state(&self) -> WsState {
        self.shared.state()
    }

    pub fn state_rx(&self) -> watch::Receiver<WsState> {
        self.shared.state_tx.subscribe()
    }

    /// Used on the next (re)connect.
    pub fn set_url(&self, url: impl Into<String>) {
        *lock(&self.shared.url) = url.into();
    }

    pub async fn wait_open(&self, within: Duration) -> bool {
        let mut rx = self.state_rx();
        let fut = async {
            loop {
                if *rx.borrow() == WsState::Open {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        timeout(within, fut).await.unwrap_or(false)
    }

    /// Register (or replace) a subscription. Sent now if the socket is open,
    /// otherwise on the next open.
    pub fn subscribe(&self, sub: Subscriber) {
        let open = self.state() == WsState::Open;
        let frame = sub.subscribe_frame.clone();
        {
            let mut subs = lock(&self.shared.subs);
            let entry = SubEntry { sub, healthy: false, sent_at: open.then(Instant::now) };
            match subs.iter_mut().find(|e| e.sub.key == entry.sub.key) {
                Some(existing) => *existing = entry,
                None => subs.push(entry),
            }
        }
        if open {
            self.shared.queue(Message::Text(frame));
        }
    }

    pub fn unsubscribe(&self, key: &str) {
        let removed = {
            let mut subs = lock(&self.shared.subs);
            subs.iter().position(|e| e.sub.key == key).map(|i| subs.remove(i))
        };
        if let Some(frame) = removed.and_then(|e| e.sub.unsubscribe_frame) {
            self.shared.queue(Message::Text(frame));
        }
    }

    /// Mark one subscription unhealthy and resend it.
    pub fn reset(&self, key: &str) {
        let frame = {
            let mut subs = lock(&self.shared.subs);
            subs.iter_mut().find(|e| e.sub.key == key).map(|e| {
                e.healthy = false;
                e.sent_at = Some(Instant::now());
                e.sub.subscribe_frame.clone()
            })
        };
        if let Some(f) = frame {
            info!(conn = %self.label(), key, "resubscribing");
            WS_RESUBSCRIBES.with_label_values(&[self.label()]).inc();
            self.shared.queue(Message::Text(f));
        }
    }

    pub fn healthy(&self, key: &str) -> bool {
        lock(&self.shared.subs).iter().any(|e| e.sub.key == key && e.healthy)
    }

    pub fn subscription_keys(&self) -> Vec<String> {
        lock(&self.shared.subs).iter().map(|e| e.sub.key.clone()).collect()
    }

    pub fn send(&self, text: impl Into<String>) -> VenueResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(VenueError::ConnectionClosed);
        }
        if self.shared.queue(Message::Text(text.into())) {
            Ok(())
        } else {
            Err(VenueError::NotReady(format!("{} not open", self.label())))
        }
    }

    /// Send `frame` and wait for the first incoming frame matching `matches`.
    pub async fn request(&self, frame: impl Into<String>, matches: AckPredicate, within: Duration) -> VenueResult<String> {
        let (tx, rx) = oneshot::channel();
        let id = self.shared.next_pending.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.pending).push(Pending { id, matches, tx });
        if let Err(e) = self.send(frame) {
            lock(&self.shared.pending).retain(|p| p.id != id);
            return Err(e);
        }
        match timeout(within, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(VenueError::ConnectionClosed),
            Err(_) => {
                lock(&self.shared.pending).retain(|p| p.id != id);
                Err(VenueError::Timeout(format!("{} request", self.label())))
            }
        }
    }

    /// Drop the current socket; the supervisor reconnects with backoff.
    pub fn force_reconnect(&self) {
        info!(conn = %self.label(), "forced reconnect");
        self.shared.kill.notify_waiters();
    }

    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.set_state(WsState::Closing);
        self.shared.queue(Message::Close(None));
        self.shared.shutdown_tx.send_replace(true);
        let handle = lock(&self.supervisor).take();
        if let Some(h) = handle {
            if timeout(Duration::from_secs(2), h).await.is_err() {
                warn!(conn = %self.label(), "supervisor did not stop in time");
            }
        }
        self.shared.fail_pending();
        self.shared.set_state(WsState::Closed);
        info!(conn = %self.label(), "websocket closed");
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.shutdown_tx.send_replace(true);
        self.shared.fail_pending();
        if let Some(h) = lock(&self.supervisor).take() {
            h.abort();
        }
    }
}

async fn supervise(shared: Arc<Shared>) {
    let label = shared.cfg.label.clone();
    let mut attempt: u32 = 0;
    while !shared.closed.load(Ordering::Acquire) {
        shared.set_state(WsState::Connecting);
        let url = lock(&shared.url).clone();
        info!(conn = %label, %url, "connecting websocket");

        let connected = tokio::select! {
            r = connect_async(url.as_str()) => Some(r),
            _ = shared.wait_shutdown() => None,
        };
        match connected {
            None => break,
            Some(Ok((ws, _resp))) => {
                attempt = 0;
                run_session(&shared, ws).await;
                info!(conn = %label, "websocket session ended");
            }
            Some(Err(e)) => warn!(conn = %label, ?e, "websocket connect failed"),
        }
        WS_CONNECTED.with_label_values(&[&label]).set(0);
        shared.fail_pending();
        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        attempt = attempt.saturating_add(1);
        WS_RECONNECTS.with_label_values(&[&label]).inc();
        let delay = backoff_delay(attempt);
        debug!(conn = %label, attempt, ?delay, "reconnect backoff");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shared.wait_shutdown() => break,
        }
    }
    shared.set_state(WsState::Closed);
}

async fn run_session(shared: &Arc<Shared>, ws: Socket) {
    let (sink, stream) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    *lock(&shared.out_tx) = Some(out_tx);
    shared.set_state(WsState::Open);
    WS_CONNECTED.with_label_values(&[&shared.cfg.label]).set(1);
    info!(conn = %shared.cfg.label, "websocket open");
    shared.replay_all();

    let mut writer = tokio::spawn(write_loop(shared.clone(), sink, out_rx));
    let mut reader = tokio::spawn(read_loop(shared.clone(), stream));
    tokio::select! {
        _ = &mut writer => {}
        _ = &mut reader => {}
        _ = shared.kill.notified() => {}
        _ = shared.wait_shutdown() => {
            // give the writer a moment to flush the close frame
            let _ = timeout(Duration::from_millis(500), &mut writer).await;
        }
    }
    *lock(&shared.out_tx) = None;
    writer.abort();
    reader.abort();
}

async fn write_loop(shared: Arc<Shared>, mut sink: SplitSink<Socket, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    let label = shared.cfg.label.clone();
    let period = (shared.cfg.heartbeat.min(shared.cfg.ack_timeout) / 2).max(Duration::from_millis(20));
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sent = Instant::now();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { return };
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    warn!(conn = %label, ?e, "websocket write failed");
                    return;
                }
                last_sent = Instant::now();
                if is_close {
                    return;
                }
            }
            _ = tick.tick() => {
                if last_sent.elapsed() >= shared.cfg.heartbeat {
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        warn!(conn = %label, ?e, "websocket ping failed");
                        return;
                    }
                    last_sent = Instant::now();
                }
                for frame in shared.due_resends() {
                    WS_RESUBSCRIBES.with_label_values(&[&label]).inc();
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        warn!(conn = %label, ?e, "websocket resend failed");
                        return;
                    }
                    last_sent = Instant::now();
                }
            }
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut stream: SplitStream<Socket>) {
    let label = shared.cfg.label.clone();
    loop {
        let next = match timeout(shared.cfg.read_timeout, stream.next()).await {
            Ok(n) => n,
            Err(_) => {
                warn!(conn = %label, timeout = ?shared.cfg.read_timeout, "websocket read timeout");
                return;
            }
        };
        let msg = match next {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                warn!(conn = %label, ?e, "websocket read error");
                return;
            }
            None => return,
        };
        WS_LAST_EVENT_TS.with_label_values(&[&label]).set(chrono::Utc::now().timestamp());
        match msg {
            Message::Text(t) => shared.on_text(&t),
            Message::Binary(b) => match String::from_utf8(b) {
                Ok(t) => shared.on_text(&t),
                Err(_) => debug!(conn = %label, "non-utf8 binary frame ignored"),
            },
            Message::Close(frame) => {
                info!(conn = %label, ?frame, "websocket close frame");
                return;
            }
            // pongs are answered by tungstenite on the next write
            _ => {}
        }
    }
}
