// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("static metric definition")
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).expect("static metric definition")
}

// -------- Config (exported so dashboards can filter on it) --------
pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec("config_venue_mode", "active venue mode (value=1)", &["mode"])
});

// -------- Websocket health --------
pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec("ws_connected", "1 if the websocket is open, 0 otherwise", &["conn"])
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("ws_reconnects_total", "websocket reconnect attempts", &["conn"])
});

pub static WS_LAST_EVENT_TS: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec("ws_last_event_ts", "unix seconds of the last received frame", &["conn"])
});

pub static WS_RESUBSCRIBES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("ws_resubscribes_total", "subscribe frames re-sent", &["conn"])
});

pub static WS_DROPPED_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("ws_dropped_frames_total", "frames with no route or bad payload", &["reason"])
});

pub static LISTEN_KEEPALIVE_OK: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("listenkey_keepalive_ok_total", "successful listenKey keepalive calls", &["venue"])
});

pub static LISTEN_KEEPALIVE_ERR: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("listenkey_keepalive_err_total", "failed listenKey keepalive calls", &["venue"])
});

// -------- REST / gateway --------
pub static REST_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("rest_calls_total", "REST round-trips by outcome", &["venue", "outcome"])
});

pub static GATEWAY_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("gateway_connected", "1 if the broker gateway session is ready")
        .expect("static metric definition")
});

pub static GATEWAY_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("gateway_reconnects_total", "broker gateway reconnects by reason", &["reason"])
});

pub static CLOCK_SKEW_MS: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec("clock_skew_ms", "venue clock skew in milliseconds", &["venue"])
});

// -------- Orders & balances --------
pub static DEALS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("deals_total", "deals derived by reconciliation", &["instrument"])
});

pub static ORDERS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("orders_created_total", "orders submitted", &["instrument"])
});

pub static ORDERS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("orders_finished_total", "orders reaching a terminal status", &["status"])
});

pub static BALANCE_PITCH: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec("balance_pitch_micros", "last balance pitch (1e-6 units)", &["ccy"])
});

pub static PITCH_ALERTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("balance_pitch_alerts_total", "pitch above tolerance", &["ccy"])
});

// -------- Series cache --------
pub static SERIES_CHUNKS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("series_chunks_total", "series cache chunk lookups", &["kind", "outcome"])
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(CONFIG_VENUE_MODE.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_LAST_EVENT_TS.clone())),
        REGISTRY.register(Box::new(WS_RESUBSCRIBES.clone())),
        REGISTRY.register(Box::new(WS_DROPPED_FRAMES.clone())),
        REGISTRY.register(Box::new(LISTEN_KEEPALIVE_OK.clone())),
        REGISTRY.register(Box::new(LISTEN_KEEPALIVE_ERR.clone())),
        REGISTRY.register(Box::new(REST_CALLS.clone())),
        REGISTRY.register(Box::new(GATEWAY_CONNECTED.clone())),
        REGISTRY.register(Box::new(GATEWAY_RECONNECTS.clone())),
        REGISTRY.register(Box::new(CLOCK_SKEW_MS.clone())),
        REGISTRY.register(Box::new(DEALS.clone())),
        REGISTRY.register(Box::new(ORDERS_CREATED.clone())),
        REGISTRY.register(Box::new(ORDERS_FINISHED.clone())),
        REGISTRY.register(Box::new(BALANCE_PITCH.clone())),
        REGISTRY.register(Box::new(PITCH_ALERTS.clone())),
        REGISTRY.register(Box::new(SERIES_CHUNKS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(resp.unwrap_or_else(|_| Response::new(Body::empty())))
}

// Serve GET / and /metrics until the process exits
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!("metrics listening on http://{addr}/ (and /metrics)");
    if let Err(e) = server.await {
        error!(?e, "metrics server exited");
    }
}
