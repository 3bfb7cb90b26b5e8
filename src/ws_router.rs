// ===============================
// src/ws_router.rs
// ===============================
//
// Demultiplex combined-stream frames `{"stream": name, "data": {...}}` to
// typed per-stream handlers. Called from the socket reader, so delivery is
// ordered within a stream.
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap as HashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::lock;
use crate::metrics::WS_DROPPED_FRAMES;
use crate::ws::FrameHandler;

type Route = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub stream: String,
    id: u64,
}

pub struct WsStreamRouter {
    label: String,
    routes: Mutex<HashMap<String, Vec<(u64, Route)>>>,
    next_id: AtomicU64,
}

impl WsStreamRouter {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), routes: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    pub fn subscribe<T, F>(&self, stream: &str, handler: F) -> StreamHandle
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let route: Route = Arc::new(move |data: &Value| {
            let decoded = T::deserialize(data).map_err(|e| e.to_string())?;
            handler(decoded);
            Ok(())
        });
        lock(&self.routes).entry(stream.to_string()).or_default().push((id, route));
        StreamHandle { stream: stream.to_string(), id }
    }

    /// Returns true when the stream has no handlers left.
    pub fn unsubscribe(&self, handle: &StreamHandle) -> bool {
        let mut routes = lock(&self.routes);
        let Some(list) = routes.get_mut(&handle.stream) else { return true };
        list.retain(|(id, _)| *id != handle.id);
        if list.is_empty() {
            routes.remove(&handle.stream);
            true
        } else {
            false
        }
    }

    pub fn has_stream(&self, stream: &str) -> bool {
        lock(&self.routes).contains_key(stream)
    }

    /// Deliver one frame. Returns true when some handler accepted it.
    pub fn dispatch(&self, frame: &str) -> bool {
        let v: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!(conn = %self.label, ?e, "undecodable frame dropped");
                WS_DROPPED_FRAMES.with_label_values(&["decode"]).inc();
                return false;
            }
        };

        let (stream, data) = match (v.get("stream").and_then(Value::as_str), v.get("data")) {
            (Some(s), Some(d)) => (s, d),
            _ => {
                if v.get("id").is_some() && v.get("result").is_some() {
                    debug!(conn = %self.label, frame, "control frame");
                } else {
                    warn!(conn = %self.label, frame, "frame without stream dropped");
                    WS_DROPPED_FRAMES.with_label_values(&["unknown"]).inc();
                }
                return false;
            }
        };

        // copy under lock, call outside it
        let targets: Vec<Route> = match lock(&self.routes).get(stream) {
            Some(list) => list.iter().map(|(_, r)| r.clone()).collect(),
            None => Vec::new(),
        };
        if targets.is_empty() {
            warn!(conn = %self.label, stream, "no subscriber for stream, dropped");
            WS_DROPPED_FRAMES.with_label_values(&["no_route"]).inc();
            return false;
        }

        let mut delivered = false;
        for route in targets {
            match route(data) {
                Ok(()) => delivered = true,
                Err(e) => {
                    warn!(conn = %self.label, stream, error = %e, "payload decode failed, dropped");
                    WS_DROPPED_FRAMES.with_label_values(&["decode"]).inc();
                }
            }
        }
        delivered
    }

    /// Frame handler to hand to a `WsConnection`.
    pub fn handler(self: &Arc<Self>) -> FrameHandler {
        let router = Arc::clone(self);
        Arc::new(move |frame: &str| {
            router.dispatch(frame);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Deserialize)]
    struct Ticker {
        c: String,
    }

    #[test]
    fn routes_by_stream_name() {
        let router = WsStreamRouter::new("t");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let h = router.subscribe("btcusdt@ticker", move |t: Ticker| lock(&s).push(t.c));

        assert!(router.dispatch(r#"{"stream":"btcusdt@ticker","data":{"c":"1.5"}}"#));
        assert!(!router.dispatch(r#"{"stream":"ethusdt@ticker","data":{"c":"2"}}"#));
        assert!(!router.dispatch(r#"{"result":null,"id":1}"#));
        assert!(!router.dispatch(r#"{"stream":"btcusdt@ticker","data":{"x":1}}"#));
        assert_eq!(*lock(&seen), vec!["1.5".to_string()]);

        assert!(router.unsubscribe(&h));
        assert!(!router.has_stream("btcusdt@ticker"));
        assert!(!router.dispatch(r#"{"stream":"btcusdt@ticker","data":{"c":"1.6"}}"#));
    }

    #[test]
    fn multiple_handlers_per_stream() {
        let router = WsStreamRouter::new("t");
        let hits = Arc::new(AtomicUsize::new(0));
        let (a, b) = (hits.clone(), hits.clone());
        let h1 = router.subscribe("s", move |_: Value| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let _h2 = router.subscribe("s", move |_: Value| {
            b.fetch_add(1, Ordering::SeqCst);
        });
        router.dispatch(r#"{"stream":"s","data":{}}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!router.unsubscribe(&h1));
        router.dispatch(r#"{"stream":"s","data":{}}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
