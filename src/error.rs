// ===============================
// src/error.rs
// ===============================
//
// One error type for every venue-facing call, plus the operator-facing
// reporter (external alert callback + repeated-error suppression).
//
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

pub type VenueResult<T> = Result<T, VenueError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VenueError {
    /// Socket, DNS, TLS, or HTTP non-2xx without an error envelope.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    /// The venue answered with a non-OK business code.
    #[error("venue error {code}: {msg}")]
    Business { code: i64, msg: String },
    #[error("protocol fatal: {0}")]
    ProtocolFatal(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("clock not initialized")]
    ClockNotInitialized,
    #[error("signer not configured")]
    NotConfigured,
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Decode,
    VenueBusiness,
    ProtocolFatal,
    Timeout,
    ClockNotInitialized,
    Local,
}

impl VenueError {
    pub fn business(code: i64, msg: impl Into<String>) -> Self {
        VenueError::Business { code, msg: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VenueError::Transport(_) | VenueError::ConnectionClosed => ErrorKind::Transport,
            VenueError::Decode(_) => ErrorKind::Decode,
            VenueError::Business { .. } => ErrorKind::VenueBusiness,
            VenueError::ProtocolFatal(_) => ErrorKind::ProtocolFatal,
            VenueError::Timeout(_) => ErrorKind::Timeout,
            VenueError::ClockNotInitialized => ErrorKind::ClockNotInitialized,
            VenueError::NotConfigured | VenueError::NotReady(_) | VenueError::InvalidRequest(_) => {
                ErrorKind::Local
            }
        }
    }

    pub fn is_business(&self) -> bool {
        matches!(self, VenueError::Business { .. })
    }

    /// Errors the caller should simply retry on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::ProtocolFatal
        )
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            VenueError::Business { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for VenueError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            VenueError::Decode(e.to_string())
        } else if e.is_timeout() {
            VenueError::Timeout(e.to_string())
        } else {
            VenueError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for VenueError {
    fn from(e: serde_json::Error) -> Self {
        VenueError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for VenueError {
    fn from(e: std::io::Error) -> Self {
        VenueError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VenueError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsErr;
        match e {
            WsErr::ConnectionClosed | WsErr::AlreadyClosed => VenueError::ConnectionClosed,
            other => VenueError::Transport(other.to_string()),
        }
    }
}

pub type ErrorCallback = Arc<dyn Fn(&str, &VenueError) + Send + Sync>;

struct Burst {
    window_start: Instant,
    count: u32,
}

/// Routes venue business errors to an operator callback and keeps logs quiet
/// when the same error repeats: a key is logged at most `burst` times per
/// `window`, the rest are counted and summarised when the window rolls.
pub struct ErrorReporter {
    callback: Mutex<Option<ErrorCallback>>,
    window: Duration,
    burst: u32,
    seen: Mutex<HashMap<String, Burst>>,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 5)
    }
}

impl ErrorReporter {
    pub fn new(window: Duration, burst: u32) -> Self {
        Self {
            callback: Mutex::new(None),
            window,
            burst,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_callback(&self, cb: ErrorCallback) {
        *lock(&self.callback) = Some(cb);
    }

    /// Report an error seen at `context`. Returns true when it was logged.
    pub fn report(&self, context: &str, err: &VenueError) -> bool {
        if err.is_business() {
            let cb = lock(&self.callback).clone();
            if let Some(cb) = cb {
                cb(context, err);
            }
        }

        let key = match err {
            VenueError::Business { code, .. } => format!("{context}:{code}"),
            other => format!("{context}:{:?}", other.kind()),
        };
        let now = Instant::now();
        let mut seen = lock(&self.seen);
        let entry = seen.entry(key).or_insert(Burst { window_start: now, count: 0 });
        if now.duration_since(entry.window_start) > self.window {
            if entry.count > self.burst {
                warn!(
                    context,
                    suppressed = entry.count - self.burst,
                    "repeated venue errors suppressed in last window"
                );
            }
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count += 1;
        if entry.count <= self.burst {
            warn!(context, error = %err, "venue error");
            true
        } else {
            debug!(context, error = %err, "venue error (suppressed)");
            false
        }
    }
}

/// Exponential backoff + jitter: 0.5s doubling up to 32s, plus 0..=250ms.
/// `attempt` counts failures so far (1 = first retry).
pub fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let shift = attempt.saturating_sub(1).min(6); // 0..=6
    let factor = 1u64 << shift; // 1,2,4,...,64
    let base_ms = 500u64.saturating_mul(factor); // 0.5s..32s
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(base_ms + jitter)
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callback_sees_every_business_error_but_logs_are_capped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let reporter = ErrorReporter::new(Duration::from_secs(300), 5);
        let h = hits.clone();
        reporter.set_callback(Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let err = VenueError::business(-2010, "insufficient balance");
        let logged: Vec<bool> = (0..8).map(|_| reporter.report("place", &err)).collect();

        assert_eq!(hits.load(Ordering::SeqCst), 8);
        assert_eq!(logged.iter().filter(|x| **x).count(), 5);
        assert!(!logged[5]);
    }

    #[test]
    fn transport_errors_do_not_reach_operator_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let reporter = ErrorReporter::default();
        let h = hits.clone();
        reporter.set_callback(Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        reporter.report("poll", &VenueError::Transport("reset".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let ms = |a| backoff_delay(a).as_millis() as u64;
        assert!((500..=750).contains(&ms(1)));
        assert!((1_000..=1_250).contains(&ms(2)));
        assert!((32_000..=32_250).contains(&ms(7)));
        assert!((32_000..=32_250).contains(&ms(40)));
    }

    #[test]
    fn kinds_drive_retry_policy() {
        assert!(VenueError::Transport("x".into()).is_retryable());
        assert!(VenueError::Timeout("x".into()).is_retryable());
        assert!(!VenueError::business(1, "x").is_retryable());
        assert_eq!(VenueError::business(-2011, "x").code(), Some(-2011));
    }
}
