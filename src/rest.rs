// ===============================
// src/rest.rs
// ===============================
//
// One typed REST round-trip:
// - attaches cookies from the process-wide jar (set from outside)
// - copies rate-limit headers into the process-wide status map
// - normalizes errors into transport / decode / business
// - never retries; callers own the retry policy
//
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{lock, ErrorReporter, VenueError, VenueResult};
use crate::metrics::REST_CALLS;

// host -> cookie header value
static COOKIE_JAR: Lazy<Mutex<HashMap<String, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

// venue -> (header -> last value)
static RATE_LIMITS: Lazy<Mutex<HashMap<String, HashMap<String, String>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Install the cookie string sent to `host` on every later call.
pub fn set_cookies(host: &str, cookie: &str) {
    lock(&COOKIE_JAR).insert(host.to_ascii_lowercase(), cookie.to_string());
}

pub fn clear_cookies() {
    lock(&COOKIE_JAR).clear();
}

fn cookies_for(host: &str) -> Option<String> {
    lock(&COOKIE_JAR).get(&host.to_ascii_lowercase()).cloned()
}

/// Last value a venue returned for a rate-limit header (lower-case name).
pub fn rate_limit_status(venue: &str, header: &str) -> Option<String> {
    lock(&RATE_LIMITS)
        .get(venue)
        .and_then(|m| m.get(&header.to_ascii_lowercase()).cloned())
}

/// Same as [`rate_limit_status`] parsed as an integer counter.
pub fn rate_limit_used(venue: &str, header: &str) -> Option<u64> {
    rate_limit_status(venue, header).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub url: String,
    pub query: Option<String>,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RestRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), query: None, body: None, headers: Vec::new() }
    }
    pub fn get(url: impl Into<String>) -> Self { Self::new(Method::GET, url) }
    pub fn post(url: impl Into<String>) -> Self { Self::new(Method::POST, url) }
    pub fn put(url: impl Into<String>) -> Self { Self::new(Method::PUT, url) }
    pub fn delete(url: impl Into<String>) -> Self { Self::new(Method::DELETE, url) }

    pub fn query(mut self, q: impl Into<String>) -> Self {
        let q = q.into();
        if !q.is_empty() {
            self.query = Some(q);
        }
        self
    }

    pub fn json_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    fn full_url(&self) -> String {
        match &self.query {
            Some(q) if self.url.contains('?') => format!("{}&{}", self.url, q),
            Some(q) => format!("{}?{}", self.url, q),
            None => self.url.clone(),
        }
    }
}

/// Extra response inspection: `(status, headers, body)`; returning an error
/// fails the call with it.
pub type PostProcessor = Arc<dyn Fn(u16, &HeaderMap, &str) -> Option<VenueError> + Send + Sync>;

/// Detect an embedded `{code, msg}` error envelope. Codes 0 and 200 mean OK.
pub fn error_envelope(body: &str) -> Option<VenueError> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    let obj = v.as_object()?;
    let code = obj.get("code")?.as_i64()?;
    if code == 0 || code == 200 {
        return None;
    }
    let msg = obj.get("msg").or_else(|| obj.get("message"))?.as_str()?;
    Some(VenueError::business(code, msg))
}

pub struct RestCaller {
    venue: String,
    http: reqwest::Client,
    rate_limit_prefixes: Vec<String>,
    post_processor: Option<PostProcessor>,
    reporter: Arc<ErrorReporter>,
}

impl RestCaller {
    pub fn new(venue: impl Into<String>, timeout: Duration, reporter: Arc<ErrorReporter>) -> VenueResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VenueError::Transport(format!("http client: {e}")))?;
        Ok(Self {
            venue: venue.into(),
            http,
            rate_limit_prefixes: Vec::new(),
            post_processor: None,
            reporter,
        })
    }

    pub fn with_rate_limit_headers(mut self, prefixes: &[&str]) -> Self {
        self.rate_limit_prefixes = prefixes.iter().map(|p| p.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_post_processor(mut self, p: PostProcessor) -> Self {
        self.post_processor = Some(p);
        self
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    /// Decode the response body into `T`.
    pub async fn call<T: DeserializeOwned>(&self, req: RestRequest) -> VenueResult<T> {
        let context = format!("{} {}", req.method, req.url);
        let body = self.call_raw(req).await?;
        serde_json::from_str::<T>(&body).map_err(|e| {
            REST_CALLS.with_label_values(&[&self.venue, "decode"]).inc();
            debug!(venue = %self.venue, %context, body = %truncate(&body, 256), "rest decode failed");
            VenueError::Decode(format!("{context}: {e}"))
        })
    }

    /// Body text of a successful call.
    pub async fn call_raw(&self, req: RestRequest) -> VenueResult<String> {
        let context = format!("{} {}", req.method, req.url);
        let url = req.full_url();
        let mut builder = self.http.request(req.method.clone(), &url);
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(cookie) = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .and_then(|h| cookies_for(&h))
        {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
        if let Some(body) = req.body {
            builder = builder.header(reqwest::header::CONTENT_TYPE, "application/json").body(body);
        }

        let resp = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                REST_CALLS.with_label_values(&[&self.venue, "transport"]).inc();
                let err = VenueError::from(e);
                self.reporter.report(&context, &err);
                return Err(err);
            }
        };

        let status = resp.status();
        self.record_rate_limits(resp.headers());
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(|e| {
            REST_CALLS.with_label_values(&[&self.venue, "transport"]).inc();
            VenueError::from(e)
        })?;

        let mut failure = error_envelope(&body);
        if failure.is_none() {
            if let Some(p) = &self.post_processor {
                failure = p(status.as_u16(), &headers, &body);
            }
        }
        if failure.is_none() && !status.is_success() {
            failure = Some(VenueError::Transport(format!("http {}: {}", status.as_u16(), truncate(&body, 200))));
        }

        match failure {
            Some(err) => {
                let outcome = if err.is_business() { "business" } else { "transport" };
                REST_CALLS.with_label_values(&[&self.venue, outcome]).inc();
                self.reporter.report(&context, &err);
                Err(err)
            }
            None => {
                REST_CALLS.with_label_values(&[&self.venue, "ok"]).inc();
                Ok(body)
            }
        }
    }

    fn record_rate_limits(&self, headers: &HeaderMap) {
        if self.rate_limit_prefixes.is_empty() {
            return;
        }
        let mut seen = Vec::new();
        for (name, value) in headers {
            let n = name.as_str();
            if self.rate_limit_prefixes.iter().any(|p| n.starts_with(p.as_str())) {
                if let Ok(v) = value.to_str() {
                    seen.push((n.to_string(), v.to_string()));
                }
            }
        }
        if seen.is_empty() {
            return;
        }
        let mut map = lock(&RATE_LIMITS);
        let entry = map.entry(self.venue.clone()).or_default();
        for (k, v) in seen {
            entry.insert(k, v);
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_detection() {
        assert_eq!(
            error_envelope(r#"{"code":-2011,"msg":"Unknown order sent."}"#),
            Some(VenueError::business(-2011, "Unknown order sent."))
        );
        assert_eq!(error_envelope(r#"{"code":0,"msg":"ok","data":[]}"#), None);
        assert_eq!(error_envelope(r#"{"code":200,"msg":"success"}"#), None);
        assert_eq!(error_envelope(r#"[[1,"2"]]"#), None);
        assert_eq!(error_envelope(r#"{"serverTime":1}"#), None);
        assert_eq!(error_envelope("not json"), None);
    }

    #[test]
    fn query_is_appended() {
        let r = RestRequest::get("http://h/api").query("a=1");
        assert_eq!(r.full_url(), "http://h/api?a=1");
        let r = RestRequest::get("http://h/api?x=2").query("a=1");
        assert_eq!(r.full_url(), "http://h/api?x=2&a=1");
        let r = RestRequest::get("http://h/api").query("");
        assert_eq!(r.full_url(), "http://h/api");
    }

    #[test]
    fn cookie_jar_is_case_insensitive_on_host() {
        set_cookies("Api.Example.COM", "sid=1");
        assert_eq!(cookies_for("api.example.com").as_deref(), Some("sid=1"));
    }
}
