// ===============================
// src/signer.rs
// ===============================
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::clock::Clock;
use crate::error::{VenueError, VenueResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("api_key", &self.api_key).finish_non_exhaustive()
    }
}

pub fn hmac_sha256_hex(secret: &str, payload: &str) -> VenueResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| VenueError::InvalidRequest(format!("hmac key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn encode_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC query signer with API-key header injection.
pub struct Signer {
    creds: Option<Credentials>,
    clock: Arc<Clock>,
    recv_window: u64,
    key_header: &'static str,
}

impl Signer {
    pub fn new(creds: Option<Credentials>, clock: Arc<Clock>, recv_window: u64) -> Self {
        Self { creds, clock, recv_window, key_header: "X-MBX-APIKEY" }
    }

    pub fn with_key_header(mut self, header: &'static str) -> Self {
        self.key_header = header;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.creds.is_some()
    }

    fn creds(&self) -> VenueResult<&Credentials> {
        self.creds.as_ref().ok_or(VenueError::NotConfigured)
    }

    /// Append `timestamp`, `recvWindow` and `signature` to `params`.
    /// Returns the headers to attach and the encoded query.
    pub fn sign(&self, params: &[(String, String)]) -> VenueResult<(Vec<(String, String)>, String)> {
        let creds = self.creds()?;
        let ts = self.clock.now_ms()?;
        let mut all = params.to_vec();
        all.push(("recvWindow".to_string(), self.recv_window.to_string()));
        all.push(("timestamp".to_string(), ts.to_string()));
        let query = encode_params(&all);
        let sig = hmac_sha256_hex(&creds.api_secret, &query)?;
        Ok((self.auth_headers()?, format!("{query}&signature={sig}")))
    }

    /// Headers for endpoints that need only the API key.
    pub fn auth_headers(&self) -> VenueResult<Vec<(String, String)>> {
        let creds = self.creds()?;
        Ok(vec![(self.key_header.to_string(), creds.api_key.clone())])
    }

    /// Signature for a websocket login payload.
    pub fn sign_payload(&self, payload: &str) -> VenueResult<String> {
        hmac_sha256_hex(&self.creds()?.api_secret, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_published_binance_example() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            hmac_sha256_hex(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn unconfigured_signer_fails() {
        let clock = Arc::new(Clock::new("t", 250, false));
        let s = Signer::new(None, clock, 5000);
        assert_eq!(s.auth_headers().unwrap_err(), VenueError::NotConfigured);
        assert_eq!(s.sign(&[]).unwrap_err(), VenueError::NotConfigured);
    }

    #[test]
    fn signed_query_carries_window_timestamp_and_signature() {
        let clock = Arc::new(Clock::new("t", 250, true));
        clock.update_from_server(1_700_000_000_000, 0, 0);
        let s = Signer::new(
            Some(Credentials { api_key: "k".into(), api_secret: "s".into() }),
            clock,
            5000,
        );
        let (headers, q) = s.sign(&[("symbol".into(), "BTCUSDT".into())]).unwrap();
        assert_eq!(headers, vec![("X-MBX-APIKEY".to_string(), "k".to_string())]);
        assert!(q.starts_with("symbol=BTCUSDT&recvWindow=5000&timestamp="));
        let (unsigned, sig) = q.rsplit_once("&signature=").unwrap();
        assert_eq!(sig, hmac_sha256_hex("s", unsigned).unwrap());
    }

    #[test]
    fn signing_needs_synced_clock() {
        let clock = Arc::new(Clock::new("t", 250, true));
        let s = Signer::new(Some(Credentials { api_key: "k".into(), api_secret: "s".into() }), clock, 5000);
        assert_eq!(s.sign(&[]).unwrap_err(), VenueError::ClockNotInitialized);
    }
}
