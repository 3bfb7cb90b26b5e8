// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : dma_venue_core — multi-venue trading connectivity core in Rust
Module  : config.rs
Version : 0.6.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Connects to a venue (mock / Binance-style REST+WS / broker
          gateway over framed TCP), keeps instruments, books, balances and
          orders reconciled, caches historical series on disk, exposes
          Prometheus metrics, and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{VenueError, VenueResult};
use crate::gateway_binance::BinanceConfig;
use crate::gateway_tcp::{GatewayConfig, GatewayContract};
use crate::series::SeriesConfig;
use crate::signer::Credentials;
use crate::trader::TraderConfig;

/// Which venue the process connects to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Mock,
    BinanceSandbox,
    BinanceMainnet,
    Broker,
}

impl VenueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(VenueMode::Mock),
            "binance_sandbox" => Some(VenueMode::BinanceSandbox),
            "binance_mainnet" => Some(VenueMode::BinanceMainnet),
            "broker" => Some(VenueMode::Broker),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Mock => "mock",
            VenueMode::BinanceSandbox => "binance_sandbox",
            VenueMode::BinanceMainnet => "binance_mainnet",
            VenueMode::Broker => "broker",
        }
    }

    // Endpoint defaults per mode; unused by mock and broker
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            VenueMode::BinanceMainnet => "https://api.binance.com",
            _ => "https://testnet.binance.vision",
        }
    }

    pub fn default_ws_url(&self) -> &'static str {
        match self {
            VenueMode::BinanceMainnet => "wss://stream.binance.com:9443",
            _ => "wss://testnet.binance.vision",
        }
    }

    pub fn default_futures_rest_url(&self) -> &'static str {
        match self {
            VenueMode::BinanceMainnet => "https://fapi.binance.com",
            _ => "https://testnet.binancefuture.com",
        }
    }
}

fn default_currency() -> String {
    "USDT".to_string()
}

fn default_sec_type() -> String {
    "CRYPTO".to_string()
}

fn default_tif() -> String {
    "GTC".to_string()
}

fn default_rel() -> Decimal {
    Decimal::new(5, 2)
}

/// One `contracts[]` entry.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractConfig {
    pub symbol: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_sec_type")]
    pub sec_type: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default = "default_tif")]
    pub time_in_force: String,
    #[serde(default)]
    pub max_price_dist_abs: Decimal,
    #[serde(default = "default_rel")]
    pub max_price_dist_rel: Decimal,
}

impl ContractConfig {
    pub fn trader_config(&self) -> TraderConfig {
        TraderConfig {
            max_price_dist_abs: self.max_price_dist_abs,
            max_price_dist_rel: self.max_price_dist_rel,
            ..TraderConfig::default()
        }
    }

    pub fn gateway_contract(&self) -> GatewayContract {
        GatewayContract {
            con_id: None,
            symbol: self.symbol.clone(),
            sec_type: self.sec_type.clone(),
            exchange: self.exchange.clone(),
            currency: self.currency.clone(),
        }
    }
}

pub fn parse_contracts(json: &str) -> VenueResult<Vec<ContractConfig>> {
    serde_json::from_str(json).map_err(|e| VenueError::InvalidRequest(format!("contracts: {e}")))
}

/// `USDT:10,BTC:0.001` -> per-currency pitch tolerance.
pub fn parse_max_pitch(s: &str) -> VenueResult<HashMap<String, Decimal>> {
    let mut out = HashMap::new();
    for item in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (ccy, amount) = item
            .split_once(':')
            .ok_or_else(|| VenueError::InvalidRequest(format!("MAX_PITCH entry '{item}'")))?;
        let amount: Decimal = amount
            .trim()
            .parse()
            .map_err(|_| VenueError::InvalidRequest(format!("MAX_PITCH amount '{item}'")))?;
        out.insert(ccy.trim().to_ascii_uppercase(), amount);
    }
    Ok(out)
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub mode: VenueMode,
    pub binance: BinanceConfig,
    pub credentials: Option<Credentials>,
    pub gateway: GatewayConfig,
    pub contracts: Vec<ContractConfig>,
    pub max_pitch: HashMap<String, Decimal>,
    pub rate_limit_min_interval: Duration,
    pub cache_enabled: bool,
    pub cache_root: PathBuf,
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

impl Settings {
    pub fn series_config(&self) -> SeriesConfig {
        SeriesConfig {
            root: self.cache_root.clone(),
            enabled: self.cache_enabled,
            min_interval: self.rate_limit_min_interval,
            ..SeriesConfig::default()
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Read `.env` (or `env_file`) into the process environment, then build the
/// settings. `mode_override` wins over `VENUE_MODE`.
pub fn load(env_file: Option<&Path>, mode_override: Option<&str>) -> VenueResult<Settings> {
    match env_file {
        Some(p) => {
            dotenvy::from_path(p).map_err(|e| VenueError::InvalidRequest(format!("env file {}: {e}", p.display())))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    let mode_text = mode_override.map(str::to_string).unwrap_or_else(|| env_or("VENUE_MODE", "mock"));
    let mode = VenueMode::parse(&mode_text)
        .ok_or_else(|| VenueError::InvalidRequest(format!("unknown venue mode '{mode_text}'")))?;

    // ===== Binance-style =====
    let binance = BinanceConfig {
        rest_url: env_or("BINANCE_REST_URL", mode.default_rest_url()),
        ws_url: env_or("BINANCE_WS_URL", mode.default_ws_url()),
        futures_rest_url: env_or("BINANCE_FUTURES_REST_URL", mode.default_futures_rest_url()),
        recv_window: env_parse("BINANCE_RECV_WINDOW", 5000),
        ..BinanceConfig::default()
    };
    let credentials = match (env::var("BINANCE_API_KEY"), env::var("BINANCE_API_SECRET")) {
        (Ok(api_key), Ok(api_secret)) if !api_key.is_empty() && !api_secret.is_empty() => {
            Some(Credentials { api_key, api_secret })
        }
        _ => None,
    };

    // ===== Broker gateway =====
    let gateway = GatewayConfig {
        address: env_or("CONNECTION_ADDRESS", "127.0.0.1"),
        port: env_parse("CONNECTION_PORT", 4002),
        client_id: env_parse("CONNECTION_CLIENT_ID", 1),
        ..GatewayConfig::default()
    };

    // ===== Contracts =====
    let contracts = if let Ok(inline) = env::var("CONTRACTS") {
        parse_contracts(&inline)?
    } else if let Ok(path) = env::var("CONTRACTS_FILE") {
        let text = std::fs::read_to_string(&path)?;
        parse_contracts(&text)?
    } else {
        parse_contracts(r#"[{"symbol":"BTCUSDT"}]"#)?
    };

    let max_pitch = parse_max_pitch(&env_or("MAX_PITCH", ""))?;

    Ok(Settings {
        mode,
        binance,
        credentials,
        gateway,
        contracts,
        max_pitch,
        rate_limit_min_interval: Duration::from_millis(env_parse("RATE_LIMIT_MIN_INTERVAL_MS", 250)),
        cache_enabled: env_parse("CACHE_ENABLED", true),
        cache_root: PathBuf::from(env_or("CACHE_ROOT", "./cache")),
        record_file: env::var("RECORD_FILE").ok().filter(|s| !s.is_empty()),
        metrics_port: env_parse("METRICS_PORT", 9898),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn modes() {
        assert_eq!(VenueMode::parse("Binance_Sandbox"), Some(VenueMode::BinanceSandbox));
        assert_eq!(VenueMode::parse("broker"), Some(VenueMode::Broker));
        assert_eq!(VenueMode::parse("paper"), None);
        assert_eq!(VenueMode::BinanceMainnet.default_ws_url(), "wss://stream.binance.com:9443");
    }

    #[test]
    fn contracts_take_camel_case_and_defaults() -> anyhow::Result<()> {
        let list = parse_contracts(
            r#"[{"symbol":"AAPL","currency":"USD","secType":"STK","exchange":"SMART","maxPriceDistAbs":"0.5"},
                {"symbol":"ETHUSDT"}]"#,
        )?;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].sec_type, "STK");
        assert_eq!(list[0].time_in_force, "GTC");
        assert_eq!(list[0].max_price_dist_abs, dec!(0.5));
        assert_eq!(list[1].currency, "USDT");
        assert_eq!(list[1].max_price_dist_rel, dec!(0.05));
        let gc = list[0].gateway_contract();
        assert_eq!((gc.symbol.as_str(), gc.exchange.as_str()), ("AAPL", "SMART"));
        assert_eq!(list[0].trader_config().max_price_dist_abs, dec!(0.5));
        assert!(parse_contracts("{").is_err());
        Ok(())
    }

    #[test]
    fn max_pitch_list() -> anyhow::Result<()> {
        let m = parse_max_pitch("usdt:10, BTC:0.001")?;
        assert_eq!(m.get("USDT"), Some(&dec!(10)));
        assert_eq!(m.get("BTC"), Some(&dec!(0.001)));
        assert!(parse_max_pitch("")?.is_empty());
        assert!(parse_max_pitch("USDT").is_err());
        assert!(parse_max_pitch("USDT:x").is_err());
        Ok(())
    }
}
