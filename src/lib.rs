// ===============================
// src/lib.rs
// ===============================
pub mod balance;
pub mod binance; // Binance-style wire models
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod gateway; // in-memory mock venue
pub mod gateway_binance; // Binance-style REST + user data stream + market streams
pub mod gateway_broker; // broker gateway venue over framed TCP
pub mod gateway_tcp;
pub mod hub;
pub mod instruments;
pub mod market;
pub mod metrics;
pub mod order;
pub mod orderbook;
pub mod recorder;
pub mod rest;
pub mod series;
pub mod signer;
pub mod trader;
pub mod wire;
pub mod ws;
pub mod ws_router;

pub use error::{VenueError, VenueResult};
pub use hub::{HubConfig, VenueApi, VenueHub};
