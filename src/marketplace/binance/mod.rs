use std::collections::BTreeSet;
use std::env;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use itertools::Itertools;
use reqwest::Client;

use crate::ticker::{Symbol, Ticker};

mod connector;
mod data_stream;
mod market_data_api;

pub use connector::{Connector, FrameStream, StreamFrame, WsConnector};
pub use data_stream::{parse_tick, BinanceTickerStream, MultiStream, TickerStream};
pub use market_data_api::{CurrencyChoice, Ticker24hr, SUPPORTED_SYMBOLS};

pub static ENDPOINT: LazyLock<String> = LazyLock::new(|| {
    env::var("BINANCE_API_ENDPOINT").unwrap_or_else(|_| String::from("https://api.binance.com"))
});

pub static STREAM_ENDPOINT: LazyLock<String> = LazyLock::new(|| {
    env::var("BINANCE_STREAM_ENDPOINT")
        .unwrap_or_else(|_| String::from("wss://stream.binance.com:9443"))
});

pub const DEFAULT_QUOTE: &str = "USDT";

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub endpoint: String,
    /// Quote asset every symbol is streamed against and stripped from pairs.
    pub quote: String,
    pub reconnect_delay: Duration,
    /// A connection silent for this long is considered dead.
    pub read_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: STREAM_ENDPOINT.clone(),
            quote: String::from(DEFAULT_QUOTE),
            reconnect_delay: Duration::from_millis(5000),
            read_timeout: Duration::from_secs(60),
        }
    }
}

impl StreamConfig {
    /// Combined-stream URL carrying one `@ticker` stream per symbol.
    pub fn stream_url(&self, symbols: &BTreeSet<Symbol>) -> String {
        let streams = symbols
            .iter()
            .map(|symbol| Ticker::new(symbol.clone(), &self.quote).stream_name())
            .join("/");
        format!("{}/stream?streams={}", self.endpoint, streams)
    }
}

/// REST side of the exchange, only used for one-shot price snapshots.
#[derive(Debug, Clone)]
pub struct Binance {
    client: Client,
    endpoint: String,
}

impl Binance {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(ENDPOINT.as_str())
    }

    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}
