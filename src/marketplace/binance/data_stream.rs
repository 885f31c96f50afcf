use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::marketplace::binance::connector::{Connector, FrameStream, StreamFrame, WsConnector};
use crate::marketplace::binance::StreamConfig;
use crate::marketplace::{Dispatcher, StreamTransport, Tick};
use crate::ticker::{Symbol, Ticker};

#[derive(Deserialize, Clone, Debug)]
pub struct MultiStream<T> {
    #[serde(default)]
    pub stream: String,
    pub data: T,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TickerStream {
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "c")]
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,

    #[serde(rename = "P")]
    #[serde(with = "rust_decimal::serde::str")]
    pub price_change_percent: Decimal,
}

/// Parses one combined-stream ticker frame into a [`Tick`].
pub fn parse_tick(message: &str, quote: &str) -> Result<Tick> {
    let stream = serde_json::de::from_str::<MultiStream<TickerStream>>(message)
        .context("Invalid ticker frame")?;
    let ticker = Ticker::from_pair(&stream.data.symbol, quote).map_err(|err| anyhow!(err))?;
    Ok(Tick {
        symbol: ticker.base,
        price: stream.data.last_price,
        change_24h: stream.data.price_change_percent,
        event_time: stream.data.event_time,
    })
}

/// Streams 24h tickers for the active symbol set over one websocket.
///
/// The connection lives in a task spawned on the runtime captured at
/// construction. Any fault ends the current connection and schedules exactly
/// one reconnect after `reconnect_delay`, forever, until `close` or a new
/// `open` replaces the task.
pub struct BinanceTickerStream<C: Connector = WsConnector> {
    config: StreamConfig,
    connector: Arc<C>,
    runtime: Handle,
    symbols: BTreeSet<Symbol>,
    task: Option<JoinHandle<()>>,
}

impl BinanceTickerStream<WsConnector> {
    pub fn new(config: StreamConfig) -> Result<Self> {
        Self::with_connector(config, WsConnector)
    }
}

impl<C: Connector> BinanceTickerStream<C> {
    pub fn with_connector(config: StreamConfig, connector: C) -> Result<Self> {
        let runtime =
            Handle::try_current().context("Ticker stream must be created inside a tokio runtime")?;
        Ok(Self {
            config,
            connector: Arc::new(connector),
            runtime,
            symbols: BTreeSet::new(),
            task: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl<C: Connector> StreamTransport for BinanceTickerStream<C> {
    fn open(&mut self, symbols: &BTreeSet<Symbol>, dispatcher: Dispatcher) {
        if *symbols == self.symbols && self.is_connected() {
            debug!("Market data stream already open for {symbols:?}");
            return;
        }

        self.close();
        self.symbols = symbols.clone();

        if symbols.is_empty() {
            info!("No active symbols, market data stream stays closed");
            return;
        }

        let url = self.config.stream_url(symbols);
        self.task = Some(self.runtime.spawn(run_stream(
            self.connector.clone(),
            self.config.clone(),
            url,
            dispatcher,
        )));
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Market data stream closed");
        }
        self.symbols.clear();
    }
}

impl<C: Connector> Drop for BinanceTickerStream<C> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_stream<C: Connector>(
    connector: Arc<C>,
    config: StreamConfig,
    url: String,
    dispatcher: Dispatcher,
) {
    loop {
        info!("Connecting to market data stream {url}");
        match connector.connect(&url).await {
            Ok(mut stream) => {
                info!("Connected to market data stream {url}");
                read_stream(&mut stream, &config, &dispatcher).await;
            }
            Err(err) => {
                error!("Failed to connect to stream: {err:#}");
            }
        }

        info!("Reconnecting in {:?}", config.reconnect_delay);
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn read_stream(stream: &mut FrameStream, config: &StreamConfig, dispatcher: &Dispatcher) {
    loop {
        match tokio::time::timeout(config.read_timeout, stream.next()).await {
            Ok(Some(Ok(StreamFrame::Text(message)))) => {
                match parse_tick(&message, &config.quote) {
                    Ok(tick) => dispatcher.dispatch(&tick),
                    Err(err) => {
                        error!("Stream parsing error : {err:#}");
                    }
                }
            }
            Ok(Some(Ok(StreamFrame::Ping))) => {
                debug!("Received ping");
            }
            Ok(Some(Ok(StreamFrame::Close(frame)))) => {
                error!("Stream closed: {:?}", frame);
                break;
            }
            Ok(Some(Err(err))) => {
                error!("Stream error: {err:#}");
                break;
            }
            Ok(None) => {
                error!("Empty stream");
                break;
            }
            Err(err) => {
                error!("Stream timeout: {}", err);
                break;
            }
        }
    }
}
