use std::collections::HashMap;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::marketplace::binance::Binance;
use crate::marketplace::PriceSnapshot;
use crate::ticker::{Symbol, Ticker};

/// Symbols offered when picking a new holding.
pub const SUPPORTED_SYMBOLS: [&str; 10] = [
    "BTC", "ETH", "BNB", "LTC", "ADA", "XRP", "LINK", "DOT", "SOL", "MATIC",
];

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24hr {
    pub symbol: String,

    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,

    #[serde(with = "rust_decimal::serde::str")]
    pub price_change_percent: Decimal,

    #[serde(with = "rust_decimal::serde::str")]
    pub high_price: Decimal,

    #[serde(with = "rust_decimal::serde::str")]
    pub low_price: Decimal,

    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,

    pub close_time: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CurrencyChoice {
    pub symbol: Symbol,
    pub price: Decimal,
    pub change_24h: Decimal,
}

impl Binance {
    /// All 24h rolling tickers. Entries that fail to decode are skipped.
    pub async fn get_24hr_tickers(&self) -> Result<Vec<Ticker24hr>> {
        let url = format!("{}/api/v3/ticker/24hr", self.endpoint);
        info!("Getting 24h tickers {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .context("Ticker snapshot request failed")?;
        let values: Vec<Value> = response.json().await.context("Invalid ticker snapshot")?;
        Ok(values
            .into_iter()
            .flat_map(|value| serde_json::from_value::<Ticker24hr>(value))
            .collect())
    }

    /// Last price and 24h change for each of `symbols` quoted in `quote`.
    /// Never fails: any error is logged and yields an empty map.
    pub async fn get_initial_prices(
        &self,
        symbols: &[Symbol],
        quote: &str,
    ) -> HashMap<Symbol, PriceSnapshot> {
        match self.get_24hr_tickers().await {
            Ok(tickers) => price_map(&tickers, symbols, quote),
            Err(err) => {
                error!("Error getting initial prices : {err:#}");
                HashMap::new()
            }
        }
    }

    /// Choices for the add-asset picker, in [`SUPPORTED_SYMBOLS`] order.
    pub async fn get_currency_choices(&self, quote: &str) -> Vec<CurrencyChoice> {
        let symbols = supported_symbols();
        let prices = self.get_initial_prices(&symbols, quote).await;
        currency_choices(symbols, &prices)
    }
}

fn supported_symbols() -> Vec<Symbol> {
    SUPPORTED_SYMBOLS
        .iter()
        .flat_map(|symbol| Symbol::new(symbol))
        .collect()
}

fn price_map(
    tickers: &[Ticker24hr],
    symbols: &[Symbol],
    quote: &str,
) -> HashMap<Symbol, PriceSnapshot> {
    tickers
        .iter()
        .filter_map(|ticker| match Ticker::from_pair(&ticker.symbol, quote) {
            Ok(pair) if symbols.contains(&pair.base) => Some((
                pair.base,
                PriceSnapshot {
                    price: ticker.last_price,
                    change_24h: ticker.price_change_percent,
                },
            )),
            Ok(_) => None,
            Err(_) => {
                debug!("Skipping {} not quoted in {quote}", ticker.symbol);
                None
            }
        })
        .collect()
}

fn currency_choices(
    symbols: Vec<Symbol>,
    prices: &HashMap<Symbol, PriceSnapshot>,
) -> Vec<CurrencyChoice> {
    symbols
        .into_iter()
        .filter_map(|symbol| {
            prices.get(&symbol).map(|snapshot| CurrencyChoice {
                price: snapshot.price,
                change_24h: snapshot.change_24h,
                symbol,
            })
        })
        .collect()
}
