use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::error::ValidationError;

/// Exchange ticker root, e.g. `BTC`. Always uppercase and non-empty.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(value: &str) -> Result<Self, ValidationError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        Ok(Self(value.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Symbol {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for Symbol {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A traded pair as the exchange names it, e.g. `BTC` quoted in `USDT`.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Ticker {
    #[serde(rename = "b")]
    pub base: Symbol,
    #[serde(rename = "q")]
    pub quote: String,
}

impl Ticker {
    pub fn new(base: Symbol, quote: &str) -> Self {
        Self {
            base,
            quote: quote.to_uppercase(),
        }
    }

    /// Splits an exchange pair such as `BTCUSDT` by stripping the `quote` suffix.
    pub fn from_pair(pair: &str, quote: &str) -> Result<Self, String> {
        let quote = quote.to_uppercase();
        let pair = pair.to_uppercase();
        match pair.strip_suffix(quote.as_str()) {
            Some(base) if !base.is_empty() => Ok(Self {
                base: Symbol(base.to_string()),
                quote,
            }),
            _ => Err(format!("Could not convert {} to ticker quoted in {}", pair, quote)),
        }
    }

    /// Combined-stream name for the 24h rolling ticker of this pair.
    pub fn stream_name(&self) -> String {
        format!(
            "{}{}@ticker",
            self.base.as_str().to_lowercase(),
            self.quote.to_lowercase()
        )
    }
}

impl Display for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}
