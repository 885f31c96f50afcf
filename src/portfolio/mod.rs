use std::collections::BTreeSet;
use std::fmt::Display;

use colored::Colorize;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::ticker::Symbol;

pub mod feed;
pub mod store;

pub use feed::PortfolioFeed;
pub use store::{PortfolioStore, STORAGE_KEY};

/// A user's position in one symbol along with its cached price state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub id: Uuid,
    pub symbol: Symbol,
    pub amount: Decimal,
    pub current_price: Decimal,
    #[serde(rename = "change24h")]
    pub change_24h: Decimal,
    pub total_value: Decimal,
    pub portfolio_share: Decimal,
}

impl Holding {
    /// Derived fields stay zero until [`PortfolioState::recompute`].
    pub fn new(symbol: Symbol, amount: Decimal, current_price: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol,
            amount,
            current_price,
            change_24h: dec!(0),
            total_value: dec!(0),
            portfolio_share: dec!(0),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioState {
    pub holdings: Vec<Holding>,
    pub total_value: Decimal,
    #[serde(default)]
    pub is_loading: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PortfolioState {
    /// Rewrites every derived field from amounts and prices.
    ///
    /// Fails with [`ValidationError::ValueOverflow`] when a holding value or
    /// the total does not fit in a `Decimal`, leaving the state untouched.
    pub fn recompute(&mut self) -> Result<(), ValidationError> {
        let values = self
            .holdings
            .iter()
            .map(|holding| holding.amount.checked_mul(holding.current_price))
            .collect::<Option<Vec<_>>>()
            .ok_or(ValidationError::ValueOverflow)?;
        let total = values
            .iter()
            .try_fold(dec!(0), |acc, value| acc.checked_add(*value))
            .ok_or(ValidationError::ValueOverflow)?;

        for (holding, value) in self.holdings.iter_mut().zip(values) {
            holding.total_value = value;
            holding.portfolio_share = if total > dec!(0) {
                value / total * dec!(100)
            } else {
                dec!(0)
            };
        }
        self.total_value = total;
        Ok(())
    }

    pub fn holding(&self, id: Uuid) -> Option<&Holding> {
        self.holdings.iter().find(|holding| holding.id == id)
    }

    /// Distinct symbols currently held.
    pub fn symbols(&self) -> BTreeSet<Symbol> {
        self.holdings
            .iter()
            .map(|holding| holding.symbol.clone())
            .collect()
    }
}

impl Display for PortfolioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "~{}", self.total_value.round_dp(2).normalize().to_string().yellow())?;
        for holding in self.holdings.iter() {
            let change = holding.change_24h.round_dp(2).normalize();
            let change = if change < dec!(0) {
                format!("{change}%").red()
            } else {
                format!("+{change}%").green()
            };
            writeln!(
                f,
                "{} {}: {} @ {} (~{}, {}%) {}",
                holding.id,
                holding.symbol,
                holding.amount.to_string().purple(),
                holding.current_price,
                holding.total_value.round_dp(2).normalize(),
                holding.portfolio_share.round_dp(2).normalize(),
                change
            )?;
        }
        if let Some(error) = &self.last_error {
            writeln!(f, "{}", error.red())?;
        }
        Ok(())
    }
}
