use rust_decimal::Decimal;
use thiserror::Error;

/// Rejection of a user-entered holding. Nothing is mutated when this is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("amount must be greater than zero, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("price must not be negative, got {0}")]
    NegativePrice(Decimal),

    #[error("portfolio value would exceed the decimal range")]
    ValueOverflow,
}
