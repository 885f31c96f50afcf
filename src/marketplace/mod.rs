use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ticker::Symbol;

pub mod binance;
pub mod registry;

pub use registry::{Dispatcher, Listener, SubscriptionRegistry, Subscription};

/// One price update for a symbol coming from the streaming feed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: Decimal,
    pub change_24h: Decimal,
    pub event_time: u64,
}

/// Last price and 24h change as returned by the one-shot snapshot endpoint.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct PriceSnapshot {
    pub price: Decimal,
    pub change_24h: Decimal,
}

/// A single live connection carrying ticks for a dynamic set of symbols.
///
/// Every parsed tick must be handed to the [`Dispatcher`] given to `open`,
/// without buffering. Transport faults are recovered by the implementation
/// itself; nothing is reported back to the caller.
pub trait StreamTransport: Send {
    /// (Re)establishes the connection for exactly `symbols`, replacing any prior one.
    fn open(&mut self, symbols: &BTreeSet<Symbol>, dispatcher: Dispatcher);

    /// Releases the connection and cancels any scheduled reconnect.
    fn close(&mut self);
}
