use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::marketplace::{Subscription, SubscriptionRegistry, Tick};
use crate::ticker::Symbol;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PricePoint {
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

/// Last `capacity` prices per symbol, oldest first. Fed like any other listener.
#[derive(Clone, Debug)]
pub struct PriceHistory {
    capacity: usize,
    windows: Arc<Mutex<HashMap<Symbol, VecDeque<PricePoint>>>>,
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Symbol, VecDeque<PricePoint>>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, tick: &Tick) {
        let time = i64::try_from(tick.event_time)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        let mut windows = self.lock();
        let window = windows.entry(tick.symbol.clone()).or_default();
        window.push_back(PricePoint {
            price: tick.price,
            time,
        });
        while window.len() > self.capacity {
            window.pop_front();
        }
    }

    pub fn points(&self, symbol: &Symbol) -> Vec<PricePoint> {
        self.lock()
            .get(symbol)
            .map(|window| window.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&self, symbol: &Symbol) {
        self.lock().remove(symbol);
    }

    /// Starts recording `symbol` from the registry. Pair with [`PriceHistory::untrack`].
    pub fn track(&self, registry: &SubscriptionRegistry, symbol: Symbol) -> Subscription {
        self.lock().entry(symbol.clone()).or_default();
        let history = self.clone();
        registry.subscribe(symbol, move |tick: &Tick| {
            history.record(tick);
            Ok(())
        })
    }

    pub fn untrack(&self, subscription: Subscription) {
        subscription.unsubscribe();
        self.forget(subscription.symbol());
    }
}
