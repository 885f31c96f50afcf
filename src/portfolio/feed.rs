use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::marketplace::{Subscription, SubscriptionRegistry, Tick};
use crate::portfolio::PortfolioStore;
use crate::ticker::Symbol;

/// Keeps one registry listener per held symbol, routing its ticks into the store.
pub struct PortfolioFeed {
    registry: SubscriptionRegistry,
    store: Arc<PortfolioStore>,
    subscriptions: BTreeMap<Symbol, Subscription>,
}

impl PortfolioFeed {
    pub fn new(registry: SubscriptionRegistry, store: Arc<PortfolioStore>) -> Self {
        Self {
            registry,
            store,
            subscriptions: BTreeMap::new(),
        }
    }

    pub fn subscribed_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.subscriptions.keys()
    }

    /// Subscribes newly held symbols and drops symbols no longer held.
    pub fn sync(&mut self) {
        let held = self.store.snapshot().symbols();

        self.subscriptions.retain(|symbol, subscription| {
            if held.contains(symbol) {
                return true;
            }
            info!("No more holdings of {symbol}, unsubscribing");
            subscription.unsubscribe();
            false
        });

        for symbol in held {
            if self.subscriptions.contains_key(&symbol) {
                continue;
            }
            info!("Watching prices of {symbol}");
            let store = self.store.clone();
            let subscription = self.registry.subscribe(symbol.clone(), move |tick: &Tick| {
                store.apply_price_update(&tick.symbol, tick.price, tick.change_24h);
                Ok(())
            });
            self.subscriptions.insert(symbol, subscription);
        }
    }

    /// Re-syncs after every store change. Runs until the task is aborted.
    pub async fn run(mut self) {
        let mut rx = self.store.subscribe();
        self.sync();
        loop {
            match rx.recv().await {
                Ok(_) => self.sync(),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Portfolio feed skipped {skipped} updates");
                    self.sync();
                }
                Err(RecvError::Closed) => {
                    warn!("Portfolio store closed, stopping feed");
                    break;
                }
            }
        }
        self.stop();
    }

    pub fn stop(&mut self) {
        for (_, subscription) in std::mem::take(&mut self.subscriptions) {
            subscription.unsubscribe();
        }
    }
}
