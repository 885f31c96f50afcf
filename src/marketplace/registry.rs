use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::marketplace::{StreamTransport, Tick};
use crate::ticker::Symbol;

pub type Listener = Arc<dyn Fn(&Tick) -> Result<()> + Send + Sync>;

struct ListenerEntry {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Listener,
}

struct RegistryInner {
    listeners: BTreeMap<Symbol, Vec<ListenerEntry>>,
    next_id: u64,
    transport: Box<dyn StreamTransport>,
}

impl RegistryInner {
    fn active_symbols(&self) -> BTreeSet<Symbol> {
        self.listeners.keys().cloned().collect()
    }
}

fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fans ticks out to many listeners over a single transport connection.
///
/// The transport is owned here and reopened whenever the set of symbols with
/// at least one listener changes. Cloning gives another handle to the same
/// registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    pub fn new<T: StreamTransport + 'static>(transport: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                listeners: BTreeMap::new(),
                next_id: 0,
                transport: Box::new(transport),
            })),
        }
    }

    /// Registers `listener` for every future tick of `symbol`.
    pub fn subscribe<F>(&self, symbol: Symbol, listener: F) -> Subscription
    where
        F: Fn(&Tick) -> Result<()> + Send + Sync + 'static,
    {
        let dispatcher = self.dispatcher();
        let active = Arc::new(AtomicBool::new(true));
        let mut inner = lock(&self.inner);

        let id = inner.next_id;
        inner.next_id += 1;

        let entries = inner.listeners.entry(symbol.clone()).or_default();
        let is_new_symbol = entries.is_empty();
        entries.push(ListenerEntry {
            id,
            active: active.clone(),
            listener: Arc::new(listener),
        });

        if is_new_symbol {
            let symbols = inner.active_symbols();
            info!("Subscribed to new symbol {symbol}, active set is now {symbols:?}");
            inner.transport.open(&symbols, dispatcher);
        } else {
            debug!("Added listener #{id} for already active symbol {symbol}");
        }

        Subscription {
            id,
            symbol,
            active,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `tick` to every listener currently registered for its symbol,
    /// in registration order.
    pub fn dispatch(&self, tick: &Tick) {
        dispatch(&self.inner, tick);
    }

    /// Handle the transport uses to feed ticks back into this registry.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn active_symbols(&self) -> BTreeSet<Symbol> {
        lock(&self.inner).active_symbols()
    }

    pub fn listener_count(&self, symbol: &Symbol) -> usize {
        lock(&self.inner)
            .listeners
            .get(symbol)
            .map_or(0, |entries| entries.len())
    }

    /// Drops every listener and closes the transport.
    pub fn shutdown(&self) {
        let mut inner = lock(&self.inner);
        for entry in inner.listeners.values().flatten() {
            entry.active.store(false, Ordering::SeqCst);
        }
        inner.listeners.clear();
        inner.transport.close();
        info!("Subscription registry shut down");
    }
}

impl Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("active_symbols", &self.active_symbols())
            .finish()
    }
}

fn dispatch(inner: &Mutex<RegistryInner>, tick: &Tick) {
    // Snapshot under the lock so listeners may (un)subscribe while being called.
    let targets = {
        let inner = lock(inner);
        match inner.listeners.get(&tick.symbol) {
            Some(entries) => entries
                .iter()
                .map(|entry| (entry.id, entry.active.clone(), entry.listener.clone()))
                .collect::<Vec<_>>(),
            None => return,
        }
    };

    for (id, active, listener) in targets {
        if !active.load(Ordering::SeqCst) {
            continue;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| listener(tick))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("Listener #{id} for {} failed : {err:#}", tick.symbol);
            }
            Err(_) => {
                error!("Listener #{id} for {} panicked", tick.symbol);
            }
        }
    }
}

/// Weak entry point into a [`SubscriptionRegistry`], handed to the transport.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Weak<Mutex<RegistryInner>>,
}

impl Dispatcher {
    pub fn dispatch(&self, tick: &Tick) {
        if let Some(inner) = self.inner.upgrade() {
            dispatch(&inner, tick);
        }
    }
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Returned by [`SubscriptionRegistry::subscribe`]. Dropping it does not unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    symbol: Symbol,
    active: Arc<AtomicBool>,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Subscription {
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Removes exactly this listener. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let dispatcher = Dispatcher {
            inner: self.registry.clone(),
        };
        let mut inner = lock(&inner);

        let Some(entries) = inner.listeners.get_mut(&self.symbol) else {
            return;
        };
        entries.retain(|entry| entry.id != self.id);

        if entries.is_empty() {
            inner.listeners.remove(&self.symbol);
            let symbols = inner.active_symbols();
            info!(
                "Last listener for {} removed, active set is now {symbols:?}",
                self.symbol
            );
            inner.transport.open(&symbols, dispatcher);
        }
    }
}
