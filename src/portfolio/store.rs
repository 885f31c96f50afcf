use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::portfolio::{Holding, PortfolioState};
use crate::storage::{Storage, StorageWriter};
use crate::ticker::Symbol;

/// Storage key of the persisted portfolio document.
pub const STORAGE_KEY: &str = "portfolio";

/// Single source of truth for holdings and their derived totals.
///
/// Every mutation recomputes all derived fields, writes the whole state to
/// storage and broadcasts the new snapshot. Persistence faults are logged and
/// never reach the caller; the in-memory state stays authoritative.
///
/// Inside a tokio runtime writes go through a [`StorageWriter`] so ticks
/// handled on the runtime never block on I/O. Use [`PortfolioStore::flush`]
/// before exiting.
pub struct PortfolioStore {
    state: Mutex<PortfolioState>,
    storage: Arc<dyn Storage>,
    writer: Option<StorageWriter>,
    tx: broadcast::Sender<PortfolioState>,
}

impl PortfolioStore {
    /// Restores the persisted state, or starts empty when there is none or it
    /// cannot be read.
    pub fn load(storage: Arc<dyn Storage>) -> Self {
        let mut state = match storage.load(STORAGE_KEY) {
            Ok(Some(json)) => match serde_json::from_str::<PortfolioState>(&json) {
                Ok(state) => {
                    info!("Restored portfolio with {} holdings", state.holdings.len());
                    state
                }
                Err(err) => {
                    error!("Failed to parse saved portfolio, starting empty : {err}");
                    PortfolioState::default()
                }
            },
            Ok(None) => {
                debug!("No saved portfolio, starting empty");
                PortfolioState::default()
            }
            Err(err) => {
                error!("Failed to load saved portfolio, starting empty : {err:#}");
                PortfolioState::default()
            }
        };

        state.is_loading = false;
        state.last_error = None;
        if let Err(err) = state.recompute() {
            error!("Saved portfolio is unusable, starting empty : {err}");
            state = PortfolioState::default();
        }

        let writer = Handle::try_current()
            .ok()
            .map(|runtime| StorageWriter::spawn(&runtime, storage.clone(), STORAGE_KEY));

        let (tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(state),
            storage,
            writer,
            tx,
        }
    }

    pub fn snapshot(&self) -> PortfolioState {
        self.lock().clone()
    }

    /// Receives a snapshot after every change.
    pub fn subscribe(&self) -> broadcast::Receiver<PortfolioState> {
        self.tx.subscribe()
    }

    pub fn add_holding(
        &self,
        symbol: &str,
        amount: Decimal,
        snapshot_price: Decimal,
    ) -> Result<Uuid, ValidationError> {
        let symbol = Symbol::new(symbol)?;
        if amount <= dec!(0) {
            return Err(ValidationError::NonPositiveAmount(amount));
        }
        if snapshot_price < dec!(0) {
            return Err(ValidationError::NegativePrice(snapshot_price));
        }

        let holding = Holding::new(symbol, amount, snapshot_price);
        let id = holding.id;

        let mut state = self.lock();
        let mut next = state.clone();
        info!("Adding {} {} @ {}", holding.amount, holding.symbol, snapshot_price);
        next.holdings.push(holding);
        self.commit(&mut state, next)?;

        Ok(id)
    }

    /// Returns whether a holding was removed. Unknown ids are ignored.
    pub fn remove_holding(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        let mut next = state.clone();
        next.holdings.retain(|holding| holding.id != id);
        if next.holdings.len() == state.holdings.len() {
            debug!("No holding {id} to remove");
            return false;
        }

        if let Err(err) = self.commit(&mut state, next) {
            error!("Failed to remove holding {id} : {err}");
            return false;
        }
        info!("Removed holding {id}");
        true
    }

    /// Applies a tick to every holding of `symbol` and returns how many were updated.
    /// A tick that would overflow the portfolio value is skipped.
    pub fn apply_price_update(
        &self,
        symbol: &Symbol,
        price: Decimal,
        change_24h: Decimal,
    ) -> usize {
        let mut state = self.lock();
        let mut next = state.clone();
        let mut updated = 0;
        for holding in next
            .holdings
            .iter_mut()
            .filter(|holding| holding.symbol == *symbol)
        {
            holding.current_price = price;
            holding.change_24h = change_24h;
            updated += 1;
        }

        if updated == 0 {
            return 0;
        }
        if let Err(err) = self.commit(&mut state, next) {
            warn!("Skipping {symbol} @ {price} : {err}");
            return 0;
        }
        updated
    }

    pub fn set_loading(&self, is_loading: bool) {
        let mut state = self.lock();
        state.is_loading = is_loading;
        self.notify(&state);
    }

    pub fn set_error(&self, error: Option<String>) {
        let mut state = self.lock();
        state.last_error = error;
        self.notify(&state);
    }

    fn lock(&self) -> MutexGuard<'_, PortfolioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until every change made so far is written to storage.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    /// Replaces `state` with `next` once its derived fields are recomputed.
    fn commit(
        &self,
        state: &mut PortfolioState,
        mut next: PortfolioState,
    ) -> Result<(), ValidationError> {
        next.recompute()?;
        *state = next;
        self.persist(state);
        self.notify(state);
        Ok(())
    }

    fn persist(&self, state: &PortfolioState) {
        let json = match serde_json::to_string(state) {
            Ok(json) => json,
            Err(err) => {
                error!("Failed to serialize portfolio : {err}");
                return;
            }
        };
        match &self.writer {
            Some(writer) => writer.save(json),
            None => {
                if let Err(err) = self.storage.save(STORAGE_KEY, &json) {
                    error!("Failed to save portfolio : {err:#}");
                }
            }
        }
    }

    fn notify(&self, state: &PortfolioState) {
        if self.tx.send(state.clone()).is_err() {
            debug!("No portfolio observers");
        }
    }
}

impl std::fmt::Debug for PortfolioStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioStore")
            .field("state", &*self.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use anyhow::{anyhow, Result};
    use proptest::prelude::*;

    use super::*;
    use crate::storage::MemoryStorage;

    struct BrokenStorage;

    impl Storage for BrokenStorage {
        fn load(&self, _key: &str) -> Result<Option<String>> {
            Err(anyhow!("disk on fire"))
        }

        fn save(&self, _key: &str, _value: &str) -> Result<()> {
            Err(anyhow!("disk on fire"))
        }
    }

    fn store() -> (Arc<MemoryStorage>, PortfolioStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = PortfolioStore::load(storage.clone());
        (storage, store)
    }

    fn symbol(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn share(state: &PortfolioState, id: Uuid) -> Decimal {
        state.holding(id).unwrap().portfolio_share
    }

    fn assert_close(actual: Decimal, expected: Decimal) {
        assert!(
            (actual - expected).abs() < dec!(0.01),
            "{actual} is not close to {expected}"
        );
    }

    /// Holds every save until the test lets it through.
    struct GatedStorage {
        gate: Mutex<mpsc::Receiver<()>>,
        inner: MemoryStorage,
    }

    impl Storage for GatedStorage {
        fn load(&self, key: &str) -> Result<Option<String>> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, value: &str) -> Result<()> {
            self.gate
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .map_err(|err| anyhow!("gate never opened : {err}"))?;
            self.inner.save(key, value)
        }
    }

    fn assert_invariants(state: &PortfolioState) {
        for h in state.holdings.iter() {
            assert_eq!(h.total_value, h.amount * h.current_price);
        }
        let total = state
            .holdings
            .iter()
            .fold(dec!(0), |acc, h| acc + h.amount * h.current_price);
        assert_eq!(state.total_value, total);

        let shares = state
            .holdings
            .iter()
            .fold(dec!(0), |acc, h| acc + h.portfolio_share);
        if state.total_value > dec!(0) {
            assert!((shares - dec!(100)).abs() <= dec!(0.0001), "shares sum to {shares}");
        } else {
            assert!(state.holdings.iter().all(|h| h.portfolio_share == dec!(0)));
        }
    }

    #[test]
    fn test_portfolio_scenario() {
        let (_, store) = store();

        let btc = store.add_holding("BTC", dec!(2), dec!(50000)).unwrap();
        let state = store.snapshot();
        assert_eq!(state.total_value, dec!(100000));
        assert_eq!(share(&state, btc), dec!(100));

        let eth = store.add_holding("eth", dec!(10), dec!(3000)).unwrap();
        let state = store.snapshot();
        assert_eq!(state.total_value, dec!(130000));
        assert_close(share(&state, btc), dec!(76.92));
        assert_close(share(&state, eth), dec!(23.08));
        assert_eq!(state.holding(eth).unwrap().symbol, symbol("ETH"));
        assert_invariants(&state);

        assert_eq!(store.apply_price_update(&symbol("BTC"), dec!(60000), dec!(3.2)), 1);
        let state = store.snapshot();
        assert_eq!(state.holding(btc).unwrap().total_value, dec!(120000));
        assert_eq!(state.holding(btc).unwrap().change_24h, dec!(3.2));
        assert_eq!(state.total_value, dec!(150000));
        assert_eq!(share(&state, btc), dec!(80));
        assert_eq!(share(&state, eth), dec!(20));

        assert!(store.remove_holding(btc));
        let state = store.snapshot();
        assert_eq!(state.holdings.len(), 1);
        assert_eq!(share(&state, eth), dec!(100));
        assert_eq!(state.total_value, dec!(30000));
    }

    #[test]
    fn test_add_holding_validation() {
        let (storage, store) = store();

        assert_eq!(
            store.add_holding("BTC", dec!(0), dec!(1)),
            Err(ValidationError::NonPositiveAmount(dec!(0)))
        );
        assert_eq!(
            store.add_holding("BTC", dec!(-1), dec!(1)),
            Err(ValidationError::NonPositiveAmount(dec!(-1)))
        );
        assert_eq!(
            store.add_holding(" ", dec!(1), dec!(1)),
            Err(ValidationError::EmptySymbol)
        );
        assert_eq!(
            store.add_holding("BTC", dec!(1), dec!(-5)),
            Err(ValidationError::NegativePrice(dec!(-5)))
        );

        assert!(store.snapshot().holdings.is_empty());
        assert_eq!(storage.load(STORAGE_KEY).unwrap(), None);
    }

    #[test]
    fn test_new_holding_starts_without_change() {
        let (_, store) = store();
        let id = store.add_holding("SOL", dec!(3.5), dec!(150)).unwrap();
        let holding = store.snapshot().holding(id).cloned().unwrap();
        assert_eq!(holding.change_24h, dec!(0));
        assert_eq!(holding.total_value, dec!(525));
    }

    #[test]
    fn test_unknown_updates_are_noops() {
        let (storage, store) = store();
        let mut rx = store.subscribe();

        assert!(!store.remove_holding(Uuid::new_v4()));
        assert_eq!(store.apply_price_update(&symbol("BTC"), dec!(1), dec!(1)), 0);

        assert!(rx.try_recv().is_err());
        assert_eq!(storage.load(STORAGE_KEY).unwrap(), None);
    }

    #[test]
    fn test_price_update_reaches_every_holding_of_symbol() {
        let (_, store) = store();
        let first = store.add_holding("BTC", dec!(1), dec!(100)).unwrap();
        let second = store.add_holding("BTC", dec!(3), dec!(100)).unwrap();

        assert_eq!(store.apply_price_update(&symbol("BTC"), dec!(200), dec!(-1)), 2);

        let state = store.snapshot();
        assert_eq!(state.holding(first).unwrap().total_value, dec!(200));
        assert_eq!(state.holding(second).unwrap().total_value, dec!(600));
        assert_eq!(share(&state, first), dec!(25));
        assert_eq!(share(&state, second), dec!(75));
    }

    #[test]
    fn test_overflowing_values_are_rejected() {
        let (storage, store) = store();
        let huge_amount = Decimal::from(1_000_000_000_000_000_u64);
        let huge_price = Decimal::from(100_000_000_000_000_u64);

        assert_eq!(
            store.add_holding("AAA", huge_amount, huge_price),
            Err(ValidationError::ValueOverflow)
        );
        assert!(store.snapshot().holdings.is_empty());

        let aaa = store.add_holding("AAA", Decimal::MAX - dec!(10), dec!(1)).unwrap();
        let bbb = store.add_holding("BBB", dec!(1), dec!(1)).unwrap();
        assert_eq!(
            store.add_holding("CCC", dec!(100), dec!(1)),
            Err(ValidationError::ValueOverflow)
        );

        assert_eq!(store.apply_price_update(&symbol("BBB"), dec!(100), dec!(5)), 0);
        let state = store.snapshot();
        assert_eq!(state.holding(bbb).unwrap().current_price, dec!(1));
        assert_eq!(state.holding(bbb).unwrap().change_24h, dec!(0));
        assert_eq!(state.holdings.len(), 2);
        assert_invariants(&state);

        assert_eq!(store.apply_price_update(&symbol("BBB"), dec!(2), dec!(5)), 1);
        assert!(store.remove_holding(aaa));
        assert_invariants(&store.snapshot());

        let saved: PortfolioState =
            serde_json::from_str(&storage.load(STORAGE_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(saved.holdings.len(), 1);
        assert_eq!(saved.total_value, dec!(2));
    }

    #[test]
    fn test_persistence_round_trip() {
        let (storage, store) = store();
        let btc = store.add_holding("BTC", dec!(0.123456789012345678), dec!(50000)).unwrap();
        let eth = store.add_holding("ETH", dec!(10), dec!(3000)).unwrap();
        store.apply_price_update(&symbol("ETH"), dec!(3100), dec!(2));
        store.set_loading(true);
        store.set_error(Some(String::from("snapshot failed")));

        let before = store.snapshot();
        let restored = PortfolioStore::load(storage.clone()).snapshot();

        assert_eq!(restored.holdings.len(), 2);
        for (a, b) in before.holdings.iter().zip(restored.holdings.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.symbol, b.symbol);
            assert_eq!(a.amount, b.amount);
            assert_eq!(a.current_price, b.current_price);
        }
        assert_eq!(restored.holding(btc).unwrap().amount, dec!(0.123456789012345678));
        assert_eq!(restored.holding(eth).unwrap().change_24h, dec!(2));
        assert_eq!(restored.total_value, before.total_value);
        assert!(!restored.is_loading);
        assert_eq!(restored.last_error, None);
    }

    #[test]
    fn test_corrupt_state_falls_back_to_empty() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save(STORAGE_KEY, "{ not json").unwrap();

        let store = PortfolioStore::load(storage.clone());
        assert_eq!(store.snapshot(), PortfolioState::default());

        store.add_holding("BTC", dec!(1), dec!(1)).unwrap();
        assert!(storage.load(STORAGE_KEY).unwrap().unwrap().contains("BTC"));
    }

    #[test]
    fn test_derived_fields_are_recomputed_on_load() {
        let storage = Arc::new(MemoryStorage::new());
        let json = serde_json::json!({
            "holdings": [{
                "id": "5f0c6a8e-8d5c-4a57-9f6b-1f2d3c4b5a69",
                "symbol": "btc",
                "amount": "2",
                "currentPrice": "50000",
                "change24h": "1.5",
                "totalValue": "1",
                "portfolioShare": "1"
            }],
            "totalValue": "1",
            "isLoading": true,
            "lastError": "stale"
        });
        storage.save(STORAGE_KEY, &json.to_string()).unwrap();

        let state = PortfolioStore::load(storage).snapshot();
        assert_eq!(state.holdings[0].symbol, symbol("BTC"));
        assert_eq!(state.total_value, dec!(100000));
        assert_eq!(state.holdings[0].portfolio_share, dec!(100));
        assert!(!state.is_loading);
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn test_storage_faults_never_reach_caller() {
        let store = PortfolioStore::load(Arc::new(BrokenStorage));
        let id = store.add_holding("BTC", dec!(1), dec!(10)).unwrap();
        store.apply_price_update(&symbol("BTC"), dec!(20), dec!(0));
        assert_eq!(store.snapshot().holding(id).unwrap().total_value, dec!(20));
    }

    #[tokio::test]
    async fn test_saves_do_not_block_mutations() {
        let (open, gate) = mpsc::channel();
        let storage = Arc::new(GatedStorage {
            gate: Mutex::new(gate),
            inner: MemoryStorage::new(),
        });
        let store = PortfolioStore::load(storage.clone());

        let started = Instant::now();
        let id = store.add_holding("BTC", dec!(1), dec!(10)).unwrap();
        store.apply_price_update(&symbol("BTC"), dec!(20), dec!(0));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(storage.load(STORAGE_KEY).unwrap(), None);

        open.send(()).unwrap();
        open.send(()).unwrap();
        store.flush().await;

        let saved: PortfolioState =
            serde_json::from_str(&storage.load(STORAGE_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(saved.holding(id).unwrap().current_price, dec!(20));
        assert_eq!(saved, store.snapshot());
    }

    #[test]
    fn test_observers_get_snapshot_after_each_change() {
        let (_, store) = store();
        let mut rx = store.subscribe();

        let id = store.add_holding("BTC", dec!(1), dec!(10)).unwrap();
        store.set_loading(true);
        store.remove_holding(id);

        let added = rx.try_recv().unwrap();
        assert_eq!(added.holdings.len(), 1);
        assert!(rx.try_recv().unwrap().is_loading);
        assert!(rx.try_recv().unwrap().holdings.is_empty());
        assert!(rx.try_recv().is_err());
    }

    const SYMBOLS: [&str; 4] = ["BTC", "ETH", "SOL", "ADA"];

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize, Decimal, Decimal),
        Remove(usize),
        Update(usize, Decimal, Decimal),
    }

    fn arb_amount() -> impl Strategy<Value = Decimal> {
        prop_oneof![
            9 => (1_i64..1_000_000_000_000, 0_u32..12).prop_map(|(m, scale)| Decimal::new(m, scale)),
            1 => Just(Decimal::MAX),
        ]
    }

    fn arb_price() -> impl Strategy<Value = Decimal> {
        prop_oneof![
            1 => Just(dec!(0)),
            8 => (1_i64..100_000_000_000, 0_u32..8).prop_map(|(m, scale)| Decimal::new(m, scale)),
            1 => Just(Decimal::MAX),
        ]
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..SYMBOLS.len(), arb_amount(), arb_price())
                .prop_map(|(i, amount, price)| Op::Add(i, amount, price)),
            any::<usize>().prop_map(Op::Remove),
            (0..SYMBOLS.len(), arb_price(), -50_i64..50)
                .prop_map(|(i, price, change)| Op::Update(i, price, Decimal::from(change))),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Totals and shares stay consistent whatever the order of adds, removes and ticks.
        #[test]
        fn prop_invariants_hold_for_any_sequence(ops in proptest::collection::vec(arb_op(), 1..40)) {
            let (_, store) = store();
            for op in ops {
                let before = store.snapshot();
                match op {
                    Op::Add(i, amount, price) => {
                        if let Err(err) = store.add_holding(SYMBOLS[i], amount, price) {
                            prop_assert_eq!(err, ValidationError::ValueOverflow);
                            prop_assert_eq!(store.snapshot(), before);
                        }
                    }
                    Op::Remove(pick) => {
                        if !before.holdings.is_empty() {
                            let id = before.holdings[pick % before.holdings.len()].id;
                            prop_assert!(store.remove_holding(id));
                        }
                    }
                    Op::Update(i, price, change) => {
                        if store.apply_price_update(&symbol(SYMBOLS[i]), price, change) == 0 {
                            prop_assert_eq!(store.snapshot(), before);
                        }
                    }
                }
                assert_invariants(&store.snapshot());
            }
        }
    }
}
