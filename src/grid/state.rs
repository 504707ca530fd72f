//! Ledger snapshots with JSON persistence

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::config::{validate_level, LadderConfig};
use super::errors::{GridError, GridResult};
use super::ledger::{Ledger, TradeGrid};
use super::registry::OrderRegistry;
use super::types::{Quote, Side};

/// Persisted ledger snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridState {
    pub instrument: String,

    /// Realized P&L accumulator
    pub realized_pnl: f64,

    /// Time the snapshot was taken
    pub saved_at: DateTime<Utc>,

    /// Last quote seen by the engine, informational only
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,

    /// All levels, each with its in-flight orders
    pub grids: Vec<TradeGrid>,
}

/// Ledger and registry rebuilt from a snapshot or a ladder
#[derive(Debug)]
pub struct Restored {
    pub ledger: Ledger,
    pub registry: OrderRegistry,
    /// True when the ledger came from a persisted snapshot
    pub resumed: bool,
}

impl GridState {
    /// Capture the current ledger
    pub fn capture(
        instrument: &str,
        ledger: &Ledger,
        last_quote: Option<Quote>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            realized_pnl: ledger.realized_pnl(),
            saved_at: now,
            bid: last_quote.map(|q| q.bid).unwrap_or_default(),
            ask: last_quote.map(|q| q.ask).unwrap_or_default(),
            grids: ledger.grids().to_vec(),
        }
    }

    /// Check the snapshot is internally consistent
    pub fn validate(&self) -> GridResult<()> {
        if self.instrument.is_empty() {
            return Err(GridError::CorruptState("instrument is empty".into()));
        }

        if !self.realized_pnl.is_finite() {
            return Err(GridError::CorruptState("realized_pnl is not a number".into()));
        }

        let mut seen = HashSet::new();
        for (index, grid) in self.grids.iter().enumerate() {
            validate_level(
                index,
                grid.open_price,
                grid.close_price,
                grid.open_chance,
                grid.close_chance,
            )
            .map_err(GridError::CorruptState)?;

            if !grid.open_total.is_finite() || !grid.close_total.is_finite()
                || grid.open_total < 0.0 || grid.close_total < 0.0
            {
                return Err(GridError::CorruptState(format!(
                    "level {}: totals must be non-negative numbers",
                    index
                )));
            }

            for side in [Side::Open, Side::Close] {
                for (key, order) in grid.orders(side) {
                    if key != &order.client_id || order.side != side {
                        return Err(GridError::CorruptState(format!(
                            "level {}: order {} filed under the wrong key or side",
                            index, key
                        )));
                    }

                    let qty_ok = order.requested_qty.is_finite()
                        && order.executed_qty.is_finite()
                        && order.executed_qty >= 0.0
                        && order.executed_qty <= order.requested_qty;
                    if !qty_ok {
                        return Err(GridError::CorruptState(format!(
                            "level {}: order {} has executed {} of requested {}",
                            index, key, order.executed_qty, order.requested_qty
                        )));
                    }

                    if !seen.insert(key.clone()) {
                        return Err(GridError::CorruptState(format!(
                            "order {} appears more than once",
                            key
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Validate that the loaded snapshot belongs to the configured ladder
    pub fn validate_against_ladder(&self, ladder: &LadderConfig) -> GridResult<()> {
        if self.instrument != ladder.instrument {
            return Err(GridError::InvalidConfig(format!(
                "State instrument '{}' doesn't match ladder instrument '{}'",
                self.instrument, ladder.instrument
            )));
        }

        if self.grids.len() != ladder.levels.len() {
            return Err(GridError::InvalidConfig(format!(
                "State has {} levels but the ladder defines {}",
                self.grids.len(),
                ladder.levels.len()
            )));
        }

        Ok(())
    }

    /// Rebuild the ledger and registry, restoring each order's grid index
    pub fn restore(self) -> GridResult<Restored> {
        self.validate()?;

        let mut ledger = Ledger::new(self.grids, self.realized_pnl);
        let mut registry = OrderRegistry::new();

        for (index, grid) in ledger.grids_mut().iter_mut().enumerate() {
            for side in [Side::Open, Side::Close] {
                for order in grid.orders_mut(side).values_mut() {
                    order.grid = index;
                    if !registry.add(order) {
                        return Err(GridError::CorruptState(format!(
                            "order {} appears more than once",
                            order.client_id
                        )));
                    }
                }
            }
        }

        Ok(Restored {
            ledger,
            registry,
            resumed: true,
        })
    }

    /// Load state from file
    pub fn load_from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)
            .map_err(|e| GridError::CorruptState(e.to_string()))?;
        Ok(state)
    }

    /// Save state to file atomically (write to temp, then rename)
    pub fn save_to_file_atomic(&self, path: impl AsRef<Path>) -> GridResult<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }
}

/// Durable sink for ledger snapshots
pub trait StateStore: Send + Sync {
    fn save(&self, state: &GridState) -> GridResult<()>;

    fn load(&self) -> GridResult<Option<GridState>>;
}

/// JSON file store with atomic replace
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateStore for JsonFileStore {
    fn save(&self, state: &GridState) -> GridResult<()> {
        state.save_to_file_atomic(&self.path)?;
        debug!("State saved to {:?}", self.path);
        Ok(())
    }

    fn load(&self) -> GridResult<Option<GridState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        GridState::load_from_file(&self.path).map(Some)
    }
}

/// In-memory store holding the serialized snapshot; clones share storage
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<String>>>,
    saves: Arc<Mutex<usize>>,
    fail_saves: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent saves fail
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Raw JSON of the last snapshot
    pub fn raw(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for MemoryStore {
    fn save(&self, state: &GridState) -> GridResult<()> {
        if *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(GridError::StatePersistence("memory store save disabled".into()));
        }
        let content = serde_json::to_string(state)?;
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(content);
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn load(&self) -> GridResult<Option<GridState>> {
        match self.raw() {
            Some(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| GridError::CorruptState(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Resume from the store if it holds a snapshot, else start from the ladder.
///
/// A snapshot that fails validation is fatal: trading an inconsistent ladder
/// is worse than not trading.
pub fn load_or_create(store: &dyn StateStore, ladder: &LadderConfig) -> GridResult<Restored> {
    ladder.validate()?;

    match store.load()? {
        Some(state) => {
            state.validate_against_ladder(ladder)?;
            let restored = state.restore()?;
            info!(
                "Loaded state: {} levels, {} in-flight orders, realized pnl {:.4}",
                restored.ledger.len(),
                restored.registry.len(),
                restored.ledger.realized_pnl()
            );
            Ok(restored)
        }
        None => {
            info!("No existing state, starting from the ladder definition");
            Ok(Restored {
                ledger: Ledger::from_ladder(ladder),
                registry: OrderRegistry::new(),
                resumed: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::LevelConfig;
    use crate::grid::ledger::GridOrder;

    fn ladder() -> LadderConfig {
        LadderConfig::new(
            "BTC-PERP",
            vec![
                LevelConfig::new(90.0, 95.0, 10.0, 0.0),
                LevelConfig::new(85.0, 90.0, 10.0, 0.0),
            ],
        )
    }

    fn ledger_with_orders() -> Ledger {
        let mut ledger = Ledger::from_ladder(&ladder());
        let now = Utc::now();
        let mut open = GridOrder::new("open-1", 1, Side::Open, 10.0, now);
        open.executed_qty = 4.0;
        open.exchange_id = Some(77);
        ledger.grids_mut()[1].open_chance = 0.0;
        ledger.grids_mut()[1].open_orders.insert(open.client_id.clone(), open);
        let close = GridOrder::new("close-1", 0, Side::Close, 3.0, now);
        ledger.grids_mut()[0].close_orders.insert(close.client_id.clone(), close);
        ledger
    }

    #[test]
    fn test_restore_rebuilds_registry_and_back_references() {
        let ledger = ledger_with_orders();
        let state = GridState::capture("BTC-PERP", &ledger, None, Utc::now());

        let json = serde_json::to_string(&state).unwrap();
        let loaded: GridState = serde_json::from_str(&json).unwrap();
        let restored = loaded.restore().unwrap();

        assert!(restored.resumed);
        assert_eq!(restored.registry.len(), 2);
        let slot = restored.registry.get("open-1").unwrap();
        assert_eq!((slot.grid, slot.side), (1, Side::Open));
        let order = &restored.ledger.grids()[1].open_orders["open-1"];
        assert_eq!(order.grid, 1);
        assert_eq!(order.executed_qty, 4.0);
        assert_eq!(order.exchange_id, Some(77));
        assert_eq!(restored.ledger.grids()[0].close_orders["close-1"].grid, 0);
    }

    #[test]
    fn test_validate_rejects_overfilled_order() {
        let mut ledger = ledger_with_orders();
        ledger.grids_mut()[1]
            .open_orders
            .get_mut("open-1")
            .unwrap()
            .executed_qty = 11.0;
        let state = GridState::capture("BTC-PERP", &ledger, None, Utc::now());
        assert!(matches!(state.restore(), Err(GridError::CorruptState(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_keys_across_grids() {
        let mut ledger = ledger_with_orders();
        let dup = GridOrder::new("open-1", 0, Side::Open, 1.0, Utc::now());
        ledger.grids_mut()[0].open_orders.insert(dup.client_id.clone(), dup);
        let state = GridState::capture("BTC-PERP", &ledger, None, Utc::now());
        assert!(matches!(state.validate(), Err(GridError::CorruptState(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_prices() {
        let mut ledger = Ledger::from_ladder(&ladder());
        ledger.grids_mut()[0].open_price = 100.0;
        let state = GridState::capture("BTC-PERP", &ledger, None, Utc::now());
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_validate_against_ladder() {
        let ledger = Ledger::from_ladder(&ladder());
        let state = GridState::capture("BTC-PERP", &ledger, None, Utc::now());
        assert!(state.validate_against_ladder(&ladder()).is_ok());

        let other = LadderConfig::new("ETH-PERP", ladder().levels);
        assert!(state.validate_against_ladder(&other).is_err());
    }

    #[test]
    fn test_load_or_create_fresh_then_resume() {
        let store = MemoryStore::new();
        let fresh = load_or_create(&store, &ladder()).unwrap();
        assert!(!fresh.resumed);
        assert_eq!(fresh.ledger.grids()[0].open_chance, 10.0);

        let ledger = ledger_with_orders();
        store
            .save(&GridState::capture("BTC-PERP", &ledger, None, Utc::now()))
            .unwrap();
        let resumed = load_or_create(&store, &ladder()).unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.registry.len(), 2);
        assert_eq!(resumed.ledger.grids()[1].open_chance, 0.0);
    }

    #[test]
    fn test_load_or_create_refuses_corrupt_snapshot() {
        let store = MemoryStore::new();
        *store.slot.lock().unwrap() = Some("{not json".into());
        assert!(matches!(
            load_or_create(&store, &ladder()),
            Err(GridError::CorruptState(_))
        ));
    }

    #[test]
    fn test_json_file_store_atomic_save() {
        let path = std::env::temp_dir().join(format!("grid_state_{}.json", uuid::Uuid::new_v4()));
        let store = JsonFileStore::new(&path);
        assert!(store.load().unwrap().is_none());

        let ledger = ledger_with_orders();
        let quote = Quote::new(100.0, 100.5, 0.001);
        store
            .save(&GridState::capture("BTC-PERP", &ledger, Some(quote), Utc::now()))
            .unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.bid, 100.0);
        assert_eq!(loaded.grids.len(), 2);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_memory_store_failure_switch() {
        let store = MemoryStore::new();
        let state = GridState::capture("BTC-PERP", &Ledger::from_ladder(&ladder()), None, Utc::now());
        store.set_fail_saves(true);
        assert!(store.save(&state).is_err());
        store.set_fail_saves(false);
        store.save(&state).unwrap();
        assert_eq!(store.save_count(), 1);
    }
}
