//! Grid Ladder Module
//!
//! A ladder of price levels, each opening a position when price comes down
//! to its open price and closing it when price comes back up to its close
//! price. The hard part is bookkeeping: every level's committed capital
//! ("chance") must survive partial fills, rejections, replayed or missing
//! exchange notifications, and crashes without being lost or spent twice.
//!
//! # Architecture
//!
//! - [`config`] - Engine tuning and ladder definitions, with validation
//! - [`types`] - Sides, order updates, quotes, engine events
//! - [`errors`] - Grid-specific error types
//! - [`ledger`] - Levels and the only mutators allowed to move capital
//! - [`registry`] - Index of in-flight orders by idempotency key
//! - [`state`] - Snapshots with JSON persistence and restore
//! - [`executor`] - Exchange abstraction (mockable for testing)
//! - [`engine`] - Placement cycle, folds and reconciliation
//! - [`runner`] - Single-writer main loop
//! - [`clock`] - Time source
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use grid_ladder::grid::{
//!     load_or_create, Engine, EngineConfig, GridRunner, JsonFileStore, LadderConfig,
//! };
//!
//! let ladder = LadderConfig::load_from_file("ladder.json")?;
//! let store = JsonFileStore::new("grid_state.json");
//! let restored = load_or_create(&store, &ladder)?;
//!
//! let mut engine = Engine::new(&ladder.instrument, restored, EngineConfig::default(), Box::new(store));
//! engine.recover(exchange.as_ref()).await?;
//!
//! let runner = GridRunner::new(engine, exchange.clone(), exchange);
//! runner.shutdown_handle().trigger_on_signal();
//! runner.run().await?;
//! ```
//!
//! # Testing
//!
//! [`executor::mock::MockExchange`] implements both exchange traits with
//! scripted quotes, rejections, transport failures and lookups:
//!
//! ```rust,ignore
//! use grid_ladder::grid::executor::mock::MockExchange;
//!
//! let exchange = MockExchange::new(100.0, 100.5, 0.1);
//! exchange.set_reject(Some("post only would cross")).await;
//! let outcome = engine.check(&exchange, &exchange).await?;
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod ledger;
pub mod registry;
pub mod runner;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, LadderConfig, LevelConfig};
pub use engine::{
    CycleOutcome, Engine, LadderSummary, ReconcileReport, RuntimeLevel, RuntimeView, EPSILON,
};
pub use errors::{GridError, GridResult};
pub use executor::{MarketData, OrderGateway};
pub use ledger::{GridOrder, Ledger, TradeGrid};
pub use registry::{OrderRegistry, OrderSlot};
pub use runner::{EventSender, GridRunner, ShutdownHandle};
pub use state::{load_or_create, GridState, JsonFileStore, MemoryStore, Restored, StateStore};
pub use types::{
    EngineEvent, OrderStatus, OrderUpdate, PlaceOutcome, PlaceRequest, Quote, Side,
};
