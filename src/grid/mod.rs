//! Grid trading engine
//!
//! A fixed ladder of price levels with resting orders, kept in line with the
//! exchange across fills, cancels, disconnects and restarts.
//!
//! # Architecture
//!
//! - [`config`] - Grid configuration and validation
//! - [`types`] - Levels, bindings, exchange events
//! - [`errors`] - Engine error type
//! - [`planner`] - Derives the level ladder from the configuration
//! - [`ledger`] - Versioned per-level order bindings
//! - [`risk`] - Exposure limits, PnL and kill switch
//! - [`executor`] - Exchange abstraction, retry and timeout helpers, mock exchange
//! - [`dispatcher`] - Runs exchange calls, at most one per level
//! - [`recovery`] - Diffs the ledger against the exchange
//! - [`state`] - Snapshot persistence
//! - [`engine`] - Single-writer event loop tying everything together
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use grid_engine::grid::{GridConfig, GridSpacing, OrderSizing, ReconciliationEngine};
//! use grid_engine::grid::state::JsonFileSnapshotStore;
//!
//! let config = GridConfig::new(
//!     "BTC/USDT", dec!(90), dec!(110),
//!     GridSpacing::LevelCount(21), OrderSizing::Base(dec!(0.01)), dec!(100),
//! );
//! let store = Arc::new(JsonFileSnapshotStore::new(GridConfig::generate_state_filename(&config.asset)));
//! let engine = ReconciliationEngine::new(config, exchange, store).await?;
//! let handle = engine.handle();
//! tokio::spawn(engine.run());
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod ledger;
pub mod planner;
pub mod recovery;
pub mod risk;
pub mod state;
pub mod types;

pub use config::{
    ExposureLimit, GridConfig, GridSpacing, OrderSizing, RetryPolicy, RiskLimits,
};
pub use engine::{
    EngineEvent, EngineHandle, EngineView, Flow, OperatorCommand, ReconciliationEngine,
};
pub use errors::{GridError, GridResult};
pub use executor::GridExchange;
pub use ledger::OrderLedger;
pub use planner::GridPlanner;
pub use risk::{PnlTracker, RiskGuard};
pub use state::{EngineSnapshot, JsonFileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use types::{
    BindingState, EngineStatus, ExchangeEvent, FillEvent, GridLevel, OrderBinding, OrderSide,
};
