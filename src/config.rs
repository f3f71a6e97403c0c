use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::grid::{GridConfig, GridResult};

/// Main configuration struct
///
/// Loaded from a file; environment variables override it, e.g.
/// `GRID__LOG__LEVEL=debug` or `GRID__GRID__REFERENCE_PRICE=101.5`.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Grid definition
    pub grid: GridConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Simulated market driving the paper exchange
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Price walk for paper runs. The price bounces between the grid bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    /// Starting price; the grid reference price when unset
    #[serde(default)]
    pub start_price: Option<Decimal>,
    /// Price change per tick
    #[serde(default = "default_paper_step")]
    pub step: Decimal,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Stop after this many ticks; run until Ctrl-C when unset
    #[serde(default)]
    pub max_ticks: Option<u64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            start_price: None,
            step: default_paper_step(),
            tick_interval_ms: default_tick_interval(),
            max_ticks: None,
        }
    }
}

fn default_paper_step() -> Decimal {
    Decimal::ONE
}

fn default_tick_interval() -> u64 {
    1000
}

impl Settings {
    /// Load settings from a configuration file plus `GRID__` environment overrides
    pub fn new(config_path: &str) -> GridResult<Self> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(Environment::with_prefix("GRID").separator("__"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.grid.validate()?;
        Ok(settings)
    }
}
