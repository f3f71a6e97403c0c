//! Grid engine configuration

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// Upper bound on the number of levels a grid may produce
pub const MAX_LEVELS: usize = 1000;

/// How the price range is divided into levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridSpacing {
    /// Uniform spacing with this many levels, both bounds included
    LevelCount(u32),
    /// Uniform spacing with a fixed price step starting at the lower bound
    FixedStep(Decimal),
    /// Geometric spacing: each level is this many percent above the previous one
    PercentStep(Decimal),
}

/// How much to trade at each level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSizing {
    /// Same base-asset size at every level
    Base(Decimal),
    /// Same quote value at every level: lower prices buy more units
    Quote(Decimal),
}

/// Exposure cap for open orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureLimit {
    /// Sum of price * remaining size across open orders
    Notional(Decimal),
    /// Sum of remaining base size across open orders
    BaseSize(Decimal),
}

impl ExposureLimit {
    pub fn cap(&self) -> Decimal {
        match self {
            ExposureLimit::Notional(v) | ExposureLimit::BaseSize(v) => *v,
        }
    }

    /// Exposure contributed by an order of `size` at `price`
    pub fn measure(&self, price: Decimal, size: Decimal) -> Decimal {
        match self {
            ExposureLimit::Notional(_) => price * size,
            ExposureLimit::BaseSize(_) => size,
        }
    }
}

/// Global risk thresholds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_exposure: Option<ExposureLimit>,

    /// Drawdown from peak equity (quote currency) that halts the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_switch_drawdown: Option<Decimal>,

    /// Total profit (realized + unrealized) at which the engine halts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,

    /// Unrealized loss (quote currency) at which the engine halts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,

    /// Percent move in the position's favour from its average entry price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_price_take_profit_pct: Option<Decimal>,

    /// Percent move against the position from its average entry price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_price_stop_loss_pct: Option<Decimal>,
}

/// Bounded exponential backoff for transport calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_retry_max_delay() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_retry_base_delay(),
            max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: default_retry_max_delay(),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Grid engine configuration, produced and validated before the engine starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Instrument to trade (e.g., "BTC/USDT")
    pub asset: String,

    pub lower_price: Decimal,
    pub upper_price: Decimal,

    pub spacing: GridSpacing,

    pub sizing: OrderSizing,

    /// Price splitting the ladder into buys (at or below) and sells (above)
    pub reference_price: Decimal,

    /// Decimal places prices are rounded to
    #[serde(default = "default_decimals")]
    pub price_decimals: u32,

    /// Decimal places sizes are truncated to
    #[serde(default = "default_decimals")]
    pub size_decimals: u32,

    #[serde(default)]
    pub risk: RiskLimits,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-call transport timeout (milliseconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// How long shutdown waits for in-flight calls (milliseconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Snapshot file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

fn default_decimals() -> u32 {
    8
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_shutdown_grace() -> u64 {
    5_000
}

impl GridConfig {
    /// Create a configuration with required parameters and default tuning
    pub fn new(
        asset: impl Into<String>,
        lower_price: Decimal,
        upper_price: Decimal,
        spacing: GridSpacing,
        sizing: OrderSizing,
        reference_price: Decimal,
    ) -> Self {
        Self {
            asset: asset.into(),
            lower_price,
            upper_price,
            spacing,
            sizing,
            reference_price,
            price_decimals: default_decimals(),
            size_decimals: default_decimals(),
            risk: RiskLimits::default(),
            retry: RetryPolicy::default(),
            request_timeout_ms: default_request_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            state_file: None,
        }
    }

    /// Generate a snapshot filename based on asset and timestamp
    ///
    /// Format: `grid_{asset}_{YYYYMMDD_HHMMSS}.json`
    pub fn generate_state_filename(asset: &str) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let safe_asset = asset.replace('/', "-");
        PathBuf::from(format!("grid_{safe_asset}_{timestamp}.json"))
    }

    /// Builder: set price/size precision
    pub fn with_precision(mut self, price_decimals: u32, size_decimals: u32) -> Self {
        self.price_decimals = price_decimals;
        self.size_decimals = size_decimals;
        self
    }

    /// Builder: set the exposure cap
    pub fn with_max_exposure(mut self, limit: ExposureLimit) -> Self {
        self.risk.max_exposure = Some(limit);
        self
    }

    /// Builder: set the drawdown kill switch
    pub fn with_kill_switch(mut self, drawdown: Decimal) -> Self {
        self.risk.kill_switch_drawdown = Some(drawdown);
        self
    }

    /// Builder: set retry parameters
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder: set per-call timeout
    pub fn with_request_timeout(mut self, millis: u64) -> Self {
        self.request_timeout_ms = millis;
        self
    }

    /// Builder: set snapshot file path
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.asset.is_empty() {
            return Err(GridError::InvalidConfiguration("asset cannot be empty".into()));
        }

        if self.lower_price <= Decimal::ZERO {
            return Err(GridError::InvalidConfiguration(
                "lower_price must be positive".into(),
            ));
        }

        if self.lower_price >= self.upper_price {
            return Err(GridError::InvalidConfiguration(
                "lower_price must be less than upper_price".into(),
            ));
        }

        match self.spacing {
            GridSpacing::LevelCount(count) if count < 2 => {
                return Err(GridError::InvalidConfiguration(
                    "level count must be at least 2".into(),
                ));
            }
            GridSpacing::FixedStep(step) | GridSpacing::PercentStep(step)
                if step <= Decimal::ZERO =>
            {
                return Err(GridError::InvalidConfiguration(
                    "spacing must be positive".into(),
                ));
            }
            _ => {}
        }

        if self.reference_price < self.lower_price || self.reference_price > self.upper_price {
            return Err(GridError::InvalidConfiguration(format!(
                "reference_price {} outside [{}, {}]",
                self.reference_price, self.lower_price, self.upper_price
            )));
        }

        let sizing_amount = match self.sizing {
            OrderSizing::Base(size) => size,
            OrderSizing::Quote(amount) => amount,
        };
        if sizing_amount <= Decimal::ZERO {
            return Err(GridError::InvalidConfiguration(
                "order size must be positive".into(),
            ));
        }

        if let Some(limit) = self.risk.max_exposure {
            if limit.cap() <= Decimal::ZERO {
                return Err(GridError::InvalidConfiguration(
                    "max_exposure must be positive".into(),
                ));
            }
        }

        let thresholds = [
            ("kill_switch_drawdown", self.risk.kill_switch_drawdown),
            ("take_profit", self.risk.take_profit),
            ("stop_loss", self.risk.stop_loss),
            ("avg_price_take_profit_pct", self.risk.avg_price_take_profit_pct),
            ("avg_price_stop_loss_pct", self.risk.avg_price_stop_loss_pct),
        ];
        for (name, value) in thresholds {
            if value.is_some_and(|v| v <= Decimal::ZERO) {
                return Err(GridError::InvalidConfiguration(format!(
                    "{} must be positive",
                    name
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(GridError::InvalidConfiguration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Load config from JSON file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> GridConfig {
        GridConfig::new(
            "BTC/USDT",
            dec!(90),
            dec!(110),
            GridSpacing::LevelCount(3),
            OrderSizing::Base(dec!(1)),
            dec!(100),
        )
    }

    #[test]
    fn test_config_validation() {
        assert!(base_config().validate().is_ok());

        let mut config = base_config();
        config.lower_price = dec!(120);
        assert!(matches!(
            config.validate(),
            Err(GridError::InvalidConfiguration(_))
        ));

        let mut config = base_config();
        config.spacing = GridSpacing::LevelCount(1);
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.spacing = GridSpacing::FixedStep(dec!(0));
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.spacing = GridSpacing::PercentStep(dec!(-1));
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.reference_price = dec!(111);
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.sizing = OrderSizing::Quote(dec!(0));
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.risk.avg_price_stop_loss_pct = Some(dec!(-2));
        assert!(matches!(
            config.validate(),
            Err(GridError::InvalidConfiguration(msg)) if msg.contains("avg_price_stop_loss_pct")
        ));
    }

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy::new(5, 100);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(30), Duration::from_millis(5_000));
    }

    #[test]
    fn test_exposure_measure() {
        let notional = ExposureLimit::Notional(dec!(1000));
        let units = ExposureLimit::BaseSize(dec!(3));
        assert_eq!(notional.measure(dec!(100), dec!(2)), dec!(200));
        assert_eq!(units.measure(dec!(100), dec!(2)), dec!(2));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = base_config().with_kill_switch(dec!(50));
        let path = std::env::temp_dir().join(format!("grid_config_{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = GridConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_file(&path);
    }
}
