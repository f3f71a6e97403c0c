//! Grid-specific error types

use thiserror::Error;

use super::types::OrderId;

/// Errors that can occur in grid engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Grid level not found: index {0}")]
    LevelNotFound(u32),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Order rejected by exchange: {0}")]
    OrderRejected(String),

    #[error("Risk limit exceeded: {0}")]
    RiskRejected(String),

    #[error("Unknown exchange orders require manual review: {0:?}")]
    UnknownOrder(Vec<OrderId>),

    #[error("Recovery incomplete: {0}")]
    RecoveryIncomplete(String),

    #[error("Ledger inconsistency: {0}")]
    LogicInconsistency(String),

    #[error("State persistence error: {0}")]
    Persistence(String),

    #[error("Action failed after {attempts} attempts: {reason}")]
    ActionFailed { attempts: u32, reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GridError {
    /// Whether the dispatcher may retry the call that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::Transport(_))
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::Persistence(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::Config(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
