//! Core data types for the grid engine

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange-assigned order identifier, normalized to a string at the transport boundary
pub type OrderId = String;

/// Order side for grid levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl From<&str> for OrderSide {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "B" | "BUY" => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rung of the price ladder. Built once by the planner and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLevel {
    index: u32,
    price: Decimal,
    side: OrderSide,
    size: Decimal,
}

impl GridLevel {
    pub(crate) fn new(index: u32, price: Decimal, side: OrderSide, size: Decimal) -> Self {
        Self {
            index,
            price,
            side,
            size,
        }
    }

    /// Index of this level (0 = lowest price)
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    /// Side assigned relative to the reference price at construction time
    pub fn side(&self) -> OrderSide {
        self.side
    }

    pub fn size(&self) -> Decimal {
        self.size
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// Lifecycle state of an order binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingState {
    /// Level needs an order, nothing sent yet
    Unplaced,
    /// Place request sent, waiting for the exchange order id
    Pending,
    /// Order resting on the book
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl BindingState {
    /// Filled, Cancelled and Rejected end the binding instance
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BindingState::Filled | BindingState::Cancelled | BindingState::Rejected
        )
    }

    /// A request is in flight or an order rests on the exchange
    pub fn is_live(&self) -> bool {
        matches!(self, BindingState::Pending | BindingState::Open)
    }
}

/// Live association between a grid level and at most one exchange order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBinding {
    pub level_index: u32,
    /// Side this binding works; a mirror may differ from the level's construction side
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<OrderId>,
    pub state: BindingState,
    pub last_known_filled_size: Decimal,
    /// Incremented on every local mutation
    pub version: u64,
    /// The engine asked for this order to be cancelled
    #[serde(default)]
    pub cancel_requested: bool,
    /// Place was refused by the risk guard; waits for the next price-level trigger
    #[serde(default)]
    pub risk_deferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

impl OrderBinding {
    /// Create an unplaced binding for a level
    pub fn unplaced(level: &GridLevel, side: OrderSide, version: u64) -> Self {
        Self {
            level_index: level.index(),
            side,
            price: level.price(),
            size: level.size(),
            exchange_order_id: None,
            state: BindingState::Unplaced,
            last_known_filled_size: Decimal::ZERO,
            version,
            cancel_requested: false,
            risk_deferred: false,
            reject_reason: None,
        }
    }

    pub fn remaining_size(&self) -> Decimal {
        (self.size - self.last_known_filled_size).max(Decimal::ZERO)
    }

    pub fn remaining_notional(&self) -> Decimal {
        self.remaining_size() * self.price
    }
}

/// Kind of corrective action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Place,
    Cancel,
    /// Cancel the resting order and place it again at the binding's price and size
    Replace,
}

/// Command produced by the engine and consumed exactly once by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationAction {
    pub kind: ActionKind,
    pub target_level: u32,
    pub expected_version: u64,
}

impl ReconciliationAction {
    pub fn place(target_level: u32, expected_version: u64) -> Self {
        Self {
            kind: ActionKind::Place,
            target_level,
            expected_version,
        }
    }

    pub fn cancel(target_level: u32, expected_version: u64) -> Self {
        Self {
            kind: ActionKind::Cancel,
            target_level,
            expected_version,
        }
    }

    pub fn replace(target_level: u32, expected_version: u64) -> Self {
        Self {
            kind: ActionKind::Replace,
            target_level,
            expected_version,
        }
    }
}

/// Process-wide engine status, always carrying the reason when not running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Running,
    /// Connectivity lost; ledger updates continue, no corrective actions
    Degraded { reason: String },
    /// Requires an explicit operator resume
    Halted { reason: String },
}

impl EngineStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, EngineStatus::Running)
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, EngineStatus::Halted { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            EngineStatus::Running => None,
            EngineStatus::Degraded { reason } | EngineStatus::Halted { reason } => Some(reason),
        }
    }
}

/// Fill notification normalized from the exchange stream
#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    pub order_id: OrderId,
    /// Size filled by this event only
    pub filled_delta: Decimal,
    /// Execution price, falls back to the order price when the venue omits it
    pub price: Option<Decimal>,
    pub event_seq: u64,
}

/// Events delivered by the exchange subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    Fill(FillEvent),
    /// The venue reports the order closed without a full fill
    Cancelled { order_id: OrderId, event_seq: u64 },
    ConnectionLost { reason: String },
    ConnectionRestored,
}

/// Acknowledgement of a place request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceAck {
    pub order_id: OrderId,
}

/// Acknowledgement of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Cancelled,
    /// The order was already filled or cancelled on the venue
    AlreadyClosed,
}

/// Open order as reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
}

/// Final status of an order found in the exchange history
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoricalStatus {
    Filled { filled_size: Decimal },
    Cancelled { filled_size: Decimal },
}

/// Closed order from the instrument's recent history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalOrder {
    pub order_id: OrderId,
    pub status: HistoricalStatus,
}
