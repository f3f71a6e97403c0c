//! Execution dispatcher - turns reconciliation actions into exchange calls
//!
//! At most one transport call is in flight per level. Calls for different
//! levels run concurrently on a [`JoinSet`]. Results never touch the ledger:
//! they come back to the engine as [`EngineEvent::Dispatch`] outcomes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::config::RetryPolicy;
use super::engine::EngineEvent;
use super::errors::GridError;
use super::executor::{with_retry, with_timeout, GridExchange};
use super::types::{
    ActionKind, CancelAck, OrderBinding, OrderId, OrderSide, ReconciliationAction,
};

/// Result of one dispatched action, tagged with the binding version it was issued against
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    PlaceAcked {
        level: u32,
        version: u64,
        order_id: OrderId,
    },
    PlaceRejected {
        level: u32,
        version: u64,
        reason: String,
    },
    CancelAcked {
        level: u32,
        version: u64,
        ack: CancelAck,
    },
    ReplaceAcked {
        level: u32,
        version: u64,
        order_id: OrderId,
        size: Decimal,
    },
    /// Replace cancelled the old order but could not place the new one
    ReplaceIncomplete {
        level: u32,
        version: u64,
        reason: String,
    },
    ActionFailed {
        level: u32,
        version: u64,
        kind: ActionKind,
        reason: String,
    },
}

impl DispatchOutcome {
    pub fn level(&self) -> u32 {
        match self {
            DispatchOutcome::PlaceAcked { level, .. }
            | DispatchOutcome::PlaceRejected { level, .. }
            | DispatchOutcome::CancelAcked { level, .. }
            | DispatchOutcome::ReplaceAcked { level, .. }
            | DispatchOutcome::ReplaceIncomplete { level, .. }
            | DispatchOutcome::ActionFailed { level, .. } => *level,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            DispatchOutcome::PlaceAcked { version, .. }
            | DispatchOutcome::PlaceRejected { version, .. }
            | DispatchOutcome::CancelAcked { version, .. }
            | DispatchOutcome::ReplaceAcked { version, .. }
            | DispatchOutcome::ReplaceIncomplete { version, .. }
            | DispatchOutcome::ActionFailed { version, .. } => *version,
        }
    }
}

/// What happened to a submitted action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Dispatched,
    /// Level busy; kept until its in-flight call resolves
    Deferred,
    /// Version mismatch or nothing to act on
    Stale,
    /// Dispatcher is shutting down
    Closed,
}

/// Parameters captured from the binding when the action is dispatched
#[derive(Debug, Clone)]
struct DispatchRequest {
    action: ReconciliationAction,
    side: OrderSide,
    price: Decimal,
    size: Decimal,
    order_id: Option<OrderId>,
}

pub struct ExecutionDispatcher<E: GridExchange + 'static> {
    exchange: Arc<E>,
    asset: String,
    retry: RetryPolicy,
    request_timeout: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
    in_flight: HashMap<u32, ActionKind>,
    deferred: BTreeMap<u32, ActionKind>,
    tasks: JoinSet<()>,
    accepting: bool,
}

impl<E: GridExchange + 'static> ExecutionDispatcher<E> {
    pub fn new(
        exchange: Arc<E>,
        asset: impl Into<String>,
        retry: RetryPolicy,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            exchange,
            asset: asset.into(),
            retry,
            request_timeout,
            events,
            in_flight: HashMap::new(),
            deferred: BTreeMap::new(),
            tasks: JoinSet::new(),
            accepting: true,
        }
    }

    pub fn is_busy(&self, level: u32) -> bool {
        self.in_flight.contains_key(&level)
    }

    pub fn in_flight_kind(&self, level: u32) -> Option<ActionKind> {
        self.in_flight.get(&level).copied()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Remember an action for a busy level. A cancel supersedes anything
    /// deferred before it and is never displaced by a later place.
    pub fn defer(&mut self, level: u32, kind: ActionKind) {
        let merged = match (self.deferred.get(&level), kind) {
            (Some(ActionKind::Cancel), ActionKind::Place) => ActionKind::Cancel,
            (_, kind) => kind,
        };
        debug!("Deferred action: level={}, kind={:?}", level, merged);
        self.deferred.insert(level, merged);
    }

    /// Check the action against the binding and start the transport call
    pub fn submit(&mut self, action: ReconciliationAction, binding: &OrderBinding) -> Submission {
        if !self.accepting {
            return Submission::Closed;
        }
        if action.expected_version != binding.version {
            debug!(
                "Dropping stale action: level={}, kind={:?}, expected_version={}, current={}",
                action.target_level, action.kind, action.expected_version, binding.version
            );
            return Submission::Stale;
        }
        if self.is_busy(action.target_level) {
            self.defer(action.target_level, action.kind);
            return Submission::Deferred;
        }

        let (size, order_id) = match action.kind {
            ActionKind::Place => (binding.size, None),
            ActionKind::Cancel | ActionKind::Replace => match &binding.exchange_order_id {
                Some(oid) => (binding.remaining_size(), Some(oid.clone())),
                None => return Submission::Stale,
            },
        };

        let request = DispatchRequest {
            action,
            side: binding.side,
            price: binding.price,
            size,
            order_id,
        };

        self.in_flight
            .insert(request.action.target_level, request.action.kind);

        let exchange = self.exchange.clone();
        let asset = self.asset.clone();
        let retry = self.retry.clone();
        let timeout = self.request_timeout;
        let events = self.events.clone();

        self.tasks.spawn(async move {
            let outcome = execute(exchange.as_ref(), &asset, &retry, timeout, request).await;
            if events.send(EngineEvent::Dispatch(outcome)).is_err() {
                warn!("Engine gone before dispatch outcome could be delivered");
            }
        });

        Submission::Dispatched
    }

    /// Mark the level's call as resolved and hand back whatever was deferred for it
    pub fn complete(&mut self, level: u32) -> Option<ActionKind> {
        self.in_flight.remove(&level);
        self.deferred.remove(&level)
    }

    /// Drop deferred place and replace actions; deferred cancels are kept
    pub fn discard_deferred_places(&mut self) -> usize {
        let before = self.deferred.len();
        self.deferred.retain(|_, kind| *kind == ActionKind::Cancel);
        before - self.deferred.len()
    }

    pub fn discard_deferred(&mut self) -> usize {
        let count = self.deferred.len();
        self.deferred.clear();
        count
    }

    /// Reap finished tasks without blocking
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                warn!("Dispatch task failed: {}", e);
            }
        }
    }

    /// Wait for every in-flight call to finish, up to `limit`.
    /// Returns false if calls were still running and got aborted.
    pub async fn wait_idle(&mut self, limit: Duration) -> bool {
        let drained = tokio::time::timeout(limit, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Dispatch task failed: {}", e);
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                "Aborting {} in-flight exchange calls after {}ms",
                self.tasks.len(),
                limit.as_millis()
            );
            self.tasks.abort_all();
            // aborted calls will never report back
            self.in_flight.clear();
        }
        drained
    }

    /// Stop accepting new calls
    pub fn close(&mut self) {
        if self.accepting {
            info!(
                "Dispatcher closing: in_flight={}, deferred={}",
                self.in_flight.len(),
                self.deferred.len()
            );
        }
        self.accepting = false;
    }
}

async fn execute<E: GridExchange>(
    exchange: &E,
    asset: &str,
    retry: &RetryPolicy,
    timeout: Duration,
    request: DispatchRequest,
) -> DispatchOutcome {
    let level = request.action.target_level;
    let version = request.action.expected_version;
    let kind = request.action.kind;

    let failed = |reason: String| DispatchOutcome::ActionFailed {
        level,
        version,
        kind,
        reason,
    };

    match kind {
        ActionKind::Place => match place(exchange, asset, retry, timeout, &request).await {
            Ok(order_id) => DispatchOutcome::PlaceAcked {
                level,
                version,
                order_id,
            },
            Err(GridError::OrderRejected(reason)) => DispatchOutcome::PlaceRejected {
                level,
                version,
                reason,
            },
            Err(e) => failed(e.to_string()),
        },
        ActionKind::Cancel => match cancel(exchange, asset, retry, timeout, &request).await {
            Ok(ack) => DispatchOutcome::CancelAcked {
                level,
                version,
                ack,
            },
            Err(e) => failed(e.to_string()),
        },
        ActionKind::Replace => {
            match cancel(exchange, asset, retry, timeout, &request).await {
                Ok(CancelAck::Cancelled) => {}
                Ok(CancelAck::AlreadyClosed) => {
                    return DispatchOutcome::CancelAcked {
                        level,
                        version,
                        ack: CancelAck::AlreadyClosed,
                    }
                }
                Err(e) => return failed(e.to_string()),
            }
            match place(exchange, asset, retry, timeout, &request).await {
                Ok(order_id) => DispatchOutcome::ReplaceAcked {
                    level,
                    version,
                    order_id,
                    size: request.size,
                },
                Err(e) => DispatchOutcome::ReplaceIncomplete {
                    level,
                    version,
                    reason: e.to_string(),
                },
            }
        }
    }
}

async fn place<E: GridExchange>(
    exchange: &E,
    asset: &str,
    retry: &RetryPolicy,
    timeout: Duration,
    request: &DispatchRequest,
) -> Result<OrderId, GridError> {
    debug!(
        "Placing order: level={}, side={}, price={}, size={}",
        request.action.target_level, request.side, request.price, request.size
    );
    let ack = with_retry(retry, move || {
        with_timeout(
            timeout,
            exchange.place_order(asset, request.side, request.price, request.size),
        )
    })
    .await?;
    Ok(ack.order_id)
}

async fn cancel<E: GridExchange>(
    exchange: &E,
    asset: &str,
    retry: &RetryPolicy,
    timeout: Duration,
    request: &DispatchRequest,
) -> Result<CancelAck, GridError> {
    let Some(order_id) = request.order_id.as_ref() else {
        return Err(GridError::LevelNotFound(request.action.target_level));
    };
    debug!(
        "Cancelling order: level={}, oid={}",
        request.action.target_level, order_id
    );
    with_retry(retry, move || {
        with_timeout(timeout, exchange.cancel_order(asset, order_id))
    })
    .await
}
