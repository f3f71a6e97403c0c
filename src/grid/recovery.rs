//! Recovery coordinator - converges the ledger with the exchange's open orders
//!
//! Runs on startup, after a reconnect and on operator resume. The result is a
//! [`RecoveryPlan`] that the engine applies before reading any live event.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rust_decimal::Decimal;

use super::config::RetryPolicy;
use super::errors::{GridError, GridResult};
use super::executor::{with_retry, with_timeout, GridExchange};
use super::ledger::OrderLedger;
use super::types::{BindingState, HistoricalOrder, HistoricalStatus, OpenOrder, OrderId, OrderSide};

/// Exchange order to bind to a level
#[derive(Debug, Clone, PartialEq)]
pub struct Adoption {
    pub level: u32,
    pub side: OrderSide,
    pub order_id: OrderId,
    pub filled_size: Decimal,
}

/// A ledger-only order whose fate was looked up
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub level: u32,
    /// Fill not yet reflected in the ledger
    pub unseen_fill: Decimal,
}

/// Corrective plan computed from the three-way diff
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryPlan {
    /// Exchange-only orders matching a free grid slot
    pub adopt: Vec<Adoption>,
    /// Consistent orders that filled further while we were not listening
    pub fill_updates: Vec<Resolution>,
    /// Ledger-only orders the history reports as filled
    pub filled: Vec<Resolution>,
    /// Ledger-only orders that are cancelled, missing or could not be looked up
    pub cancelled: Vec<Resolution>,
    /// Place requests that never reached the book
    pub reset_pending: Vec<u32>,
    /// Exchange orders that fit no grid slot
    pub unknown: Vec<OrderId>,
    pub consistent: usize,
}

impl RecoveryPlan {
    pub fn is_noop(&self) -> bool {
        self.adopt.is_empty()
            && self.fill_updates.is_empty()
            && self.filled.is_empty()
            && self.cancelled.is_empty()
            && self.reset_pending.is_empty()
            && self.unknown.is_empty()
    }
}

pub struct RecoveryCoordinator<E: GridExchange> {
    exchange: Arc<E>,
    asset: String,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl<E: GridExchange> RecoveryCoordinator<E> {
    pub fn new(
        exchange: Arc<E>,
        asset: impl Into<String>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            asset: asset.into(),
            retry,
            request_timeout,
        }
    }

    /// Query the exchange and build the plan for `ledger`
    pub async fn plan(&self, ledger: &OrderLedger) -> GridResult<RecoveryPlan> {
        let exchange = self.exchange.as_ref();
        let asset = self.asset.as_str();
        let timeout = self.request_timeout;

        let open = with_retry(&self.retry, move || {
            with_timeout(timeout, exchange.list_open_orders(asset))
        })
        .await
        .map_err(|e| GridError::RecoveryIncomplete(format!("open orders unavailable: {e}")))?;

        let exchange_ids: HashSet<&str> = open.iter().map(|o| o.order_id.as_str()).collect();
        let needs_history = ledger.bindings().any(|b| {
            b.state == BindingState::Open
                && b.exchange_order_id
                    .as_deref()
                    .is_some_and(|oid| !exchange_ids.contains(oid))
        });

        let history = if needs_history {
            match with_retry(&self.retry, move || {
                with_timeout(timeout, exchange.order_history(asset))
            })
            .await
            {
                Ok(history) => Some(history),
                Err(e) => {
                    warn!("Order history unavailable, treating missing orders as cancelled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let plan = diff(ledger, &open, history.as_deref());
        info!(
            "Recovery plan: open_orders={}, consistent={}, adopt={}, filled={}, cancelled={}, reset={}, unknown={}",
            open.len(),
            plan.consistent,
            plan.adopt.len(),
            plan.filled.len(),
            plan.cancelled.len(),
            plan.reset_pending.len(),
            plan.unknown.len()
        );
        Ok(plan)
    }
}

/// Three-way diff between ledger bindings and the exchange's open orders
pub fn diff(
    ledger: &OrderLedger,
    open: &[OpenOrder],
    history: Option<&[HistoricalOrder]>,
) -> RecoveryPlan {
    let mut plan = RecoveryPlan::default();
    let open_by_id: HashMap<&str, &OpenOrder> =
        open.iter().map(|o| (o.order_id.as_str(), o)).collect();
    let history_by_id: HashMap<&str, &HistoricalStatus> = history
        .unwrap_or_default()
        .iter()
        .map(|h| (h.order_id.as_str(), &h.status))
        .collect();

    // ledger side: consistent or ledger-only
    for binding in ledger.bindings() {
        if binding.state != BindingState::Open {
            continue;
        }
        let Some(oid) = binding.exchange_order_id.as_deref() else {
            continue;
        };

        if let Some(order) = open_by_id.get(oid) {
            plan.consistent += 1;
            if order.filled_size > binding.last_known_filled_size {
                plan.fill_updates.push(Resolution {
                    level: binding.level_index,
                    unseen_fill: order.filled_size - binding.last_known_filled_size,
                });
            }
            continue;
        }

        match history_by_id.get(oid) {
            Some(HistoricalStatus::Filled { filled_size }) => plan.filled.push(Resolution {
                level: binding.level_index,
                unseen_fill: (*filled_size - binding.last_known_filled_size).max(Decimal::ZERO),
            }),
            Some(HistoricalStatus::Cancelled { filled_size }) => plan.cancelled.push(Resolution {
                level: binding.level_index,
                unseen_fill: (*filled_size - binding.last_known_filled_size).max(Decimal::ZERO),
            }),
            None => plan.cancelled.push(Resolution {
                level: binding.level_index,
                unseen_fill: Decimal::ZERO,
            }),
        }
    }

    // exchange side: orders the ledger does not know
    let mut claimed: HashSet<u32> = HashSet::new();
    for order in open {
        if ledger.level_for_order(&order.order_id).is_some() {
            continue;
        }

        let slot = ledger.levels().iter().find(|level| {
            level.price() == order.price
                && level.size() == order.size
                && !claimed.contains(&level.index())
                && match ledger.binding(level.index()) {
                    None => true,
                    Some(b) => match b.state {
                        BindingState::Unplaced | BindingState::Pending => b.side == order.side,
                        BindingState::Open => false,
                        _ => true,
                    },
                }
        });

        match slot {
            Some(level) => {
                claimed.insert(level.index());
                plan.adopt.push(Adoption {
                    level: level.index(),
                    side: order.side,
                    order_id: order.order_id.clone(),
                    filled_size: order.filled_size,
                });
            }
            None => {
                warn!(
                    "Unknown exchange order needs manual review: oid={}, side={}, price={}, size={}",
                    order.order_id, order.side, order.price, order.size
                );
                plan.unknown.push(order.order_id.clone());
            }
        }
    }

    // place requests whose order never showed up
    for binding in ledger.bindings() {
        if binding.state == BindingState::Pending && !claimed.contains(&binding.level_index) {
            plan.reset_pending.push(binding.level_index);
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::ledger::{BindingEvent, BindingEventKind};
    use crate::grid::types::GridLevel;
    use rust_decimal_macros::dec;

    fn ledger() -> OrderLedger {
        let mut ledger = OrderLedger::new(vec![
            GridLevel::new(0, dec!(90), OrderSide::Buy, dec!(1)),
            GridLevel::new(1, dec!(100), OrderSide::Buy, dec!(1)),
            GridLevel::new(2, dec!(110), OrderSide::Sell, dec!(1)),
        ]);
        ledger.seed(dec!(100));
        ledger
    }

    fn open_level(ledger: &mut OrderLedger, index: u32, oid: &str) {
        let v = ledger.binding_version(index).unwrap();
        ledger
            .apply(index, BindingEvent::new(v, BindingEventKind::Submitted))
            .unwrap();
        ledger
            .apply(
                index,
                BindingEvent::new(v + 1, BindingEventKind::Acknowledged { order_id: oid.into() }),
            )
            .unwrap();
    }

    fn resting(oid: &str, side: OrderSide, price: Decimal) -> OpenOrder {
        OpenOrder {
            order_id: oid.into(),
            side,
            price,
            size: dec!(1),
            filled_size: dec!(0),
        }
    }

    #[test]
    fn test_consistent_orders_need_nothing() {
        let mut ledger = ledger();
        open_level(&mut ledger, 0, "a");
        open_level(&mut ledger, 1, "b");

        let open = vec![
            resting("a", OrderSide::Buy, dec!(90)),
            resting("b", OrderSide::Buy, dec!(100)),
        ];
        let plan = diff(&ledger, &open, None);
        assert!(plan.is_noop());
        assert_eq!(plan.consistent, 2);
    }

    #[test]
    fn test_missing_order_resolved_from_history() {
        let mut ledger = ledger();
        open_level(&mut ledger, 0, "a");
        open_level(&mut ledger, 1, "b");

        let open = vec![resting("a", OrderSide::Buy, dec!(90))];
        let history = vec![HistoricalOrder {
            order_id: "b".into(),
            status: HistoricalStatus::Filled { filled_size: dec!(1) },
        }];
        let plan = diff(&ledger, &open, Some(&history));
        assert_eq!(
            plan.filled,
            vec![Resolution {
                level: 1,
                unseen_fill: dec!(1)
            }]
        );

        // no history at all: treated as cancelled
        let plan = diff(&ledger, &open, None);
        assert_eq!(plan.cancelled.len(), 1);
        assert_eq!(plan.cancelled[0].level, 1);
    }

    #[test]
    fn test_exchange_only_orders() {
        let mut ledger = ledger();
        open_level(&mut ledger, 0, "a");
        // level 1 sent a place whose ack was lost
        let v = ledger.binding_version(1).unwrap();
        ledger
            .apply(1, BindingEvent::new(v, BindingEventKind::Submitted))
            .unwrap();

        let open = vec![
            resting("a", OrderSide::Buy, dec!(90)),
            resting("lost-ack", OrderSide::Buy, dec!(100)),
            resting("gap", OrderSide::Sell, dec!(110)),
            resting("dup", OrderSide::Buy, dec!(90)),
            resting("stray", OrderSide::Buy, dec!(95)),
        ];
        let plan = diff(&ledger, &open, None);

        let adopted: Vec<_> = plan.adopt.iter().map(|a| (a.level, a.order_id.as_str())).collect();
        assert_eq!(adopted, vec![(1, "lost-ack"), (2, "gap")]);
        assert_eq!(plan.unknown, vec!["dup".to_string(), "stray".to_string()]);
        assert!(plan.reset_pending.is_empty());
    }

    #[test]
    fn test_pending_without_order_resets() {
        let mut ledger = ledger();
        let v = ledger.binding_version(0).unwrap();
        ledger
            .apply(0, BindingEvent::new(v, BindingEventKind::Submitted))
            .unwrap();

        let plan = diff(&ledger, &[], None);
        assert_eq!(plan.reset_pending, vec![0]);
    }

    #[tokio::test]
    async fn test_list_failure_is_incomplete() {
        let exchange = Arc::new(MockExchange::new(dec!(100)));
        exchange.set_should_fail(true).await;
        let coordinator = RecoveryCoordinator::new(
            exchange,
            "BTC/USDT",
            RetryPolicy::new(2, 1),
            Duration::from_millis(100),
        );

        let result = coordinator.plan(&ledger()).await;
        assert!(matches!(result, Err(GridError::RecoveryIncomplete(_))));
    }

    #[tokio::test]
    async fn test_history_unavailable_cancels() {
        let exchange = Arc::new(MockExchange::new(dec!(100)));
        exchange.set_history_unavailable(true).await;
        let coordinator = RecoveryCoordinator::new(
            exchange,
            "BTC/USDT",
            RetryPolicy::new(2, 1),
            Duration::from_millis(100),
        );

        let mut ledger = ledger();
        open_level(&mut ledger, 1, "gone");
        let plan = coordinator.plan(&ledger).await.unwrap();
        assert_eq!(plan.cancelled.len(), 1);
        assert!(plan.filled.is_empty());
    }
}
