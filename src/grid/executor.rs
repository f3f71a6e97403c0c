//! Exchange abstraction for the grid engine - enables mocking for tests

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use super::config::RetryPolicy;
use super::errors::{GridError, GridResult};
use super::types::{
    CancelAck, ExchangeEvent, HistoricalOrder, OpenOrder, OrderId, OrderSide, PlaceAck,
};

/// Exchange operations trait - can be mocked for testing.
///
/// Implementations normalize venue payloads into the fixed shapes in
/// [`super::types`] before returning them.
#[async_trait]
pub trait GridExchange: Send + Sync {
    /// Place a limit order
    async fn place_order(
        &self,
        asset: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> GridResult<PlaceAck>;

    /// Cancel an order by id
    async fn cancel_order(&self, asset: &str, order_id: &OrderId) -> GridResult<CancelAck>;

    /// Orders currently resting for the asset
    async fn list_open_orders(&self, asset: &str) -> GridResult<Vec<OpenOrder>>;

    /// Recently closed orders for the asset
    async fn order_history(&self, asset: &str) -> GridResult<Vec<HistoricalOrder>>;

    /// Stream of fills, venue cancels and connectivity changes
    async fn subscribe_fills(&self, asset: &str) -> GridResult<mpsc::UnboundedReceiver<ExchangeEvent>>;
}

/// Execute with exponential backoff retry.
///
/// Only transport errors are retried; anything else is returned as is.
/// Running out of attempts yields [`GridError::ActionFailed`].
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> GridResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = GridResult<T>>,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempts += 1;
                if attempts >= policy.max_attempts {
                    return Err(GridError::ActionFailed {
                        attempts,
                        reason: e.to_string(),
                    });
                }

                let delay = policy.delay_for(attempts);
                warn!(
                    "Operation failed (attempt {}/{}), retrying in {}ms: {}",
                    attempts,
                    policy.max_attempts,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Bound a single call; an elapsed timer counts as a transport error
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = GridResult<T>>,
) -> GridResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GridError::Transport(format!(
            "request timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

// ============================================================================
// Paper exchange for tests and demos
// ============================================================================

/// In-process exchange that matches resting orders against a settable mid price.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use crate::grid::types::{FillEvent, HistoricalStatus};

    /// Mock exchange for testing
    pub struct MockExchange {
        pub open_orders: Arc<Mutex<Vec<OpenOrder>>>,
        pub history: Arc<Mutex<Vec<HistoricalOrder>>>,
        pub placed: Arc<Mutex<Vec<(OrderSide, Decimal, Decimal)>>>,
        pub cancelled_oids: Arc<Mutex<Vec<OrderId>>>,
        pub mid_price: Arc<Mutex<Decimal>>,
        pub should_fail: Arc<Mutex<bool>>,
        pub reject_reason: Arc<Mutex<Option<String>>>,
        pub history_unavailable: Arc<Mutex<bool>>,
        subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ExchangeEvent>>>>,
        fail_next: AtomicU32,
        next_oid: AtomicU64,
        next_seq: AtomicU64,
    }

    impl MockExchange {
        pub fn new(mid_price: Decimal) -> Self {
            Self {
                open_orders: Arc::new(Mutex::new(Vec::new())),
                history: Arc::new(Mutex::new(Vec::new())),
                placed: Arc::new(Mutex::new(Vec::new())),
                cancelled_oids: Arc::new(Mutex::new(Vec::new())),
                mid_price: Arc::new(Mutex::new(mid_price)),
                should_fail: Arc::new(Mutex::new(false)),
                reject_reason: Arc::new(Mutex::new(None)),
                history_unavailable: Arc::new(Mutex::new(false)),
                subscribers: Arc::new(Mutex::new(Vec::new())),
                fail_next: AtomicU32::new(0),
                next_oid: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
            }
        }

        pub async fn set_should_fail(&self, fail: bool) {
            *self.should_fail.lock().await = fail;
        }

        /// Fail the next `count` calls with a transport error
        pub fn fail_next(&self, count: u32) {
            self.fail_next.store(count, Ordering::SeqCst);
        }

        /// Reject every place request with `reason` until cleared
        pub async fn set_reject(&self, reason: Option<&str>) {
            *self.reject_reason.lock().await = reason.map(str::to_string);
        }

        pub async fn set_history_unavailable(&self, unavailable: bool) {
            *self.history_unavailable.lock().await = unavailable;
        }

        fn next_seq(&self) -> u64 {
            self.next_seq.fetch_add(1, Ordering::SeqCst)
        }

        /// Deliver an event to every subscriber
        pub async fn emit(&self, event: ExchangeEvent) {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }

        pub async fn disconnect(&self, reason: &str) {
            self.emit(ExchangeEvent::ConnectionLost {
                reason: reason.to_string(),
            })
            .await;
        }

        pub async fn reconnect(&self) {
            self.emit(ExchangeEvent::ConnectionRestored).await;
        }

        /// Close every subscription stream
        pub async fn drop_subscribers(&self) {
            self.subscribers.lock().await.clear();
        }

        /// Seed a resting order, e.g. one placed before a restart
        pub async fn insert_open_order(&self, order: OpenOrder) {
            self.open_orders.lock().await.push(order);
        }

        pub async fn open_order_count(&self) -> usize {
            self.open_orders.lock().await.len()
        }

        pub async fn find_open(&self, side: OrderSide, price: Decimal) -> Option<OpenOrder> {
            self.open_orders
                .lock()
                .await
                .iter()
                .find(|o| o.side == side && o.price == price)
                .cloned()
        }

        /// Fill `size` of a resting order and publish the fill
        pub async fn fill_order(&self, order_id: &str, size: Decimal) -> Option<FillEvent> {
            let fill = {
                let mut orders = self.open_orders.lock().await;
                let pos = orders.iter().position(|o| o.order_id == order_id)?;
                let order = &mut orders[pos];
                let delta = size.min(order.size - order.filled_size);
                order.filled_size += delta;
                let fill = FillEvent {
                    order_id: order.order_id.clone(),
                    filled_delta: delta,
                    price: Some(order.price),
                    event_seq: self.next_seq(),
                };
                if order.filled_size >= order.size {
                    let done = orders.remove(pos);
                    self.history.lock().await.push(HistoricalOrder {
                        order_id: done.order_id,
                        status: HistoricalStatus::Filled {
                            filled_size: done.filled_size,
                        },
                    });
                }
                fill
            };
            self.emit(ExchangeEvent::Fill(fill.clone())).await;
            Some(fill)
        }

        /// Cancel a resting order from the venue side
        pub async fn venue_cancel(&self, order_id: &str) -> bool {
            let removed = {
                let mut orders = self.open_orders.lock().await;
                match orders.iter().position(|o| o.order_id == order_id) {
                    Some(pos) => Some(orders.remove(pos)),
                    None => None,
                }
            };
            let Some(order) = removed else {
                return false;
            };
            self.history.lock().await.push(HistoricalOrder {
                order_id: order.order_id.clone(),
                status: HistoricalStatus::Cancelled {
                    filled_size: order.filled_size,
                },
            });
            self.emit(ExchangeEvent::Cancelled {
                order_id: order.order_id,
                event_seq: self.next_seq(),
            })
            .await;
            true
        }

        /// Move the mid price and fill every order it crosses
        pub async fn set_mid_price(&self, price: Decimal) -> Vec<FillEvent> {
            *self.mid_price.lock().await = price;

            let crossed: Vec<(OrderId, Decimal)> = self
                .open_orders
                .lock()
                .await
                .iter()
                .filter(|o| match o.side {
                    OrderSide::Buy => o.price >= price,
                    OrderSide::Sell => o.price <= price,
                })
                .map(|o| (o.order_id.clone(), o.size - o.filled_size))
                .collect();

            let mut fills = Vec::new();
            for (oid, remaining) in crossed {
                if let Some(fill) = self.fill_order(&oid, remaining).await {
                    fills.push(fill);
                }
            }
            fills
        }

        async fn check_failure(&self) -> GridResult<()> {
            let pending = self.fail_next.load(Ordering::SeqCst);
            if pending > 0 {
                self.fail_next.store(pending - 1, Ordering::SeqCst);
                return Err(GridError::Transport("Mock transient failure".into()));
            }
            if *self.should_fail.lock().await {
                return Err(GridError::Transport("Mock failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl GridExchange for MockExchange {
        async fn place_order(
            &self,
            _asset: &str,
            side: OrderSide,
            price: Decimal,
            size: Decimal,
        ) -> GridResult<PlaceAck> {
            self.check_failure().await?;
            if let Some(reason) = self.reject_reason.lock().await.clone() {
                return Err(GridError::OrderRejected(reason));
            }

            let order_id = format!("m-{}", self.next_oid.fetch_add(1, Ordering::SeqCst));
            self.placed.lock().await.push((side, price, size));
            self.open_orders.lock().await.push(OpenOrder {
                order_id: order_id.clone(),
                side,
                price,
                size,
                filled_size: Decimal::ZERO,
            });

            Ok(PlaceAck { order_id })
        }

        async fn cancel_order(&self, _asset: &str, order_id: &OrderId) -> GridResult<CancelAck> {
            self.check_failure().await?;
            self.cancelled_oids.lock().await.push(order_id.clone());
            if self.venue_cancel(order_id).await {
                Ok(CancelAck::Cancelled)
            } else {
                Ok(CancelAck::AlreadyClosed)
            }
        }

        async fn list_open_orders(&self, _asset: &str) -> GridResult<Vec<OpenOrder>> {
            self.check_failure().await?;
            Ok(self.open_orders.lock().await.clone())
        }

        async fn order_history(&self, _asset: &str) -> GridResult<Vec<HistoricalOrder>> {
            if *self.history_unavailable.lock().await {
                return Err(GridError::Transport("Mock history unavailable".into()));
            }
            self.check_failure().await?;
            Ok(self.history.lock().await.clone())
        }

        async fn subscribe_fills(
            &self,
            _asset: &str,
        ) -> GridResult<mpsc::UnboundedReceiver<ExchangeEvent>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscribers.lock().await.push(tx);
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockExchange;
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let policy = RetryPolicy::new(3, 1);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = with_retry(&policy, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GridError::Transport("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let policy = RetryPolicy::new(2, 1);
        let result: GridResult<()> =
            with_retry(&policy, || async { Err(GridError::Transport("down".into())) }).await;
        assert!(matches!(
            result,
            Err(GridError::ActionFailed { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let policy = RetryPolicy::new(5, 1);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: GridResult<()> = with_retry(&policy, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GridError::OrderRejected("insufficient balance".into()))
        })
        .await;

        assert!(matches!(result, Err(GridError::OrderRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transport() {
        let result: GridResult<()> = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(GridError::Transport(_))));
    }

    #[tokio::test]
    async fn test_mock_crossing_fills() {
        let exchange = MockExchange::new(dec!(100));
        let mut events = exchange.subscribe_fills("BTC").await.unwrap();

        let buy = exchange
            .place_order("BTC", OrderSide::Buy, dec!(95), dec!(1))
            .await
            .unwrap();
        exchange
            .place_order("BTC", OrderSide::Sell, dec!(105), dec!(1))
            .await
            .unwrap();

        let fills = exchange.set_mid_price(dec!(94)).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, buy.order_id);
        assert_eq!(exchange.open_order_count().await, 1);

        match events.recv().await {
            Some(ExchangeEvent::Fill(fill)) => assert_eq!(fill.filled_delta, dec!(1)),
            other => panic!("unexpected event {:?}", other),
        }

        let ack = exchange.cancel_order("BTC", &buy.order_id).await.unwrap();
        assert_eq!(ack, CancelAck::AlreadyClosed);
    }
}
