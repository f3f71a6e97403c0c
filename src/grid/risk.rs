//! Risk guard - exposure limit, drawdown kill switch and profit tracking

use std::collections::BTreeMap;

use log::{info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::config::{ExposureLimit, RiskLimits};
use super::errors::{GridError, GridResult};
use super::types::{BindingState, OrderBinding, OrderSide};

/// Average-cost position and PnL for the traded asset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlTracker {
    /// Signed base position (negative = short)
    pub position: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    /// Quote volume traded
    pub volume: Decimal,
    /// Fills that closed (part of) an opposite position
    pub round_trips: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<Decimal>,
    /// Highest equity seen since start or last re-arm
    pub peak_equity: Decimal,
}

impl PnlTracker {
    pub fn record_fill(&mut self, side: OrderSide, price: Decimal, size: Decimal) {
        if size <= Decimal::ZERO {
            return;
        }
        self.volume += price * size;

        let direction = match side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        };
        let signed = size * direction;

        // portion of this fill that reduces the existing position
        let closing = if self.position.is_sign_positive() == signed.is_sign_positive()
            || self.position.is_zero()
        {
            Decimal::ZERO
        } else {
            size.min(self.position.abs())
        };

        if closing > Decimal::ZERO {
            let pnl = match side {
                OrderSide::Sell => (price - self.avg_entry_price) * closing,
                OrderSide::Buy => (self.avg_entry_price - price) * closing,
            };
            self.realized_pnl += pnl;
            self.round_trips += 1;
        }

        let opening = size - closing;
        let remaining = self.position + direction * closing;
        if opening > Decimal::ZERO {
            let held = remaining.abs();
            self.avg_entry_price =
                (self.avg_entry_price * held + price * opening) / (held + opening);
            self.position = remaining + direction * opening;
        } else {
            self.position = remaining;
        }
        if self.position.is_zero() {
            self.avg_entry_price = Decimal::ZERO;
        }

        self.update_peak();
    }

    pub fn mark(&mut self, price: Decimal) {
        self.mark_price = Some(price);
        self.update_peak();
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        match self.mark_price {
            Some(mark) if !self.position.is_zero() => (mark - self.avg_entry_price) * self.position,
            _ => Decimal::ZERO,
        }
    }

    pub fn equity(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl()
    }

    /// Percent the mark has moved in the position's favour since entry;
    /// negative when it moved against it.
    pub fn entry_move_pct(&self) -> Option<Decimal> {
        let mark = self.mark_price?;
        if self.position.is_zero() || self.avg_entry_price <= Decimal::ZERO {
            return None;
        }
        let change = (mark - self.avg_entry_price) / self.avg_entry_price * Decimal::ONE_HUNDRED;
        Some(if self.position.is_sign_negative() {
            -change
        } else {
            change
        })
    }

    pub fn drawdown(&self) -> Decimal {
        (self.peak_equity - self.equity()).max(Decimal::ZERO)
    }

    fn update_peak(&mut self) {
        self.peak_equity = self.peak_equity.max(self.equity());
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Reservation {
    exposure: Decimal,
    /// First snapshot write that records the venue acknowledgement
    acked_at: Option<u64>,
}

/// Exposure accounting plus halt thresholds
#[derive(Debug, Clone)]
pub struct RiskGuard {
    limits: RiskLimits,
    reserved: BTreeMap<u32, Reservation>,
    committed: BTreeMap<u32, Decimal>,
    pnl: PnlTracker,
    rejections: u32,
}

impl RiskGuard {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            reserved: BTreeMap::new(),
            committed: BTreeMap::new(),
            pnl: PnlTracker::default(),
            rejections: 0,
        }
    }

    fn measure(&self, price: Decimal, size: Decimal) -> Decimal {
        match self.limits.max_exposure {
            Some(limit) => limit.measure(price, size),
            None => price * size,
        }
    }

    /// Reserved plus committed exposure across all levels
    pub fn exposure(&self) -> Decimal {
        self.reserved_exposure() + self.committed_exposure()
    }

    pub fn reserved_exposure(&self) -> Decimal {
        self.reserved.values().map(|r| r.exposure).sum()
    }

    pub fn committed_exposure(&self) -> Decimal {
        self.committed.values().copied().sum()
    }

    /// Admit an order for `level`, reserving its exposure.
    ///
    /// Anything the level already held is replaced, so a re-quote only counts once.
    pub fn admit(&mut self, level: u32, price: Decimal, size: Decimal) -> GridResult<()> {
        let candidate = self.measure(price, size);

        if let Some(limit) = self.limits.max_exposure {
            let others = self.exposure() - self.level_exposure(level);
            if others + candidate > limit.cap() {
                let unit = match limit {
                    ExposureLimit::Notional(_) => "notional",
                    ExposureLimit::BaseSize(_) => "base size",
                };
                return Err(GridError::RiskRejected(format!(
                    "level {} would raise {} exposure to {} (limit {})",
                    level,
                    unit,
                    others + candidate,
                    limit.cap()
                )));
            }
        }

        self.committed.remove(&level);
        self.reserved.insert(
            level,
            Reservation {
                exposure: candidate,
                acked_at: None,
            },
        );
        Ok(())
    }

    fn level_exposure(&self, level: u32) -> Decimal {
        self.reserved.get(&level).map(|r| r.exposure).unwrap_or_default()
            + self.committed.get(&level).copied().unwrap_or_default()
    }

    /// Venue accepted the level's order; it becomes committed once snapshot
    /// `write_seq` is durable.
    pub fn acknowledge(&mut self, level: u32, write_seq: u64) {
        if let Some(reservation) = self.reserved.get_mut(&level) {
            reservation.acked_at = Some(write_seq);
        }
    }

    /// Snapshot `write_seq` was persisted
    pub fn commit_through(&mut self, write_seq: u64) {
        let ready: Vec<u32> = self
            .reserved
            .iter()
            .filter(|(_, r)| r.acked_at.is_some_and(|seq| seq <= write_seq))
            .map(|(level, _)| *level)
            .collect();
        for level in ready {
            if let Some(reservation) = self.reserved.remove(&level) {
                self.committed.insert(level, reservation.exposure);
            }
        }
    }

    /// A partial or complete fill shrinks the level's open exposure
    pub fn reduce(&mut self, level: u32, price: Decimal, filled: Decimal) {
        let delta = self.measure(price, filled);
        if let Some(reservation) = self.reserved.get_mut(&level) {
            reservation.exposure = (reservation.exposure - delta).max(Decimal::ZERO);
        } else if let Some(exposure) = self.committed.get_mut(&level) {
            *exposure = (*exposure - delta).max(Decimal::ZERO);
        }
    }

    /// The level's order reached a terminal state
    pub fn release(&mut self, level: u32) {
        self.reserved.remove(&level);
        self.committed.remove(&level);
    }

    pub fn on_rejected(&mut self, level: u32, reason: &str) {
        self.rejections += 1;
        self.release(level);
        warn!(
            "Order rejected by venue: level={}, reason={}, total_rejections={}",
            level, reason, self.rejections
        );
    }

    pub fn rejections(&self) -> u32 {
        self.rejections
    }

    /// Rebuild exposure from the ledger after recovery; every live binding
    /// counts as committed.
    pub fn rebuild<'a>(&mut self, bindings: impl Iterator<Item = &'a OrderBinding>) {
        self.reserved.clear();
        self.committed.clear();
        for binding in bindings.filter(|b| b.state.is_live()) {
            let exposure = self.measure(binding.price, binding.remaining_size());
            if binding.state == BindingState::Pending {
                self.reserved.insert(
                    binding.level_index,
                    Reservation {
                        exposure,
                        acked_at: None,
                    },
                );
            } else {
                self.committed.insert(binding.level_index, exposure);
            }
        }
    }

    pub fn record_fill(&mut self, side: OrderSide, price: Decimal, size: Decimal) {
        self.pnl.record_fill(side, price, size);
    }

    pub fn mark(&mut self, price: Decimal) {
        self.pnl.mark(price);
    }

    pub fn pnl(&self) -> &PnlTracker {
        &self.pnl
    }

    pub fn restore_pnl(&mut self, pnl: PnlTracker) {
        self.pnl = pnl;
    }

    /// Reset the drawdown reference to current equity, used on operator resume
    pub fn rearm(&mut self) {
        self.pnl.peak_equity = self.pnl.equity();
        info!(
            "Risk guard re-armed: equity={}, position={}",
            self.pnl.peak_equity, self.pnl.position
        );
    }

    /// Reason to halt the engine, if a threshold has been crossed
    pub fn halt_reason(&self) -> Option<String> {
        if let Some(limit) = self.limits.kill_switch_drawdown {
            let drawdown = self.pnl.drawdown();
            if drawdown >= limit {
                return Some(format!(
                    "kill switch: drawdown {} reached limit {}",
                    drawdown, limit
                ));
            }
        }
        if let Some(target) = self.limits.take_profit {
            let equity = self.pnl.equity();
            if equity >= target {
                return Some(format!(
                    "take profit: pnl {} reached target {}",
                    equity, target
                ));
            }
        }
        if let Some(limit) = self.limits.stop_loss {
            let unrealized = self.pnl.unrealized_pnl();
            if unrealized <= -limit {
                return Some(format!(
                    "stop loss: unrealized pnl {} reached -{}",
                    unrealized, limit
                ));
            }
        }
        if let Some(moved) = self.pnl.entry_move_pct() {
            if let Some(target) = self.limits.avg_price_take_profit_pct {
                if moved >= target {
                    return Some(format!(
                        "average price take profit: {}% from entry {} reached {}%",
                        moved.round_dp(2),
                        self.pnl.avg_entry_price,
                        target
                    ));
                }
            }
            if let Some(limit) = self.limits.avg_price_stop_loss_pct {
                if moved <= -limit {
                    return Some(format!(
                        "average price stop loss: {}% from entry {} reached -{}%",
                        moved.round_dp(2),
                        self.pnl.avg_entry_price,
                        limit
                    ));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_exposure_limit_in_base_units() {
        let mut guard = RiskGuard::new(RiskLimits {
            max_exposure: Some(ExposureLimit::BaseSize(dec!(3))),
            ..Default::default()
        });

        assert!(guard.admit(0, dec!(100), dec!(2)).is_ok());
        assert!(matches!(
            guard.admit(1, dec!(110), dec!(2)),
            Err(GridError::RiskRejected(_))
        ));
        assert_eq!(guard.exposure(), dec!(2));

        // re-admitting the same level replaces its reservation
        assert!(guard.admit(0, dec!(100), dec!(3)).is_ok());
        assert_eq!(guard.exposure(), dec!(3));

        guard.release(0);
        assert!(guard.admit(1, dec!(110), dec!(2)).is_ok());
    }

    #[test]
    fn test_reserved_becomes_committed_after_persist() {
        let mut guard = RiskGuard::new(RiskLimits::default());
        guard.admit(2, dec!(100), dec!(1)).unwrap();
        assert_eq!(guard.reserved_exposure(), dec!(100));

        guard.commit_through(10);
        assert_eq!(guard.committed_exposure(), dec!(0));

        guard.acknowledge(2, 11);
        guard.commit_through(10);
        assert_eq!(guard.committed_exposure(), dec!(0));
        guard.commit_through(11);
        assert_eq!(guard.committed_exposure(), dec!(100));
        assert_eq!(guard.reserved_exposure(), dec!(0));

        guard.reduce(2, dec!(100), dec!(0.25));
        assert_eq!(guard.exposure(), dec!(75));
    }

    #[test]
    fn test_pnl_round_trip() {
        let mut pnl = PnlTracker::default();
        pnl.record_fill(OrderSide::Buy, dec!(100), dec!(1));
        pnl.record_fill(OrderSide::Buy, dec!(90), dec!(1));
        assert_eq!(pnl.position, dec!(2));
        assert_eq!(pnl.avg_entry_price, dec!(95));

        pnl.record_fill(OrderSide::Sell, dec!(110), dec!(1));
        assert_eq!(pnl.realized_pnl, dec!(15));
        assert_eq!(pnl.round_trips, 1);
        assert_eq!(pnl.position, dec!(1));

        pnl.mark(dec!(105));
        assert_eq!(pnl.unrealized_pnl(), dec!(10));
        assert_eq!(pnl.volume, dec!(300));
    }

    #[test]
    fn test_short_then_cover_through_zero() {
        let mut pnl = PnlTracker::default();
        pnl.record_fill(OrderSide::Sell, dec!(110), dec!(1));
        assert_eq!(pnl.position, dec!(-1));

        pnl.record_fill(OrderSide::Buy, dec!(100), dec!(2));
        assert_eq!(pnl.realized_pnl, dec!(10));
        assert_eq!(pnl.position, dec!(1));
        assert_eq!(pnl.avg_entry_price, dec!(100));
    }

    #[test]
    fn test_kill_switch() {
        let mut guard = RiskGuard::new(RiskLimits {
            kill_switch_drawdown: Some(dec!(15)),
            ..Default::default()
        });

        guard.record_fill(OrderSide::Buy, dec!(100), dec!(1));
        guard.mark(dec!(110));
        assert!(guard.halt_reason().is_none());

        // peak equity 10, now -10
        guard.mark(dec!(90));
        let reason = guard.halt_reason().unwrap();
        assert!(reason.contains("kill switch"));

        guard.rearm();
        assert!(guard.halt_reason().is_none());
    }

    #[test]
    fn test_take_profit() {
        let mut guard = RiskGuard::new(RiskLimits {
            take_profit: Some(dec!(5)),
            ..Default::default()
        });
        guard.record_fill(OrderSide::Buy, dec!(100), dec!(1));
        guard.record_fill(OrderSide::Sell, dec!(106), dec!(1));
        assert!(guard.halt_reason().unwrap().contains("take profit"));
    }

    #[test]
    fn test_stop_loss_on_unrealized_loss() {
        let mut guard = RiskGuard::new(RiskLimits {
            stop_loss: Some(dec!(10)),
            ..Default::default()
        });
        guard.record_fill(OrderSide::Buy, dec!(100), dec!(2));
        guard.mark(dec!(96));
        assert!(guard.halt_reason().is_none());

        guard.mark(dec!(95));
        assert!(guard.halt_reason().unwrap().contains("stop loss"));
    }

    #[test]
    fn test_average_price_stops_follow_position_side() {
        let limits = RiskLimits {
            avg_price_take_profit_pct: Some(dec!(5)),
            avg_price_stop_loss_pct: Some(dec!(3)),
            ..Default::default()
        };

        let mut long = RiskGuard::new(limits.clone());
        long.record_fill(OrderSide::Buy, dec!(100), dec!(1));
        long.record_fill(OrderSide::Buy, dec!(90), dec!(1));
        long.mark(dec!(97));
        assert!(long.halt_reason().is_none());
        long.mark(dec!(99.75));
        assert!(long.halt_reason().unwrap().contains("average price take profit"));
        long.mark(dec!(92.15));
        assert!(long.halt_reason().unwrap().contains("average price stop loss"));

        // a short profits when the mark falls
        let mut short = RiskGuard::new(limits);
        short.record_fill(OrderSide::Sell, dec!(100), dec!(1));
        short.mark(dec!(95));
        assert!(short.halt_reason().unwrap().contains("average price take profit"));
        short.mark(dec!(103));
        assert!(short.halt_reason().unwrap().contains("average price stop loss"));

        // flat: nothing to measure against
        let flat = RiskGuard::new(RiskLimits {
            avg_price_stop_loss_pct: Some(dec!(3)),
            ..Default::default()
        });
        assert_eq!(flat.pnl().entry_move_pct(), None);
        assert!(flat.halt_reason().is_none());
    }
}
