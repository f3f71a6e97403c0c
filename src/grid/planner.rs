//! Grid planner - turns a validated configuration into the price ladder

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use super::config::{GridConfig, GridSpacing, OrderSizing, MAX_LEVELS};
use super::errors::{GridError, GridResult};
use super::types::{GridLevel, OrderSide};

/// Stateless level calculator
#[derive(Debug, Clone, Copy, Default)]
pub struct GridPlanner;

impl GridPlanner {
    /// Build the ordered, immutable grid levels for a configuration.
    ///
    /// Same input always yields the same levels: all arithmetic is exact
    /// decimal arithmetic followed by rounding to `price_decimals`.
    pub fn plan(config: &GridConfig) -> GridResult<Vec<GridLevel>> {
        config.validate()?;

        let prices = Self::level_prices(config)?;

        if prices.len() < 2 {
            return Err(GridError::InvalidConfiguration(format!(
                "spacing yields {} level(s), need at least 2",
                prices.len()
            )));
        }

        if prices.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(GridError::InvalidConfiguration(format!(
                "rounding to {} decimals collapses adjacent levels",
                config.price_decimals
            )));
        }

        prices
            .into_iter()
            .enumerate()
            .map(|(i, price)| {
                let size = Self::level_size(config, price)?;
                let side = if price <= config.reference_price {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                };
                Ok(GridLevel::new(i as u32, price, side, size))
            })
            .collect()
    }

    fn level_prices(config: &GridConfig) -> GridResult<Vec<Decimal>> {
        let dp = config.price_decimals;
        let lower = config.lower_price;
        let upper = config.upper_price;

        match config.spacing {
            GridSpacing::LevelCount(count) => {
                let count = count as usize;
                if count > MAX_LEVELS {
                    return Err(too_many_levels(count));
                }
                let step = (upper - lower) / Decimal::from(count - 1);
                Ok((0..count)
                    .map(|i| {
                        if i == count - 1 {
                            upper.round_dp(dp)
                        } else {
                            (lower + step * Decimal::from(i)).round_dp(dp)
                        }
                    })
                    .collect())
            }
            GridSpacing::FixedStep(step) => {
                let span = (upper - lower)
                    .checked_div(step)
                    .ok_or_else(|| overflows("fixed step spacing"))?
                    .floor();
                // span + 1 levels; compare before converting so huge spans cannot overflow
                if span >= Decimal::from(MAX_LEVELS) {
                    return Err(too_many_levels(MAX_LEVELS + 1));
                }
                let count = span
                    .to_usize()
                    .ok_or_else(|| too_many_levels(MAX_LEVELS + 1))?
                    + 1;
                Ok((0..count)
                    .map(|i| (lower + step * Decimal::from(i)).round_dp(dp))
                    .collect())
            }
            GridSpacing::PercentStep(pct) => {
                let ratio = (pct / Decimal::ONE_HUNDRED)
                    .checked_add(Decimal::ONE)
                    .ok_or_else(|| overflows("percent step spacing"))?;
                let mut prices = vec![lower.round_dp(dp)];
                loop {
                    let last = prices[prices.len() - 1];
                    let next = last
                        .checked_mul(ratio)
                        .ok_or_else(|| overflows("percent step spacing"))?
                        .round_dp(dp);
                    if next > upper {
                        break;
                    }
                    if next <= last {
                        return Err(GridError::InvalidConfiguration(format!(
                            "{}% step does not move price {} at {} decimals",
                            pct, last, dp
                        )));
                    }
                    prices.push(next);
                    if prices.len() > MAX_LEVELS {
                        return Err(too_many_levels(prices.len()));
                    }
                }
                Ok(prices)
            }
        }
    }

    fn level_size(config: &GridConfig, price: Decimal) -> GridResult<Decimal> {
        let raw = match config.sizing {
            OrderSizing::Base(size) => size,
            OrderSizing::Quote(amount) => amount
                .checked_div(price)
                .ok_or_else(|| overflows("quote sizing"))?,
        };
        let size = raw.round_dp_with_strategy(config.size_decimals, RoundingStrategy::ToZero);
        if size <= Decimal::ZERO {
            return Err(GridError::InvalidConfiguration(format!(
                "order size at price {} rounds to zero",
                price
            )));
        }
        Ok(size)
    }

    /// Lowest level strictly above the reference price.
    ///
    /// Seeding leaves this level empty so the first buy fill has a free mirror.
    pub fn gap_level(levels: &[GridLevel], reference_price: Decimal) -> Option<u32> {
        levels
            .iter()
            .find(|l| l.price() > reference_price)
            .map(|l| l.index())
    }

    /// Number of levels priced at or below `price`; changes whenever the
    /// market crosses a level.
    pub fn band_of(levels: &[GridLevel], price: Decimal) -> usize {
        levels.partition_point(|l| l.price() <= price)
    }
}

fn overflows(what: &str) -> GridError {
    GridError::InvalidConfiguration(format!("{} overflows decimal range", what))
}

fn too_many_levels(count: usize) -> GridError {
    GridError::InvalidConfiguration(format!(
        "grid would have {} levels, maximum is {}",
        count, MAX_LEVELS
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn config(spacing: GridSpacing) -> GridConfig {
        GridConfig::new(
            "BTC/USDT",
            dec!(90),
            dec!(110),
            spacing,
            OrderSizing::Base(dec!(1)),
            dec!(100),
        )
        .with_precision(2, 4)
    }

    #[test]
    fn test_level_count_includes_bounds() {
        let levels = GridPlanner::plan(&config(GridSpacing::LevelCount(3))).unwrap();
        let prices: Vec<_> = levels.iter().map(|l| l.price()).collect();
        assert_eq!(prices, vec![dec!(90), dec!(100), dec!(110)]);

        // reference sits exactly on level 1, which stays a buy
        assert_eq!(levels[0].side(), OrderSide::Buy);
        assert_eq!(levels[1].side(), OrderSide::Buy);
        assert_eq!(levels[2].side(), OrderSide::Sell);
    }

    #[test]
    fn test_fixed_step() {
        let levels = GridPlanner::plan(&config(GridSpacing::FixedStep(dec!(6)))).unwrap();
        let prices: Vec<_> = levels.iter().map(|l| l.price()).collect();
        assert_eq!(prices, vec![dec!(90), dec!(96), dec!(102), dec!(108)]);
    }

    #[test]
    fn test_percent_step() {
        let levels = GridPlanner::plan(&config(GridSpacing::PercentStep(dec!(10)))).unwrap();
        let prices: Vec<_> = levels.iter().map(|l| l.price()).collect();
        assert_eq!(prices, vec![dec!(90), dec!(99), dec!(108.9)]);
    }

    #[test]
    fn test_quote_sizing_truncates() {
        let mut cfg = config(GridSpacing::LevelCount(3));
        cfg.sizing = OrderSizing::Quote(dec!(100));
        let levels = GridPlanner::plan(&cfg).unwrap();
        assert_eq!(levels[0].size(), dec!(1.1111));
        assert_eq!(levels[1].size(), dec!(1));
        assert_eq!(levels[2].size(), dec!(0.909));
    }

    #[test]
    fn test_invalid_inputs() {
        let mut cfg = config(GridSpacing::LevelCount(3));
        cfg.upper_price = dec!(90);
        assert!(GridPlanner::plan(&cfg).is_err());

        assert!(GridPlanner::plan(&config(GridSpacing::FixedStep(dec!(25)))).is_err());
        assert!(GridPlanner::plan(&config(GridSpacing::LevelCount(5000))).is_err());
        assert!(GridPlanner::plan(&config(GridSpacing::FixedStep(dec!(0.001)))).is_err());

        // 1000 levels over a 20-wide range collapse at whole-number precision
        let mut cfg = config(GridSpacing::LevelCount(1000));
        cfg.price_decimals = 0;
        assert!(matches!(
            GridPlanner::plan(&cfg),
            Err(GridError::InvalidConfiguration(_))
        ));
    }

    fn wide(spacing: GridSpacing, lower: Decimal, upper: Decimal) -> GridConfig {
        GridConfig::new("BTC/USDT", lower, upper, spacing, OrderSizing::Base(dec!(1)), dec!(2))
            .with_precision(2, 4)
    }

    fn is_overflow(result: GridResult<Vec<GridLevel>>) -> bool {
        matches!(result, Err(GridError::InvalidConfiguration(msg)) if msg.contains("overflows"))
    }

    #[test]
    fn test_fixed_step_overflow_is_invalid() {
        let upper = Decimal::from_i128_with_scale(10i128.pow(28), 0);
        let cfg = wide(GridSpacing::FixedStep(Decimal::new(1, 10)), dec!(1), upper);
        assert!(cfg.validate().is_ok());
        assert!(is_overflow(GridPlanner::plan(&cfg)));
    }

    #[test]
    fn test_percent_step_overflow_is_invalid() {
        let upper = Decimal::from_i128_with_scale(7 * 10i128.pow(28), 0);
        let pct = Decimal::from_i128_with_scale(10i128.pow(27), 0);
        let cfg = wide(GridSpacing::PercentStep(pct), dec!(1), upper);
        assert!(cfg.validate().is_ok());
        assert!(is_overflow(GridPlanner::plan(&cfg)));
    }

    #[test]
    fn test_level_count_quote_sizing_overflow_is_invalid() {
        let mut cfg = wide(GridSpacing::LevelCount(3), dec!(0.5), dec!(10));
        cfg.sizing = OrderSizing::Quote(Decimal::from_i128_with_scale(7 * 10i128.pow(28), 0));
        assert!(cfg.validate().is_ok());
        assert!(is_overflow(GridPlanner::plan(&cfg)));
    }

    #[test]
    fn test_gap_and_band() {
        let levels = GridPlanner::plan(&config(GridSpacing::LevelCount(3))).unwrap();
        assert_eq!(GridPlanner::gap_level(&levels, dec!(100)), Some(2));
        assert_eq!(GridPlanner::gap_level(&levels, dec!(110)), None);
        assert_eq!(GridPlanner::band_of(&levels, dec!(85)), 0);
        assert_eq!(GridPlanner::band_of(&levels, dec!(100)), 2);
        assert_eq!(GridPlanner::band_of(&levels, dec!(105)), 2);
    }

    proptest! {
        #[test]
        fn prop_levels_ordered_and_deterministic(
            lower in 1u32..10_000,
            width in 1u32..10_000,
            count in 2u32..200,
            ref_frac in 0u32..=100,
        ) {
            let lower = Decimal::from(lower);
            let upper = lower + Decimal::from(width);
            let reference = lower + (upper - lower) * Decimal::from(ref_frac) / dec!(100);
            let cfg = GridConfig::new(
                "ETH/USDT",
                lower,
                upper,
                GridSpacing::LevelCount(count),
                OrderSizing::Quote(dec!(250)),
                reference,
            );

            let first = GridPlanner::plan(&cfg).unwrap();
            let second = GridPlanner::plan(&cfg).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(
                serde_json::to_string(&first).unwrap(),
                serde_json::to_string(&second).unwrap()
            );

            prop_assert_eq!(first.len(), count as usize);
            for pair in first.windows(2) {
                prop_assert!(pair[0].price() < pair[1].price());
            }
            for level in &first {
                let expected = if level.price() <= reference { OrderSide::Buy } else { OrderSide::Sell };
                prop_assert_eq!(level.side(), expected);
            }
        }
    }
}
