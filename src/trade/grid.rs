//! Grid construction and pair bookkeeping.
//!
//! A grid spans `levels` intervals between the configured band edges.
//! Every interval is one [`GridPair`]: a buy at the lower price linked
//! to a sell at the next-higher price. A pair whose two sides have both
//! filled realises `(sell - buy) x qty - fees` and re-arms.

use rust_decimal::Decimal;

use crate::domain::{GridSpec, Side, SymbolFilters};
use crate::error::{Error, Result};

use super::precision::{check_min_notional, truncate_price, truncate_quantity};

/// One buy/sell rung pair of the grid.
#[derive(Debug, Clone)]
pub struct GridPair {
    pub id: u32,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub quantity: Decimal,
    pub buy_filled: bool,
    pub sell_filled: bool,
}

impl GridPair {
    /// Closed round-trip profit net of maker fees on both legs.
    pub fn profit(&self, maker_fee: Decimal) -> Decimal {
        let gross = (self.sell_price - self.buy_price) * self.quantity;
        let fees =
            (self.buy_price * self.quantity + self.sell_price * self.quantity) * maker_fee;
        gross - fees
    }
}

/// Outcome of recording a grid fill.
#[derive(Debug, PartialEq)]
pub enum GridFillOutcome {
    /// One leg filled; the pair is still open.
    Partial,
    /// Both legs filled: profit realised, pair re-armed, both legs need
    /// replacement orders.
    PairComplete { profit: Decimal },
}

/// The live grid for one trading task.
#[derive(Debug, Clone)]
pub struct GridPlan {
    pub spec: GridSpec,
    /// Direction of the position this grid serves.
    pub side: Side,
    pub pairs: Vec<GridPair>,
}

impl GridPlan {
    /// Lay out the grid, splitting `capital` evenly across the levels.
    pub fn build(
        spec: &GridSpec,
        side: Side,
        capital: Decimal,
        filters: &SymbolFilters,
    ) -> Result<Self> {
        if spec.levels == 0 {
            return Err(Error::Config("grid needs at least one level".into()));
        }
        let prices = spec.level_prices();
        let per_level = capital / Decimal::from(spec.levels);

        let mut pairs = Vec::with_capacity(spec.levels as usize);
        for (i, window) in prices.windows(2).enumerate() {
            let buy_price = truncate_price(window[0], filters);
            let sell_price = truncate_price(window[1], filters);
            let quantity = truncate_quantity(per_level / buy_price, filters);
            if quantity <= Decimal::ZERO {
                return Err(Error::Business(format!(
                    "grid level at {buy_price} sizes to zero quantity"
                )));
            }
            check_min_notional(buy_price, quantity, filters)?;
            pairs.push(GridPair {
                id: i as u32,
                buy_price,
                sell_price,
                quantity,
                buy_filled: false,
                sell_filled: false,
            });
        }
        Ok(Self { spec: spec.clone(), side, pairs })
    }

    /// Record a fill on one leg of a pair.
    pub fn record_fill(&mut self, pair_id: u32, leg: Side, maker_fee: Decimal) -> GridFillOutcome {
        let Some(pair) = self.pairs.iter_mut().find(|p| p.id == pair_id) else {
            return GridFillOutcome::Partial;
        };
        match leg {
            Side::Buy => pair.buy_filled = true,
            Side::Sell => pair.sell_filled = true,
        }
        if pair.buy_filled && pair.sell_filled {
            let profit = pair.profit(maker_fee);
            pair.buy_filled = false;
            pair.sell_filled = false;
            GridFillOutcome::PairComplete { profit }
        } else {
            GridFillOutcome::Partial
        }
    }

    /// Whether a traded price breaches a movable band edge. Returns the
    /// direction to shift, `true` for up.
    pub fn band_breach(&self, price: Decimal) -> Option<bool> {
        if self.spec.move_up && price >= self.spec.upper_price {
            return Some(true);
        }
        if self.spec.move_down && price <= self.spec.lower_price {
            return Some(false);
        }
        None
    }

    /// Rebuild the plan with the band shifted one interval.
    pub fn shifted(&self, up: bool, capital: Decimal, filters: &SymbolFilters) -> Result<Self> {
        Self::build(&self.spec.shifted(up), self.side, capital, filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GridType;
    use rust_decimal_macros::dec;

    fn spec(move_up: bool, move_down: bool) -> GridSpec {
        GridSpec {
            grid_type: GridType::Normal,
            ratio: Decimal::ONE,
            levels: 10,
            upper_price: dec!(1.05),
            lower_price: dec!(0.95),
            move_up,
            move_down,
        }
    }

    fn filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: dec!(0.01),
            step_size: dec!(1),
            min_notional: dec!(5),
        }
    }

    #[test]
    fn build_pairs_buys_with_next_higher_sell() {
        let plan = GridPlan::build(&spec(false, false), Side::Buy, dec!(950), &filters()).unwrap();
        assert_eq!(plan.pairs.len(), 10);
        assert_eq!(plan.pairs[0].buy_price, dec!(0.95));
        assert_eq!(plan.pairs[0].sell_price, dec!(0.96));
        assert_eq!(plan.pairs[9].buy_price, dec!(1.04));
        assert_eq!(plan.pairs[9].sell_price, dec!(1.05));
        assert_eq!(plan.pairs[0].quantity, dec!(100));
    }

    #[test]
    fn completed_pair_realises_spread_minus_fees() {
        let mut plan = GridPlan::build(&spec(false, false), Side::Buy, dec!(950), &filters()).unwrap();
        let maker = dec!(0.0002);
        assert_eq!(plan.record_fill(0, Side::Buy, maker), GridFillOutcome::Partial);
        let outcome = plan.record_fill(0, Side::Sell, maker);
        // (0.96 - 0.95) x 100 - (0.95 + 0.96) x 100 x 0.0002
        let expected = dec!(1) - dec!(191) * dec!(0.0002);
        assert_eq!(outcome, GridFillOutcome::PairComplete { profit: expected });

        // The pair re-arms for the next round trip.
        assert_eq!(plan.record_fill(0, Side::Buy, maker), GridFillOutcome::Partial);
    }

    #[test]
    fn band_breach_respects_flags() {
        let fixed = GridPlan::build(&spec(false, false), Side::Buy, dec!(950), &filters()).unwrap();
        assert_eq!(fixed.band_breach(dec!(1.10)), None);

        let movable = GridPlan::build(&spec(true, true), Side::Buy, dec!(950), &filters()).unwrap();
        assert_eq!(movable.band_breach(dec!(1.05)), Some(true));
        assert_eq!(movable.band_breach(dec!(0.95)), Some(false));
        assert_eq!(movable.band_breach(dec!(1.00)), None);
    }

    #[test]
    fn shift_moves_band_one_interval() {
        let plan = GridPlan::build(&spec(true, false), Side::Buy, dec!(950), &filters()).unwrap();
        let shifted = plan.shifted(true, dec!(950), &filters()).unwrap();
        assert_eq!(shifted.spec.lower_price, dec!(0.96));
        assert_eq!(shifted.spec.upper_price, dec!(1.06));
        assert_eq!(shifted.pairs[0].buy_price, dec!(0.96));
    }

    #[test]
    fn undersized_levels_are_rejected() {
        let result = GridPlan::build(&spec(false, false), Side::Buy, dec!(1), &filters());
        assert!(result.is_err());
    }
}
