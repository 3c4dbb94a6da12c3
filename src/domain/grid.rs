use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Grid flavour selected by the strategy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridType {
    Normal,
    /// Initial sized entry precedes the grid deployment (`ratio < 1`).
    Abnormal,
}

/// Validated grid parameters carried inside trade signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub grid_type: GridType,
    /// Capital share of the initial entry, in (0, 1]. 1 means the whole
    /// allocation is spread across the grid.
    pub ratio: Decimal,
    pub levels: u32,
    pub upper_price: Decimal,
    pub lower_price: Decimal,
    pub move_up: bool,
    pub move_down: bool,
}

impl GridSpec {
    /// Distance between adjacent grid levels.
    pub fn price_interval(&self) -> Decimal {
        (self.upper_price - self.lower_price) / Decimal::from(self.levels)
    }

    /// Grid level prices, `lower, lower + interval, ..., upper`.
    pub fn level_prices(&self) -> Vec<Decimal> {
        let interval = self.price_interval();
        (0..=self.levels)
            .map(|i| self.lower_price + interval * Decimal::from(i))
            .collect()
    }

    /// Shift the whole band up or down by one interval.
    pub fn shifted(&self, up: bool) -> Self {
        let interval = self.price_interval();
        let delta = if up { interval } else { -interval };
        Self {
            upper_price: self.upper_price + delta,
            lower_price: self.lower_price + delta,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec() -> GridSpec {
        GridSpec {
            grid_type: GridType::Normal,
            ratio: Decimal::ONE,
            levels: 10,
            upper_price: dec!(1.05),
            lower_price: dec!(0.95),
            move_up: false,
            move_down: false,
        }
    }

    #[test]
    fn level_prices_span_the_band() {
        let s = spec();
        let prices = s.level_prices();
        assert_eq!(prices.len(), 11);
        assert_eq!(prices[0], dec!(0.95));
        assert_eq!(prices[1], dec!(0.96));
        assert_eq!(*prices.last().unwrap(), dec!(1.05));
    }

    #[test]
    fn shifting_moves_band_by_one_interval() {
        let s = spec().shifted(true);
        assert_eq!(s.lower_price, dec!(0.96));
        assert_eq!(s.upper_price, dec!(1.06));
        let down = spec().shifted(false);
        assert_eq!(down.lower_price, dec!(0.94));
    }
}
