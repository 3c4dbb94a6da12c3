//! Per-account capital accounting and position sizing.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Share of the wallet balance the executor is allowed to deploy; the
/// rest is a buffer against fees and funding.
pub const CAPITAL_BUFFER: Decimal = dec!(0.95);

/// Fee rates applied in profit accounting.
#[derive(Debug, Clone, Copy)]
pub struct FeeRates {
    /// Resting (grid) orders.
    pub maker: Decimal,
    /// Market orders.
    pub taker: Decimal,
}

impl Default for FeeRates {
    fn default() -> Self {
        Self { maker: dec!(0.0002), taker: dec!(0.0005) }
    }
}

/// Tracks one account's deployable capital. Balance updates arrive via
/// balance events; sizing reads are taken at intent time.
pub struct CapitalManager {
    balance: Mutex<Decimal>,
}

impl CapitalManager {
    pub fn new(balance: Decimal) -> Self {
        Self { balance: Mutex::new(balance) }
    }

    pub fn set_balance(&self, balance: Decimal) {
        *self.balance.lock() = balance;
    }

    /// Deployable capital after the safety buffer.
    pub fn available(&self) -> Decimal {
        *self.balance.lock() * CAPITAL_BUFFER
    }

    /// Capital allocated to one of `pair_count` configured symbols.
    pub fn per_symbol(&self, pair_count: usize) -> Decimal {
        if pair_count == 0 {
            return Decimal::ZERO;
        }
        self.available() / Decimal::from(pair_count as u64)
    }

    /// Position size for a plain market entry.
    pub fn position_size(&self, pair_count: usize, leverage: u32, entry_price: Decimal) -> Decimal {
        if entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.per_symbol(pair_count) * Decimal::from(leverage) / entry_price
    }

    /// Notional capital for the whole grid (`ratio = 1` deploys the full
    /// symbol allocation across the levels).
    pub fn grid_capital(&self, pair_count: usize, leverage: u32, ratio: Decimal) -> Decimal {
        self.per_symbol(pair_count) * (Decimal::ONE - ratio) * Decimal::from(leverage)
    }

    /// Notional capital for the sized entry preceding an abnormal grid.
    pub fn entry_capital(&self, pair_count: usize, leverage: u32, ratio: Decimal) -> Decimal {
        self.per_symbol(pair_count) * ratio * Decimal::from(leverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_and_split() {
        let capital = CapitalManager::new(dec!(1000));
        assert_eq!(capital.available(), dec!(950));
        assert_eq!(capital.per_symbol(2), dec!(475));
    }

    #[test]
    fn market_position_size() {
        let capital = CapitalManager::new(dec!(1000));
        // 950 / 1 pair * 10x leverage / price 0.95 = 10000
        assert_eq!(capital.position_size(1, 10, dec!(0.95)), dec!(10000));
        assert_eq!(capital.position_size(1, 10, Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn abnormal_split_partitions_allocation() {
        let capital = CapitalManager::new(dec!(1000));
        let entry = capital.entry_capital(1, 10, dec!(0.4));
        let grid = capital.grid_capital(1, 10, dec!(0.4));
        assert_eq!(entry, dec!(3800));
        assert_eq!(grid, dec!(5700));
        assert_eq!(entry + grid, capital.per_symbol(1) * dec!(10));
    }

    #[test]
    fn full_ratio_leaves_nothing_for_grid() {
        let capital = CapitalManager::new(dec!(1000));
        assert_eq!(capital.grid_capital(1, 10, Decimal::ONE), Decimal::ZERO);
    }

    #[test]
    fn balance_updates_take_effect() {
        let capital = CapitalManager::new(Decimal::ZERO);
        assert_eq!(capital.available(), Decimal::ZERO);
        capital.set_balance(dec!(200));
        assert_eq!(capital.available(), dec!(190));
    }
}
