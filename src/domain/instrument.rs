use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange trading rules for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    /// Minimum price increment.
    pub tick_size: Decimal,
    /// Minimum quantity increment.
    pub step_size: Decimal,
    /// Minimum order notional (price x quantity).
    pub min_notional: Decimal,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            tick_size: Decimal::new(1, 4),
            step_size: Decimal::new(1, 1),
            min_notional: Decimal::from(5),
        }
    }
}
