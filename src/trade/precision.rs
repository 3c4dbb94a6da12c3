//! Price/quantity precision: truncation to the instrument's tick and
//! lot step, and the minimum-notional gate.

use rust_decimal::Decimal;

use crate::domain::SymbolFilters;
use crate::error::{Error, Result};

/// Truncate (never round) a value down to a multiple of `step`.
pub fn truncate_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

/// Truncate a price to the instrument tick.
pub fn truncate_price(price: Decimal, filters: &SymbolFilters) -> Decimal {
    truncate_to_step(price, filters.tick_size)
}

/// Truncate a quantity to the instrument lot step.
pub fn truncate_quantity(quantity: Decimal, filters: &SymbolFilters) -> Decimal {
    truncate_to_step(quantity, filters.step_size)
}

/// Reject orders below the exchange minimum notional before submission.
pub fn check_min_notional(price: Decimal, quantity: Decimal, filters: &SymbolFilters) -> Result<()> {
    let notional = price * quantity;
    if notional < filters.min_notional {
        return Err(Error::Business(format!(
            "order notional {notional} below minimum {}",
            filters.min_notional
        )));
    }
    Ok(())
}
