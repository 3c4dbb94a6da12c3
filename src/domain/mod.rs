//! Pure domain types shared across the engines.

pub mod grid;
pub mod instrument;
pub mod kline;
pub mod order;
pub mod position;
pub mod signal;

pub use grid::{GridSpec, GridType};
pub use instrument::SymbolFilters;
pub use kline::Kline;
pub use order::{Order, OrderStatus, OrderType, Side};
pub use position::PositionState;
pub use signal::{IndicatorResult, Signal, TradeAction};
