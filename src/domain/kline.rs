use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single candlestick as delivered by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kline {
    /// Candle open time in epoch milliseconds.
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Candle close time in epoch milliseconds.
    pub close_time: i64,
    /// Whether the exchange has flagged this candle as final.
    pub is_closed: bool,
}
