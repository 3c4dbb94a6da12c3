use serde::{Deserialize, Serialize};

use super::Side;

/// Directional signal produced by an indicator or by signal synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    Long,
    Short,
    #[default]
    None,
}

impl Signal {
    pub fn entry_side(self) -> Option<Side> {
        match self {
            Signal::Long => Some(Side::Buy),
            Signal::Short => Some(Side::Sell),
            Signal::None => None,
        }
    }
}

/// Result of a single indicator computation for one closed candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorResult {
    pub signal: Signal,
    /// Indicator-specific diagnostics (current value, bands, ...).
    pub data: serde_json::Value,
}

/// What the strategy wants the executor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Open,
    Close,
}
