use serde::{Deserialize, Serialize};

use super::Side;

/// Per-symbol position state held by a trading task and mirrored by the
/// strategy engine. Transitions happen only on confirmed position events,
/// never on raw order fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    #[default]
    None,
    Long,
    Short,
}

impl PositionState {
    pub fn is_flat(self) -> bool {
        self == PositionState::None
    }

    /// Entry side that produces this position.
    pub fn entry_side(self) -> Option<Side> {
        match self {
            PositionState::Long => Some(Side::Buy),
            PositionState::Short => Some(Side::Sell),
            PositionState::None => None,
        }
    }

    /// Position reached by opening with the given side.
    pub fn from_entry(side: Side) -> Self {
        match side {
            Side::Buy => PositionState::Long,
            Side::Sell => PositionState::Short,
        }
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PositionState::None => "NONE",
            PositionState::Long => "LONG",
            PositionState::Short => "SHORT",
        };
        f.write_str(s)
    }
}
