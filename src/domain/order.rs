use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells. Used in signed P&L arithmetic.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type as understood by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    PostOnly,
    Stop,
    TakeProfit,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::PostOnly => "POST_ONLY",
            OrderType::Stop => "STOP",
            OrderType::TakeProfit => "TAKE_PROFIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// A tracked order within a trading task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Exchange-assigned id, present once the order is acknowledged.
    pub order_id: Option<i64>,
    /// Client-side id used to correlate acknowledgements and fills.
    pub client_order_id: String,
    pub task_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub status: OrderStatus,
    pub is_grid_order: bool,
    pub grid_pair_id: Option<u32>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Record a fill, capping at the order quantity.
    pub fn apply_fill(&mut self, quantity: Decimal) {
        self.filled_quantity = (self.filled_quantity + quantity).min(self.quantity);
        if self.remaining() <= Decimal::ZERO {
            self.status = OrderStatus::Filled;
        } else {
            self.status = OrderStatus::PartiallyFilled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(qty: Decimal) -> Order {
        Order {
            order_id: Some(1),
            client_order_id: "c1".into(),
            task_id: "t1".into(),
            symbol: "XRPUSDC".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(0.95)),
            quantity: qty,
            filled_quantity: Decimal::ZERO,
            status: OrderStatus::Submitted,
            is_grid_order: true,
            grid_pair_id: Some(0),
        }
    }

    #[test]
    fn fills_never_exceed_quantity() {
        let mut o = order(dec!(100));
        o.apply_fill(dec!(60));
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        o.apply_fill(dec!(60));
        assert_eq!(o.filled_quantity, dec!(100));
        assert_eq!(o.status, OrderStatus::Filled);
        assert!(!o.is_open());
    }

    #[test]
    fn side_arithmetic() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.sign(), dec!(-1));
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
    }
}
