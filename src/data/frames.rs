//! Wire frames received over the exchange WebSocket streams.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Frames on the market stream. Unknown event types are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
pub enum MarketFrame {
    #[serde(rename = "kline")]
    Kline {
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "k")]
        kline: KlineFrame,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct KlineFrame {
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "c")]
    pub close: Decimal,
    /// Whether the candle is final.
    #[serde(rename = "x")]
    pub is_closed: bool,
}

/// Frames on the user-data stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
pub enum UserFrame {
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate {
        #[serde(rename = "o")]
        order: OrderUpdateFrame,
    },
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate {
        #[serde(rename = "a")]
        account: AccountUpdateFrame,
    },
    #[serde(rename = "listenKeyExpired")]
    ListenKeyExpired,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderUpdateFrame {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    /// Order status after this update (NEW, PARTIALLY_FILLED, FILLED, ...).
    #[serde(rename = "X")]
    pub status: String,
    /// Quantity filled by this update alone.
    #[serde(rename = "l", default)]
    pub last_fill_quantity: Decimal,
    #[serde(rename = "L", default)]
    pub last_fill_price: Decimal,
    /// Cumulative filled quantity.
    #[serde(rename = "z", default)]
    pub filled_quantity: Decimal,
    #[serde(rename = "n", default)]
    pub fee: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountUpdateFrame {
    #[serde(rename = "B", default)]
    pub balances: Vec<BalanceFrame>,
    #[serde(rename = "P", default)]
    pub positions: Vec<PositionFrame>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceFrame {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "wb")]
    pub wallet_balance: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionFrame {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "pa")]
    pub amount: Decimal,
    #[serde(rename = "ep")]
    pub entry_price: Decimal,
}
