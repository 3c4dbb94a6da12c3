//! Typed bus payloads for data-engine subjects.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Kline, OrderType, Side};

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientConnected {
    pub user_id: String,
    pub testnet: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionFailed {
    pub user_id: String,
    pub reason: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WsConnected {
    pub user_id: String,
    /// `market` or `user`.
    pub stream: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WsDisconnected {
    pub user_id: String,
    pub stream: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserStreamStarted {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KlinesRequest {
    pub user_id: String,
    pub symbol: String,
    pub interval: String,
    pub limit: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KlinesResponse {
    pub user_id: String,
    pub symbol: String,
    pub interval: String,
    pub klines: Vec<Kline>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KlinesFailed {
    pub user_id: String,
    pub symbol: String,
    pub interval: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KlineUpdate {
    pub user_id: String,
    pub symbol: String,
    pub interval: String,
    /// The freshest window of closed candles, newest last.
    pub klines: Vec<Kline>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceRequest {
    pub user_id: String,
    /// Margin asset to report; defaults to the USDC-margined wallet.
    #[serde(default = "default_margin_asset")]
    pub asset: String,
}

fn default_margin_asset() -> String {
    "USDC".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountBalance {
    pub user_id: String,
    pub asset: String,
    pub balance: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderCreate {
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub client_order_id: String,
    #[serde(default)]
    pub reduce_only: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderCancel {
    pub user_id: String,
    pub symbol: String,
    pub order_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderSubmitted {
    pub user_id: String,
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    pub retry_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderFailed {
    pub user_id: String,
    pub symbol: String,
    pub client_order_id: String,
    pub reason: String,
    pub code: String,
    pub retry_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub user_id: String,
    pub symbol: String,
    pub order_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderFilled {
    pub user_id: String,
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    /// Quantity of this fill, not the cumulative total.
    pub quantity: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderUpdateEvent {
    pub user_id: String,
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    pub status: String,
    pub filled_quantity: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub user_id: String,
    pub balances: Vec<AssetBalance>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub balance: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub user_id: String,
    pub symbol: String,
    /// Signed position amount, negative for shorts.
    pub amount: Decimal,
    pub entry_price: Decimal,
}
