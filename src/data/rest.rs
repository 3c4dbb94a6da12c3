//! Signed REST client for the perpetual futures exchange.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::account::ApiCredentials;
use crate::domain::{Kline, OrderType, Side, SymbolFilters};
use crate::error::{Error, Result};

use super::sign::sign_query;

/// Default REST timeout.
pub const REST_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_WINDOW_MS: u64 = 5_000;

/// A new-order request as passed to the exchange.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub client_order_id: String,
    pub reduce_only: bool,
}

/// Exchange acknowledgement for a submitted order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub client_order_id: String,
}

/// REST operations the engine needs. The live client talks HTTP; tests
/// substitute a scripted implementation.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;

    /// Available balance for the margin asset.
    async fn account_balance(&self, asset: &str) -> Result<Decimal>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()>;

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters>;

    async fn create_listen_key(&self) -> Result<String>;

    async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()>;
}

/// Live client. Every signed request gets a fresh timestamp and
/// signature, including retries issued by the engine.
pub struct FuturesRestClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

impl FuturesRestClient {
    pub fn new(base_url: &str, credentials: &ApiCredentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
        })
    }

    fn canonical_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<serde_json::Value> {
        let mut url = self.base_url.join(path)?;
        if signed {
            params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
            params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
            let query = Self::canonical_query(&params);
            let signature = sign_query(&self.api_secret, &query)?;
            url.set_query(Some(&format!("{query}&signature={signature}")));
        } else if !params.is_empty() {
            url.set_query(Some(&Self::canonical_query(&params)));
        }

        debug!(method = %method, path, "exchange request");
        let response = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::Auth(format!("exchange rejected credentials: {body}")));
        }
        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(api_err) if status.is_client_error() => Err(Error::Exchange {
                code: api_err.code,
                message: api_err.msg,
            }),
            _ => Err(Error::Connection(format!("HTTP {status}: {body}"))),
        }
    }

    fn parse_kline(raw: &serde_json::Value) -> Result<Kline> {
        let row = raw
            .as_array()
            .ok_or_else(|| Error::Json(serde::de::Error::custom("kline row is not an array")))?;
        let num = |i: usize| -> Result<i64> {
            row.get(i)
                .and_then(serde_json::Value::as_i64)
                .ok_or_else(|| Error::Json(serde::de::Error::custom("missing kline timestamp")))
        };
        let dec = |i: usize| -> Result<Decimal> {
            row.get(i)
                .and_then(serde_json::Value::as_str)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Json(serde::de::Error::custom("missing kline price field")))
        };
        Ok(Kline {
            open_time: num(0)?,
            open: dec(1)?,
            high: dec(2)?,
            low: dec(3)?,
            close: dec(4)?,
            volume: dec(5)?,
            close_time: num(6)?,
            // Historical rows are final by definition.
            is_closed: true,
        })
    }
}

#[async_trait]
impl ExchangeApi for FuturesRestClient {
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self.send(Method::GET, "/fapi/v1/klines", params, false).await?;
        body.as_array()
            .ok_or_else(|| Error::Json(serde::de::Error::custom("klines body is not an array")))?
            .iter()
            .map(Self::parse_kline)
            .collect()
    }

    async fn account_balance(&self, asset: &str) -> Result<Decimal> {
        let body = self.send(Method::GET, "/fapi/v2/balance", Vec::new(), true).await?;
        let entries = body
            .as_array()
            .ok_or_else(|| Error::Json(serde::de::Error::custom("balance body is not an array")))?;
        for entry in entries {
            if entry.get("asset").and_then(|a| a.as_str()) == Some(asset) {
                let raw = entry
                    .get("availableBalance")
                    .or_else(|| entry.get("balance"))
                    .and_then(|b| b.as_str())
                    .unwrap_or("0");
                return raw
                    .parse()
                    .map_err(|_| Error::Json(serde::de::Error::custom("invalid balance decimal")));
            }
        }
        Err(Error::Business(format!("no balance entry for asset {asset}")))
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_str().to_string()),
            ("quantity", request.quantity.to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];
        if let Some(price) = request.price {
            params.push(("price", price.to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        let body = self.send(Method::POST, "/fapi/v1/order", params, true).await?;
        let order_id = body
            .get("orderId")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| Error::Json(serde::de::Error::custom("order ack missing orderId")))?;
        Ok(OrderAck {
            order_id,
            client_order_id: request.client_order_id.clone(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.send(Method::DELETE, "/fapi/v1/order", params, true).await?;
        Ok(())
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let params = vec![("symbol", symbol.to_string())];
        let body = self.send(Method::GET, "/fapi/v1/exchangeInfo", params, false).await?;
        let symbols = body
            .get("symbols")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| Error::Json(serde::de::Error::custom("exchangeInfo missing symbols")))?;
        let info = symbols
            .iter()
            .find(|s| s.get("symbol").and_then(|v| v.as_str()) == Some(symbol))
            .ok_or_else(|| Error::Business(format!("unknown symbol {symbol}")))?;

        let mut filters = SymbolFilters::default();
        if let Some(rows) = info.get("filters").and_then(serde_json::Value::as_array) {
            for row in rows {
                let dec = |key: &str| -> Option<Decimal> {
                    row.get(key).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
                };
                match row.get("filterType").and_then(|v| v.as_str()) {
                    Some("PRICE_FILTER") => {
                        if let Some(tick) = dec("tickSize") {
                            filters.tick_size = tick;
                        }
                    }
                    Some("LOT_SIZE") => {
                        if let Some(step) = dec("stepSize") {
                            filters.step_size = step;
                        }
                    }
                    Some("MIN_NOTIONAL") => {
                        if let Some(notional) = dec("notional") {
                            filters.min_notional = notional;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(filters)
    }

    async fn create_listen_key(&self) -> Result<String> {
        let body = self.send(Method::POST, "/fapi/v1/listenKey", Vec::new(), false).await?;
        body.get("listenKey")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Json(serde::de::Error::custom("missing listenKey")))
    }

    async fn keepalive_listen_key(&self, _listen_key: &str) -> Result<()> {
        self.send(Method::PUT, "/fapi/v1/listenKey", Vec::new(), false).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kline_row_parses() {
        let raw = json!([
            1700000000000i64, "0.95", "0.97", "0.94", "0.96", "12345.6",
            1700000899999i64, "0", 10, "0", "0", "0"
        ]);
        let kline = FuturesRestClient::parse_kline(&raw).unwrap();
        assert_eq!(kline.open_time, 1700000000000);
        assert_eq!(kline.close.to_string(), "0.96");
        assert!(kline.is_closed);
    }

    #[test]
    fn canonical_query_preserves_order() {
        let q = FuturesRestClient::canonical_query(&[
            ("symbol", "XRPUSDC".to_string()),
            ("side", "BUY".to_string()),
        ]);
        assert_eq!(q, "symbol=XRPUSDC&side=BUY");
    }
}
