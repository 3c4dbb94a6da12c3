//! Scripted [`ExchangeApi`] double.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::data::rest::{ExchangeApi, OrderAck, OrderRequest};
use crate::domain::{Kline, SymbolFilters};
use crate::error::{Error, Result};

/// One recorded call against the scripted API.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    Klines { symbol: String, interval: String, limit: u32 },
    Balance { asset: String },
    Submit { client_order_id: String },
    Cancel { order_id: i64 },
    ListenKey,
    Keepalive,
}

#[derive(Default)]
struct Script {
    submit_results: VecDeque<Result<OrderAck>>,
    listen_key_results: VecDeque<Result<String>>,
    balance: Option<Decimal>,
    klines: Vec<Kline>,
}

/// Scripted REST double. Each queued result is popped once; exhausted
/// queues fall back to permissive defaults.
pub struct ScriptedApi {
    script: Mutex<Script>,
    calls: Mutex<Vec<ApiCall>>,
    next_order_id: AtomicU32,
}

impl Default for ScriptedApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            next_order_id: AtomicU32::new(1),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_balance(self: Arc<Self>, balance: Decimal) -> Arc<Self> {
        self.script.lock().expect("script lock").balance = Some(balance);
        self
    }

    pub fn with_klines(self: Arc<Self>, klines: Vec<Kline>) -> Arc<Self> {
        self.script.lock().expect("script lock").klines = klines;
        self
    }

    pub fn push_submit_result(&self, result: Result<OrderAck>) {
        self.script.lock().expect("script lock").submit_results.push_back(result);
    }

    pub fn push_listen_key_result(&self, result: Result<String>) {
        self.script.lock().expect("script lock").listen_key_results.push_back(result);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn submit_attempts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ApiCall::Submit { .. }))
            .count()
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait]
impl ExchangeApi for ScriptedApi {
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        self.record(ApiCall::Klines {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            limit,
        });
        Ok(self.script.lock().expect("script lock").klines.clone())
    }

    async fn account_balance(&self, asset: &str) -> Result<Decimal> {
        self.record(ApiCall::Balance { asset: asset.to_string() });
        Ok(self
            .script
            .lock()
            .expect("script lock")
            .balance
            .unwrap_or(dec!(1000)))
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        self.record(ApiCall::Submit { client_order_id: request.client_order_id.clone() });
        let scripted = self.script.lock().expect("script lock").submit_results.pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(OrderAck {
                order_id: i64::from(self.next_order_id.fetch_add(1, Ordering::SeqCst)),
                client_order_id: request.client_order_id.clone(),
            }),
        }
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> Result<()> {
        self.record(ApiCall::Cancel { order_id });
        Ok(())
    }

    async fn symbol_filters(&self, _symbol: &str) -> Result<SymbolFilters> {
        Ok(SymbolFilters::default())
    }

    async fn create_listen_key(&self) -> Result<String> {
        self.record(ApiCall::ListenKey);
        let scripted = self.script.lock().expect("script lock").listen_key_results.pop_front();
        match scripted {
            Some(result) => result,
            None => Ok("listen-key".to_string()),
        }
    }

    async fn keepalive_listen_key(&self, _listen_key: &str) -> Result<()> {
        self.record(ApiCall::Keepalive);
        Ok(())
    }
}

/// Convenience constructor for a retryable server-side error.
pub fn server_error() -> Error {
    Error::Connection("HTTP 500: upstream unavailable".into())
}

/// Convenience constructor for a non-retryable client error.
pub fn client_error() -> Error {
    Error::Exchange { code: -2019, message: "margin is insufficient".into() }
}
