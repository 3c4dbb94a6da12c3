//! Scripted market/user stream doubles and a transport factory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::account::Account;
use crate::data::market_ws::{MarketStream, MarketWsEvent, StreamSub};
use crate::data::rest::ExchangeApi;
use crate::data::user_ws::{UserStream, UserWsEvent};
use crate::data::TransportFactory;
use crate::error::Result;

use super::api::ScriptedApi;

/// Remote control for a scripted market stream.
#[derive(Clone)]
pub struct MarketStreamHandle {
    tx: mpsc::UnboundedSender<MarketWsEvent>,
}

impl MarketStreamHandle {
    pub fn closed_kline(&self, symbol: &str, interval: &str) {
        self.tx
            .send(MarketWsEvent::ClosedKline {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
            })
            .ok();
    }

    pub fn disconnect(&self, reason: &str) {
        self.tx
            .send(MarketWsEvent::Disconnected { reason: reason.to_string() })
            .ok();
    }
}

/// Scripted market stream: queued connect results and events, then a
/// live channel, then pending forever.
pub struct ScriptedMarketStream {
    connect_results: VecDeque<Result<()>>,
    events: VecDeque<MarketWsEvent>,
    rx: Option<mpsc::UnboundedReceiver<MarketWsEvent>>,
    connect_count: Arc<AtomicU32>,
    subscriptions: Arc<Mutex<Vec<Vec<StreamSub>>>>,
}

impl Default for ScriptedMarketStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedMarketStream {
    pub fn new() -> Self {
        Self {
            connect_results: VecDeque::new(),
            events: VecDeque::new(),
            rx: None,
            connect_count: Arc::new(AtomicU32::new(0)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A stream driven on demand from the test body.
    pub fn channelled() -> (Self, MarketStreamHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = Self::new();
        stream.rx = Some(rx);
        (stream, MarketStreamHandle { tx })
    }

    pub fn with_connect_results(mut self, results: Vec<Result<()>>) -> Self {
        self.connect_results = results.into();
        self
    }

    pub fn with_events(mut self, events: Vec<MarketWsEvent>) -> Self {
        self.events = events.into();
        self
    }

    /// Shared observation handles: connect count and subscribe log.
    pub fn probes(&self) -> (Arc<AtomicU32>, Arc<Mutex<Vec<Vec<StreamSub>>>>) {
        (Arc::clone(&self.connect_count), Arc::clone(&self.subscriptions))
    }
}

#[async_trait]
impl MarketStream for ScriptedMarketStream {
    async fn connect(&mut self) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.connect_results.pop_front().unwrap_or(Ok(()))
    }

    async fn subscribe(&mut self, subs: &[StreamSub]) -> Result<()> {
        self.subscriptions
            .lock()
            .expect("subscription log lock")
            .push(subs.to_vec());
        Ok(())
    }

    async fn next_event(&mut self) -> Option<MarketWsEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        match &mut self.rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}

/// Remote control for a scripted user stream.
#[derive(Clone)]
pub struct UserStreamHandle {
    tx: mpsc::UnboundedSender<UserWsEvent>,
}

impl UserStreamHandle {
    pub fn send(&self, event: UserWsEvent) {
        self.tx.send(event).ok();
    }
}

/// Scripted user-data stream.
pub struct ScriptedUserStream {
    connect_results: VecDeque<Result<()>>,
    events: VecDeque<UserWsEvent>,
    rx: Option<mpsc::UnboundedReceiver<UserWsEvent>>,
    listen_keys: Arc<Mutex<Vec<String>>>,
}

impl Default for ScriptedUserStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedUserStream {
    pub fn new() -> Self {
        Self {
            connect_results: VecDeque::new(),
            events: VecDeque::new(),
            rx: None,
            listen_keys: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn channelled() -> (Self, UserStreamHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = Self::new();
        stream.rx = Some(rx);
        (stream, UserStreamHandle { tx })
    }

    pub fn with_events(mut self, events: Vec<UserWsEvent>) -> Self {
        self.events = events.into();
        self
    }

    /// Listen keys this stream was connected with, in order.
    pub fn listen_key_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.listen_keys)
    }
}

#[async_trait]
impl UserStream for ScriptedUserStream {
    async fn connect(&mut self, listen_key: &str) -> Result<()> {
        self.listen_keys
            .lock()
            .expect("listen key log lock")
            .push(listen_key.to_string());
        self.connect_results.pop_front().unwrap_or(Ok(()))
    }

    async fn next_event(&mut self) -> Option<UserWsEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        match &mut self.rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}

/// Transport factory handing out the shared scripted API plus queued
/// stream doubles; exhausted queues produce idle streams.
pub struct ScriptedTransport {
    api: Arc<ScriptedApi>,
    market_streams: Mutex<VecDeque<ScriptedMarketStream>>,
    user_streams: Mutex<VecDeque<ScriptedUserStream>>,
}

impl ScriptedTransport {
    pub fn new(api: Arc<ScriptedApi>) -> Self {
        Self {
            api,
            market_streams: Mutex::new(VecDeque::new()),
            user_streams: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_market_stream(&self, stream: ScriptedMarketStream) {
        self.market_streams
            .lock()
            .expect("market stream queue lock")
            .push_back(stream);
    }

    pub fn push_user_stream(&self, stream: ScriptedUserStream) {
        self.user_streams
            .lock()
            .expect("user stream queue lock")
            .push_back(stream);
    }
}

impl TransportFactory for ScriptedTransport {
    fn rest(&self, _account: &Account) -> Result<Arc<dyn ExchangeApi>> {
        Ok(Arc::clone(&self.api) as Arc<dyn ExchangeApi>)
    }

    fn market_stream(&self, _account: &Account) -> Box<dyn MarketStream> {
        let stream = self
            .market_streams
            .lock()
            .expect("market stream queue lock")
            .pop_front()
            .unwrap_or_default();
        Box::new(stream)
    }

    fn user_stream(&self, _account: &Account) -> Box<dyn UserStream> {
        let stream = self
            .user_streams
            .lock()
            .expect("user stream queue lock")
            .pop_front()
            .unwrap_or_default();
        Box::new(stream)
    }
}
