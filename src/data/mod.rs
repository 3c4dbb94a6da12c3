//! Data engine: per-account REST client, market K-line stream and
//! user-data stream, driven entirely by bus events.
//!
//! Every account gets its own connections; a failure in one account
//! never touches another. Connection lifecycles follow the
//! [`connection::Reconnector`] state machine.

pub mod connection;
pub mod frames;
pub mod market_ws;
pub mod messages;
pub mod rest;
pub mod sign;
pub mod user_ws;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::account::{Account, AccountLoaded, AccountRegistry};
use crate::bus::{handler, topics, EventBus};
use crate::domain::Side;
use crate::error::{Error, Result};

use connection::{ReconnectPolicy, Reconnector};
use frames::{AccountUpdateFrame, OrderUpdateFrame};
use market_ws::{MarketStream, MarketWsEvent, StreamSub, WsMarketStream};
use messages::*;
use rest::{ExchangeApi, FuturesRestClient, OrderAck, OrderRequest};
use user_ws::{UserStream, UserWsEvent, WsUserStream};

/// Forced-reconnect threshold for silent sockets.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
/// Listen-key refresh cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Total attempts for one order submission.
pub const MAX_ORDER_ATTEMPTS: u32 = 3;
/// K-line window size published on each closed candle.
pub const KLINE_WINDOW: u32 = 200;

const RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Builds per-account transports. The live factory talks to the
/// exchange; tests inject scripted streams and APIs.
pub trait TransportFactory: Send + Sync {
    fn rest(&self, account: &Account) -> Result<Arc<dyn ExchangeApi>>;
    fn market_stream(&self, account: &Account) -> Box<dyn MarketStream>;
    fn user_stream(&self, account: &Account) -> Box<dyn UserStream>;
}

/// Production transport factory.
pub struct LiveTransport {
    pub rest_url: String,
    pub ws_url: String,
    pub testnet_rest_url: String,
    pub testnet_ws_url: String,
}

impl Default for LiveTransport {
    fn default() -> Self {
        Self {
            rest_url: "https://fapi.binance.com".into(),
            ws_url: "wss://fstream.binance.com".into(),
            testnet_rest_url: "https://testnet.binancefuture.com".into(),
            testnet_ws_url: "wss://stream.binancefuture.com".into(),
        }
    }
}

impl LiveTransport {
    fn rest_url_for(&self, account: &Account) -> &str {
        if account.testnet { &self.testnet_rest_url } else { &self.rest_url }
    }

    fn ws_url_for(&self, account: &Account) -> &str {
        if account.testnet { &self.testnet_ws_url } else { &self.ws_url }
    }
}

impl TransportFactory for LiveTransport {
    fn rest(&self, account: &Account) -> Result<Arc<dyn ExchangeApi>> {
        Ok(Arc::new(FuturesRestClient::new(
            self.rest_url_for(account),
            &account.credentials,
        )?))
    }

    fn market_stream(&self, account: &Account) -> Box<dyn MarketStream> {
        Box::new(WsMarketStream::new(format!("{}/ws", self.ws_url_for(account))))
    }

    fn user_stream(&self, account: &Account) -> Box<dyn UserStream> {
        Box::new(WsUserStream::new(self.ws_url_for(account).to_string()))
    }
}

struct AccountHandle {
    api: Arc<dyn ExchangeApi>,
    market_tx: mpsc::UnboundedSender<StreamSub>,
}

/// The data engine. One instance serves every account.
pub struct DataEngine {
    bus: Arc<EventBus>,
    registry: Arc<AccountRegistry>,
    transport: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,
    connections: DashMap<String, AccountHandle>,
}

impl DataEngine {
    pub fn new(
        bus: Arc<EventBus>,
        registry: Arc<AccountRegistry>,
        transport: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            registry,
            transport,
            policy: ReconnectPolicy::default(),
            connections: DashMap::new(),
        })
    }

    /// Register the engine's handlers on the bus.
    pub fn attach(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::ACCOUNT_LOADED,
            handler("de.account_loaded", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_account_loaded(event).await }
            }),
        );

        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::GET_HISTORICAL_KLINES,
            handler("de.historical_klines", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_klines_request(event).await }
            }),
        );

        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::GET_ACCOUNT_BALANCE,
            handler("de.balance", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_balance_request(event).await }
            }),
        );

        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::ORDER_CREATE,
            handler("de.order_create", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_order_create(event).await }
            }),
        );

        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::ORDER_CANCEL,
            handler("de.order_cancel", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_order_cancel(event).await }
            }),
        );
    }

    /// Resolve the account's REST client, waiting briefly for setup to
    /// finish. Requests triggered by `pm.account.loaded` fan-out can
    /// land before this engine's own handler has built the clients.
    async fn api(&self, user_id: &str) -> Result<Arc<dyn ExchangeApi>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(handle) = self.connections.get(user_id) {
                return Ok(Arc::clone(&handle.api));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::UnknownAccount(user_id.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn on_account_loaded(self: Arc<Self>, event: crate::bus::Event) -> Result<()> {
        let payload: AccountLoaded = event.decode()?;
        let account = self
            .registry
            .get(&payload.user_id)
            .ok_or_else(|| Error::UnknownAccount(payload.user_id.clone()))?;
        if !account.is_enabled {
            info!(user_id = %account.user_id, "account disabled, skipping connections");
            return Ok(());
        }

        let api = match self.transport.rest(&account) {
            Ok(api) => api,
            Err(e) => {
                self.report_connection_failure(&account.user_id, &e);
                return Ok(());
            }
        };

        // The listen-key request doubles as the credential probe: an
        // AuthN failure aborts only this account's setup.
        let listen_key = match api.create_listen_key().await {
            Ok(key) => key,
            Err(e) => {
                self.report_connection_failure(&account.user_id, &e);
                return Ok(());
            }
        };

        self.bus.emit(
            topics::CLIENT_CONNECTED,
            &ClientConnected {
                user_id: account.user_id.clone(),
                testnet: account.testnet,
            },
        );

        let (market_tx, market_rx) = mpsc::unbounded_channel();
        self.connections.insert(
            account.user_id.clone(),
            AccountHandle { api: Arc::clone(&api), market_tx },
        );

        let market_stream = self.transport.market_stream(&account);
        tokio::spawn(run_market_task(
            account.user_id.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&api),
            market_stream,
            market_rx,
            self.policy.clone(),
        ));

        let user_stream = self.transport.user_stream(&account);
        tokio::spawn(run_user_task(
            account.user_id.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&api),
            user_stream,
            listen_key,
            self.policy.clone(),
        ));
        Ok(())
    }

    fn report_connection_failure(&self, user_id: &str, e: &Error) {
        error!(user_id = %user_id, error = %e, "client connection failed");
        self.bus.emit(
            topics::CLIENT_CONNECTION_FAILED,
            &ConnectionFailed {
                user_id: user_id.to_string(),
                reason: e.to_string(),
                code: e.code().to_string(),
            },
        );
    }

    async fn on_klines_request(self: Arc<Self>, event: crate::bus::Event) -> Result<()> {
        let request: KlinesRequest = event.decode()?;
        let api = self.api(&request.user_id).await?;

        // A history request implies live interest in the pair: keep the
        // market stream subscribed to it.
        if let Some(handle) = self.connections.get(&request.user_id) {
            handle
                .market_tx
                .send(StreamSub {
                    symbol: request.symbol.clone(),
                    interval: request.interval.clone(),
                })
                .ok();
        }

        match api.klines(&request.symbol, &request.interval, request.limit).await {
            Ok(klines) => self.bus.emit(
                topics::HISTORICAL_KLINES_SUCCESS,
                &KlinesResponse {
                    user_id: request.user_id,
                    symbol: request.symbol,
                    interval: request.interval,
                    klines,
                },
            ),
            Err(e) => self.bus.emit(
                topics::HISTORICAL_KLINES_FAILED,
                &KlinesFailed {
                    user_id: request.user_id,
                    symbol: request.symbol,
                    interval: request.interval,
                    reason: e.to_string(),
                },
            ),
        }
        Ok(())
    }

    async fn on_balance_request(self: Arc<Self>, event: crate::bus::Event) -> Result<()> {
        let request: BalanceRequest = event.decode()?;
        let api = self.api(&request.user_id).await?;
        let balance = api.account_balance(&request.asset).await?;
        self.bus.emit(
            topics::ACCOUNT_BALANCE,
            &AccountBalance {
                user_id: request.user_id,
                asset: request.asset,
                balance,
            },
        );
        Ok(())
    }

    async fn on_order_create(self: Arc<Self>, event: crate::bus::Event) -> Result<()> {
        let create: OrderCreate = event.decode()?;
        let api = self.api(&create.user_id).await?;
        let request = OrderRequest {
            symbol: create.symbol.clone(),
            side: create.side,
            order_type: create.order_type,
            quantity: create.quantity,
            price: create.price,
            client_order_id: create.client_order_id.clone(),
            reduce_only: create.reduce_only,
        };

        let (retry_count, outcome) = submit_with_retry(api.as_ref(), &request).await;
        match outcome {
            Ok(ack) => {
                info!(
                    user_id = %create.user_id,
                    symbol = %create.symbol,
                    order_id = ack.order_id,
                    retry_count,
                    "order submitted"
                );
                self.bus.emit(
                    topics::ORDER_SUBMITTED,
                    &OrderSubmitted {
                        user_id: create.user_id,
                        symbol: create.symbol,
                        order_id: ack.order_id,
                        client_order_id: ack.client_order_id,
                        retry_count,
                    },
                );
            }
            Err(e) => {
                error!(
                    user_id = %create.user_id,
                    symbol = %create.symbol,
                    error = %e,
                    retry_count,
                    "order submission failed"
                );
                self.bus.emit(
                    topics::ORDER_FAILED,
                    &OrderFailed {
                        user_id: create.user_id,
                        symbol: create.symbol,
                        client_order_id: create.client_order_id,
                        reason: e.to_string(),
                        code: e.code().to_string(),
                        retry_count,
                    },
                );
            }
        }
        Ok(())
    }

    async fn on_order_cancel(self: Arc<Self>, event: crate::bus::Event) -> Result<()> {
        let cancel: OrderCancel = event.decode()?;
        let api = self.api(&cancel.user_id).await?;
        match api.cancel_order(&cancel.symbol, cancel.order_id).await {
            Ok(()) => self.bus.emit(
                topics::ORDER_CANCELLED,
                &OrderCancelled {
                    user_id: cancel.user_id,
                    symbol: cancel.symbol,
                    order_id: cancel.order_id,
                },
            ),
            Err(e) => self.bus.emit(
                topics::ORDER_FAILED,
                &OrderFailed {
                    user_id: cancel.user_id,
                    symbol: cancel.symbol,
                    client_order_id: String::new(),
                    reason: format!("cancel of order {} failed: {e}", cancel.order_id),
                    code: e.code().to_string(),
                    retry_count: 0,
                },
            ),
        }
        Ok(())
    }
}

/// Submit an order, retrying transient failures with a fresh timestamp
/// and signature each attempt. Returns the retry count actually used.
pub(crate) async fn submit_with_retry(
    api: &dyn ExchangeApi,
    request: &OrderRequest,
) -> (u32, Result<OrderAck>) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match api.submit_order(request).await {
            Ok(ack) => return (attempt - 1, Ok(ack)),
            Err(e) if e.is_retryable() && attempt < MAX_ORDER_ATTEMPTS => {
                warn!(
                    client_order_id = %request.client_order_id,
                    attempt,
                    error = %e,
                    "retrying order submission"
                );
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(e) => {
                let retry_count = if e.is_retryable() { attempt } else { attempt - 1 };
                return (retry_count, Err(e));
            }
        }
    }
}

async fn reconnect_market(
    user_id: &str,
    bus: &EventBus,
    stream: &mut Box<dyn MarketStream>,
    subs: &[StreamSub],
    reconnector: &mut Reconnector,
) -> bool {
    loop {
        reconnector.on_connecting();
        match stream.connect().await {
            Ok(()) => match stream.subscribe(subs).await {
                Ok(()) => {
                    reconnector.on_connected();
                    bus.emit(
                        topics::WS_CONNECTED,
                        &WsConnected { user_id: user_id.to_string(), stream: "market".into() },
                    );
                    return true;
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "market resubscribe failed");
                    if fail_or_backoff(user_id, bus, reconnector, &e).await {
                        return false;
                    }
                }
            },
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "market connect failed");
                if fail_or_backoff(user_id, bus, reconnector, &e).await {
                    return false;
                }
            }
        }
    }
}

/// Record a connection failure. Returns `true` when the connection is
/// terminally failed (reported critically); otherwise sleeps out the
/// backoff and lets the caller retry.
async fn fail_or_backoff(
    user_id: &str,
    bus: &EventBus,
    reconnector: &mut Reconnector,
    e: &Error,
) -> bool {
    if reconnector.on_failure() {
        error!(
            user_id = %user_id,
            failures = reconnector.failures(),
            "connection permanently failed"
        );
        bus.emit(
            topics::CLIENT_CONNECTION_FAILED,
            &ConnectionFailed {
                user_id: user_id.to_string(),
                reason: format!("gave up after {} consecutive failures: {e}", reconnector.failures()),
                code: "CONNECTION_FAILED".into(),
            },
        );
        return true;
    }
    tokio::time::sleep(reconnector.next_delay()).await;
    false
}

async fn run_market_task(
    user_id: String,
    bus: Arc<EventBus>,
    api: Arc<dyn ExchangeApi>,
    mut stream: Box<dyn MarketStream>,
    mut rx: mpsc::UnboundedReceiver<StreamSub>,
    policy: ReconnectPolicy,
) {
    let mut subs: Vec<StreamSub> = Vec::new();
    let mut reconnector = Reconnector::new(policy);

    if !reconnect_market(&user_id, &bus, &mut stream, &subs, &mut reconnector).await {
        return;
    }

    enum Step {
        Subscribe(StreamSub),
        Event(Option<MarketWsEvent>),
        Timeout,
        Stop,
    }

    loop {
        // Resolve the select into a value first so the stream borrow
        // from the event future is released before we drive the stream.
        let step = tokio::select! {
            command = rx.recv() => match command {
                Some(sub) => Step::Subscribe(sub),
                None => Step::Stop,
            },
            next = timeout(HEARTBEAT_TIMEOUT, stream.next_event()) => match next {
                Ok(event) => Step::Event(event),
                Err(_) => Step::Timeout,
            },
        };

        let reason = match step {
            Step::Stop => {
                info!(user_id = %user_id, "market task shutting down");
                return;
            }
            Step::Subscribe(sub) => {
                if subs.contains(&sub) {
                    continue;
                }
                subs.push(sub.clone());
                match stream.subscribe(std::slice::from_ref(&sub)).await {
                    Ok(()) => continue,
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "market subscribe failed, reconnecting");
                        e.to_string()
                    }
                }
            }
            Step::Event(Some(MarketWsEvent::ClosedKline { symbol, interval })) => {
                publish_kline_window(&user_id, &bus, api.as_ref(), &symbol, &interval).await;
                continue;
            }
            Step::Event(Some(MarketWsEvent::Disconnected { reason })) => reason,
            Step::Event(None) => "stream ended".to_string(),
            Step::Timeout => "heartbeat timeout".to_string(),
        };

        warn!(user_id = %user_id, reason = %reason, "market stream lost");
        bus.emit(topics::WS_DISCONNECTED, &WsDisconnected {
            user_id: user_id.clone(),
            stream: "market".into(),
            reason,
        });
        if !reconnect_market(&user_id, &bus, &mut stream, &subs, &mut reconnector).await {
            return;
        }
    }
}

/// Fetch the freshest closed-candle window and publish it. K-lines are
/// never cached; every tick carries the full window.
async fn publish_kline_window(
    user_id: &str,
    bus: &EventBus,
    api: &dyn ExchangeApi,
    symbol: &str,
    interval: &str,
) {
    match api.klines(symbol, interval, KLINE_WINDOW).await {
        Ok(mut klines) => {
            // The newest row may still be open; publish closed candles only.
            klines.retain(|k| k.is_closed);
            bus.emit(
                topics::KLINE_UPDATE,
                &KlineUpdate {
                    user_id: user_id.to_string(),
                    symbol: symbol.to_string(),
                    interval: interval.to_string(),
                    klines,
                },
            );
        }
        Err(e) => {
            warn!(user_id = %user_id, symbol, interval, error = %e, "kline window fetch failed");
        }
    }
}

async fn run_user_task(
    user_id: String,
    bus: Arc<EventBus>,
    api: Arc<dyn ExchangeApi>,
    mut stream: Box<dyn UserStream>,
    initial_listen_key: String,
    policy: ReconnectPolicy,
) {
    let mut listen_key = initial_listen_key;
    let mut reconnector = Reconnector::new(policy);

    'connection: loop {
        reconnector.on_connecting();
        match stream.connect(&listen_key).await {
            Ok(()) => {
                reconnector.on_connected();
                bus.emit(
                    topics::WS_CONNECTED,
                    &WsConnected { user_id: user_id.clone(), stream: "user".into() },
                );
                bus.emit(topics::USER_STREAM_STARTED, &UserStreamStarted { user_id: user_id.clone() });
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "user stream connect failed");
                if fail_or_backoff(&user_id, &bus, &mut reconnector, &e).await {
                    return;
                }
                match api.create_listen_key().await {
                    Ok(key) => listen_key = key,
                    Err(e) => {
                        if fail_or_backoff(&user_id, &bus, &mut reconnector, &e).await {
                            return;
                        }
                    }
                }
                continue 'connection;
            }
        }

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        // The first interval tick fires immediately; consume it.
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    if let Err(e) = api.keepalive_listen_key(&listen_key).await {
                        warn!(user_id = %user_id, error = %e, "listen-key keepalive failed");
                        bus.emit(topics::WS_DISCONNECTED, &WsDisconnected {
                            user_id: user_id.clone(),
                            stream: "user".into(),
                            reason: format!("keepalive failed: {e}"),
                        });
                        break;
                    }
                }
                next = timeout(HEARTBEAT_TIMEOUT, stream.next_event()) => {
                    let reason = match next {
                        Ok(Some(UserWsEvent::Order(frame))) => {
                            publish_order_update(&user_id, &bus, frame);
                            continue;
                        }
                        Ok(Some(UserWsEvent::Account(frame))) => {
                            publish_account_update(&user_id, &bus, frame);
                            continue;
                        }
                        Ok(Some(UserWsEvent::ListenKeyExpired)) => "listen key expired".to_string(),
                        Ok(Some(UserWsEvent::Disconnected { reason })) => reason,
                        Ok(None) => "stream ended".to_string(),
                        Err(_) => "heartbeat timeout".to_string(),
                    };
                    warn!(user_id = %user_id, reason = %reason, "user stream lost");
                    bus.emit(topics::WS_DISCONNECTED, &WsDisconnected {
                        user_id: user_id.clone(),
                        stream: "user".into(),
                        reason,
                    });
                    break;
                }
            }
        }

        // A dropped user stream always gets a brand new listen-key.
        loop {
            match api.create_listen_key().await {
                Ok(key) => {
                    listen_key = key;
                    break;
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "listen-key renewal failed");
                    if fail_or_backoff(&user_id, &bus, &mut reconnector, &e).await {
                        return;
                    }
                }
            }
        }
    }
}

fn publish_order_update(user_id: &str, bus: &EventBus, frame: OrderUpdateFrame) {
    let side = if frame.side == "SELL" { Side::Sell } else { Side::Buy };
    bus.emit(
        topics::ORDER_UPDATE,
        &OrderUpdateEvent {
            user_id: user_id.to_string(),
            symbol: frame.symbol.clone(),
            order_id: frame.order_id,
            client_order_id: frame.client_order_id.clone(),
            status: frame.status.clone(),
            filled_quantity: frame.filled_quantity,
        },
    );
    if frame.last_fill_quantity > rust_decimal::Decimal::ZERO {
        bus.emit(
            topics::ORDER_FILLED,
            &OrderFilled {
                user_id: user_id.to_string(),
                symbol: frame.symbol,
                order_id: frame.order_id,
                client_order_id: frame.client_order_id,
                side,
                price: frame.last_fill_price,
                quantity: frame.last_fill_quantity,
                fee: frame.fee,
            },
        );
    }
}

fn publish_account_update(user_id: &str, bus: &EventBus, frame: AccountUpdateFrame) {
    bus.emit(
        topics::ACCOUNT_UPDATE,
        &AccountUpdate {
            user_id: user_id.to_string(),
            balances: frame
                .balances
                .iter()
                .map(|b| AssetBalance { asset: b.asset.clone(), balance: b.wallet_balance })
                .collect(),
        },
    );
    for position in frame.positions {
        bus.emit(
            topics::POSITION_UPDATE,
            &PositionUpdate {
                user_id: user_id.to_string(),
                symbol: position.symbol,
                amount: position.amount,
                entry_price: position.entry_price,
            },
        );
    }
}
