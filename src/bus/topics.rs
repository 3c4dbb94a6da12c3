//! The complete set of subjects used by the runtime.

// Account registry
pub const ACCOUNT_LOADED: &str = "pm.account.loaded";
pub const ACCOUNT_ENABLED: &str = "pm.account.enabled";
pub const ACCOUNT_DISABLED: &str = "pm.account.disabled";
pub const ACCOUNT_LOAD_FAILED: &str = "pm.load.failed";
pub const PM_READY: &str = "pm.manager.ready";
pub const PM_SHUTDOWN: &str = "pm.manager.shutdown";

// Data engine: connections
pub const CLIENT_CONNECTED: &str = "de.client.connected";
pub const CLIENT_CONNECTION_FAILED: &str = "de.client.connection_failed";
pub const WS_CONNECTED: &str = "de.websocket.connected";
pub const WS_DISCONNECTED: &str = "de.websocket.disconnected";
pub const USER_STREAM_STARTED: &str = "de.user_stream.started";

// Data engine: market data
pub const GET_HISTORICAL_KLINES: &str = "de.get_historical_klines";
pub const HISTORICAL_KLINES_SUCCESS: &str = "de.historical_klines.success";
pub const HISTORICAL_KLINES_FAILED: &str = "de.historical_klines.failed";
pub const KLINE_UPDATE: &str = "de.kline.update";

// Data engine: account and orders
pub const ACCOUNT_BALANCE: &str = "de.account.balance";
pub const ACCOUNT_UPDATE: &str = "de.account.update";
pub const POSITION_UPDATE: &str = "de.position.update";
pub const ORDER_SUBMITTED: &str = "de.order.submitted";
pub const ORDER_FAILED: &str = "de.order.failed";
pub const ORDER_CANCELLED: &str = "de.order.cancelled";
pub const ORDER_FILLED: &str = "de.order.filled";
pub const ORDER_UPDATE: &str = "de.order.update";

// Trading requests consumed by the data engine
pub const ORDER_CREATE: &str = "trading.order.create";
pub const ORDER_CANCEL: &str = "trading.order.cancel";
pub const GET_ACCOUNT_BALANCE: &str = "trading.get_account_balance";

// Strategy engine
pub const STRATEGY_LOADED: &str = "st.strategy.loaded";
pub const STRATEGY_LOAD_FAILED: &str = "st.strategy.load_failed";
pub const INDICATOR_SUBSCRIBE: &str = "st.indicator.subscribe";
pub const SIGNAL_GENERATED: &str = "st.signal.generated";
pub const GRID_CREATE: &str = "st.grid.create";

// Indicator engine
pub const INDICATOR_CREATED: &str = "ta.indicator.created";
pub const INDICATOR_CREATE_FAILED: &str = "ta.indicator.create_failed";
pub const CALCULATION_COMPLETED: &str = "ta.calculation.completed";

// Trade executor
pub const POSITION_OPENED: &str = "tr.position.opened";
pub const POSITION_CLOSED: &str = "tr.position.closed";
