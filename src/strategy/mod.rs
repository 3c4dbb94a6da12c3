//! Strategy engine: one runtime per account, fed by completed indicator
//! calculations, producing trade intents for the executor.
//!
//! Position state lives here as a mirror of the executor's view and is
//! mutated only by `tr.position.opened` / `tr.position.closed`, never
//! by raw fills, which protects the state machine from partial fills
//! and pending cancellations.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::account::{AccountLoaded, AccountRegistry};
use crate::bus::{handler, topics, Event, EventBus};
use crate::config::StrategyConfig;
use crate::domain::{GridSpec, IndicatorResult, PositionState, Side, Signal, TradeAction};
use crate::error::Result;
use crate::indicator::CalculationCompleted;
use crate::trade::{PositionClosed, PositionOpened};

#[derive(Debug, Serialize, Deserialize)]
pub struct StrategyLoaded {
    pub user_id: String,
    pub strategy: String,
    pub timeframe: String,
    pub pairs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StrategyLoadFailed {
    pub user_id: String,
    pub strategy: String,
    pub reason: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndicatorSubscribe {
    pub user_id: String,
    pub symbol: String,
    pub indicator_name: String,
    pub indicator_params: serde_json::Value,
    pub timeframe: String,
}

/// Trade intent handed to the executor. Carries the grid configuration
/// verbatim so the executor can select its mode without re-reading
/// strategy files.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignalGenerated {
    pub user_id: String,
    pub symbol: String,
    pub action: TradeAction,
    pub side: Side,
    /// Reference price for sizing, the close of the triggering candle.
    pub price: Decimal,
    pub leverage: u32,
    pub pair_count: usize,
    pub grid: Option<GridSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GridCreate {
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub grid: GridSpec,
    pub leverage: u32,
    pub pair_count: usize,
}

struct StrategyRuntime {
    name: String,
    config: StrategyConfig,
    grid: Option<GridSpec>,
    positions: Mutex<HashMap<String, PositionState>>,
}

impl StrategyRuntime {
    fn position(&self, symbol: &str) -> PositionState {
        self.positions.lock().get(symbol).copied().unwrap_or_default()
    }

    fn set_position(&self, symbol: &str, state: PositionState) {
        self.positions.lock().insert(symbol.to_string(), state);
    }

    fn has_pair(&self, symbol: &str) -> bool {
        self.config.trading_pairs.iter().any(|p| p.symbol == symbol)
    }
}

/// The strategy engine. Loads one strategy per account and turns
/// aggregated indicator signals into trade intents.
pub struct StrategyEngine {
    bus: Arc<EventBus>,
    registry: Arc<AccountRegistry>,
    config_dir: PathBuf,
    strategies: DashMap<String, Arc<StrategyRuntime>>,
}

impl StrategyEngine {
    pub fn new(bus: Arc<EventBus>, registry: Arc<AccountRegistry>, config_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            bus,
            registry,
            config_dir,
            strategies: DashMap::new(),
        })
    }

    pub fn attach(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::ACCOUNT_LOADED,
            handler("st.account_loaded", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_account_loaded(event).await }
            }),
        );

        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::CALCULATION_COMPLETED,
            handler("st.calculation", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_calculation(event).await }
            }),
        );

        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::POSITION_OPENED,
            handler("st.position_opened", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_position_opened(event).await }
            }),
        );

        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::POSITION_CLOSED,
            handler("st.position_closed", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_position_closed(event).await }
            }),
        );
    }

    fn strategy_path(&self, user_id: &str, strategy: &str) -> PathBuf {
        self.config_dir
            .join("strategies")
            .join(user_id)
            .join(format!("{strategy}.json"))
    }

    async fn on_account_loaded(self: Arc<Self>, event: Event) -> Result<()> {
        let payload: AccountLoaded = event.decode()?;
        if !self.registry.get(&payload.user_id).map_or(false, |a| a.is_enabled) {
            return Ok(());
        }
        let path = self.strategy_path(&payload.user_id, &payload.strategy);

        let loaded = StrategyConfig::load(&path).and_then(|config| {
            let grid = config.grid_spec()?;
            Ok((config, grid))
        });
        let (config, grid) = match loaded {
            Ok(ok) => ok,
            Err(e) => {
                warn!(
                    user_id = %payload.user_id,
                    strategy = %payload.strategy,
                    error = %e,
                    "strategy load failed"
                );
                self.bus.emit(
                    topics::STRATEGY_LOAD_FAILED,
                    &StrategyLoadFailed {
                        user_id: payload.user_id,
                        strategy: payload.strategy,
                        reason: e.to_string(),
                        code: e.code().to_string(),
                    },
                );
                return Ok(());
            }
        };

        let pairs: Vec<String> = config.trading_pairs.iter().map(|p| p.symbol.clone()).collect();
        let mut positions = HashMap::new();
        for symbol in &pairs {
            positions.insert(symbol.clone(), PositionState::None);
        }

        info!(
            user_id = %payload.user_id,
            strategy = %payload.strategy,
            pairs = pairs.len(),
            "strategy loaded"
        );

        // Register the runtime before announcing anything: downstream
        // engines may react to the subscriptions immediately.
        let runtime = Arc::new(StrategyRuntime {
            name: payload.strategy.clone(),
            config,
            grid,
            positions: Mutex::new(positions),
        });
        self.strategies.insert(payload.user_id.clone(), Arc::clone(&runtime));

        self.bus.emit(
            topics::STRATEGY_LOADED,
            &StrategyLoaded {
                user_id: payload.user_id.clone(),
                strategy: payload.strategy.clone(),
                timeframe: runtime.config.timeframe.clone(),
                pairs,
            },
        );

        for pair in &runtime.config.trading_pairs {
            for (indicator_name, params) in &pair.indicator_params {
                self.bus.emit(
                    topics::INDICATOR_SUBSCRIBE,
                    &IndicatorSubscribe {
                        user_id: payload.user_id.clone(),
                        symbol: pair.symbol.clone(),
                        indicator_name: indicator_name.clone(),
                        indicator_params: params.clone(),
                        timeframe: runtime.config.timeframe.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn on_calculation(self: Arc<Self>, event: Event) -> Result<()> {
        let calc: CalculationCompleted = event.decode()?;
        let Some(runtime) = self.strategies.get(&calc.user_id).map(|r| Arc::clone(r.value())) else {
            return Ok(());
        };
        if !runtime.has_pair(&calc.symbol) {
            return Ok(());
        }

        let composite = composite_signal(&calc.results);
        let current = runtime.position(&calc.symbol);
        let Some((action, side)) = intent_for(current, composite) else {
            return Ok(());
        };

        info!(
            user_id = %calc.user_id,
            symbol = %calc.symbol,
            strategy = %runtime.name,
            ?action,
            ?side,
            "signal generated"
        );
        self.bus.emit(
            topics::SIGNAL_GENERATED,
            &SignalGenerated {
                user_id: calc.user_id,
                symbol: calc.symbol,
                action,
                side,
                price: calc.close_price,
                leverage: runtime.config.leverage,
                pair_count: runtime.config.trading_pairs.len(),
                grid: runtime.grid.clone(),
            },
        );
        Ok(())
    }

    async fn on_position_opened(self: Arc<Self>, event: Event) -> Result<()> {
        let opened: PositionOpened = event.decode()?;
        let Some(runtime) = self.strategies.get(&opened.user_id).map(|r| Arc::clone(r.value())) else {
            return Ok(());
        };
        runtime.set_position(&opened.symbol, PositionState::from_entry(opened.side));

        if let Some(grid) = &runtime.grid {
            self.bus.emit(
                topics::GRID_CREATE,
                &GridCreate {
                    user_id: opened.user_id,
                    symbol: opened.symbol,
                    side: opened.side,
                    entry_price: opened.entry_price,
                    grid: grid.clone(),
                    leverage: runtime.config.leverage,
                    pair_count: runtime.config.trading_pairs.len(),
                },
            );
        }
        Ok(())
    }

    async fn on_position_closed(self: Arc<Self>, event: Event) -> Result<()> {
        let closed: PositionClosed = event.decode()?;
        let Some(runtime) = self.strategies.get(&closed.user_id).map(|r| Arc::clone(r.value())) else {
            return Ok(());
        };
        runtime.set_position(&closed.symbol, PositionState::None);

        if runtime.config.reverse {
            let reverse_side = closed.side.opposite();
            info!(
                user_id = %closed.user_id,
                symbol = %closed.symbol,
                side = %reverse_side,
                "reverse entry"
            );
            self.bus.emit(
                topics::SIGNAL_GENERATED,
                &SignalGenerated {
                    user_id: closed.user_id,
                    symbol: closed.symbol,
                    action: TradeAction::Open,
                    side: reverse_side,
                    price: closed.exit_price,
                    leverage: runtime.config.leverage,
                    pair_count: runtime.config.trading_pairs.len(),
                    grid: runtime.grid.clone(),
                },
            );
        }
        Ok(())
    }
}

/// Default composition rule: unanimous direction wins, anything else is
/// no signal.
fn composite_signal(results: &BTreeMap<String, IndicatorResult>) -> Signal {
    let mut signals = results.values().map(|r| r.signal);
    let Some(first) = signals.next() else {
        return Signal::None;
    };
    if first == Signal::None {
        return Signal::None;
    }
    if signals.all(|s| s == first) {
        first
    } else {
        Signal::None
    }
}

/// Position-state transition table for composite signals.
fn intent_for(current: PositionState, composite: Signal) -> Option<(TradeAction, Side)> {
    match (current, composite) {
        (PositionState::None, signal) => {
            signal.entry_side().map(|side| (TradeAction::Open, side))
        }
        (PositionState::Long, Signal::Short) => Some((TradeAction::Close, Side::Sell)),
        (PositionState::Short, Signal::Long) => Some((TradeAction::Close, Side::Buy)),
        _ => None,
    }
}
