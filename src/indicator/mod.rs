//! Indicator engine: instance registry keyed by
//! `(user, symbol, interval, name)`, K-line driven recomputation, and
//! per-symbol aggregation of results into one completed calculation per
//! candle.

pub mod aggregator;
pub mod builtin;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::{handler, topics, Event, EventBus};
use crate::data::messages::{KlineUpdate, KlinesRequest, KlinesResponse};
use crate::domain::IndicatorResult;
use crate::error::Result;
use crate::strategy::IndicatorSubscribe;

use aggregator::Aggregator;
use builtin::{Indicator, IndicatorRegistry};

/// Historical window requested when an indicator subscribes.
pub const DEFAULT_HISTORY: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub user_id: String,
    pub symbol: String,
    pub interval: String,
    pub name: String,
}

struct InstanceState {
    indicator: Mutex<Box<dyn Indicator>>,
    ready: AtomicBool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndicatorCreated {
    pub user_id: String,
    pub symbol: String,
    pub indicator_name: String,
    pub timeframe: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndicatorCreateFailed {
    pub user_id: String,
    pub symbol: String,
    pub indicator_name: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CalculationCompleted {
    pub user_id: String,
    pub symbol: String,
    pub interval: String,
    pub close_price: Decimal,
    /// `indicator_name -> result` for every indicator on this key.
    pub results: BTreeMap<String, IndicatorResult>,
}

/// The indicator engine. Never caches K-lines; each computation works
/// on the window the data engine supplies.
pub struct IndicatorEngine {
    bus: Arc<EventBus>,
    registry: IndicatorRegistry,
    instances: DashMap<InstanceKey, Arc<InstanceState>>,
    aggregator: Aggregator,
}

impl IndicatorEngine {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Self::with_registry(bus, IndicatorRegistry::with_builtins())
    }

    pub fn with_registry(bus: Arc<EventBus>, registry: IndicatorRegistry) -> Arc<Self> {
        Arc::new(Self {
            bus,
            registry,
            instances: DashMap::new(),
            aggregator: Aggregator::new(),
        })
    }

    pub fn attach(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::INDICATOR_SUBSCRIBE,
            handler("ta.subscribe", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_subscribe(event).await }
            }),
        );

        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::HISTORICAL_KLINES_SUCCESS,
            handler("ta.history", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_history(event).await }
            }),
        );

        let engine = Arc::clone(self);
        self.bus.subscribe(
            topics::KLINE_UPDATE,
            handler("ta.kline", move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.on_kline(event).await }
            }),
        );
    }

    async fn on_subscribe(self: Arc<Self>, event: Event) -> Result<()> {
        let request: IndicatorSubscribe = event.decode()?;
        match self.registry.create(&request.indicator_name, &request.indicator_params) {
            Ok(indicator) => {
                let min_klines = indicator.min_klines();
                let key = InstanceKey {
                    user_id: request.user_id.clone(),
                    symbol: request.symbol.clone(),
                    interval: request.timeframe.clone(),
                    name: request.indicator_name.clone(),
                };
                info!(
                    user_id = %key.user_id,
                    symbol = %key.symbol,
                    indicator = %key.name,
                    timeframe = %key.interval,
                    "indicator instance created"
                );
                self.instances.insert(
                    key,
                    Arc::new(InstanceState {
                        indicator: Mutex::new(indicator),
                        ready: AtomicBool::new(false),
                    }),
                );
                self.bus.emit(
                    topics::GET_HISTORICAL_KLINES,
                    &KlinesRequest {
                        user_id: request.user_id.clone(),
                        symbol: request.symbol.clone(),
                        interval: request.timeframe.clone(),
                        limit: (min_klines as u32).max(DEFAULT_HISTORY),
                    },
                );
                self.bus.emit(
                    topics::INDICATOR_CREATED,
                    &IndicatorCreated {
                        user_id: request.user_id,
                        symbol: request.symbol,
                        indicator_name: request.indicator_name,
                        timeframe: request.timeframe,
                    },
                );
            }
            Err(e) => {
                warn!(
                    user_id = %request.user_id,
                    indicator = %request.indicator_name,
                    error = %e,
                    "indicator construction failed"
                );
                self.bus.emit(
                    topics::INDICATOR_CREATE_FAILED,
                    &IndicatorCreateFailed {
                        user_id: request.user_id,
                        symbol: request.symbol,
                        indicator_name: request.indicator_name,
                        reason: e.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn on_history(self: Arc<Self>, event: Event) -> Result<()> {
        let response: KlinesResponse = event.decode()?;
        for entry in self.instances.iter() {
            let key = entry.key();
            if key.user_id != response.user_id
                || key.symbol != response.symbol
                || key.interval != response.interval
            {
                continue;
            }
            let state = entry.value();
            match state.indicator.lock().initialize(&response.klines) {
                Ok(()) => {
                    state.ready.store(true, Ordering::SeqCst);
                    info!(
                        user_id = %key.user_id,
                        symbol = %key.symbol,
                        indicator = %key.name,
                        candles = response.klines.len(),
                        "indicator ready"
                    );
                }
                Err(e) => {
                    warn!(
                        user_id = %key.user_id,
                        indicator = %key.name,
                        error = %e,
                        "indicator initialization failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn on_kline(self: Arc<Self>, event: Event) -> Result<()> {
        let update: KlineUpdate = event.decode()?;
        let Some(last) = update.klines.last() else {
            return Ok(());
        };
        let tick = last.close_time;

        // Ready instances for this key form the expected set; anything
        // still initializing is ignored.
        let matching: Vec<(InstanceKey, Arc<InstanceState>)> = self
            .instances
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.user_id == update.user_id
                    && key.symbol == update.symbol
                    && key.interval == update.interval
                    && entry.value().ready.load(Ordering::SeqCst)
            })
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        if matching.is_empty() {
            return Ok(());
        }
        let expected = matching.iter().map(|(key, _)| key.name.clone()).collect();

        for (key, state) in matching {
            let result = state.indicator.lock().compute(&update.klines);
            if let Some(results) = self.aggregator.deposit(
                &update.user_id,
                &update.symbol,
                tick,
                &expected,
                &key.name,
                result,
            ) {
                self.bus.emit(
                    topics::CALCULATION_COMPLETED,
                    &CalculationCompleted {
                        user_id: update.user_id.clone(),
                        symbol: update.symbol.clone(),
                        interval: update.interval.clone(),
                        close_price: last.close,
                        results,
                    },
                );
            }
        }
        Ok(())
    }
}
