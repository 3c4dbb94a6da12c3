//! Trade executor: turns strategy intents into exchange orders through
//! per-symbol trading tasks, owns capital accounting and precision, and
//! reports position transitions back to the bus.

pub mod capital;
pub mod grid;
pub mod precision;
pub mod task;

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::account::AccountLoaded;
use crate::bus::{handler, topics, Event, EventBus};
use crate::data::messages::{
    AccountBalance, AccountUpdate, BalanceRequest, OrderCancelled, OrderFailed, OrderFilled,
    OrderSubmitted,
};
use crate::domain::{Side, SymbolFilters, TradeAction};
use crate::error::Result;
use crate::store::{OrderStore, TaskStore};
use crate::strategy::{GridCreate, SignalGenerated};

pub use capital::{CapitalManager, FeeRates};
pub use grid::{GridFillOutcome, GridPair, GridPlan};
pub use task::{spawn_task, TaskContext, TaskHandle, TaskIntent, TradeMode};

const MARGIN_ASSET: &str = "USDC";

/// Published when a position is confirmed open (entry fill or first
/// grid rung fill, depending on mode).
#[derive(Debug, Serialize, Deserialize)]
pub struct PositionOpened {
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub mode: TradeMode,
}

/// Published only after the closing fill AND all surviving order
/// cancellations are confirmed.
#[derive(Debug, Serialize, Deserialize)]
pub struct PositionClosed {
    pub user_id: String,
    pub symbol: String,
    /// Entry side of the position that was closed.
    pub side: Side,
    pub exit_price: Decimal,
    pub pnl: Decimal,
}

/// The trade executor. Owns one [`CapitalManager`] per account and one
/// task actor per (user, symbol).
pub struct TradeExecutor {
    bus: Arc<EventBus>,
    fees: FeeRates,
    capital: DashMap<String, Arc<CapitalManager>>,
    tasks: DashMap<(String, String), TaskHandle>,
    filters: DashMap<String, SymbolFilters>,
    task_store: Option<Arc<dyn TaskStore>>,
    order_store: Option<Arc<dyn OrderStore>>,
}

impl TradeExecutor {
    pub fn new(
        bus: Arc<EventBus>,
        fees: FeeRates,
        task_store: Option<Arc<dyn TaskStore>>,
        order_store: Option<Arc<dyn OrderStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            fees,
            capital: DashMap::new(),
            tasks: DashMap::new(),
            filters: DashMap::new(),
            task_store,
            order_store,
        })
    }

    /// Seed instrument trading rules. Symbols without an entry fall back
    /// to conservative defaults.
    pub fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.filters.insert(symbol.to_string(), filters);
    }

    pub fn attach(self: &Arc<Self>) {
        let executor = Arc::clone(self);
        self.bus.subscribe(
            topics::ACCOUNT_LOADED,
            handler("tr.account_loaded", move |event| {
                let executor = Arc::clone(&executor);
                async move { executor.on_account_loaded(event).await }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.subscribe(
            topics::ACCOUNT_BALANCE,
            handler("tr.balance", move |event| {
                let executor = Arc::clone(&executor);
                async move { executor.on_balance(event).await }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.subscribe(
            topics::ACCOUNT_UPDATE,
            handler("tr.account_update", move |event| {
                let executor = Arc::clone(&executor);
                async move { executor.on_account_update(event).await }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.subscribe(
            topics::SIGNAL_GENERATED,
            handler("tr.signal", move |event| {
                let executor = Arc::clone(&executor);
                async move { executor.on_signal(event).await }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.subscribe(
            topics::GRID_CREATE,
            handler("tr.grid_create", move |event| {
                let executor = Arc::clone(&executor);
                async move { executor.on_grid_create(event).await }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.subscribe(
            topics::ORDER_SUBMITTED,
            handler("tr.order_submitted", move |event| {
                let executor = Arc::clone(&executor);
                async move { executor.on_order_submitted(event).await }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.subscribe(
            topics::ORDER_FAILED,
            handler("tr.order_failed", move |event| {
                let executor = Arc::clone(&executor);
                async move { executor.on_order_failed(event).await }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.subscribe(
            topics::ORDER_FILLED,
            handler("tr.order_filled", move |event| {
                let executor = Arc::clone(&executor);
                async move { executor.on_order_filled(event).await }
            }),
        );

        let executor = Arc::clone(self);
        self.bus.subscribe(
            topics::ORDER_CANCELLED,
            handler("tr.order_cancelled", move |event| {
                let executor = Arc::clone(&executor);
                async move { executor.on_order_cancelled(event).await }
            }),
        );
    }

    fn capital_for(&self, user_id: &str) -> Arc<CapitalManager> {
        let entry = self
            .capital
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(CapitalManager::new(Decimal::ZERO)));
        Arc::clone(entry.value())
    }

    fn task_for(&self, user_id: &str, symbol: &str) -> TaskHandle {
        let key = (user_id.to_string(), symbol.to_string());
        self.tasks
            .entry(key)
            .or_insert_with(|| {
                let filters = self
                    .filters
                    .get(symbol)
                    .map(|f| f.value().clone())
                    .unwrap_or_default();
                let ctx = TaskContext {
                    bus: Arc::clone(&self.bus),
                    capital: self.capital_for(user_id),
                    filters,
                    fees: self.fees,
                    task_store: self.task_store.clone(),
                    order_store: self.order_store.clone(),
                };
                spawn_task(ctx, user_id.to_string(), symbol.to_string())
            })
            .value()
            .clone()
    }

    fn existing_task(&self, user_id: &str, symbol: &str) -> Option<TaskHandle> {
        self.tasks
            .get(&(user_id.to_string(), symbol.to_string()))
            .map(|h| h.value().clone())
    }

    async fn on_account_loaded(self: Arc<Self>, event: Event) -> Result<()> {
        let payload: AccountLoaded = event.decode()?;
        self.capital_for(&payload.user_id);
        self.bus.emit(
            topics::GET_ACCOUNT_BALANCE,
            &BalanceRequest {
                user_id: payload.user_id,
                asset: MARGIN_ASSET.to_string(),
            },
        );
        Ok(())
    }

    async fn on_balance(self: Arc<Self>, event: Event) -> Result<()> {
        let balance: AccountBalance = event.decode()?;
        debug!(user_id = %balance.user_id, balance = %balance.balance, "balance received");
        self.capital_for(&balance.user_id).set_balance(balance.balance);
        Ok(())
    }

    async fn on_account_update(self: Arc<Self>, event: Event) -> Result<()> {
        let update: AccountUpdate = event.decode()?;
        if let Some(entry) = update.balances.iter().find(|b| b.asset == MARGIN_ASSET) {
            self.capital_for(&update.user_id).set_balance(entry.balance);
        }
        Ok(())
    }

    async fn on_signal(self: Arc<Self>, event: Event) -> Result<()> {
        let signal: SignalGenerated = event.decode()?;
        let task = self.task_for(&signal.user_id, &signal.symbol);
        match signal.action {
            TradeAction::Open => task.send(TaskIntent::Open {
                side: signal.side,
                price: signal.price,
                leverage: signal.leverage,
                pair_count: signal.pair_count,
                grid: signal.grid,
            }),
            TradeAction::Close => task.send(TaskIntent::Close { side: signal.side }),
        }
        Ok(())
    }

    async fn on_grid_create(self: Arc<Self>, event: Event) -> Result<()> {
        let create: GridCreate = event.decode()?;
        let task = self.task_for(&create.user_id, &create.symbol);
        task.send(TaskIntent::DeployGrid {
            side: create.side,
            grid: create.grid,
            leverage: create.leverage,
            pair_count: create.pair_count,
        });
        Ok(())
    }

    async fn on_order_submitted(self: Arc<Self>, event: Event) -> Result<()> {
        let ack: OrderSubmitted = event.decode()?;
        if let Some(task) = self.existing_task(&ack.user_id, &ack.symbol) {
            task.send(TaskIntent::OrderSubmitted {
                client_order_id: ack.client_order_id,
                order_id: ack.order_id,
            });
        }
        Ok(())
    }

    async fn on_order_failed(self: Arc<Self>, event: Event) -> Result<()> {
        let failed: OrderFailed = event.decode()?;
        if let Some(task) = self.existing_task(&failed.user_id, &failed.symbol) {
            task.send(TaskIntent::OrderFailed {
                client_order_id: failed.client_order_id,
                reason: failed.reason,
            });
        }
        Ok(())
    }

    async fn on_order_filled(self: Arc<Self>, event: Event) -> Result<()> {
        let fill: OrderFilled = event.decode()?;
        if let Some(task) = self.existing_task(&fill.user_id, &fill.symbol) {
            task.send(TaskIntent::OrderFilled {
                order_id: fill.order_id,
                client_order_id: fill.client_order_id,
                price: fill.price,
                quantity: fill.quantity,
            });
        }
        Ok(())
    }

    async fn on_order_cancelled(self: Arc<Self>, event: Event) -> Result<()> {
        let cancelled: OrderCancelled = event.decode()?;
        if let Some(task) = self.existing_task(&cancelled.user_id, &cancelled.symbol) {
            task.send(TaskIntent::OrderCancelled { order_id: cancelled.order_id });
        }
        Ok(())
    }
}
