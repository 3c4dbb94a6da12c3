//! Per-(user, symbol) trading task.
//!
//! Each task is a single-writer actor: bus handlers convert events into
//! [`TaskIntent`]s and queue them here, and one owning tokio task applies
//! them in order. Position state therefore transitions strictly
//! opened -> closed -> opened, no matter how handlers interleave.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{topics, EventBus};
use crate::data::messages::{OrderCancel, OrderCreate};
use crate::domain::{GridSpec, GridType, Order, OrderStatus, OrderType, PositionState, Side, SymbolFilters};
use crate::store::{OrderRecord, OrderStore, TaskRecord, TaskStore};

use super::capital::{CapitalManager, FeeRates};
use super::grid::{GridFillOutcome, GridPlan};
use super::precision::{check_min_notional, truncate_price, truncate_quantity};
use super::{PositionClosed, PositionOpened};

use std::sync::Arc;

/// Execution mode selected from the signal's grid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeMode {
    NoGrid,
    NormalGrid,
    AbnormalGrid,
}

/// Everything a task needs besides its own state.
#[derive(Clone)]
pub struct TaskContext {
    pub bus: Arc<EventBus>,
    pub capital: Arc<CapitalManager>,
    pub filters: SymbolFilters,
    pub fees: FeeRates,
    pub task_store: Option<Arc<dyn TaskStore>>,
    pub order_store: Option<Arc<dyn OrderStore>>,
}

/// Mutating operations, applied one at a time by the owning actor.
#[derive(Debug)]
pub enum TaskIntent {
    Open {
        side: Side,
        price: Decimal,
        leverage: u32,
        pair_count: usize,
        grid: Option<GridSpec>,
    },
    Close {
        side: Side,
    },
    DeployGrid {
        side: Side,
        grid: GridSpec,
        leverage: u32,
        pair_count: usize,
    },
    OrderSubmitted {
        client_order_id: String,
        order_id: i64,
    },
    OrderFailed {
        client_order_id: String,
        reason: String,
    },
    OrderFilled {
        order_id: i64,
        client_order_id: String,
        price: Decimal,
        quantity: Decimal,
    },
    OrderCancelled {
        order_id: i64,
    },
}

/// Handle for queuing intents into a task actor.
#[derive(Clone)]
pub struct TaskHandle {
    tx: mpsc::UnboundedSender<TaskIntent>,
}

impl TaskHandle {
    pub fn send(&self, intent: TaskIntent) {
        if self.tx.send(intent).is_err() {
            warn!("trading task actor is gone, intent dropped");
        }
    }
}

/// Spawn the owning actor for one (user, symbol) task.
pub fn spawn_task(ctx: TaskContext, user_id: String, symbol: String) -> TaskHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut task = TradingTask::new(ctx, user_id, symbol);
        while let Some(intent) = rx.recv().await {
            task.handle(intent);
        }
        debug!(user_id = %task.user_id, symbol = %task.symbol, "trading task actor stopped");
    });
    TaskHandle { tx }
}

struct PendingClose {
    client_order_id: String,
    /// Entry side of the position being closed.
    closed_side: Side,
    exit_price: Option<Decimal>,
    filled: bool,
    awaiting_cancel: HashSet<i64>,
}

struct GridState {
    plan: GridPlan,
    capital: Decimal,
    /// client_order_id -> (pair id, leg side)
    links: HashMap<String, (u32, Side)>,
}

pub(crate) struct TradingTask {
    ctx: TaskContext,
    task_id: String,
    user_id: String,
    symbol: String,
    position: PositionState,
    entry_price: Decimal,
    quantity: Decimal,
    mode: TradeMode,
    realized_pnl: Decimal,
    orders: HashMap<String, Order>,
    order_ids: HashMap<i64, String>,
    grid: Option<GridState>,
    pending_entry: Option<String>,
    pending_close: Option<PendingClose>,
    created_at: DateTime<Utc>,
}

impl TradingTask {
    pub(crate) fn new(ctx: TaskContext, user_id: String, symbol: String) -> Self {
        Self {
            ctx,
            task_id: Uuid::new_v4().to_string(),
            user_id,
            symbol,
            position: PositionState::None,
            entry_price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            mode: TradeMode::NoGrid,
            realized_pnl: Decimal::ZERO,
            orders: HashMap::new(),
            order_ids: HashMap::new(),
            grid: None,
            pending_entry: None,
            pending_close: None,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn handle(&mut self, intent: TaskIntent) {
        match intent {
            TaskIntent::Open { side, price, leverage, pair_count, grid } => {
                self.on_open(side, price, leverage, pair_count, grid);
            }
            TaskIntent::Close { side } => self.on_close(side),
            TaskIntent::DeployGrid { side, grid, leverage, pair_count } => {
                self.on_deploy_grid(side, grid, leverage, pair_count);
            }
            TaskIntent::OrderSubmitted { client_order_id, order_id } => {
                self.on_order_submitted(&client_order_id, order_id);
            }
            TaskIntent::OrderFailed { client_order_id, reason } => {
                self.on_order_failed(&client_order_id, &reason);
            }
            TaskIntent::OrderFilled { order_id, client_order_id, price, quantity } => {
                self.on_order_filled(order_id, &client_order_id, price, quantity);
            }
            TaskIntent::OrderCancelled { order_id } => self.on_order_cancelled(order_id),
        }
    }

    fn on_open(
        &mut self,
        side: Side,
        price: Decimal,
        leverage: u32,
        pair_count: usize,
        grid: Option<GridSpec>,
    ) {
        if !self.position.is_flat()
            || self.pending_entry.is_some()
            || self.pending_close.is_some()
            || self.grid.is_some()
        {
            debug!(
                user_id = %self.user_id,
                symbol = %self.symbol,
                "open intent ignored, task already engaged"
            );
            return;
        }

        // Fresh cycle, fresh task row.
        self.task_id = Uuid::new_v4().to_string();
        self.created_at = Utc::now();
        self.realized_pnl = Decimal::ZERO;

        match &grid {
            None => {
                self.mode = TradeMode::NoGrid;
                let quantity = truncate_quantity(
                    self.ctx.capital.position_size(pair_count, leverage, price),
                    &self.ctx.filters,
                );
                if let Err(e) = check_min_notional(price, quantity, &self.ctx.filters) {
                    warn!(
                        user_id = %self.user_id,
                        symbol = %self.symbol,
                        error = %e,
                        "entry rejected before submission"
                    );
                    return;
                }
                let client_order_id = self.submit_market(side, quantity, false);
                self.pending_entry = Some(client_order_id);
            }
            Some(spec) if spec.grid_type == GridType::Normal => {
                self.mode = TradeMode::NormalGrid;
                let capital =
                    self.ctx.capital.per_symbol(pair_count) * Decimal::from(leverage);
                match GridPlan::build(spec, side, capital, &self.ctx.filters) {
                    Ok(plan) => self.deploy_plan(plan, capital),
                    Err(e) => {
                        warn!(
                            user_id = %self.user_id,
                            symbol = %self.symbol,
                            error = %e,
                            "grid construction failed"
                        );
                        return;
                    }
                }
            }
            Some(spec) => {
                self.mode = TradeMode::AbnormalGrid;
                let entry_capital =
                    self.ctx.capital.entry_capital(pair_count, leverage, spec.ratio);
                let quantity =
                    truncate_quantity(entry_capital / price, &self.ctx.filters);
                if let Err(e) = check_min_notional(price, quantity, &self.ctx.filters) {
                    warn!(
                        user_id = %self.user_id,
                        symbol = %self.symbol,
                        error = %e,
                        "grid entry rejected before submission"
                    );
                    return;
                }
                let client_order_id = self.submit_market(side, quantity, false);
                self.pending_entry = Some(client_order_id);
            }
        }
        self.persist_task("PENDING", None, None);
    }

    fn on_close(&mut self, side: Side) {
        if self.position.is_flat() || self.pending_close.is_some() {
            debug!(
                user_id = %self.user_id,
                symbol = %self.symbol,
                "close intent ignored, nothing to close"
            );
            return;
        }
        let closed_side = match self.position.entry_side() {
            Some(entry) => entry,
            None => side.opposite(),
        };
        let client_order_id = self.submit_market(side, self.quantity, true);
        self.pending_close = Some(PendingClose {
            client_order_id,
            closed_side,
            exit_price: None,
            filled: false,
            awaiting_cancel: HashSet::new(),
        });
    }

    fn on_deploy_grid(&mut self, side: Side, grid: GridSpec, leverage: u32, pair_count: usize) {
        if self.grid.is_some() {
            // Normal grids are laid out at open time; the strategy's
            // grid-create event is only actionable for the abnormal flow.
            return;
        }
        let capital = self.ctx.capital.grid_capital(pair_count, leverage, grid.ratio);
        if capital <= Decimal::ZERO {
            warn!(
                user_id = %self.user_id,
                symbol = %self.symbol,
                "no capital left for grid deployment"
            );
            return;
        }
        match GridPlan::build(&grid, side, capital, &self.ctx.filters) {
            Ok(plan) => self.deploy_plan(plan, capital),
            Err(e) => warn!(
                user_id = %self.user_id,
                symbol = %self.symbol,
                error = %e,
                "grid deployment failed"
            ),
        }
    }

    /// Submit limit orders for every leg of every pair in the plan.
    fn deploy_plan(&mut self, plan: GridPlan, capital: Decimal) {
        let mut links = HashMap::new();
        for pair in &plan.pairs {
            let buy_id = self.submit_limit(Side::Buy, pair.buy_price, pair.quantity, pair.id);
            links.insert(buy_id, (pair.id, Side::Buy));
            let sell_id = self.submit_limit(Side::Sell, pair.sell_price, pair.quantity, pair.id);
            links.insert(sell_id, (pair.id, Side::Sell));
        }
        info!(
            user_id = %self.user_id,
            symbol = %self.symbol,
            pairs = plan.pairs.len(),
            "grid deployed"
        );
        self.grid = Some(GridState { plan, capital, links });
    }

    fn on_order_submitted(&mut self, client_order_id: &str, order_id: i64) {
        if let Some(order) = self.orders.get_mut(client_order_id) {
            order.order_id = Some(order_id);
            order.status = OrderStatus::Submitted;
            self.order_ids.insert(order_id, client_order_id.to_string());
            let order = order.clone();
            self.persist_order(&order, None);
        }
    }

    fn on_order_failed(&mut self, client_order_id: &str, reason: &str) {
        let Some(mut order) = self.orders.remove(client_order_id) else {
            return;
        };
        error!(
            user_id = %self.user_id,
            symbol = %self.symbol,
            client_order_id,
            reason,
            "order failed"
        );
        order.status = OrderStatus::Rejected;
        self.persist_order(&order, None);

        if self.pending_entry.as_deref() == Some(client_order_id) {
            self.pending_entry = None;
        }
        if let Some(pending) = &self.pending_close {
            if pending.client_order_id == client_order_id {
                // The position survives; the strategy may retry later.
                self.pending_close = None;
            }
        }
        if let Some(grid) = &mut self.grid {
            grid.links.remove(client_order_id);
        }
    }

    fn on_order_filled(
        &mut self,
        order_id: i64,
        client_order_id: &str,
        price: Decimal,
        quantity: Decimal,
    ) {
        let client_id = if !client_order_id.is_empty() {
            client_order_id.to_string()
        } else if let Some(id) = self.order_ids.get(&order_id) {
            id.clone()
        } else {
            debug!(order_id, "fill for unknown order ignored");
            return;
        };
        let Some(order) = self.orders.get_mut(&client_id) else {
            debug!(client_order_id = %client_id, "fill for untracked order ignored");
            return;
        };
        order.apply_fill(quantity);
        let fully_filled = order.status == OrderStatus::Filled;
        let order_snapshot = order.clone();
        self.persist_order(&order_snapshot, Some(Utc::now()));
        if !fully_filled {
            debug!(
                client_order_id = %client_id,
                remaining = %order_snapshot.remaining(),
                "partial fill"
            );
        }

        if self.pending_entry.as_deref() == Some(client_id.as_str()) {
            if fully_filled {
                self.pending_entry = None;
                self.open_position(order_snapshot.side, price, order_snapshot.quantity);
            }
            return;
        }

        if let Some(pending) = &mut self.pending_close {
            if pending.client_order_id == client_id {
                if fully_filled {
                    pending.exit_price = Some(price);
                    pending.filled = true;
                    self.settle_close_fill(price);
                    self.cancel_surviving_orders();
                    self.try_finalize_close();
                }
                return;
            }
        }

        self.on_grid_fill(&client_id, price, quantity);
    }

    fn on_grid_fill(&mut self, client_id: &str, price: Decimal, quantity: Decimal) {
        let Some(grid) = &mut self.grid else {
            return;
        };
        let Some((pair_id, leg)) = grid.links.get(client_id).copied() else {
            debug!(client_order_id = %client_id, "fill without grid link ignored");
            return;
        };

        let outcome = grid.plan.record_fill(pair_id, leg, self.ctx.fees.maker);
        let first_fill = self.position.is_flat() && self.mode == TradeMode::NormalGrid;
        let plan_side = grid.plan.side;
        if first_fill {
            // A normal grid opens its position on the first rung fill.
            self.open_position(plan_side, price, quantity);
        }

        if let GridFillOutcome::PairComplete { profit } = outcome {
            self.realized_pnl += profit;
            info!(
                user_id = %self.user_id,
                symbol = %self.symbol,
                pair_id,
                profit = %profit,
                "grid pair completed"
            );
            self.persist_task("OPEN", None, None);
            self.rearm_pair(pair_id);
        }

        let breach = self.grid.as_ref().and_then(|g| g.plan.band_breach(price));
        if let Some(up) = breach {
            self.shift_band(up);
        }
    }

    /// Re-place both legs of a completed pair.
    fn rearm_pair(&mut self, pair_id: u32) {
        let Some(grid) = &self.grid else { return };
        let Some(pair) = grid.plan.pairs.iter().find(|p| p.id == pair_id).cloned() else {
            return;
        };
        let buy_id = self.submit_limit(Side::Buy, pair.buy_price, pair.quantity, pair.id);
        let sell_id = self.submit_limit(Side::Sell, pair.sell_price, pair.quantity, pair.id);
        if let Some(grid) = &mut self.grid {
            grid.links.insert(buy_id, (pair.id, Side::Buy));
            grid.links.insert(sell_id, (pair.id, Side::Sell));
        }
    }

    /// Cancel outstanding rungs, shift the band one interval, repost.
    fn shift_band(&mut self, up: bool) {
        let Some(grid) = &mut self.grid else { return };
        info!(
            user_id = %self.user_id,
            symbol = %self.symbol,
            direction = if up { "up" } else { "down" },
            "shifting grid band"
        );
        let old_links: Vec<String> = grid.links.keys().cloned().collect();
        grid.links.clear();
        let capital = grid.capital;
        let shifted = grid.plan.shifted(up, capital, &self.ctx.filters);
        for client_id in old_links {
            self.cancel_if_open(&client_id);
        }
        match shifted {
            Ok(plan) => self.deploy_plan(plan, capital),
            Err(e) => {
                warn!(
                    user_id = %self.user_id,
                    symbol = %self.symbol,
                    error = %e,
                    "band shift failed, grid dropped"
                );
                self.grid = None;
            }
        }
    }

    fn open_position(&mut self, side: Side, price: Decimal, quantity: Decimal) {
        self.position = PositionState::from_entry(side);
        self.entry_price = price;
        self.quantity = quantity;
        info!(
            user_id = %self.user_id,
            symbol = %self.symbol,
            side = %side,
            entry_price = %price,
            quantity = %quantity,
            mode = ?self.mode,
            "position opened"
        );
        self.persist_task("OPEN", None, None);
        self.ctx.bus.emit(
            topics::POSITION_OPENED,
            &PositionOpened {
                user_id: self.user_id.clone(),
                symbol: self.symbol.clone(),
                side,
                entry_price: price,
                quantity,
                mode: self.mode,
            },
        );
    }

    /// Realise the single-order profit of the position round trip.
    fn settle_close_fill(&mut self, exit_price: Decimal) {
        let entry_side = match self.position.entry_side() {
            Some(side) => side,
            None => return,
        };
        let qty = self.quantity;
        let gross = (exit_price - self.entry_price) * qty * entry_side.sign();
        let fees = self.entry_price * qty * self.ctx.fees.taker
            + exit_price * qty * self.ctx.fees.taker;
        self.realized_pnl += gross - fees;
    }

    /// Cancel every surviving open order (grid rungs included). The
    /// position-closed event waits for all of these acknowledgements.
    fn cancel_surviving_orders(&mut self) {
        let close_id = self
            .pending_close
            .as_ref()
            .map(|p| p.client_order_id.clone())
            .unwrap_or_default();
        let surviving: Vec<(String, i64)> = self
            .orders
            .iter()
            .filter(|(client_id, order)| {
                **client_id != close_id && order.is_open() && order.order_id.is_some()
            })
            .map(|(client_id, order)| (client_id.clone(), order.order_id.unwrap_or_default()))
            .collect();

        for (client_id, order_id) in &surviving {
            debug!(client_order_id = %client_id, order_id, "cancelling surviving order");
            self.ctx.bus.emit(
                topics::ORDER_CANCEL,
                &OrderCancel {
                    user_id: self.user_id.clone(),
                    symbol: self.symbol.clone(),
                    order_id: *order_id,
                },
            );
        }
        if let Some(pending) = &mut self.pending_close {
            pending.awaiting_cancel = surviving.into_iter().map(|(_, id)| id).collect();
        }
    }

    fn cancel_if_open(&self, client_id: &str) {
        if let Some(order) = self.orders.get(client_id) {
            if order.is_open() {
                if let Some(order_id) = order.order_id {
                    self.ctx.bus.emit(
                        topics::ORDER_CANCEL,
                        &OrderCancel {
                            user_id: self.user_id.clone(),
                            symbol: self.symbol.clone(),
                            order_id,
                        },
                    );
                }
            }
        }
    }

    fn on_order_cancelled(&mut self, order_id: i64) {
        if let Some(client_id) = self.order_ids.get(&order_id).cloned() {
            if let Some(order) = self.orders.get_mut(&client_id) {
                order.status = OrderStatus::Cancelled;
                let order = order.clone();
                self.persist_order(&order, None);
            }
        }
        if let Some(pending) = &mut self.pending_close {
            pending.awaiting_cancel.remove(&order_id);
        }
        self.try_finalize_close();
    }

    /// Publish the position-closed event only after the close order has
    /// filled AND every surviving order cancellation is confirmed.
    fn try_finalize_close(&mut self) {
        let ready = self
            .pending_close
            .as_ref()
            .map_or(false, |p| p.filled && p.awaiting_cancel.is_empty());
        if !ready {
            return;
        }
        let Some(pending) = self.pending_close.take() else { return };
        let exit_price = pending.exit_price.unwrap_or_default();

        info!(
            user_id = %self.user_id,
            symbol = %self.symbol,
            exit_price = %exit_price,
            pnl = %self.realized_pnl,
            "position closed"
        );
        self.persist_task("CLOSED", Some(Utc::now()), Some(exit_price));
        self.ctx.bus.emit(
            topics::POSITION_CLOSED,
            &PositionClosed {
                user_id: self.user_id.clone(),
                symbol: self.symbol.clone(),
                side: pending.closed_side,
                exit_price,
                pnl: self.realized_pnl,
            },
        );

        self.position = PositionState::None;
        self.entry_price = Decimal::ZERO;
        self.quantity = Decimal::ZERO;
        self.mode = TradeMode::NoGrid;
        self.grid = None;
        self.orders.retain(|_, order| order.is_open());
    }

    fn submit_market(&mut self, side: Side, quantity: Decimal, reduce_only: bool) -> String {
        self.submit_order(side, OrderType::Market, None, quantity, reduce_only, None)
    }

    fn submit_limit(&mut self, side: Side, price: Decimal, quantity: Decimal, pair_id: u32) -> String {
        let price = truncate_price(price, &self.ctx.filters);
        self.submit_order(side, OrderType::Limit, Some(price), quantity, false, Some(pair_id))
    }

    fn submit_order(
        &mut self,
        side: Side,
        order_type: OrderType,
        price: Option<Decimal>,
        quantity: Decimal,
        reduce_only: bool,
        grid_pair_id: Option<u32>,
    ) -> String {
        let client_order_id = format!("gb-{}", Uuid::new_v4().simple());
        let order = Order {
            order_id: None,
            client_order_id: client_order_id.clone(),
            task_id: self.task_id.clone(),
            symbol: self.symbol.clone(),
            side,
            order_type,
            price,
            quantity,
            filled_quantity: Decimal::ZERO,
            status: OrderStatus::New,
            is_grid_order: grid_pair_id.is_some(),
            grid_pair_id,
        };
        self.orders.insert(client_order_id.clone(), order.clone());
        self.persist_order(&order, None);

        self.ctx.bus.emit(
            topics::ORDER_CREATE,
            &OrderCreate {
                user_id: self.user_id.clone(),
                symbol: self.symbol.clone(),
                side,
                order_type,
                price,
                quantity,
                client_order_id: client_order_id.clone(),
                reduce_only,
            },
        );
        client_order_id
    }

    fn persist_task(
        &self,
        status: &str,
        closed_at: Option<DateTime<Utc>>,
        exit_price: Option<Decimal>,
    ) {
        let Some(store) = &self.ctx.task_store else { return };
        let record = TaskRecord {
            task_id: self.task_id.clone(),
            user_id: self.user_id.clone(),
            symbol: self.symbol.clone(),
            side: self.position.entry_side(),
            entry_price: (self.entry_price > Decimal::ZERO).then_some(self.entry_price),
            exit_price,
            quantity: self.quantity,
            pnl: self.realized_pnl,
            status: status.to_string(),
            created_at: self.created_at,
            closed_at,
        };
        if let Err(e) = store.upsert_task(&record) {
            warn!(task_id = %self.task_id, error = %e, "task persistence failed");
        }
    }

    fn persist_order(&self, order: &Order, filled_at: Option<DateTime<Utc>>) {
        let Some(store) = &self.ctx.order_store else { return };
        let record = OrderRecord {
            order: order.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            filled_at,
        };
        if let Err(e) = store.upsert_order(&record) {
            warn!(client_order_id = %order.client_order_id, error = %e, "order persistence failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryJournal;
    use crate::domain::GridType;
    use rust_decimal_macros::dec;

    fn context() -> TaskContext {
        TaskContext {
            bus: Arc::new(EventBus::new(Arc::new(MemoryJournal::new()))),
            capital: Arc::new(CapitalManager::new(dec!(1000))),
            filters: SymbolFilters {
                tick_size: dec!(0.01),
                step_size: dec!(1),
                min_notional: dec!(5),
            },
            fees: FeeRates::default(),
            task_store: None,
            order_store: None,
        }
    }

    fn task() -> TradingTask {
        TradingTask::new(context(), "u1".into(), "XRPUSDC".into())
    }

    fn subjects(task: &TradingTask) -> Vec<String> {
        task.ctx.bus.query_recent(100).into_iter().map(|e| e.subject).collect()
    }

    fn created_orders(task: &TradingTask) -> Vec<OrderCreate> {
        task.ctx
            .bus
            .query_recent(100)
            .into_iter()
            .filter(|e| e.subject == topics::ORDER_CREATE)
            .map(|e| serde_json::from_str(&e.data).unwrap())
            .collect()
    }

    fn open_no_grid(task: &mut TradingTask) -> String {
        task.handle(TaskIntent::Open {
            side: Side::Buy,
            price: dec!(1.00),
            leverage: 10,
            pair_count: 1,
            grid: None,
        });
        let client_id = task.pending_entry.clone().expect("entry pending");
        task.handle(TaskIntent::OrderSubmitted { client_order_id: client_id.clone(), order_id: 1 });
        task.handle(TaskIntent::OrderFilled {
            order_id: 1,
            client_order_id: client_id.clone(),
            price: dec!(1.00),
            quantity: dec!(9500),
        });
        client_id
    }

    #[tokio::test]
    async fn no_grid_round_trip_keeps_state_machine_ordered() {
        let mut task = task();
        open_no_grid(&mut task);
        assert_eq!(task.position, PositionState::Long);
        assert!(subjects(&task).contains(&topics::POSITION_OPENED.to_string()));

        // Close: market sell, fill, no surviving orders, closed emitted.
        task.handle(TaskIntent::Close { side: Side::Sell });
        let close_id = task.pending_close.as_ref().unwrap().client_order_id.clone();
        task.handle(TaskIntent::OrderSubmitted { client_order_id: close_id.clone(), order_id: 2 });
        task.handle(TaskIntent::OrderFilled {
            order_id: 2,
            client_order_id: close_id,
            price: dec!(1.10),
            quantity: dec!(9500),
        });

        assert_eq!(task.position, PositionState::None);
        assert!(subjects(&task).contains(&topics::POSITION_CLOSED.to_string()));
        // (1.10 - 1.00) x 9500 - taker fees on both legs.
        let fees = dec!(1.00) * dec!(9500) * dec!(0.0005) + dec!(1.10) * dec!(9500) * dec!(0.0005);
        assert_eq!(task.realized_pnl, dec!(950) - fees);
    }

    #[tokio::test]
    async fn duplicate_open_is_ignored() {
        let mut task = task();
        open_no_grid(&mut task);
        let before = created_orders(&task).len();
        task.handle(TaskIntent::Open {
            side: Side::Buy,
            price: dec!(1.00),
            leverage: 10,
            pair_count: 1,
            grid: None,
        });
        assert_eq!(created_orders(&task).len(), before);
    }

    #[tokio::test]
    async fn normal_grid_opens_on_first_rung_fill() {
        let mut task = task();
        let spec = GridSpec {
            grid_type: GridType::Normal,
            ratio: Decimal::ONE,
            levels: 10,
            upper_price: dec!(1.05),
            lower_price: dec!(0.95),
            move_up: false,
            move_down: false,
        };
        task.handle(TaskIntent::Open {
            side: Side::Buy,
            price: dec!(1.00),
            leverage: 1,
            pair_count: 1,
            grid: Some(spec),
        });
        // 10 pairs, both legs resting.
        assert_eq!(created_orders(&task).len(), 20);
        assert_eq!(task.position, PositionState::None);

        // Acknowledge then fill one buy rung.
        let buy_id = task
            .grid
            .as_ref()
            .unwrap()
            .links
            .iter()
            .find(|(_, (pair, leg))| *pair == 0 && *leg == Side::Buy)
            .map(|(id, _)| id.clone())
            .unwrap();
        task.handle(TaskIntent::OrderSubmitted { client_order_id: buy_id.clone(), order_id: 10 });
        task.handle(TaskIntent::OrderFilled {
            order_id: 10,
            client_order_id: buy_id,
            price: dec!(0.95),
            quantity: dec!(100),
        });
        assert_eq!(task.position, PositionState::Long);
        assert!(subjects(&task).contains(&topics::POSITION_OPENED.to_string()));
    }

    #[tokio::test]
    async fn completed_pair_adds_profit_and_rearms() {
        let mut task = task();
        let spec = GridSpec {
            grid_type: GridType::Normal,
            ratio: Decimal::ONE,
            levels: 10,
            upper_price: dec!(1.05),
            lower_price: dec!(0.95),
            move_up: false,
            move_down: false,
        };
        task.handle(TaskIntent::Open {
            side: Side::Buy,
            price: dec!(1.00),
            leverage: 1,
            pair_count: 1,
            grid: Some(spec),
        });

        let find_leg = |task: &TradingTask, leg: Side| {
            task.grid
                .as_ref()
                .unwrap()
                .links
                .iter()
                .find(|(_, (pair, l))| *pair == 0 && *l == leg)
                .map(|(id, _)| id.clone())
                .unwrap()
        };
        let buy_id = find_leg(&task, Side::Buy);
        let sell_id = find_leg(&task, Side::Sell);
        task.handle(TaskIntent::OrderSubmitted { client_order_id: buy_id.clone(), order_id: 10 });
        task.handle(TaskIntent::OrderSubmitted { client_order_id: sell_id.clone(), order_id: 11 });

        task.handle(TaskIntent::OrderFilled {
            order_id: 10,
            client_order_id: buy_id,
            price: dec!(0.95),
            quantity: dec!(100),
        });
        let pnl_before = task.realized_pnl;
        let orders_before = created_orders(&task).len();
        task.handle(TaskIntent::OrderFilled {
            order_id: 11,
            client_order_id: sell_id,
            price: dec!(0.96),
            quantity: dec!(100),
        });

        let expected = (dec!(0.96) - dec!(0.95)) * dec!(100)
            - (dec!(0.95) + dec!(0.96)) * dec!(100) * dec!(0.0002);
        assert_eq!(task.realized_pnl - pnl_before, expected);
        // Both legs reposted.
        assert_eq!(created_orders(&task).len(), orders_before + 2);
    }

    #[tokio::test]
    async fn close_waits_for_cancellations_before_position_closed() {
        let mut task = task();
        let spec = GridSpec {
            grid_type: GridType::Normal,
            ratio: Decimal::ONE,
            levels: 2,
            upper_price: dec!(1.05),
            lower_price: dec!(0.95),
            move_up: false,
            move_down: false,
        };
        task.handle(TaskIntent::Open {
            side: Side::Buy,
            price: dec!(1.00),
            leverage: 1,
            pair_count: 1,
            grid: Some(spec),
        });

        // Acknowledge all rungs and fill the first buy to open.
        let links: Vec<(String, i64)> = task
            .grid
            .as_ref()
            .unwrap()
            .links
            .keys()
            .cloned()
            .enumerate()
            .map(|(i, id)| (id, 100 + i as i64))
            .collect();
        for (client_id, order_id) in &links {
            task.handle(TaskIntent::OrderSubmitted {
                client_order_id: client_id.clone(),
                order_id: *order_id,
            });
        }
        let (buy_id, buy_order_id) = links
            .iter()
            .find(|(id, _)| {
                task.grid.as_ref().unwrap().links[id] == (0, Side::Buy)
            })
            .cloned()
            .unwrap();
        task.handle(TaskIntent::OrderFilled {
            order_id: buy_order_id,
            client_order_id: buy_id,
            price: dec!(0.95),
            quantity: dec!(500),
        });
        assert_eq!(task.position, PositionState::Long);

        // Close: fill the close order; three rungs survive.
        task.handle(TaskIntent::Close { side: Side::Sell });
        let close_id = task.pending_close.as_ref().unwrap().client_order_id.clone();
        task.handle(TaskIntent::OrderSubmitted { client_order_id: close_id.clone(), order_id: 999 });
        task.handle(TaskIntent::OrderFilled {
            order_id: 999,
            client_order_id: close_id,
            price: dec!(1.00),
            quantity: dec!(500),
        });

        let awaiting: Vec<i64> = task
            .pending_close
            .as_ref()
            .unwrap()
            .awaiting_cancel
            .iter()
            .copied()
            .collect();
        assert_eq!(awaiting.len(), 3);
        assert!(!subjects(&task).contains(&topics::POSITION_CLOSED.to_string()));

        // Only after the last cancellation lands is the close published.
        for (i, order_id) in awaiting.iter().enumerate() {
            task.handle(TaskIntent::OrderCancelled { order_id: *order_id });
            let closed = subjects(&task).contains(&topics::POSITION_CLOSED.to_string());
            if i + 1 < awaiting.len() {
                assert!(!closed);
            } else {
                assert!(closed);
            }
        }
        assert_eq!(task.position, PositionState::None);
    }

    #[tokio::test]
    async fn min_notional_rejection_submits_nothing() {
        let mut task = task();
        task.ctx.capital.set_balance(dec!(0.01));
        task.handle(TaskIntent::Open {
            side: Side::Buy,
            price: dec!(1.00),
            leverage: 1,
            pair_count: 1,
            grid: None,
        });
        assert!(created_orders(&task).is_empty());
        assert!(task.pending_entry.is_none());
    }
}
