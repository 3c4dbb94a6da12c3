//! Persistence stores: the sqlite-backed event journal plus trading-task
//! and order records. All writes are best-effort from the caller's point
//! of view; failures are logged upstream and never block trading.

pub mod sqlite;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{Order, Side};
use crate::error::Result;

pub use sqlite::{SqliteEventJournal, SqliteOrderStore, SqliteTaskStore};

/// Snapshot of a trading task written on each meaningful transition.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Option<Side>,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Snapshot of an order written on submit/fill/cancel.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order: Order,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

pub trait TaskStore: Send + Sync {
    fn upsert_task(&self, task: &TaskRecord) -> Result<()>;
    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;
}

pub trait OrderStore: Send + Sync {
    fn upsert_order(&self, record: &OrderRecord) -> Result<()>;
    fn orders_for_task(&self, task_id: &str) -> Result<Vec<OrderRecord>>;
}
