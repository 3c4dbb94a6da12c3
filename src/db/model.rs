//! Database row types for Diesel ORM.

use diesel::prelude::*;

use super::schema::{events, orders, trading_tasks};

/// Journal row (insertable; the rowid is assigned by sqlite).
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = events)]
pub struct NewEventRow {
    pub subject: String,
    pub data: String,
    pub event_id: String,
    pub timestamp: String,
    pub source: Option<String>,
}

/// Journal row (queryable).
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = events)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EventRow {
    pub id: Option<i32>,
    pub subject: String,
    pub data: String,
    pub event_id: String,
    pub timestamp: String,
    pub source: Option<String>,
}

/// Trading task row.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = trading_tasks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TaskRow {
    pub task_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Option<String>,
    pub entry_price: Option<String>,
    pub exit_price: Option<String>,
    pub quantity: String,
    pub pnl: String,
    pub status: String,
    pub created_at: String,
    pub closed_at: Option<String>,
}

/// Order row.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = orders)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OrderRow {
    pub client_order_id: String,
    pub order_id: Option<i64>,
    pub task_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub price: Option<String>,
    pub quantity: String,
    pub filled_quantity: String,
    pub status: String,
    pub is_grid_order: i32,
    pub grid_pair_id: Option<i32>,
    pub created_at: String,
    pub filled_at: Option<String>,
}
