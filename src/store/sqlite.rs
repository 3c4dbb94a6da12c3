//! SQLite store implementations using Diesel.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::Integer;

use crate::bus::{Journal, JournalEntry, JOURNAL_CAP};
use crate::db::model::{EventRow, NewEventRow, OrderRow, TaskRow};
use crate::db::schema::{events, orders, trading_tasks};
use crate::db::DbPool;
use crate::domain::{Order, OrderStatus, OrderType, Side};
use crate::error::{Error, Result};

use super::{OrderRecord, OrderStore, TaskRecord, TaskStore};

fn get_conn(
    pool: &DbPool,
) -> Result<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<SqliteConnection>>> {
    pool.get().map_err(|e| Error::Connection(e.to_string()))
}

fn parse_decimal(raw: &str) -> Result<rust_decimal::Decimal> {
    raw.parse()
        .map_err(|_| Error::Database(format!("invalid decimal in row: {raw}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Database(e.to_string()))
}

/// Journal backed by the `events` table, trimmed to the cap on append.
pub struct SqliteEventJournal {
    pool: DbPool,
}

impl SqliteEventJournal {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl Journal for SqliteEventJournal {
    fn append(&self, entry: JournalEntry) -> Result<()> {
        let row = NewEventRow {
            subject: entry.subject,
            data: entry.data,
            event_id: entry.event_id,
            timestamp: entry.timestamp.to_rfc3339(),
            source: entry.source,
        };
        let mut conn = get_conn(&self.pool)?;
        diesel::insert_into(events::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;

        diesel::sql_query(
            "DELETE FROM events WHERE id NOT IN \
             (SELECT id FROM events ORDER BY id DESC LIMIT ?)",
        )
        .bind::<Integer, _>(JOURNAL_CAP as i32)
        .execute(&mut conn)
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let mut conn = get_conn(&self.pool)?;
        let rows: Vec<EventRow> = events::table
            .order(events::id.desc())
            .limit(limit as i64)
            .load(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                Ok(JournalEntry {
                    subject: row.subject,
                    data: row.data,
                    event_id: row.event_id,
                    timestamp: parse_timestamp(&row.timestamp)?,
                    source: row.source,
                })
            })
            .collect()
    }
}

/// Trading-task store backed by the `trading_tasks` table.
pub struct SqliteTaskStore {
    pool: DbPool,
}

impl SqliteTaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn to_row(record: &TaskRecord) -> TaskRow {
        TaskRow {
            task_id: record.task_id.clone(),
            user_id: record.user_id.clone(),
            symbol: record.symbol.clone(),
            side: record.side.map(|s| s.as_str().to_string()),
            entry_price: record.entry_price.map(|p| p.to_string()),
            exit_price: record.exit_price.map(|p| p.to_string()),
            quantity: record.quantity.to_string(),
            pnl: record.pnl.to_string(),
            status: record.status.clone(),
            created_at: record.created_at.to_rfc3339(),
            closed_at: record.closed_at.map(|t| t.to_rfc3339()),
        }
    }

    fn from_row(row: TaskRow) -> Result<TaskRecord> {
        let side = match row.side.as_deref() {
            Some("BUY") => Some(Side::Buy),
            Some("SELL") => Some(Side::Sell),
            _ => None,
        };
        Ok(TaskRecord {
            task_id: row.task_id,
            user_id: row.user_id,
            symbol: row.symbol,
            side,
            entry_price: row.entry_price.as_deref().map(parse_decimal).transpose()?,
            exit_price: row.exit_price.as_deref().map(parse_decimal).transpose()?,
            quantity: parse_decimal(&row.quantity)?,
            pnl: parse_decimal(&row.pnl)?,
            status: row.status,
            created_at: parse_timestamp(&row.created_at)?,
            closed_at: row.closed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn upsert_task(&self, task: &TaskRecord) -> Result<()> {
        let row = Self::to_row(task);
        let mut conn = get_conn(&self.pool)?;
        diesel::replace_into(trading_tasks::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let mut conn = get_conn(&self.pool)?;
        let row: Option<TaskRow> = trading_tasks::table
            .find(task_id)
            .first(&mut conn)
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        row.map(Self::from_row).transpose()
    }
}

/// Order store backed by the `orders` table.
pub struct SqliteOrderStore {
    pool: DbPool,
}

impl SqliteOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn to_row(record: &OrderRecord) -> OrderRow {
        let order = &record.order;
        OrderRow {
            client_order_id: order.client_order_id.clone(),
            order_id: order.order_id,
            task_id: order.task_id.clone(),
            user_id: record.user_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side.as_str().to_string(),
            order_type: order.order_type.as_str().to_string(),
            price: order.price.map(|p| p.to_string()),
            quantity: order.quantity.to_string(),
            filled_quantity: order.filled_quantity.to_string(),
            status: order.status.as_str().to_string(),
            is_grid_order: i32::from(order.is_grid_order),
            grid_pair_id: order.grid_pair_id.map(|id| id as i32),
            created_at: record.created_at.to_rfc3339(),
            filled_at: record.filled_at.map(|t| t.to_rfc3339()),
        }
    }

    fn from_row(row: OrderRow) -> Result<OrderRecord> {
        let side = match row.side.as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            other => return Err(Error::Database(format!("unknown side: {other}"))),
        };
        let order_type = match row.order_type.as_str() {
            "MARKET" => OrderType::Market,
            "LIMIT" => OrderType::Limit,
            "POST_ONLY" => OrderType::PostOnly,
            "STOP" => OrderType::Stop,
            "TAKE_PROFIT" => OrderType::TakeProfit,
            "STOP_MARKET" => OrderType::StopMarket,
            "TAKE_PROFIT_MARKET" => OrderType::TakeProfitMarket,
            other => return Err(Error::Database(format!("unknown order type: {other}"))),
        };
        let status = match row.status.as_str() {
            "NEW" => OrderStatus::New,
            "SUBMITTED" => OrderStatus::Submitted,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            other => return Err(Error::Database(format!("unknown order status: {other}"))),
        };
        Ok(OrderRecord {
            order: Order {
                order_id: row.order_id,
                client_order_id: row.client_order_id,
                task_id: row.task_id,
                symbol: row.symbol,
                side,
                order_type,
                price: row.price.as_deref().map(parse_decimal).transpose()?,
                quantity: parse_decimal(&row.quantity)?,
                filled_quantity: parse_decimal(&row.filled_quantity)?,
                status,
                is_grid_order: row.is_grid_order != 0,
                grid_pair_id: row.grid_pair_id.map(|id| id as u32),
            },
            user_id: row.user_id,
            created_at: parse_timestamp(&row.created_at)?,
            filled_at: row.filled_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

impl OrderStore for SqliteOrderStore {
    fn upsert_order(&self, record: &OrderRecord) -> Result<()> {
        let row = Self::to_row(record);
        let mut conn = get_conn(&self.pool)?;
        diesel::replace_into(orders::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    fn orders_for_task(&self, task_id: &str) -> Result<Vec<OrderRecord>> {
        let mut conn = get_conn(&self.pool)?;
        let rows: Vec<OrderRow> = orders::table
            .filter(orders::task_id.eq(task_id))
            .load(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.into_iter().map(Self::from_row).collect()
    }
}
