//! Order & Trade Rows
//!
//! Persistent projections of the in-memory order and of executed trades.
//! Rows are written inside the same transaction as the operation that
//! produced them; the in-memory book is rebuilt from active rows on restart.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::models::{OrderId, OrderStatus, UserId};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRecord {
    pub id: i64,
    pub user_id: i64,
    pub ticker_id: i64,
    pub side: i16,
    pub ticker_ledger_id: i64,
    #[sqlx(rename = "type")]
    pub kind: i16,
    pub quantity: i64,
    pub filled: i64,
    pub price: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    pub fn remaining(&self) -> i64 {
        self.quantity - self.filled
    }
}

/// List view joined with the symbol.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecordWithTicker {
    pub id: i64,
    pub user_id: i64,
    pub ticker: String,
    pub ticker_id: i64,
    pub side: i16,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: i16,
    pub quantity: i64,
    pub filled: i64,
    pub price: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl OrderRecordWithTicker {
    /// Lifecycle state as derived from the row.
    pub fn status(&self) -> OrderStatus {
        if !self.is_active {
            if self.filled >= self.quantity {
                OrderStatus::Filled
            } else {
                OrderStatus::Canceled
            }
        } else if self.filled > 0 {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Resting
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub ticker_id: i64,
    pub order_taker_id: i64,
    pub order_maker_id: i64,
    /// Cash-leg engine transfer id, NUMERIC(39,0) as decimal text.
    pub ledger_transfer_id: String,
    /// Seller's cash account row id.
    pub user_ledger_id: i64,
    /// Buyer's asset account row id.
    pub ticker_ledger_id: i64,
    pub kind: i16,
    pub quantity: i64,
    pub price: i64,
    pub settled: bool,
}

pub async fn insert_order(conn: &mut PgConnection, order: &OrderRecord) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO orders (id, user_id, ticker_id, side, ticker_ledger_id, type,
                            quantity, filled, price, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(order.id)
    .bind(order.user_id)
    .bind(order.ticker_id)
    .bind(order.side)
    .bind(order.ticker_ledger_id)
    .bind(order.kind)
    .bind(order.quantity)
    .bind(order.filled)
    .bind(order.price)
    .bind(order.is_active)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_order(conn: &mut PgConnection, id: OrderId) -> sqlx::Result<Option<OrderRecord>> {
    sqlx::query_as(
        r#"
        SELECT id, user_id, ticker_id, side, ticker_ledger_id, type,
               quantity, filled, price, is_active, created_at, closed_at
        FROM orders WHERE id = $1
        "#,
    )
    .bind(id as i64)
    .fetch_optional(conn)
    .await
}

/// Replace price/quantity/side/type for a modify; the fill counter restarts
/// with the replacement order.
pub async fn update_order(conn: &mut PgConnection, order: &OrderRecord) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE orders
        SET price = $1, quantity = $2, side = $3, type = $4, filled = $5,
            is_active = $6, closed_at = NULL
        WHERE id = $7
        "#,
    )
    .bind(order.price)
    .bind(order.quantity)
    .bind(order.side)
    .bind(order.kind)
    .bind(order.filled)
    .bind(order.is_active)
    .bind(order.id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn add_filled(conn: &mut PgConnection, id: OrderId, quantity: i64) -> sqlx::Result<()> {
    sqlx::query(r#"UPDATE orders SET filled = filled + $1 WHERE id = $2"#)
        .bind(quantity)
        .bind(id as i64)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn close_order(
    conn: &mut PgConnection,
    id: OrderId,
    closed_at: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(r#"UPDATE orders SET is_active = FALSE, closed_at = $1 WHERE id = $2"#)
        .bind(closed_at)
        .bind(id as i64)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn list_orders_by_user(
    conn: &mut PgConnection,
    user_id: UserId,
    only_active: bool,
) -> sqlx::Result<Vec<OrderRecordWithTicker>> {
    sqlx::query_as(
        r#"
        SELECT o.id, o.user_id, t.ticker AS ticker, o.ticker_id, o.side, o.type,
               o.quantity, o.filled, o.price, o.is_active, o.created_at, o.closed_at
        FROM orders o
        LEFT JOIN ticker t ON o.ticker_id = t.id
        WHERE o.user_id = $1 AND (NOT $2 OR o.is_active)
        ORDER BY o.created_at DESC
        "#,
    )
    .bind(user_id)
    .bind(only_active)
    .fetch_all(conn)
    .await
}

/// Active orders across all symbols, oldest first (id order is time order),
/// for rebuilding the in-memory books at startup.
pub async fn list_active_orders(conn: &mut PgConnection) -> sqlx::Result<Vec<OrderRecord>> {
    sqlx::query_as(
        r#"
        SELECT id, user_id, ticker_id, side, ticker_ledger_id, type,
               quantity, filled, price, is_active, created_at, closed_at
        FROM orders WHERE is_active = TRUE ORDER BY id
        "#,
    )
    .fetch_all(conn)
    .await
}

pub async fn insert_trade(conn: &mut PgConnection, trade: &TradeRecord) -> sqlx::Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO trades (ticker_id, order_taker_id, order_maker_id, ledger_transfer_id,
                            user_ledger_id, ticker_ledger_id, type, quantity, price, settled)
        VALUES ($1, $2, $3, $4::numeric, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(trade.ticker_id)
    .bind(trade.order_taker_id)
    .bind(trade.order_maker_id)
    .bind(&trade.ledger_transfer_id)
    .bind(trade.user_ledger_id)
    .bind(trade.ticker_ledger_id)
    .bind(trade.kind)
    .bind(trade.quantity)
    .bind(trade.price)
    .bind(trade.settled)
    .fetch_one(conn)
    .await?;
    Ok(id)
}

/// Flip a trade to settled once a reconciliation retry posts, recording the
/// replacement transfer id.
pub async fn mark_trade_settled(
    conn: &mut PgConnection,
    trade_row_id: i64,
    ledger_transfer_id: u128,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"UPDATE trades SET settled = TRUE, ledger_transfer_id = $1::numeric WHERE id = $2"#,
    )
    .bind(ledger_transfer_id.to_string())
    .bind(trade_row_id)
    .execute(conn)
    .await?;
    Ok(())
}
