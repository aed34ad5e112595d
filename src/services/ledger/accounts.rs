//! Account Projections
//!
//! Relational rows tying symbols and users to their engine accounts:
//! `ticker` (one per listed symbol, immutable after bootstrap, owns the
//! escrow account id) and `users_ledger` (one per (user, symbol), created at
//! registration, never deleted). 128-bit engine ids live in NUMERIC(39,0)
//! columns and cross the wire as decimal strings.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::models::UserId;

use super::{parse_account_id, LedgerError};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Ticker {
    pub id: i64,
    pub ticker: String,
    pub tb_ledger_id: i64,
    pub escrow_account_id: String,
    pub created_at: DateTime<Utc>,
}

impl Ticker {
    pub fn escrow_account(&self) -> Result<u128, LedgerError> {
        parse_account_id(&self.escrow_account_id)
    }

    pub fn ledger(&self) -> u32 {
        self.tb_ledger_id as u32
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserLedger {
    pub id: i64,
    pub user_id: i64,
    pub ledger_id: i64,
    pub tb_account_id: String,
    pub is_escrow: bool,
    pub created_at: DateTime<Utc>,
}

impl UserLedger {
    pub fn account(&self) -> Result<u128, LedgerError> {
        parse_account_id(&self.tb_account_id)
    }
}

pub async fn ticker_by_symbol(
    conn: &mut PgConnection,
    symbol: &str,
) -> sqlx::Result<Option<Ticker>> {
    sqlx::query_as(
        r#"
        SELECT id, ticker, tb_ledger_id, escrow_account_id::text AS escrow_account_id, created_at
        FROM ticker WHERE ticker = $1
        "#,
    )
    .bind(symbol)
    .fetch_optional(conn)
    .await
}

pub async fn ticker_by_id(conn: &mut PgConnection, id: i64) -> sqlx::Result<Option<Ticker>> {
    sqlx::query_as(
        r#"
        SELECT id, ticker, tb_ledger_id, escrow_account_id::text AS escrow_account_id, created_at
        FROM ticker WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await
}

pub async fn list_tickers(conn: &mut PgConnection) -> sqlx::Result<Vec<Ticker>> {
    sqlx::query_as(
        r#"
        SELECT id, ticker, tb_ledger_id, escrow_account_id::text AS escrow_account_id, created_at
        FROM ticker ORDER BY id
        "#,
    )
    .fetch_all(conn)
    .await
}

pub async fn insert_ticker(
    conn: &mut PgConnection,
    symbol: &str,
    tb_ledger_id: i64,
    escrow_account_id: u128,
) -> sqlx::Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO ticker (ticker, tb_ledger_id, escrow_account_id)
        VALUES ($1, $2, $3::numeric) RETURNING id
        "#,
    )
    .bind(symbol)
    .bind(tb_ledger_id)
    .bind(escrow_account_id.to_string())
    .fetch_one(conn)
    .await?;
    Ok(id)
}

/// The user's account on one symbol's ledger.
pub async fn user_ledger(
    conn: &mut PgConnection,
    user_id: UserId,
    ledger_id: i64,
) -> sqlx::Result<Option<UserLedger>> {
    sqlx::query_as(
        r#"
        SELECT id, user_id, ledger_id, tb_account_id::text AS tb_account_id, is_escrow, created_at
        FROM users_ledger WHERE user_id = $1 AND ledger_id = $2
        "#,
    )
    .bind(user_id)
    .bind(ledger_id)
    .fetch_optional(conn)
    .await
}

pub async fn insert_user_ledger(
    conn: &mut PgConnection,
    user_id: UserId,
    ledger_id: i64,
    tb_account_id: u128,
    is_escrow: bool,
) -> sqlx::Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO users_ledger (user_id, ledger_id, tb_account_id, is_escrow)
        VALUES ($1, $2, $3::numeric, $4) RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(ledger_id)
    .bind(tb_account_id.to_string())
    .bind(is_escrow)
    .fetch_one(conn)
    .await?;
    Ok(id)
}
