//! Order Service
//!
//! The one place that composes the ledger, the store and the books:
//! validate input, reserve funds, submit to the matching engine, persist
//! orders and trades, settle executions against escrow, close filled orders
//! and publish trades to the hub.
//!
//! Two store transactions per add: the first covers reservation + order row +
//! book mutation, the second covers settlement + trade rows + fill/close
//! updates. Settlement runs on a spawned task that the request awaits, so a
//! canceled request can abandon the wait but never the work.

pub mod store;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::models::{
    MarketDepth, Order, OrderId, OrderModify, OrderType, Price, Quantity, Side, TopOfBook, Trade,
    UserId,
};
use crate::websocket::HubHandle;

use super::ledger::accounts::{self, Ticker};
use super::ledger::{
    LedgerError, LedgerGateway, TransferSpec, CODE_ASSET_RESERVATION, CODE_ASSET_SETTLEMENT,
    CODE_CASH_RESERVATION, CODE_CASH_SETTLEMENT, CODE_RELEASE,
};
use super::matching::{BookError, BookRegistry};
use super::reconciliation::ReconciliationQueue;
use store::{OrderRecord, OrderRecordWithTicker, TradeRecord};

/// Market depth shown by the depth endpoint.
const DEPTH_LEVELS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("quantity must be greater than zero")]
    InvalidQuantity,

    #[error("price must be greater than zero")]
    InvalidPrice,

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("order {0} not found")]
    UnknownOrder(OrderId),

    #[error("order {0} is already closed")]
    OrderClosed(OrderId),

    #[error("order {0} already exists")]
    DuplicateOrder(OrderId),

    #[error("fund reservation failed: {0}")]
    ReservationFailed(#[source] LedgerError),

    #[error("order {0} cannot fill at its limit price")]
    MatchRejected(OrderId),

    #[error("no ledger account for user {0} on ledger {1}")]
    MissingAccount(UserId, i64),

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

impl OrderError {
    fn from_book(err: BookError) -> Self {
        match err {
            BookError::Duplicate(id) => OrderError::DuplicateOrder(id),
            BookError::CannotMatch(id) => OrderError::MatchRejected(id),
            BookError::NotFound(id) => OrderError::UnknownOrder(id),
        }
    }
}

/// Strictly increasing, time-based order ids: millisecond timestamp in the
/// high bits, a per-process counter breaking same-millisecond ties.
pub struct OrderIdGenerator {
    last: AtomicU64,
}

impl OrderIdGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> OrderId {
        let candidate = (Utc::now().timestamp_millis() as u64) << 20;
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(if candidate > last { candidate } else { last + 1 })
            })
            .expect("fetch_update closure is total");
        if candidate > prev {
            candidate
        } else {
            prev + 1
        }
    }
}

impl Default for OrderIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrderService {
    pool: PgPool,
    gateway: Arc<LedgerGateway>,
    books: Arc<BookRegistry>,
    hub: HubHandle,
    reconciliation: ReconciliationQueue,
    /// Quote-currency symbol (cash leg of every pair).
    cash_ticker: String,
    id_gen: OrderIdGenerator,
}

impl OrderService {
    pub fn new(
        pool: PgPool,
        gateway: Arc<LedgerGateway>,
        books: Arc<BookRegistry>,
        hub: HubHandle,
        reconciliation: ReconciliationQueue,
        cash_ticker: String,
    ) -> Self {
        Self {
            pool,
            gateway,
            books,
            hub,
            reconciliation,
            cash_ticker,
            id_gen: OrderIdGenerator::new(),
        }
    }

    // ========================================================================
    // Add
    // ========================================================================

    pub async fn add_order(
        &self,
        user_id: UserId,
        symbol: &str,
        side: Side,
        price: Price,
        quantity: Quantity,
        kind: OrderType,
    ) -> Result<(OrderId, Vec<Trade>), OrderError> {
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity);
        }
        if price == 0 {
            return Err(OrderError::InvalidPrice);
        }

        let order_id = self.id_gen.next();

        let mut tx = self.pool.begin().await?;

        let asset = accounts::ticker_by_symbol(&mut tx, symbol)
            .await?
            .ok_or_else(|| OrderError::UnknownSymbol(symbol.to_string()))?;
        let quote = accounts::ticker_by_symbol(&mut tx, &self.cash_ticker)
            .await?
            .ok_or_else(|| OrderError::UnknownSymbol(self.cash_ticker.clone()))?;

        // Belt against id collision, checked before any funds move.
        let book = self.books.get_or_create(symbol);
        if book.lock().contains(order_id) {
            return Err(OrderError::DuplicateOrder(order_id));
        }

        // FILL_AND_KILL never rests, so only GTC holds a reservation.
        if kind == OrderType::GoodTillCancel {
            let spec = self
                .reservation_spec(&mut tx, user_id, side, price, quantity, &asset, &quote)
                .await?;
            self.gateway
                .reserve(spec)
                .await
                .map_err(OrderError::ReservationFailed)?;
        }

        store::insert_order(
            &mut tx,
            &OrderRecord {
                id: order_id as i64,
                user_id,
                ticker_id: asset.id,
                side: side.as_i16(),
                ticker_ledger_id: asset.tb_ledger_id,
                kind: kind.as_i16(),
                quantity: quantity as i64,
                filled: 0,
                price: price as i64,
                is_active: true,
                created_at: Utc::now(),
                closed_at: None,
            },
        )
        .await?;

        let order = Order::new(order_id, user_id, side, price, quantity, kind);
        let trades = {
            let mut book = book.lock();
            book.add(order).map_err(OrderError::from_book)?
        };

        tx.commit().await?;

        info!(
            order_id,
            symbol, %side, price, quantity, trades = trades.len(),
            "order accepted"
        );

        self.settle_detached(asset.id, order_id, kind, trades.clone())
            .await;

        for trade in &trades {
            self.hub.publish_trade(trade);
        }

        Ok((order_id, trades))
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    pub async fn cancel_order(&self, user_id: UserId, order_id: OrderId) -> Result<(), OrderError> {
        let mut tx = self.pool.begin().await?;

        let row = store::get_order(&mut tx, order_id)
            .await?
            .filter(|r| r.user_id == user_id)
            .ok_or(OrderError::UnknownOrder(order_id))?;
        if !row.is_active {
            return Err(OrderError::OrderClosed(order_id));
        }

        if row.remaining() > 0 {
            // Best effort: a failed release leaves funds in escrow but must
            // not block the cancel itself.
            if let Err(e) = self.release_remaining(&mut tx, &row).await {
                warn!(order_id, "reservation release failed on cancel: {e}");
            }
        }

        let ticker = accounts::ticker_by_id(&mut tx, row.ticker_id)
            .await?
            .ok_or(OrderError::UnknownOrder(order_id))?;
        if let Some(book) = self.books.get(&ticker.ticker) {
            if let Err(e) = book.lock().cancel(order_id) {
                warn!(order_id, "book cancel: {e}");
            }
        }

        store::close_order(&mut tx, order_id, Utc::now()).await?;
        tx.commit().await?;

        info!(order_id, "order canceled");
        Ok(())
    }

    // ========================================================================
    // Modify
    // ========================================================================

    /// Cancel-then-add with the supplied parameters. The old remaining
    /// reservation is released and a fresh one taken; the replacement order
    /// forfeits time priority and may match immediately. Not atomic with
    /// respect to an intervening match on the same symbol.
    pub async fn modify_order(
        &self,
        user_id: UserId,
        modify: OrderModify,
        kind: OrderType,
    ) -> Result<Vec<Trade>, OrderError> {
        if modify.quantity == 0 {
            return Err(OrderError::InvalidQuantity);
        }
        if modify.price == 0 {
            return Err(OrderError::InvalidPrice);
        }

        let mut tx = self.pool.begin().await?;

        let row = store::get_order(&mut tx, modify.id)
            .await?
            .filter(|r| r.user_id == user_id)
            .ok_or(OrderError::UnknownOrder(modify.id))?;
        if !row.is_active {
            return Err(OrderError::OrderClosed(modify.id));
        }

        let asset = accounts::ticker_by_id(&mut tx, row.ticker_id)
            .await?
            .ok_or(OrderError::UnknownOrder(modify.id))?;
        let quote = accounts::ticker_by_symbol(&mut tx, &self.cash_ticker)
            .await?
            .ok_or_else(|| OrderError::UnknownSymbol(self.cash_ticker.clone()))?;

        if row.remaining() > 0 {
            if let Err(e) = self.release_remaining(&mut tx, &row).await {
                warn!(order_id = modify.id, "reservation release failed on modify: {e}");
            }
        }
        if kind == OrderType::GoodTillCancel {
            let spec = self
                .reservation_spec(
                    &mut tx,
                    user_id,
                    modify.side,
                    modify.price,
                    modify.quantity,
                    &asset,
                    &quote,
                )
                .await?;
            self.gateway
                .reserve(spec)
                .await
                .map_err(OrderError::ReservationFailed)?;
        }

        store::update_order(
            &mut tx,
            &OrderRecord {
                side: modify.side.as_i16(),
                kind: kind.as_i16(),
                quantity: modify.quantity as i64,
                filled: 0,
                price: modify.price as i64,
                is_active: true,
                closed_at: None,
                ..row
            },
        )
        .await?;

        let book = self.books.get_or_create(&asset.ticker);
        let trades = {
            let mut book = book.lock();
            book.modify(modify, kind).map_err(OrderError::from_book)?
        };

        tx.commit().await?;

        info!(order_id = modify.id, trades = trades.len(), "order modified");

        self.settle_detached(asset.id, modify.id, kind, trades.clone())
            .await;

        for trade in &trades {
            self.hub.publish_trade(trade);
        }

        Ok(trades)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// A single order row, scoped to its owner.
    pub async fn order_by_id(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<Option<OrderRecord>, OrderError> {
        let mut conn = self.pool.acquire().await?;
        Ok(store::get_order(&mut conn, order_id)
            .await?
            .filter(|r| r.user_id == user_id))
    }

    pub async fn orders_by_user(
        &self,
        user_id: UserId,
        only_active: bool,
    ) -> Result<Vec<OrderRecordWithTicker>, OrderError> {
        let mut conn = self.pool.acquire().await?;
        Ok(store::list_orders_by_user(&mut conn, user_id, only_active).await?)
    }

    pub fn market_depth(&self, symbol: &str) -> MarketDepth {
        match self.books.get(symbol) {
            Some(book) => book.lock().depth(DEPTH_LEVELS),
            None => MarketDepth {
                bids: Vec::new(),
                asks: Vec::new(),
                timestamp: Utc::now().timestamp_millis(),
            },
        }
    }

    pub fn top_of_book(&self, symbol: &str) -> TopOfBook {
        match self.books.get(symbol) {
            Some(book) => book.lock().top_of_book(),
            None => TopOfBook {
                best_bid: None,
                best_ask: None,
                spread: None,
            },
        }
    }

    pub fn book_size(&self, symbol: &str) -> usize {
        self.books.get(symbol).map_or(0, |b| b.lock().size())
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Rebuild the in-memory books from active order rows (ascending id =
    /// time priority). Reservations are already held, so this touches neither
    /// the ledger nor the rows.
    pub async fn recover_books(&self) -> Result<usize, OrderError> {
        let mut conn = self.pool.acquire().await?;
        let rows = store::list_active_orders(&mut conn).await?;

        let mut count = 0;
        for row in rows {
            let Some(ticker) = accounts::ticker_by_id(&mut conn, row.ticker_id).await? else {
                warn!(order_id = row.id, "skipping recovery for unknown ticker");
                continue;
            };
            let remaining = row.remaining();
            if remaining <= 0 {
                continue;
            }
            let (Some(side), Some(kind)) = (
                Side::from_i16(row.side),
                OrderType::from_i16(row.kind),
            ) else {
                warn!(order_id = row.id, "skipping recovery for malformed row");
                continue;
            };

            let mut order = Order::new(
                row.id as u64,
                row.user_id,
                side,
                row.price as u64,
                row.quantity as u64,
                kind,
            );
            order.remaining_quantity = remaining as u64;
            order.created_at = row.created_at;

            let book = self.books.get_or_create(&ticker.ticker);
            match book.lock().add(order) {
                Ok(trades) if trades.is_empty() => count += 1,
                // A consistent snapshot is never crossed.
                Ok(trades) => error!(
                    order_id = row.id,
                    trades = trades.len(),
                    "recovered order matched against snapshot"
                ),
                Err(e) => warn!(order_id = row.id, "recovery add failed: {e}"),
            }
        }
        Ok(count)
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// Run settlement on a detached task and await it, so that dropping the
    /// surrounding request cannot abandon post-match work.
    async fn settle_detached(
        &self,
        ticker_id: i64,
        taker_id: OrderId,
        taker_kind: OrderType,
        trades: Vec<Trade>,
    ) {
        if trades.is_empty() && taker_kind != OrderType::FillAndKill {
            return;
        }

        let pool = self.pool.clone();
        let gateway = Arc::clone(&self.gateway);
        let reconciliation = self.reconciliation.clone();
        let cash_ticker = self.cash_ticker.clone();

        let handle = tokio::spawn(async move {
            settle_trades(
                pool,
                gateway,
                reconciliation,
                cash_ticker,
                ticker_id,
                taker_id,
                taker_kind,
                trades,
            )
            .await
        });

        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(taker_id, "settlement failed: {e}"),
            Err(e) => error!(taker_id, "settlement task panicked: {e}"),
        }
    }

    async fn reservation_spec(
        &self,
        tx: &mut sqlx::PgConnection,
        user_id: UserId,
        side: Side,
        price: Price,
        quantity: Quantity,
        asset: &Ticker,
        quote: &Ticker,
    ) -> Result<TransferSpec, OrderError> {
        match side {
            // BID reserves cash: user cash -> cash escrow, amount price * qty.
            Side::Bid => {
                let user_cash = accounts::user_ledger(tx, user_id, quote.id)
                    .await?
                    .ok_or(OrderError::MissingAccount(user_id, quote.id))?;
                Ok(TransferSpec {
                    debit: user_cash.account()?,
                    credit: quote.escrow_account()?,
                    amount: price as u128 * quantity as u128,
                    ledger: quote.ledger(),
                    code: CODE_CASH_RESERVATION,
                })
            }
            // ASK reserves the asset itself: user asset -> asset escrow.
            Side::Ask => {
                let user_asset = accounts::user_ledger(tx, user_id, asset.id)
                    .await?
                    .ok_or(OrderError::MissingAccount(user_id, asset.id))?;
                Ok(TransferSpec {
                    debit: user_asset.account()?,
                    credit: asset.escrow_account()?,
                    amount: quantity as u128,
                    ledger: asset.ledger(),
                    code: CODE_ASSET_RESERVATION,
                })
            }
        }
    }

    /// Inverse of the reservation for whatever quantity is still unfilled.
    async fn release_remaining(
        &self,
        tx: &mut sqlx::PgConnection,
        row: &OrderRecord,
    ) -> Result<(), OrderError> {
        let Some(side) = Side::from_i16(row.side) else {
            return Err(OrderError::UnknownOrder(row.id as u64));
        };
        // FAK orders never reserved anything.
        if OrderType::from_i16(row.kind) != Some(OrderType::GoodTillCancel) {
            return Ok(());
        }

        let remaining = row.remaining() as u128;
        let spec = match side {
            Side::Bid => {
                let quote = accounts::ticker_by_symbol(tx, &self.cash_ticker)
                    .await?
                    .ok_or_else(|| OrderError::UnknownSymbol(self.cash_ticker.clone()))?;
                let user_cash = accounts::user_ledger(tx, row.user_id, quote.id)
                    .await?
                    .ok_or(OrderError::MissingAccount(row.user_id, quote.id))?;
                TransferSpec {
                    debit: quote.escrow_account()?,
                    credit: user_cash.account()?,
                    amount: row.price as u128 * remaining,
                    ledger: quote.ledger(),
                    code: CODE_RELEASE,
                }
            }
            Side::Ask => {
                let asset = accounts::ticker_by_id(tx, row.ticker_id)
                    .await?
                    .ok_or(OrderError::UnknownOrder(row.id as u64))?;
                let user_asset = accounts::user_ledger(tx, row.user_id, asset.id)
                    .await?
                    .ok_or(OrderError::MissingAccount(row.user_id, asset.id))?;
                TransferSpec {
                    debit: asset.escrow_account()?,
                    credit: user_asset.account()?,
                    amount: remaining,
                    ledger: asset.ledger(),
                    code: CODE_RELEASE,
                }
            }
        };

        self.gateway.release(spec).await?;
        Ok(())
    }
}

/// Settle every trade of one match result: pair of linked transfers per trade
/// (cash-escrow -> seller, asset-escrow -> buyer), trade rows, fill counters,
/// closing of fully-filled orders. A rejected batch does not unwind the
/// match; the trade row is written unsettled and queued for reconciliation.
#[allow(clippy::too_many_arguments)]
async fn settle_trades(
    pool: PgPool,
    gateway: Arc<LedgerGateway>,
    reconciliation: ReconciliationQueue,
    cash_ticker: String,
    ticker_id: i64,
    taker_id: OrderId,
    taker_kind: OrderType,
    trades: Vec<Trade>,
) -> Result<(), OrderError> {
    let mut tx = pool.begin().await?;

    let asset = accounts::ticker_by_id(&mut tx, ticker_id)
        .await?
        .ok_or(OrderError::UnknownOrder(taker_id))?;
    let quote = accounts::ticker_by_symbol(&mut tx, &cash_ticker)
        .await?
        .ok_or_else(|| OrderError::UnknownSymbol(cash_ticker.clone()))?;

    let mut touched: HashSet<OrderId> = HashSet::new();
    let mut failures: Vec<(i64, TransferSpec, TransferSpec, String)> = Vec::new();

    for trade in &trades {
        let maker_row = store::get_order(&mut tx, trade.maker_id)
            .await?
            .ok_or(OrderError::UnknownOrder(trade.maker_id))?;
        let taker_row = store::get_order(&mut tx, trade.taker_id)
            .await?
            .ok_or(OrderError::UnknownOrder(trade.taker_id))?;

        // The trade's side is the taker's direction.
        let (buyer_id, seller_id) = match trade.side {
            Side::Bid => (taker_row.user_id, maker_row.user_id),
            Side::Ask => (maker_row.user_id, taker_row.user_id),
        };

        let buyer_asset = accounts::user_ledger(&mut tx, buyer_id, asset.id)
            .await?
            .ok_or(OrderError::MissingAccount(buyer_id, asset.id))?;
        let seller_cash = accounts::user_ledger(&mut tx, seller_id, quote.id)
            .await?
            .ok_or(OrderError::MissingAccount(seller_id, quote.id))?;

        let cash_leg = TransferSpec {
            debit: quote.escrow_account()?,
            credit: seller_cash.account()?,
            amount: trade.price as u128 * trade.quantity as u128,
            ledger: quote.ledger(),
            code: CODE_CASH_SETTLEMENT,
        };
        let asset_leg = TransferSpec {
            debit: asset.escrow_account()?,
            credit: buyer_asset.account()?,
            amount: trade.quantity as u128,
            ledger: asset.ledger(),
            code: CODE_ASSET_SETTLEMENT,
        };

        let (settled, transfer_id, failure) = match gateway.settle(&cash_leg, &asset_leg).await {
            Ok((cash_id, _)) => (true, cash_id, None),
            Err(e) => {
                warn!(
                    maker = trade.maker_id,
                    taker = trade.taker_id,
                    "settlement batch rejected: {e}"
                );
                (false, 0, Some(e.to_string()))
            }
        };

        let trade_row_id = store::insert_trade(
            &mut tx,
            &TradeRecord {
                ticker_id: asset.id,
                order_taker_id: trade.taker_id as i64,
                order_maker_id: trade.maker_id as i64,
                ledger_transfer_id: transfer_id.to_string(),
                user_ledger_id: seller_cash.id,
                ticker_ledger_id: buyer_asset.id,
                kind: taker_kind.as_i16(),
                quantity: trade.quantity as i64,
                price: trade.price as i64,
                settled,
            },
        )
        .await?;

        if let Some(reason) = failure {
            failures.push((trade_row_id, cash_leg, asset_leg, reason));
        }

        store::add_filled(&mut tx, trade.maker_id, trade.quantity as i64).await?;
        store::add_filled(&mut tx, trade.taker_id, trade.quantity as i64).await?;
        touched.insert(trade.maker_id);
        touched.insert(trade.taker_id);
    }

    // Close whichever orders the fills completed.
    for id in touched {
        if let Some(row) = store::get_order(&mut tx, id).await? {
            if row.is_active && row.filled >= row.quantity {
                store::close_order(&mut tx, id, Utc::now()).await?;
            }
        }
    }

    // A FILL_AND_KILL taker never rests: any remainder was canceled in the
    // book, so the row closes here regardless of fill state.
    if taker_kind == OrderType::FillAndKill {
        if let Some(row) = store::get_order(&mut tx, taker_id).await? {
            if row.is_active {
                store::close_order(&mut tx, taker_id, Utc::now()).await?;
            }
        }
    }

    tx.commit().await?;

    // Enqueue after commit so the recorded failures reference durable rows.
    for (trade_row_id, cash_leg, asset_leg, reason) in failures {
        reconciliation
            .record_and_enqueue(trade_row_id, cash_leg, asset_leg, &reason)
            .await;
    }

    debug!(taker_id, trades = trades.len(), "settlement complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ids_strictly_increase() {
        let gen = OrderIdGenerator::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = gen.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn order_ids_embed_wall_clock() {
        let gen = OrderIdGenerator::new();
        let id = gen.next();
        let ms = (id >> 20) as i64;
        let now = Utc::now().timestamp_millis();
        assert!((now - ms).abs() < 2_000, "id timestamp {ms} far from now {now}");
    }
}
