//! Reconciliation Queue
//!
//! Holding pen for settlement batches the ledger engine rejected. The match
//! is never unwound (that would break time priority); instead the failed
//! transfer pair is recorded, the trade row stays flagged unsettled, and a
//! background worker retries the batch. Retries that exhaust their attempts
//! are left for operator attention.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::ledger::{LedgerGateway, TransferSpec};
use super::orders::store;

const QUEUE_DEPTH: usize = 1024;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// A settlement pair to replay, tied back to its unsettled trade row.
#[derive(Debug, Clone)]
pub struct SettlementRetry {
    pub trade_row_id: i64,
    pub failure_id: i64,
    pub cash: TransferSpec,
    pub asset: TransferSpec,
}

#[derive(Clone)]
pub struct ReconciliationQueue {
    tx: mpsc::Sender<SettlementRetry>,
    pool: PgPool,
}

impl ReconciliationQueue {
    /// Spawn the worker and return the enqueue handle.
    pub fn start(gateway: Arc<LedgerGateway>, pool: PgPool) -> Self {
        let (tx, mut rx) = mpsc::channel::<SettlementRetry>(QUEUE_DEPTH);

        let worker_pool = pool.clone();
        tokio::spawn(async move {
            info!("reconciliation worker started");
            while let Some(retry) = rx.recv().await {
                Self::process(&gateway, &worker_pool, retry).await;
            }
            info!("reconciliation worker stopped");
        });

        Self { tx, pool }
    }

    /// Record the failure for audit, then hand the pair to the worker. Never
    /// blocks the settlement path; a full queue is logged and left to the
    /// recorded row.
    pub async fn record_and_enqueue(
        &self,
        trade_row_id: i64,
        cash: TransferSpec,
        asset: TransferSpec,
        reason: &str,
    ) {
        let failure_id = match record_failure(&self.pool, trade_row_id, &cash, &asset, reason).await
        {
            Ok(id) => id,
            Err(e) => {
                error!("failed to record settlement failure for trade {trade_row_id}: {e}");
                0
            }
        };

        let retry = SettlementRetry {
            trade_row_id,
            failure_id,
            cash,
            asset,
        };
        if self.tx.try_send(retry).is_err() {
            error!(
                "reconciliation queue full; trade {} awaits operator replay",
                trade_row_id
            );
        }
    }

    async fn process(gateway: &LedgerGateway, pool: &PgPool, retry: SettlementRetry) {
        for attempt in 1..=MAX_ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY * attempt).await;

            match gateway.settle(&retry.cash, &retry.asset).await {
                Ok((cash_id, _)) => {
                    info!(
                        "settlement for trade {} reconciled on attempt {attempt}",
                        retry.trade_row_id
                    );
                    if let Err(e) = resolve(pool, &retry, cash_id).await {
                        error!(
                            "trade {} settled but could not be marked: {e}",
                            retry.trade_row_id
                        );
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "settlement retry {attempt}/{MAX_ATTEMPTS} for trade {} failed: {e}",
                        retry.trade_row_id
                    );
                }
            }
        }
        error!(
            "settlement for trade {} exhausted retries; operator attention required",
            retry.trade_row_id
        );
    }
}

async fn record_failure(
    pool: &PgPool,
    trade_row_id: i64,
    cash: &TransferSpec,
    asset: &TransferSpec,
    reason: &str,
) -> sqlx::Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO settlement_failures
            (trade_id, cash_debit, cash_credit, cash_amount, cash_ledger,
             asset_debit, asset_credit, asset_amount, asset_ledger, reason)
        VALUES ($1, $2::numeric, $3::numeric, $4::numeric, $5,
                $6::numeric, $7::numeric, $8::numeric, $9, $10)
        RETURNING id
        "#,
    )
    .bind(trade_row_id)
    .bind(cash.debit.to_string())
    .bind(cash.credit.to_string())
    .bind(cash.amount.to_string())
    .bind(cash.ledger as i64)
    .bind(asset.debit.to_string())
    .bind(asset.credit.to_string())
    .bind(asset.amount.to_string())
    .bind(asset.ledger as i64)
    .bind(reason)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

async fn resolve(pool: &PgPool, retry: &SettlementRetry, cash_transfer_id: u128) -> sqlx::Result<()> {
    let mut conn = pool.acquire().await?;
    store::mark_trade_settled(&mut conn, retry.trade_row_id, cash_transfer_id).await?;
    if retry.failure_id != 0 {
        sqlx::query(r#"UPDATE settlement_failures SET resolved_at = NOW() WHERE id = $1"#)
            .bind(retry.failure_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
