//! Bootstrap: seed the configured tickers with fresh escrow accounts, and
//! optionally provision per-symbol ledger accounts for a seed list of users
//! (`INIT_USER_IDS=1,2,3`). Safe to re-run; existing rows and accounts are
//! left alone.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orderbook_backend::config::AppConfig;
use orderbook_backend::db::Database;
use orderbook_backend::services::ledger::{accounts, next_transfer_id, LedgerGateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orderbook_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    let db = Database::connect(&config.database_url).await?;
    let gateway = Arc::new(LedgerGateway::connect(
        config.tb_cluster_id as u128,
        &config.tb_address,
    )?);

    let mut tx = db.pool.begin().await?;

    for (symbol, ledger) in config.ticker_seeds() {
        if accounts::ticker_by_symbol(&mut tx, &symbol).await?.is_some() {
            tracing::info!("ticker {symbol} already seeded");
            continue;
        }

        let escrow_id = next_transfer_id();
        gateway.create_escrow_account(escrow_id, ledger as u32).await?;
        let ticker_id = accounts::insert_ticker(&mut tx, &symbol, ledger, escrow_id).await?;
        tracing::info!("seeded ticker {symbol} (id={ticker_id}, ledger={ledger})");
    }

    let user_ids: Vec<i64> = std::env::var("INIT_USER_IDS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    if !user_ids.is_empty() {
        let tickers = accounts::list_tickers(&mut tx).await?;
        for user_id in user_ids {
            for ticker in &tickers {
                if accounts::user_ledger(&mut tx, user_id, ticker.id).await?.is_some() {
                    continue;
                }
                // One engine account per (user, symbol): user id in the high
                // 64 bits, ledger in the low.
                let account_id = ((user_id as u128) << 64) | ticker.tb_ledger_id as u128;
                gateway.create_user_account(account_id, ticker.ledger()).await?;
                accounts::insert_user_ledger(&mut tx, user_id, ticker.id, account_id, false)
                    .await?;
                tracing::info!("provisioned user {user_id} on {}", ticker.ticker);
            }
        }
    }

    tx.commit().await?;
    tracing::info!("bootstrap complete");
    Ok(())
}
