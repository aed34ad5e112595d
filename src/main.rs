use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orderbook_backend::config::AppConfig;
use orderbook_backend::db::Database;
use orderbook_backend::services::ledger::LedgerGateway;
use orderbook_backend::services::matching::BookRegistry;
use orderbook_backend::services::orders::OrderService;
use orderbook_backend::services::reconciliation::ReconciliationQueue;
use orderbook_backend::services::sequence::SequenceOracle;
use orderbook_backend::websocket::{serve_ws, Hub};
use orderbook_backend::{api, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orderbook_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting orderbook backend v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    let db = Database::connect(&config.database_url).await?;
    tracing::info!("Database connected");

    let gateway = Arc::new(LedgerGateway::connect(
        config.tb_cluster_id as u128,
        &config.tb_address,
    )?);
    tracing::info!("Ledger engine client ready at {}", config.tb_address);

    let sequences = Arc::new(SequenceOracle::new());
    let (hub, hub_handle) = Hub::new(sequences);
    tokio::spawn(hub.run());

    let reconciliation = ReconciliationQueue::start(Arc::clone(&gateway), db.pool.clone());

    let books = Arc::new(BookRegistry::new());
    let orders = OrderService::new(
        db.pool.clone(),
        gateway,
        books,
        hub_handle.clone(),
        reconciliation,
        config.cash_ticker.clone(),
    );

    // Rebuild the in-memory books from open orders before taking traffic.
    match orders.recover_books().await {
        Ok(0) => tracing::info!("No open orders to recover"),
        Ok(count) => tracing::info!("Recovered {count} open orders into the books"),
        Err(e) => {
            tracing::error!("Book recovery failed: {e}");
            tracing::warn!("Starting with empty books");
        }
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        orders,
        hub: hub_handle,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/ws", get(serve_ws))
        .nest("/api/v1", api::routes::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(5)))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            // Give in-flight work 10s to drain, then force the exit.
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                tracing::warn!("graceful shutdown timed out; forcing close");
                std::process::exit(1);
            });
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.db.health_check().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
    }
}

/// Resolve on SIGINT/SIGTERM; axum then stops accepting and drains in-flight
/// requests.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
