//! Market Data Handlers

use axum::extract::{Path, State};
use axum::Json;
use std::sync::Arc;

use crate::models::{MarketDepth, TopOfBook};
use crate::AppState;

/// GET /ticker/{ticker}/depth: top 10 levels per side.
pub async fn get_depth(
    State(state): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> Json<MarketDepth> {
    Json(state.orders.market_depth(&ticker.to_uppercase()))
}

/// GET /ticker/{ticker}/top
pub async fn get_top_of_book(
    State(state): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> Json<TopOfBook> {
    Json(state.orders.top_of_book(&ticker.to_uppercase()))
}
