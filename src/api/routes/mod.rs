use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::auth::middleware::auth_middleware;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Public market data
    let public_routes = Router::new()
        .route("/ticker/:ticker/depth", get(handlers::market::get_depth))
        .route("/ticker/:ticker/top", get(handlers::market::get_top_of_book));

    // Order entry (auth required)
    let protected_routes = Router::new()
        .route("/order/add", post(handlers::order::add_order))
        .route("/order/modify", put(handlers::order::modify_order))
        .route("/order/cancel", delete(handlers::order::cancel_order))
        .route("/order/list", get(handlers::order::list_orders))
        .layer(axum_middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new().merge(public_routes).merge(protected_routes)
}
