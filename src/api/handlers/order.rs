//! Order API Handlers
//!
//! Add, modify and cancel resolve to the order service; every response uses
//! the `{orderId, trades, status, message}` envelope. 200 accepted,
//! 400 malformed input, 422 rejected by the core, 500 store/ledger trouble.

use axum::{extract::State, http::StatusCode, Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::models::{OrderId, OrderModify, OrderStatus, OrderType, Price, Quantity, Side, Trade};
use crate::services::orders::store::OrderRecordWithTicker;
use crate::services::orders::OrderError;
use crate::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AddOrderRequest {
    pub side: Side,
    pub price: Price,
    pub quantity: Quantity,
    #[serde(rename = "type")]
    pub kind: OrderType,
    pub ticker: String,
}

#[derive(Debug, Deserialize)]
pub struct ModifyOrderRequest {
    pub id: OrderId,
    pub side: Option<Side>,
    pub price: Option<Price>,
    pub quantity: Option<Quantity>,
    #[serde(rename = "type")]
    pub kind: Option<OrderType>,
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    pub id: OrderId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEnvelope {
    pub order_id: OrderId,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trades: Vec<Trade>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OrderEnvelope {
    fn accepted(order_id: OrderId, trades: Vec<Trade>) -> Self {
        Self {
            order_id,
            trades,
            status: "accepted",
            message: None,
        }
    }

    fn rejected(order_id: OrderId, message: String) -> Self {
        Self {
            order_id,
            trades: Vec::new(),
            status: "rejected",
            message: Some(message),
        }
    }
}

fn reject(order_id: OrderId, err: OrderError) -> (StatusCode, Json<OrderEnvelope>) {
    let status = match err {
        OrderError::InvalidQuantity | OrderError::InvalidPrice => StatusCode::BAD_REQUEST,
        OrderError::Store(_) | OrderError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(OrderEnvelope::rejected(order_id, err.to_string())))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /order/add
pub async fn add_order(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<AddOrderRequest>,
) -> Result<Json<OrderEnvelope>, (StatusCode, Json<OrderEnvelope>)> {
    let (order_id, trades) = state
        .orders
        .add_order(
            auth_user.user_id,
            &req.ticker.to_uppercase(),
            req.side,
            req.price,
            req.quantity,
            req.kind,
        )
        .await
        .map_err(|e| reject(0, e))?;

    Ok(Json(OrderEnvelope::accepted(order_id, trades)))
}

/// PUT /order/modify. Fields left out of the request keep their current
/// values; the replacement order forfeits time priority.
pub async fn modify_order(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ModifyOrderRequest>,
) -> Result<Json<OrderEnvelope>, (StatusCode, Json<OrderEnvelope>)> {
    if req.id == 0 {
        return Err(reject(0, OrderError::UnknownOrder(0)));
    }

    let current = state
        .orders
        .order_by_id(auth_user.user_id, req.id)
        .await
        .map_err(|e| reject(req.id, e))?
        .ok_or_else(|| reject(req.id, OrderError::UnknownOrder(req.id)))?;

    let side = req
        .side
        .or_else(|| Side::from_i16(current.side))
        .ok_or_else(|| reject(req.id, OrderError::UnknownOrder(req.id)))?;
    let kind = req
        .kind
        .or_else(|| OrderType::from_i16(current.kind))
        .ok_or_else(|| reject(req.id, OrderError::UnknownOrder(req.id)))?;

    let modify = OrderModify {
        id: req.id,
        side,
        price: req.price.unwrap_or(current.price as u64),
        quantity: req.quantity.unwrap_or(current.quantity as u64),
    };

    let trades = state
        .orders
        .modify_order(auth_user.user_id, modify, kind)
        .await
        .map_err(|e| reject(req.id, e))?;

    Ok(Json(OrderEnvelope::accepted(req.id, trades)))
}

/// DELETE /order/cancel
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CancelOrderRequest>,
) -> Result<Json<OrderEnvelope>, (StatusCode, Json<OrderEnvelope>)> {
    if req.id == 0 {
        return Err(reject(0, OrderError::UnknownOrder(0)));
    }

    state
        .orders
        .cancel_order(auth_user.user_id, req.id)
        .await
        .map_err(|e| reject(req.id, e))?;

    Ok(Json(OrderEnvelope::accepted(req.id, Vec::new())))
}

#[derive(Debug, Serialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub order: OrderRecordWithTicker,
    pub status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderView>,
}

/// GET /order/list: the caller's active orders.
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<OrderListResponse>, (StatusCode, Json<OrderEnvelope>)> {
    let orders = state
        .orders
        .orders_by_user(auth_user.user_id, true)
        .await
        .map_err(|e| reject(0, e))?
        .into_iter()
        .map(|order| OrderView {
            status: order.status(),
            order,
        })
        .collect();
    Ok(Json(OrderListResponse { orders }))
}
