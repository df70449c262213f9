//! Order API Handlers
//!
//! Submission, cancellation, and order/trade queries. Authentication sits
//! in front of this service; requests arrive with an already-verified
//! `user_id`.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::store::OrderFilter;
use crate::models::{
    CreateOrderRequest, OrderResponse, OrderSide, OrderStatus, TradeResponse,
};
use crate::utils::response::{ApiResponse, AppError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CancelOrderResponse {
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct OrderQuery {
    pub user_id: Uuid,
    pub bond_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub side: Option<OrderSide>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TradeQuery {
    pub user_id: Uuid,
    pub bond_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub user_id: Uuid,
}

/// Create a new order
/// POST /orders
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, AppError> {
    if let Some(nonce) = &req.client_nonce {
        tracing::debug!("Order submission with client nonce {}", nonce);
    }

    let outcome = state
        .engine
        .submit(
            req.user_id,
            req.bond_id,
            req.side,
            req.order_type,
            req.price,
            req.quantity,
        )
        .await?;

    let trade_ids = outcome.trades.iter().map(|t| t.id).collect();
    Ok(Json(ApiResponse::success(OrderResponse::from_order(
        &outcome.order,
        trade_ids,
    ))))
}

/// Cancel an open order
/// DELETE /orders/:order_id
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<CancelOrderRequest>,
) -> Result<Json<ApiResponse<CancelOrderResponse>>, AppError> {
    let cancelled = state.engine.cancel(order_id, req.user_id).await?;
    Ok(Json(ApiResponse::success(CancelOrderResponse { cancelled })))
}

/// Get one of the caller's orders
/// GET /orders/:order_id?user_id=...
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<ApiResponse<OrderResponse>>, AppError> {
    let order = state
        .store
        .fetch_order(order_id)
        .await?
        .filter(|o| o.user_id == query.user_id)
        .ok_or_else(|| AppError::not_found("order not found"))?;
    Ok(Json(ApiResponse::success(order.into())))
}

/// List the caller's orders with optional filters
/// GET /orders?user_id=...&bond_id=...&status=...&side=...&limit=...
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrderQuery>,
) -> Result<Json<ApiResponse<Vec<OrderResponse>>>, AppError> {
    let filter = OrderFilter {
        bond_id: query.bond_id,
        status: query.status,
        side: query.side,
        limit: query.limit.unwrap_or(100).clamp(1, 1000),
    };
    let orders = state.store.list_user_orders(query.user_id, filter).await?;
    Ok(Json(ApiResponse::success(
        orders.into_iter().map(OrderResponse::from).collect(),
    )))
}

/// List trades where the caller was on either side
/// GET /trades?user_id=...&bond_id=...&limit=...
pub async fn list_user_trades(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradeQuery>,
) -> Result<Json<ApiResponse<Vec<TradeResponse>>>, AppError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let trades = state
        .store
        .list_user_trades(query.user_id, query.bond_id, limit)
        .await?;
    Ok(Json(ApiResponse::success(
        trades.into_iter().map(TradeResponse::from).collect(),
    )))
}
