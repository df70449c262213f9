//! Market data handlers: orderbook snapshots and recent trades per bond.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::TradeResponse;
use crate::services::matching::types::BookSnapshot;
use crate::utils::response::{ApiResponse, AppError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    pub depth: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

/// Top levels of a bond's book
/// GET /bonds/:bond_id/orderbook?depth=...
pub async fn get_orderbook(
    State(state): State<Arc<AppState>>,
    Path(bond_id): Path<Uuid>,
    Query(query): Query<DepthQuery>,
) -> Result<Json<ApiResponse<BookSnapshot>>, AppError> {
    let depth = query
        .depth
        .unwrap_or(20)
        .clamp(1, state.config.max_snapshot_depth);
    let snapshot = state.engine.snapshot(bond_id, depth).await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// Recent trades for a bond, newest first
/// GET /bonds/:bond_id/trades?limit=...
pub async fn get_bond_trades(
    State(state): State<Arc<AppState>>,
    Path(bond_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiResponse<Vec<TradeResponse>>>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let trades = state.store.list_bond_trades(bond_id, limit).await?;
    Ok(Json(ApiResponse::success(
        trades.into_iter().map(TradeResponse::from).collect(),
    )))
}
