//! Broadcaster diagnostics.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::utils::response::ApiResponse;
use crate::websocket::broadcaster::RoomStats;
use crate::AppState;

/// GET /ws/stats
pub async fn get_room_stats(State(state): State<Arc<AppState>>) -> Json<ApiResponse<RoomStats>> {
    Json(ApiResponse::success(state.broadcaster.stats()))
}
