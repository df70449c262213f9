use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::AppState;

pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        // Orders
        .route("/orders", post(handlers::order::create_order))
        .route("/orders", get(handlers::order::list_orders))
        .route("/orders/:order_id", get(handlers::order::get_order))
        .route("/orders/:order_id", delete(handlers::order::cancel_order))
        .route("/trades", get(handlers::order::list_user_trades))
        // Market data
        .route("/bonds/:bond_id/orderbook", get(handlers::market::get_orderbook))
        .route("/bonds/:bond_id/trades", get(handlers::market::get_bond_trades))
        // Portfolio
        .route("/portfolio/:user_id", get(handlers::portfolio::get_portfolio))
        // Diagnostics
        .route("/ws/stats", get(handlers::stats::get_room_stats))
}
