use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::websocket::handler::handle_socket;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// Authenticated user id, supplied by the auth layer in front of this
    /// service. Connections without one are anonymous market-data
    /// subscribers.
    pub user_id: Option<Uuid>,
}

pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}
