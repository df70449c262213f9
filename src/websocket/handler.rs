//! WebSocket Handler
//!
//! One task per connection: inbound frames drive room membership and
//! heartbeats, outbound frames are drained from the broadcaster queue to
//! the socket. A send that exceeds the configured timeout drops the
//! connection.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::websocket::broadcaster::{user_room, Room};
use crate::websocket::events::OutboundEvent;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom { room: String },
    LeaveRoom { room: String },
    Ping { timestamp: Option<i64> },
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: Option<Uuid>) {
    let (connection_id, mut outbound) = state.broadcaster.register(user_id);

    // Authenticated connections are auto-subscribed to their own user room.
    if let Some(uid) = user_id {
        state.broadcaster.join_room(connection_id, &user_room(uid));
    }

    state.broadcaster.send_to(
        connection_id,
        &OutboundEvent::Connected {
            connection_id,
            authenticated: user_id.is_some(),
        },
    );

    let (mut sender, mut receiver) = socket.split();
    let send_timeout = Duration::from_millis(state.config.ws_send_timeout_ms);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, connection_id, user_id, &state);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        // Connection reset without a closing handshake is
                        // normal (browser closed, network switch).
                        tracing::warn!("WebSocket disconnected: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if !forward_frame(&mut sender, text, send_timeout).await {
                            break;
                        }
                    }
                    // Queue closed: the broadcaster evicted us.
                    None => break,
                }
            }
        }
    }

    state.broadcaster.unregister(connection_id);
}

async fn forward_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    text: String,
    send_timeout: Duration,
) -> bool {
    match tokio::time::timeout(send_timeout, sender.send(Message::Text(text))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!("WebSocket send failed: {}", e);
            false
        }
        Err(_) => {
            tracing::warn!("WebSocket send timed out");
            false
        }
    }
}

fn handle_client_message(
    text: &str,
    connection_id: Uuid,
    user_id: Option<Uuid>,
    state: &Arc<AppState>,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            state.broadcaster.send_to(
                connection_id,
                &OutboundEvent::Error {
                    message: format!("failed to parse message: {}", e),
                },
            );
            return;
        }
    };

    match message {
        ClientMessage::JoinRoom { room } => {
            match Room::parse(&room) {
                Some(Room::User(target)) if user_id != Some(target) => {
                    state.broadcaster.send_to(
                        connection_id,
                        &OutboundEvent::Error {
                            message: "user rooms require authentication as that user".to_string(),
                        },
                    );
                    return;
                }
                Some(_) => {}
                None => {
                    state.broadcaster.send_to(
                        connection_id,
                        &OutboundEvent::Error {
                            message: format!("unknown room: {}", room),
                        },
                    );
                    return;
                }
            }
            state.broadcaster.join_room(connection_id, &room);
            state
                .broadcaster
                .send_to(connection_id, &OutboundEvent::RoomJoined { room });
        }

        ClientMessage::LeaveRoom { room } => {
            state.broadcaster.leave_room(connection_id, &room);
            state
                .broadcaster
                .send_to(connection_id, &OutboundEvent::RoomLeft { room });
        }

        ClientMessage::Ping { timestamp } => {
            state
                .broadcaster
                .send_to(connection_id, &OutboundEvent::Pong { timestamp });
        }
    }
}
