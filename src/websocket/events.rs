//! Outbound event frames.
//!
//! Every frame on the wire is one of these, tagged by `type`, with a
//! `server_sequence` stamped by the broadcaster at publish time.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{datetime_as_millis, OrderSide, OrderStatus, OrderType, Trade};
use crate::services::matching::types::BookSnapshot;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Connected {
        connection_id: Uuid,
        authenticated: bool,
    },
    OrderbookUpdate {
        data: BookSnapshot,
    },
    Trade {
        data: TradePayload,
    },
    OrderUpdate {
        data: OrderUpdatePayload,
    },
    PortfolioUpdate,
    RoomJoined {
        room: String,
    },
    RoomLeft {
        room: String,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TradePayload {
    pub id: Uuid,
    pub bond_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub executed_at: DateTime<Utc>,
}

impl From<&Trade> for TradePayload {
    fn from(trade: &Trade) -> Self {
        Self {
            id: trade.id,
            bond_id: trade.bond_id,
            price: trade.price,
            quantity: trade.quantity,
            executed_at: trade.executed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderUpdatePayload {
    pub order_id: Uuid,
    pub bond_id: Uuid,
    pub side: OrderSide,
    pub order_type: OrderType,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub filled_quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub remaining_quantity: Decimal,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
