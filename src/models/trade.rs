use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::datetime_as_millis;

/// An executed trade. Immutable once recorded; references both orders by id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub id: Uuid,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub bond_id: Uuid,
    pub price: Decimal,
    pub quantity: Decimal,
    pub tx_hash: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeResponse {
    pub id: Uuid,
    pub bond_id: Uuid,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub price: Decimal,
    pub quantity: Decimal,
    pub tx_hash: Option<String>,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub executed_at: DateTime<Utc>,
}

impl From<Trade> for TradeResponse {
    fn from(trade: Trade) -> Self {
        Self {
            id: trade.id,
            bond_id: trade.bond_id,
            buy_order_id: trade.buy_order_id,
            sell_order_id: trade.sell_order_id,
            price: trade.price,
            quantity: trade.quantity,
            tx_hash: trade.tx_hash,
            executed_at: trade.executed_at,
        }
    }
}
