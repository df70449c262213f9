use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-(user, bond) unit balance. At most one row per pair; a row that would
/// reach zero is deleted instead of kept.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Holding {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bond_id: Uuid,
    pub quantity: Decimal,
    pub last_updated: DateTime<Utc>,
}
