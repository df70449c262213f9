use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a bond. Only `active` bonds accept new orders; issuance and
/// maturity are managed outside the trading core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "bond_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BondStatus {
    Draft,
    Active,
    Matured,
}

impl fmt::Display for BondStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BondStatus::Draft => write!(f, "draft"),
            BondStatus::Active => write!(f, "active"),
            BondStatus::Matured => write!(f, "matured"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Bond {
    pub id: Uuid,
    pub name: String,
    pub isin: String,
    pub coupon_rate: f64,
    pub maturity_date: DateTime<Utc>,
    pub face_value: Decimal,
    /// Smallest tradable fraction. Order quantities must be positive
    /// multiples of this.
    pub min_unit: Decimal,
    pub status: BondStatus,
}

impl Bond {
    pub fn is_tradable(&self) -> bool {
        self.status == BondStatus::Active
    }
}
