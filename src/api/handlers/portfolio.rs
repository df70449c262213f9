//! Portfolio handler: a user's holdings valued at the last trade price,
//! falling back to face value when a bond has never traded.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::utils::response::{ApiResponse, AppError};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct PortfolioHolding {
    pub bond_id: Uuid,
    pub bond_name: String,
    pub isin: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub current_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub market_value: Decimal,
    pub coupon_rate: f64,
    pub maturity_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PortfolioResponse {
    pub user_id: Uuid,
    pub wallet_address: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_portfolio_value: Decimal,
    pub holdings: Vec<PortfolioHolding>,
    pub holdings_count: usize,
}

/// GET /portfolio/:user_id
pub async fn get_portfolio(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PortfolioResponse>>, AppError> {
    let user = state
        .store
        .fetch_user(user_id)
        .await?
        .ok_or_else(|| AppError::not_found("user not found"))?;

    if state.config.demo_holdings_enabled {
        seed_demo_holdings(&state, user_id).await?;
    }

    let holdings = state.store.list_user_holdings(user_id).await?;

    let mut entries = Vec::with_capacity(holdings.len());
    let mut total_value = Decimal::ZERO;
    for holding in holdings {
        let bond = match state.store.fetch_bond(holding.bond_id).await? {
            Some(bond) => bond,
            None => continue,
        };
        let current_price = state
            .store
            .last_trade_price(bond.id)
            .await?
            .unwrap_or(bond.face_value);
        let market_value = holding.quantity * current_price;
        total_value += market_value;

        entries.push(PortfolioHolding {
            bond_id: bond.id,
            bond_name: bond.name,
            isin: bond.isin,
            quantity: holding.quantity,
            current_price,
            market_value,
            coupon_rate: bond.coupon_rate,
            maturity_date: bond.maturity_date,
        });
    }

    let holdings_count = entries.len();
    Ok(Json(ApiResponse::success(PortfolioResponse {
        user_id,
        wallet_address: user.wallet_address,
        total_portfolio_value: total_value,
        holdings: entries,
        holdings_count,
    })))
}

/// Grant starter units of up to two active bonds to a user with no
/// holdings. Behind `DEMO_HOLDINGS_ENABLED`; never called from the matching
/// path.
async fn seed_demo_holdings(state: &Arc<AppState>, user_id: Uuid) -> Result<(), AppError> {
    let existing = state.store.list_user_holdings(user_id).await?;
    if !existing.is_empty() {
        return Ok(());
    }

    let bonds = state.store.list_active_bonds(2).await?;
    if bonds.is_empty() {
        return Ok(());
    }

    let mut tx = state.store.begin().await?;
    let mut grants = Vec::new();
    for (i, bond) in bonds.iter().enumerate() {
        let quantity = if i == 0 {
            Decimal::from(10)
        } else {
            Decimal::from(5)
        };
        if let Err(e) = tx.upsert_holding(user_id, bond.id, quantity).await {
            let _ = tx.rollback().await;
            return Err(e.into());
        }
        grants.push((bond.id, quantity));
    }
    tx.commit().await?;

    for (bond_id, quantity) in grants {
        state.engine.ledger().credit(user_id, bond_id, quantity);
    }

    tracing::info!("Seeded demo holdings for user {}", user_id);
    Ok(())
}
