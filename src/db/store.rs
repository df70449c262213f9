//! Persistence adapter.
//!
//! The engine talks to storage through a narrow interface: reads for
//! startup recovery and queries, and a transactional write unit
//! (`StoreTx`) under which one submission's order, trade, and holding
//! mutations commit or roll back together. Events are only broadcast after
//! `commit` returns.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Bond, Holding, Order, OrderSide, OrderStatus, Trade, User};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("write conflict")]
    Conflict,

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("40001") => {
                StoreError::Conflict
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Filters for the user order listing.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub bond_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub side: Option<OrderSide>,
    pub limit: i64,
}

#[async_trait]
pub trait TradingStore: Send + Sync {
    /// Open the transactional write unit for one submission.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    async fn fetch_bond(&self, id: Uuid) -> Result<Option<Bond>, StoreError>;
    async fn fetch_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn fetch_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn list_user_orders(
        &self,
        user_id: Uuid,
        filter: OrderFilter,
    ) -> Result<Vec<Order>, StoreError>;

    /// Trades where the user was on either side, newest first.
    async fn list_user_trades(
        &self,
        user_id: Uuid,
        bond_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Trade>, StoreError>;

    async fn list_bond_trades(&self, bond_id: Uuid, limit: i64) -> Result<Vec<Trade>, StoreError>;

    async fn last_trade_price(&self, bond_id: Uuid) -> Result<Option<Decimal>, StoreError>;

    /// Open and partially filled orders in insertion order, for book
    /// recovery at startup.
    async fn load_resting_orders(&self) -> Result<Vec<Order>, StoreError>;

    async fn load_holdings(&self) -> Result<Vec<Holding>, StoreError>;

    async fn list_user_holdings(&self, user_id: Uuid) -> Result<Vec<Holding>, StoreError>;

    async fn list_active_bonds(&self, limit: i64) -> Result<Vec<Bond>, StoreError>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn update_order_fill_and_status(
        &mut self,
        order_id: Uuid,
        filled_quantity: Decimal,
        status: OrderStatus,
    ) -> Result<(), StoreError>;

    async fn insert_trade(&mut self, trade: &Trade) -> Result<(), StoreError>;

    /// Set the absolute balance for a (user, bond) row, creating it if
    /// missing.
    async fn upsert_holding(
        &mut self,
        user_id: Uuid,
        bond_id: Uuid,
        quantity: Decimal,
    ) -> Result<(), StoreError>;

    async fn delete_holding(&mut self, user_id: Uuid, bond_id: Uuid) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradingStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn fetch_bond(&self, id: Uuid) -> Result<Option<Bond>, StoreError> {
        let bond = sqlx::query_as::<_, Bond>(
            "SELECT id, name, isin, coupon_rate, maturity_date, face_value, min_unit, status FROM bonds WHERE id = $1"
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(bond)
    }

    async fn fetch_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, name, wallet_address, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn fetch_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    async fn list_user_orders(
        &self,
        user_id: Uuid,
        filter: OrderFilter,
    ) -> Result<Vec<Order>, StoreError> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE user_id = $1
              AND ($2::uuid IS NULL OR bond_id = $2)
              AND ($3::order_status IS NULL OR status = $3)
              AND ($4::order_side IS NULL OR side = $4)
            ORDER BY created_at DESC
            LIMIT $5
            "#,
        )
        .bind(user_id)
        .bind(filter.bond_id)
        .bind(filter.status)
        .bind(filter.side)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn list_user_trades(
        &self,
        user_id: Uuid,
        bond_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(
            r#"
            SELECT t.* FROM trades t
            WHERE (t.buy_order_id IN (SELECT id FROM orders WHERE user_id = $1)
                OR t.sell_order_id IN (SELECT id FROM orders WHERE user_id = $1))
              AND ($2::uuid IS NULL OR t.bond_id = $2)
            ORDER BY t.executed_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(bond_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    async fn list_bond_trades(&self, bond_id: Uuid, limit: i64) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(
            "SELECT * FROM trades WHERE bond_id = $1 ORDER BY executed_at DESC LIMIT $2",
        )
        .bind(bond_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    async fn last_trade_price(&self, bond_id: Uuid) -> Result<Option<Decimal>, StoreError> {
        let price = sqlx::query_scalar::<_, Decimal>(
            "SELECT price FROM trades WHERE bond_id = $1 ORDER BY executed_at DESC LIMIT 1",
        )
        .bind(bond_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(price)
    }

    async fn load_resting_orders(&self) -> Result<Vec<Order>, StoreError> {
        let orders = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE status IN ('open', 'partial') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn load_holdings(&self) -> Result<Vec<Holding>, StoreError> {
        let holdings = sqlx::query_as::<_, Holding>("SELECT * FROM holdings")
            .fetch_all(&self.pool)
            .await?;
        Ok(holdings)
    }

    async fn list_user_holdings(&self, user_id: Uuid) -> Result<Vec<Holding>, StoreError> {
        let holdings =
            sqlx::query_as::<_, Holding>("SELECT * FROM holdings WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(holdings)
    }

    async fn list_active_bonds(&self, limit: i64) -> Result<Vec<Bond>, StoreError> {
        let bonds = sqlx::query_as::<_, Bond>(
            "SELECT id, name, isin, coupon_rate, maturity_date, face_value, min_unit, status FROM bonds WHERE status = 'active' LIMIT $1"
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(bonds)
    }
}

pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, bond_id, side, order_type, price, quantity, filled_quantity, status, tx_hash, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(order.bond_id)
        .bind(order.side)
        .bind(order.order_type)
        .bind(order.price)
        .bind(order.quantity)
        .bind(order.filled_quantity)
        .bind(order.status)
        .bind(&order.tx_hash)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_order_fill_and_status(
        &mut self,
        order_id: Uuid,
        filled_quantity: Decimal,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE orders SET filled_quantity = $1, status = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(filled_quantity)
        .bind(status)
        .bind(Utc::now())
        .bind(order_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_trade(&mut self, trade: &Trade) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (id, buy_order_id, sell_order_id, bond_id, price, quantity, tx_hash, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(trade.id)
        .bind(trade.buy_order_id)
        .bind(trade.sell_order_id)
        .bind(trade.bond_id)
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(&trade.tx_hash)
        .bind(trade.executed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_holding(
        &mut self,
        user_id: Uuid,
        bond_id: Uuid,
        quantity: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO holdings (id, user_id, bond_id, quantity, last_updated)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, bond_id)
            DO UPDATE SET quantity = $4, last_updated = $5
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(bond_id)
        .bind(quantity)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_holding(&mut self, user_id: Uuid, bond_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM holdings WHERE user_id = $1 AND bond_id = $2")
            .bind(user_id)
            .bind(bond_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
