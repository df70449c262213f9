//! In-memory store.
//!
//! Implements the same narrow adapter as the Postgres store against plain
//! maps. Transactions buffer their writes and apply them atomically on
//! commit, so engine behavior under rollback is identical to the database
//! path. Used by the test suite and available as a storage backend for
//! local development.

#![allow(dead_code)]
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::store::{OrderFilter, StoreError, StoreTx, TradingStore};
use crate::models::{Bond, Holding, Order, OrderStatus, Trade, User};

#[derive(Default)]
struct MemoryData {
    bonds: HashMap<Uuid, Bond>,
    users: HashMap<Uuid, User>,
    orders: HashMap<Uuid, Order>,
    /// Order ids in insertion order; recovery relies on it when
    /// `created_at` values collide.
    order_seq: Vec<Uuid>,
    trades: Vec<Trade>,
    holdings: HashMap<(Uuid, Uuid), Holding>,
}

#[derive(Default, Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<MemoryData>>,
    /// When set, every `commit` fails. Lets tests exercise the
    /// all-or-nothing submission contract.
    fail_commits: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bond(&self, bond: Bond) {
        self.data.lock().bonds.insert(bond.id, bond);
    }

    pub fn add_user(&self, user: User) {
        self.data.lock().users.insert(user.id, user);
    }

    pub fn set_holding(&self, user_id: Uuid, bond_id: Uuid, quantity: Decimal) {
        self.data.lock().holdings.insert(
            (user_id, bond_id),
            Holding {
                id: Uuid::new_v4(),
                user_id,
                bond_id,
                quantity,
                last_updated: Utc::now(),
            },
        );
    }

    pub fn set_fail_commits(&self, fail: bool) {
        *self.fail_commits.lock() = fail;
    }

    pub fn trade_count(&self) -> usize {
        self.data.lock().trades.len()
    }

    pub fn order_count(&self) -> usize {
        self.data.lock().orders.len()
    }
}

#[async_trait]
impl TradingStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            data: Arc::clone(&self.data),
            fail_commits: Arc::clone(&self.fail_commits),
            ops: Vec::new(),
        }))
    }

    async fn fetch_bond(&self, id: Uuid) -> Result<Option<Bond>, StoreError> {
        Ok(self.data.lock().bonds.get(&id).cloned())
    }

    async fn fetch_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.data.lock().users.get(&id).cloned())
    }

    async fn fetch_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.data.lock().orders.get(&id).cloned())
    }

    async fn list_user_orders(
        &self,
        user_id: Uuid,
        filter: OrderFilter,
    ) -> Result<Vec<Order>, StoreError> {
        let data = self.data.lock();
        let mut orders: Vec<Order> = data
            .order_seq
            .iter()
            .rev()
            .filter_map(|id| data.orders.get(id))
            .filter(|o| o.user_id == user_id)
            .filter(|o| filter.bond_id.map_or(true, |b| o.bond_id == b))
            .filter(|o| filter.status.map_or(true, |s| o.status == s))
            .filter(|o| filter.side.map_or(true, |s| o.side == s))
            .cloned()
            .collect();
        orders.truncate(filter.limit.max(0) as usize);
        Ok(orders)
    }

    async fn list_user_trades(
        &self,
        user_id: Uuid,
        bond_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Trade>, StoreError> {
        let data = self.data.lock();
        let mine = |order_id: &Uuid| {
            data.orders
                .get(order_id)
                .map_or(false, |o| o.user_id == user_id)
        };
        let mut trades: Vec<Trade> = data
            .trades
            .iter()
            .rev()
            .filter(|t| mine(&t.buy_order_id) || mine(&t.sell_order_id))
            .filter(|t| bond_id.map_or(true, |b| t.bond_id == b))
            .cloned()
            .collect();
        trades.truncate(limit.max(0) as usize);
        Ok(trades)
    }

    async fn list_bond_trades(&self, bond_id: Uuid, limit: i64) -> Result<Vec<Trade>, StoreError> {
        let data = self.data.lock();
        let mut trades: Vec<Trade> = data
            .trades
            .iter()
            .rev()
            .filter(|t| t.bond_id == bond_id)
            .cloned()
            .collect();
        trades.truncate(limit.max(0) as usize);
        Ok(trades)
    }

    async fn last_trade_price(&self, bond_id: Uuid) -> Result<Option<Decimal>, StoreError> {
        let data = self.data.lock();
        Ok(data
            .trades
            .iter()
            .rev()
            .find(|t| t.bond_id == bond_id)
            .map(|t| t.price))
    }

    async fn load_resting_orders(&self) -> Result<Vec<Order>, StoreError> {
        let data = self.data.lock();
        Ok(data
            .order_seq
            .iter()
            .filter_map(|id| data.orders.get(id))
            .filter(|o| o.status.is_resting())
            .cloned()
            .collect())
    }

    async fn load_holdings(&self) -> Result<Vec<Holding>, StoreError> {
        Ok(self.data.lock().holdings.values().cloned().collect())
    }

    async fn list_user_holdings(&self, user_id: Uuid) -> Result<Vec<Holding>, StoreError> {
        Ok(self
            .data
            .lock()
            .holdings
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_active_bonds(&self, limit: i64) -> Result<Vec<Bond>, StoreError> {
        let data = self.data.lock();
        let mut bonds: Vec<Bond> = data
            .bonds
            .values()
            .filter(|b| b.is_tradable())
            .cloned()
            .collect();
        bonds.truncate(limit.max(0) as usize);
        Ok(bonds)
    }
}

enum TxOp {
    InsertOrder(Order),
    UpdateOrder {
        order_id: Uuid,
        filled_quantity: Decimal,
        status: OrderStatus,
    },
    InsertTrade(Trade),
    UpsertHolding {
        user_id: Uuid,
        bond_id: Uuid,
        quantity: Decimal,
    },
    DeleteHolding {
        user_id: Uuid,
        bond_id: Uuid,
    },
}

pub struct MemoryTx {
    data: Arc<Mutex<MemoryData>>,
    fail_commits: Arc<Mutex<bool>>,
    ops: Vec<TxOp>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.ops.push(TxOp::InsertOrder(order.clone()));
        Ok(())
    }

    async fn update_order_fill_and_status(
        &mut self,
        order_id: Uuid,
        filled_quantity: Decimal,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        self.ops.push(TxOp::UpdateOrder {
            order_id,
            filled_quantity,
            status,
        });
        Ok(())
    }

    async fn insert_trade(&mut self, trade: &Trade) -> Result<(), StoreError> {
        self.ops.push(TxOp::InsertTrade(trade.clone()));
        Ok(())
    }

    async fn upsert_holding(
        &mut self,
        user_id: Uuid,
        bond_id: Uuid,
        quantity: Decimal,
    ) -> Result<(), StoreError> {
        self.ops.push(TxOp::UpsertHolding {
            user_id,
            bond_id,
            quantity,
        });
        Ok(())
    }

    async fn delete_holding(&mut self, user_id: Uuid, bond_id: Uuid) -> Result<(), StoreError> {
        self.ops.push(TxOp::DeleteHolding { user_id, bond_id });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if *self.fail_commits.lock() {
            return Err(StoreError::Database("commit refused".to_string()));
        }
        let ops = std::mem::take(&mut self.ops);
        let mut data = self.data.lock();
        for op in ops {
            match op {
                TxOp::InsertOrder(order) => {
                    data.order_seq.push(order.id);
                    data.orders.insert(order.id, order);
                }
                TxOp::UpdateOrder {
                    order_id,
                    filled_quantity,
                    status,
                } => {
                    if let Some(order) = data.orders.get_mut(&order_id) {
                        order.filled_quantity = filled_quantity;
                        order.status = status;
                        order.updated_at = Utc::now();
                    }
                }
                TxOp::InsertTrade(trade) => data.trades.push(trade),
                TxOp::UpsertHolding {
                    user_id,
                    bond_id,
                    quantity,
                } => {
                    let entry = data
                        .holdings
                        .entry((user_id, bond_id))
                        .or_insert_with(|| Holding {
                            id: Uuid::new_v4(),
                            user_id,
                            bond_id,
                            quantity: Decimal::ZERO,
                            last_updated: Utc::now(),
                        });
                    entry.quantity = quantity;
                    entry.last_updated = Utc::now();
                }
                TxOp::DeleteHolding { user_id, bond_id } => {
                    data.holdings.remove(&(user_id, bond_id));
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
