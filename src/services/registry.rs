//! Read-through bond and user registry.
//!
//! The engine only needs to know whether a bond exists and is tradable and
//! whether a user exists; lifecycles are managed elsewhere. Lookups go to
//! the store and positive results are cached with a short TTL so the hot
//! path rarely touches the database.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::matching::error::TradingError;
use crate::db::store::TradingStore;
use crate::models::Bond;

pub struct Registry {
    store: Arc<dyn TradingStore>,
    bonds: DashMap<Uuid, (Bond, Instant)>,
    users: DashMap<Uuid, Instant>,
    ttl: Duration,
}

impl Registry {
    pub fn new(store: Arc<dyn TradingStore>, ttl: Duration) -> Self {
        Self {
            store,
            bonds: DashMap::new(),
            users: DashMap::new(),
            ttl,
        }
    }

    /// Look up a bond, erroring if it does not exist.
    pub async fn bond(&self, bond_id: Uuid) -> Result<Bond, TradingError> {
        if let Some(entry) = self.bonds.get(&bond_id) {
            let (bond, cached_at) = entry.value();
            if cached_at.elapsed() < self.ttl {
                return Ok(bond.clone());
            }
        }

        match self.store.fetch_bond(bond_id).await? {
            Some(bond) => {
                self.bonds.insert(bond_id, (bond.clone(), Instant::now()));
                Ok(bond)
            }
            None => {
                self.bonds.remove(&bond_id);
                Err(TradingError::UnknownInstrument(bond_id))
            }
        }
    }

    /// Look up a bond and require it to accept orders.
    pub async fn tradable_bond(&self, bond_id: Uuid) -> Result<Bond, TradingError> {
        let bond = self.bond(bond_id).await?;
        if !bond.is_tradable() {
            return Err(TradingError::InstrumentNotTradable(bond_id));
        }
        Ok(bond)
    }

    /// Verify that a user exists.
    pub async fn ensure_user(&self, user_id: Uuid) -> Result<(), TradingError> {
        if let Some(cached_at) = self.users.get(&user_id) {
            if cached_at.elapsed() < self.ttl {
                return Ok(());
            }
        }

        match self.store.fetch_user(user_id).await? {
            Some(_) => {
                self.users.insert(user_id, Instant::now());
                Ok(())
            }
            None => {
                self.users.remove(&user_id);
                Err(TradingError::UnknownUser(user_id))
            }
        }
    }
}
