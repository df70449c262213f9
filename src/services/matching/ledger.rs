//! Holdings ledger.
//!
//! Hot-path mirror of the `holdings` table: per-(user, bond) unit balances
//! under fine-grained keyed locking. Rows never go negative and a row that
//! reaches zero is removed. All mutations for a bond happen under that
//! bond's matching serializer; a trade's transfer debits the seller and
//! credits the buyer in sorted user-id order.

use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::error::TradingError;
use crate::models::Holding;

#[derive(Default)]
pub struct HoldingsLedger {
    balances: DashMap<(Uuid, Uuid), Decimal>,
}

impl HoldingsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load balances from persisted holdings rows at startup.
    pub fn load(&self, holdings: impl IntoIterator<Item = Holding>) {
        for h in holdings {
            if h.quantity > Decimal::ZERO {
                self.balances.insert((h.user_id, h.bond_id), h.quantity);
            }
        }
    }

    pub fn get(&self, user_id: Uuid, bond_id: Uuid) -> Decimal {
        self.balances
            .get(&(user_id, bond_id))
            .map(|q| *q)
            .unwrap_or(Decimal::ZERO)
    }

    /// Credit units, creating the row if missing.
    pub fn credit(&self, user_id: Uuid, bond_id: Uuid, quantity: Decimal) {
        if quantity <= Decimal::ZERO {
            return;
        }
        *self
            .balances
            .entry((user_id, bond_id))
            .or_insert(Decimal::ZERO) += quantity;
    }

    /// Debit units. Fails if the balance would go negative; removes the row
    /// when it reaches exactly zero.
    pub fn debit(&self, user_id: Uuid, bond_id: Uuid, quantity: Decimal) -> Result<(), TradingError> {
        if quantity <= Decimal::ZERO {
            return Ok(());
        }
        match self.balances.entry((user_id, bond_id)) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let balance = *entry.get();
                if balance < quantity {
                    return Err(TradingError::InsufficientHoldings);
                }
                if balance == quantity {
                    entry.remove();
                } else {
                    *entry.get_mut() = balance - quantity;
                }
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Err(TradingError::InsufficientHoldings),
        }
    }

    /// Move units from seller to buyer. Rows are touched in sorted user-id
    /// order; the debit is checked first so a failed transfer changes
    /// nothing.
    pub fn transfer(
        &self,
        seller_id: Uuid,
        buyer_id: Uuid,
        bond_id: Uuid,
        quantity: Decimal,
    ) -> Result<(), TradingError> {
        if seller_id <= buyer_id {
            self.debit(seller_id, bond_id, quantity)?;
            self.credit(buyer_id, bond_id, quantity);
        } else {
            // check before credit so nothing is applied on failure
            if self.get(seller_id, bond_id) < quantity {
                return Err(TradingError::InsufficientHoldings);
            }
            self.credit(buyer_id, bond_id, quantity);
            self.debit(seller_id, bond_id, quantity)?;
        }
        Ok(())
    }

    /// All balances for one user, for the portfolio read path.
    pub fn balances_for_user(&self, user_id: Uuid) -> Vec<(Uuid, Decimal)> {
        self.balances
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| (e.key().1, *e.value()))
            .collect()
    }

    /// Sum of all balances in one bond. Invariant under trade execution.
    pub fn total_for_bond(&self, bond_id: Uuid) -> Decimal {
        self.balances
            .iter()
            .filter(|e| e.key().1 == bond_id)
            .map(|e| *e.value())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_credit_creates_row() {
        let ledger = HoldingsLedger::new();
        let (user, bond) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.credit(user, bond, dec!(100));
        assert_eq!(ledger.get(user, bond), dec!(100));
    }

    #[test]
    fn test_debit_to_zero_removes_row() {
        let ledger = HoldingsLedger::new();
        let (user, bond) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.credit(user, bond, dec!(10));
        ledger.debit(user, bond, dec!(10)).unwrap();
        assert_eq!(ledger.get(user, bond), Decimal::ZERO);
        assert!(ledger.balances_for_user(user).is_empty());
    }

    #[test]
    fn test_debit_rejects_overdraw() {
        let ledger = HoldingsLedger::new();
        let (user, bond) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.credit(user, bond, dec!(5));
        let err = ledger.debit(user, bond, dec!(10)).unwrap_err();
        assert!(matches!(err, TradingError::InsufficientHoldings));
        assert_eq!(ledger.get(user, bond), dec!(5));
    }

    #[test]
    fn test_transfer_conserves_units() {
        let ledger = HoldingsLedger::new();
        let bond = Uuid::new_v4();
        let (seller, buyer) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.credit(seller, bond, dec!(1000));
        ledger.credit(buyer, bond, dec!(50));

        ledger.transfer(seller, buyer, bond, dec!(100)).unwrap();

        assert_eq!(ledger.get(seller, bond), dec!(900));
        assert_eq!(ledger.get(buyer, bond), dec!(150));
        assert_eq!(ledger.total_for_bond(bond), dec!(1050));
    }

    #[test]
    fn test_failed_transfer_changes_nothing() {
        let ledger = HoldingsLedger::new();
        let bond = Uuid::new_v4();
        let (seller, buyer) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.credit(seller, bond, dec!(3));

        assert!(ledger.transfer(seller, buyer, bond, dec!(10)).is_err());
        assert_eq!(ledger.get(seller, bond), dec!(3));
        assert_eq!(ledger.get(buyer, bond), Decimal::ZERO);
    }
}
