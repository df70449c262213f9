//! Matching Engine Types
//!
//! Shared types for the order book and matching engine.

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

// ============================================================================
// Price Level
// ============================================================================

/// Decimal places a book price key is normalized to.
const PRICE_DP: u32 = 8;

/// Book price key: the price rescaled to [`PRICE_DP`] places and held as
/// its integer mantissa, so equal prices always land on the same level
/// regardless of how they were written (99.5 vs 99.50).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriceLevel(i64);

impl PriceLevel {
    pub fn from_decimal(price: Decimal) -> Self {
        let mut normalized = price;
        normalized.rescale(PRICE_DP);
        PriceLevel(normalized.mantissa() as i64)
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, PRICE_DP)
    }
}

// ============================================================================
// Resting Order
// ============================================================================

/// An order resting in the book. Only orders with remaining quantity and a
/// non-terminal status live here; the book is the source of truth for
/// unmatched quantity.
#[derive(Debug, Clone)]
pub struct RestingOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    /// Book-local insertion counter. Strictly monotonic; breaks price ties
    /// even when wall-clock timestamps collide.
    pub seq: u64,
}

impl RestingOrder {
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }
}

// ============================================================================
// Match Plan
// ============================================================================

/// A single prospective fill against a resting maker order.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker_order_id: Uuid,
    pub maker_user_id: Uuid,
    /// Maker's limit price; the trade settles here.
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Outcome of walking the opposite side for an incoming order. Computed
/// without mutating the book so a failed persistence commit leaves no trace.
#[derive(Debug, Clone, Default)]
pub struct MatchPlan {
    pub fills: Vec<Fill>,
    /// Resting sell orders whose owner can no longer cover their remaining
    /// quantity. Their residual is cancelled in the same submission.
    pub exhausted: Vec<Uuid>,
}

impl MatchPlan {
    pub fn filled_quantity(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity).sum()
    }
}

// ============================================================================
// Depth / Snapshot
// ============================================================================

/// One aggregated price level of the book.
#[derive(Debug, Clone, Serialize)]
pub struct DepthLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    pub orders_count: usize,
}

/// Top-of-book snapshot for API responses and orderbook_update events.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub bond_id: Uuid,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_level_conversion() {
        let price = dec!(99.50);
        let level = PriceLevel::from_decimal(price);
        assert_eq!(level.to_decimal(), price);
    }

    #[test]
    fn test_price_level_preserves_eight_decimals() {
        let price = dec!(101.12345678);
        let level = PriceLevel::from_decimal(price);
        assert_eq!(level.to_decimal(), price);
    }

    #[test]
    fn test_price_level_ordering() {
        let p1 = PriceLevel::from_decimal(dec!(99.00));
        let p2 = PriceLevel::from_decimal(dec!(100.00));
        assert!(p1 < p2);
    }
}
