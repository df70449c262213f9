//! Matching engine.
//!
//! One serializer per bond: every submission, cancel, and snapshot for a
//! bond runs under that bond's async mutex, so matching is single-threaded
//! within an instrument while instruments proceed in parallel. A submission
//! is planned against the book, committed through the persistence adapter
//! as one transaction, and only then applied to the book and ledger and
//! handed to the broadcaster. A failed commit therefore leaves no trace
//! anywhere.

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::book::OrderBook;
use super::error::TradingError;
use super::ledger::HoldingsLedger;
use super::types::{BookSnapshot, MatchPlan, RestingOrder};
use crate::db::store::{StoreTx, TradingStore};
use crate::models::{Order, OrderSide, OrderStatus, OrderType, Trade};
use crate::services::registry::Registry;
use crate::utils::mock_tx_hash;
use crate::websocket::broadcaster::{instrument_room, user_room, Broadcaster};
use crate::websocket::events::{OrderUpdatePayload, OutboundEvent};

/// Bounded retries for ledger-row write conflicts before surfacing.
const COMMIT_ATTEMPTS: u32 = 3;

/// Result of an accepted submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub order: Order,
    pub trades: Vec<Trade>,
}

/// Pending fill-and-status write for a resting maker order.
struct MakerUpdate {
    order_id: Uuid,
    user_id: Uuid,
    price: Decimal,
    quantity: Decimal,
    filled_quantity: Decimal,
    status: OrderStatus,
}

/// Absolute holdings row write derived from a submission's fills.
enum HoldingWrite {
    Set {
        user_id: Uuid,
        quantity: Decimal,
    },
    Delete {
        user_id: Uuid,
    },
}

pub struct MatchingEngine {
    store: Arc<dyn TradingStore>,
    registry: Arc<Registry>,
    ledger: Arc<HoldingsLedger>,
    broadcaster: Arc<Broadcaster>,
    books: DashMap<Uuid, Arc<Mutex<OrderBook>>>,
    /// Resting order id -> bond id, for cancellation routing.
    order_locator: DashMap<Uuid, Uuid>,
    broadcast_depth: usize,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<dyn TradingStore>,
        registry: Arc<Registry>,
        ledger: Arc<HoldingsLedger>,
        broadcaster: Arc<Broadcaster>,
        broadcast_depth: usize,
    ) -> Self {
        Self {
            store,
            registry,
            ledger,
            broadcaster,
            books: DashMap::new(),
            order_locator: DashMap::new(),
            broadcast_depth,
        }
    }

    pub fn ledger(&self) -> &Arc<HoldingsLedger> {
        &self.ledger
    }

    fn book(&self, bond_id: Uuid) -> Arc<Mutex<OrderBook>> {
        self.books
            .entry(bond_id)
            .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new(bond_id))))
            .clone()
    }

    /// Rebuild books and ledger from the store. Open and partial orders are
    /// re-inserted in creation order, which re-derives their time priority
    /// and leaves each book's insertion counter past the maximum observed.
    pub async fn recover(&self) -> Result<usize, TradingError> {
        let holdings = self.store.load_holdings().await?;
        self.ledger.load(holdings);

        let orders = self.store.load_resting_orders().await?;
        let mut count = 0;
        for order in orders {
            let price = match order.price {
                Some(price) => price,
                None => {
                    tracing::warn!("Skipping resting order {} without a price", order.id);
                    continue;
                }
            };
            let book = self.book(order.bond_id);
            let mut book = book.lock().await;
            book.insert(
                order.side,
                RestingOrder {
                    id: order.id,
                    user_id: order.user_id,
                    price,
                    quantity: order.quantity,
                    filled_quantity: order.filled_quantity,
                    seq: 0,
                },
            );
            self.order_locator.insert(order.id, order.bond_id);
            count += 1;
        }
        Ok(count)
    }

    /// Submit an order: validate, match against the opposite side, commit
    /// the whole effect atomically, then broadcast.
    pub async fn submit(
        &self,
        user_id: Uuid,
        bond_id: Uuid,
        side: OrderSide,
        order_type: OrderType,
        price: Option<Decimal>,
        quantity: Decimal,
    ) -> Result<SubmitOutcome, TradingError> {
        let bond = self.registry.tradable_bond(bond_id).await?;
        self.registry.ensure_user(user_id).await?;

        if quantity <= Decimal::ZERO {
            return Err(TradingError::BadQuantity(format!(
                "quantity must be positive, got {}",
                quantity
            )));
        }
        if !(quantity % bond.min_unit).is_zero() {
            return Err(TradingError::BadQuantity(format!(
                "quantity {} is not a multiple of the minimum unit {}",
                quantity, bond.min_unit
            )));
        }

        let limit_price = match order_type {
            OrderType::Limit => match price {
                Some(price) if price > Decimal::ZERO => Some(price),
                Some(price) => {
                    return Err(TradingError::BadPrice(format!(
                        "limit price must be positive, got {}",
                        price
                    )))
                }
                None => {
                    return Err(TradingError::BadPrice(
                        "limit orders require a price".to_string(),
                    ))
                }
            },
            // Market orders cross the book at maker prices.
            OrderType::Market => None,
        };

        let book = self.book(bond_id);
        let mut book = book.lock().await;

        // Sell-side check happens under the serializer so concurrent fills
        // on this bond cannot invalidate it. Units are debited as fills
        // occur, not reserved here.
        if side == OrderSide::Sell && self.ledger.get(user_id, bond_id) < quantity {
            return Err(TradingError::InsufficientHoldings);
        }

        let plan = book.plan_match(user_id, side, limit_price, quantity, |seller| {
            self.ledger.get(seller, bond_id)
        });

        let filled = plan.filled_quantity();
        let residual = quantity - filled;
        let rests = order_type == OrderType::Limit && residual > Decimal::ZERO;

        let status = match order_type {
            OrderType::Limit => {
                if residual.is_zero() {
                    OrderStatus::Filled
                } else if filled > Decimal::ZERO {
                    OrderStatus::Partial
                } else {
                    OrderStatus::Open
                }
            }
            // Market residual is discarded: filled if anything matched,
            // otherwise cancelled.
            OrderType::Market => {
                if filled > Decimal::ZERO {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Cancelled
                }
            }
        };

        let now = Utc::now();
        let taker = Order {
            id: Uuid::new_v4(),
            user_id,
            bond_id,
            side,
            order_type,
            price: limit_price,
            quantity,
            filled_quantity: filled,
            status,
            tx_hash: Some(mock_tx_hash()),
            created_at: now,
            updated_at: now,
        };

        let trades: Vec<Trade> = plan
            .fills
            .iter()
            .map(|fill| {
                let (buy_order_id, sell_order_id) = match side {
                    OrderSide::Buy => (taker.id, fill.maker_order_id),
                    OrderSide::Sell => (fill.maker_order_id, taker.id),
                };
                Trade {
                    id: Uuid::new_v4(),
                    buy_order_id,
                    sell_order_id,
                    bond_id,
                    price: fill.price,
                    quantity: fill.quantity,
                    tx_hash: Some(mock_tx_hash()),
                    executed_at: now,
                }
            })
            .collect();

        let maker_updates = self.build_maker_updates(&book, &plan);
        let holding_writes = self.build_holding_writes(bond_id, side, user_id, &plan);

        self.persist_submission(&taker, &trades, &maker_updates, &holding_writes)
            .await?;

        // Commit succeeded; apply to the in-memory state.
        book.apply_fills(side, &plan.fills);
        for order_id in &plan.exhausted {
            book.remove(order_id);
            self.order_locator.remove(order_id);
        }
        for fill in &plan.fills {
            if !book.contains(&fill.maker_order_id) {
                self.order_locator.remove(&fill.maker_order_id);
            }
        }
        if rests {
            book.insert(
                side,
                RestingOrder {
                    id: taker.id,
                    user_id,
                    // rests is only true for limit orders
                    price: limit_price.unwrap_or_default(),
                    quantity,
                    filled_quantity: filled,
                    seq: 0,
                },
            );
            self.order_locator.insert(taker.id, bond_id);
        }
        for fill in &plan.fills {
            let (seller, buyer) = match side {
                OrderSide::Buy => (fill.maker_user_id, user_id),
                OrderSide::Sell => (user_id, fill.maker_user_id),
            };
            if let Err(e) = self.ledger.transfer(seller, buyer, bond_id, fill.quantity) {
                // Fills are capped at seller availability at plan time, so
                // this cannot fire while the serializer invariant holds.
                let err = TradingError::InternalError(format!(
                    "ledger transfer failed after commit (seller={}, buyer={}, bond={}): {}",
                    seller, buyer, bond_id, e
                ));
                tracing::error!("{}", err);
            }
        }

        if status == OrderStatus::Cancelled {
            tracing::info!(
                "Market order {} cancelled unfilled on bond {}",
                taker.id,
                bond_id
            );
        }

        let batch = self.build_event_batch(&book, &taker, &trades, &maker_updates);
        self.broadcaster.publish_batch(batch);

        tracing::info!(
            "Order {} processed: bond={}, side={}, filled={}, status={}",
            taker.id,
            bond_id,
            side,
            filled,
            status
        );

        Ok(SubmitOutcome {
            order: taker,
            trades,
        })
    }

    /// Cancel a resting order. Succeeds only if the order rests in a book,
    /// belongs to the requesting user, and is not terminal; every other
    /// case returns `false` without error.
    pub async fn cancel(&self, order_id: Uuid, user_id: Uuid) -> Result<bool, TradingError> {
        let bond_id = match self.order_locator.get(&order_id) {
            Some(bond_id) => *bond_id,
            None => {
                // Unknown or terminal; either way there is nothing to pull
                // from a book.
                tracing::debug!(
                    "Cancel of {} rejected: {}",
                    order_id,
                    TradingError::NotCancellable
                );
                return Ok(false);
            }
        };

        let book = self.book(bond_id);
        let mut book = book.lock().await;

        let resting = match book.get(&order_id) {
            Some(resting) => resting.clone(),
            None => return Ok(false),
        };
        if resting.user_id != user_id {
            tracing::debug!(
                "Cancel of {} rejected for user {}: {}",
                order_id,
                user_id,
                TradingError::NotOwner
            );
            return Ok(false);
        }
        let side = match book.side_of(&order_id) {
            Some(side) => side,
            None => return Ok(false),
        };

        self.persist_cancel(order_id, resting.filled_quantity).await?;

        book.remove(&order_id);
        self.order_locator.remove(&order_id);

        let batch = vec![
            (
                user_room(user_id),
                OutboundEvent::OrderUpdate {
                    data: OrderUpdatePayload {
                        order_id,
                        bond_id,
                        side,
                        order_type: OrderType::Limit,
                        price: Some(resting.price),
                        quantity: resting.quantity,
                        filled_quantity: resting.filled_quantity,
                        remaining_quantity: Decimal::ZERO,
                        status: OrderStatus::Cancelled,
                        reason: None,
                    },
                },
            ),
            (
                instrument_room(bond_id),
                OutboundEvent::OrderbookUpdate {
                    data: book.snapshot(self.broadcast_depth),
                },
            ),
        ];
        self.broadcaster.publish_batch(batch);

        tracing::info!("Order {} cancelled by user {}", order_id, user_id);
        Ok(true)
    }

    /// Aggregated depth snapshot of a bond's book.
    pub async fn snapshot(&self, bond_id: Uuid, depth: usize) -> Result<BookSnapshot, TradingError> {
        self.registry.bond(bond_id).await?;
        let book = self.book(bond_id);
        let book = book.lock().await;
        Ok(book.snapshot(depth))
    }

    fn build_maker_updates(&self, book: &OrderBook, plan: &MatchPlan) -> Vec<MakerUpdate> {
        let exhausted: HashSet<Uuid> = plan.exhausted.iter().copied().collect();
        let mut updates = Vec::new();

        for fill in &plan.fills {
            let maker = match book.get(&fill.maker_order_id) {
                Some(maker) => maker,
                None => continue,
            };
            let filled_quantity = maker.filled_quantity + fill.quantity;
            let status = if exhausted.contains(&fill.maker_order_id) {
                OrderStatus::Cancelled
            } else if filled_quantity >= maker.quantity {
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            };
            updates.push(MakerUpdate {
                order_id: maker.id,
                user_id: maker.user_id,
                price: maker.price,
                quantity: maker.quantity,
                filled_quantity,
                status,
            });
        }

        for order_id in &plan.exhausted {
            if plan.fills.iter().any(|f| f.maker_order_id == *order_id) {
                continue;
            }
            let maker = match book.get(order_id) {
                Some(maker) => maker,
                None => continue,
            };
            updates.push(MakerUpdate {
                order_id: maker.id,
                user_id: maker.user_id,
                price: maker.price,
                quantity: maker.quantity,
                filled_quantity: maker.filled_quantity,
                status: OrderStatus::Cancelled,
            });
        }

        updates
    }

    fn build_holding_writes(
        &self,
        bond_id: Uuid,
        taker_side: OrderSide,
        taker_user_id: Uuid,
        plan: &MatchPlan,
    ) -> Vec<HoldingWrite> {
        let mut deltas: HashMap<Uuid, Decimal> = HashMap::new();
        for fill in &plan.fills {
            let (seller, buyer) = match taker_side {
                OrderSide::Buy => (fill.maker_user_id, taker_user_id),
                OrderSide::Sell => (taker_user_id, fill.maker_user_id),
            };
            *deltas.entry(seller).or_insert(Decimal::ZERO) -= fill.quantity;
            *deltas.entry(buyer).or_insert(Decimal::ZERO) += fill.quantity;
        }

        deltas
            .into_iter()
            .filter(|(_, delta)| !delta.is_zero())
            .map(|(user_id, delta)| {
                let balance = self.ledger.get(user_id, bond_id) + delta;
                if balance <= Decimal::ZERO {
                    HoldingWrite::Delete { user_id }
                } else {
                    HoldingWrite::Set {
                        user_id,
                        quantity: balance,
                    }
                }
            })
            .collect()
    }

    async fn persist_submission(
        &self,
        taker: &Order,
        trades: &[Trade],
        maker_updates: &[MakerUpdate],
        holding_writes: &[HoldingWrite],
    ) -> Result<(), TradingError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.store.begin().await?;
            let written = Self::write_submission(
                &mut tx,
                taker,
                trades,
                maker_updates,
                holding_writes,
            )
            .await;
            let result = match written {
                Ok(()) => tx.commit().await.map_err(TradingError::from),
                Err(e) => {
                    let _ = tx.rollback().await;
                    Err(e)
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(TradingError::Conflict) if attempt < COMMIT_ATTEMPTS => {
                    tracing::warn!(
                        "Write conflict persisting order {} (attempt {}), retrying",
                        taker.id,
                        attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_submission(
        tx: &mut Box<dyn StoreTx>,
        taker: &Order,
        trades: &[Trade],
        maker_updates: &[MakerUpdate],
        holding_writes: &[HoldingWrite],
    ) -> Result<(), TradingError> {
        tx.insert_order(taker).await?;
        for update in maker_updates {
            tx.update_order_fill_and_status(update.order_id, update.filled_quantity, update.status)
                .await?;
        }
        for trade in trades {
            tx.insert_trade(trade).await?;
        }
        for write in holding_writes {
            match write {
                HoldingWrite::Set { user_id, quantity } => {
                    tx.upsert_holding(*user_id, taker.bond_id, *quantity).await?
                }
                HoldingWrite::Delete { user_id } => {
                    tx.delete_holding(*user_id, taker.bond_id).await?
                }
            }
        }
        Ok(())
    }

    async fn persist_cancel(
        &self,
        order_id: Uuid,
        filled_quantity: Decimal,
    ) -> Result<(), TradingError> {
        let mut tx = self.store.begin().await?;
        let written = tx
            .update_order_fill_and_status(order_id, filled_quantity, OrderStatus::Cancelled)
            .await;
        match written {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e.into())
            }
        }
    }

    fn build_event_batch(
        &self,
        book: &OrderBook,
        taker: &Order,
        trades: &[Trade],
        maker_updates: &[MakerUpdate],
    ) -> Vec<(String, OutboundEvent)> {
        let room = instrument_room(taker.bond_id);
        let mut batch = Vec::new();

        for trade in trades {
            batch.push((
                room.clone(),
                OutboundEvent::Trade {
                    data: trade.into(),
                },
            ));
        }
        batch.push((
            room,
            OutboundEvent::OrderbookUpdate {
                data: book.snapshot(self.broadcast_depth),
            },
        ));

        let taker_reason = if taker.order_type == OrderType::Market
            && taker.status == OrderStatus::Cancelled
        {
            Some("unfilled_market".to_string())
        } else {
            None
        };
        batch.push((
            user_room(taker.user_id),
            OutboundEvent::OrderUpdate {
                data: OrderUpdatePayload {
                    order_id: taker.id,
                    bond_id: taker.bond_id,
                    side: taker.side,
                    order_type: taker.order_type,
                    price: taker.price,
                    quantity: taker.quantity,
                    filled_quantity: taker.filled_quantity,
                    remaining_quantity: match taker.status {
                        OrderStatus::Open | OrderStatus::Partial => taker.remaining(),
                        _ => Decimal::ZERO,
                    },
                    status: taker.status,
                    reason: taker_reason,
                },
            },
        ));

        for update in maker_updates {
            let reason = if update.status == OrderStatus::Cancelled {
                Some("holdings_exhausted".to_string())
            } else {
                None
            };
            batch.push((
                user_room(update.user_id),
                OutboundEvent::OrderUpdate {
                    data: OrderUpdatePayload {
                        order_id: update.order_id,
                        bond_id: taker.bond_id,
                        side: taker.side.opposite(),
                        order_type: OrderType::Limit,
                        price: Some(update.price),
                        quantity: update.quantity,
                        filled_quantity: update.filled_quantity,
                        remaining_quantity: if update.status == OrderStatus::Partial {
                            update.quantity - update.filled_quantity
                        } else {
                            Decimal::ZERO
                        },
                        status: update.status,
                        reason,
                    },
                },
            ));
        }

        if !trades.is_empty() {
            let mut affected: HashSet<Uuid> = HashSet::new();
            affected.insert(taker.user_id);
            for update in maker_updates {
                affected.insert(update.user_id);
            }
            for user_id in affected {
                batch.push((user_room(user_id), OutboundEvent::PortfolioUpdate));
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::{Bond, BondStatus, User};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        engine: Arc<MatchingEngine>,
        store: MemoryStore,
        broadcaster: Arc<Broadcaster>,
        bond_id: Uuid,
    }

    fn test_bond(min_unit: Decimal) -> Bond {
        Bond {
            id: Uuid::new_v4(),
            name: "Treasury 2030".to_string(),
            isin: "IN0020300001".to_string(),
            coupon_rate: 7.25,
            maturity_date: Utc::now() + chrono::Duration::days(1800),
            face_value: dec!(1000),
            min_unit,
            status: BondStatus::Active,
        }
    }

    async fn harness() -> Harness {
        harness_with_min_unit(dec!(1)).await
    }

    async fn harness_with_min_unit(min_unit: Decimal) -> Harness {
        let store = MemoryStore::new();
        let bond = test_bond(min_unit);
        let bond_id = bond.id;
        store.add_bond(bond);

        let arc_store: Arc<dyn TradingStore> = Arc::new(store.clone());
        let registry = Arc::new(Registry::new(arc_store.clone(), Duration::from_secs(5)));
        let ledger = Arc::new(HoldingsLedger::new());
        let broadcaster = Arc::new(Broadcaster::new(64));
        let engine = Arc::new(MatchingEngine::new(
            arc_store,
            registry,
            ledger,
            broadcaster.clone(),
            10,
        ));

        Harness {
            engine,
            store,
            broadcaster,
            bond_id,
        }
    }

    /// Fresh user holding `quantity` units of the bond, mirrored in both
    /// the store and the ledger.
    fn user_holding(h: &Harness, quantity: Decimal) -> Uuid {
        let user = User {
            id: Uuid::new_v4(),
            name: "trader".to_string(),
            wallet_address: None,
            created_at: Utc::now(),
        };
        let id = user.id;
        h.store.add_user(user);
        if quantity > Decimal::ZERO {
            h.store.set_holding(id, h.bond_id, quantity);
            h.engine.ledger().credit(id, h.bond_id, quantity);
        }
        id
    }

    fn funded_user(h: &Harness) -> Uuid {
        user_holding(h, dec!(1000))
    }

    async fn limit(
        h: &Harness,
        user: Uuid,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> SubmitOutcome {
        h.engine
            .submit(user, h.bond_id, side, OrderType::Limit, Some(price), quantity)
            .await
            .unwrap()
    }

    fn subscribe_room(h: &Harness, room: String) -> mpsc::Receiver<String> {
        let (conn, rx) = h.broadcaster.register(None);
        h.broadcaster.join_room(conn, &room);
        rx
    }

    fn frame_types(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            types.push(value["type"].as_str().unwrap().to_string());
        }
        types
    }

    #[tokio::test]
    async fn test_simple_cross() {
        let h = harness().await;
        let a = funded_user(&h);
        let b = funded_user(&h);

        let sell = limit(&h, a, OrderSide::Sell, dec!(99.50), dec!(100)).await;
        let buy = limit(&h, b, OrderSide::Buy, dec!(99.50), dec!(100)).await;

        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].price, dec!(99.50));
        assert_eq!(buy.trades[0].quantity, dec!(100));
        assert_eq!(buy.order.status, OrderStatus::Filled);
        assert_eq!(buy.order.filled_quantity, dec!(100));

        let maker = h.store.fetch_order(sell.order.id).await.unwrap().unwrap();
        assert_eq!(maker.status, OrderStatus::Filled);
        assert_eq!(maker.filled_quantity, dec!(100));

        assert_eq!(h.engine.ledger().get(a, h.bond_id), dec!(900));
        assert_eq!(h.engine.ledger().get(b, h.bond_id), dec!(1100));
        // conservation
        assert_eq!(h.engine.ledger().total_for_bond(h.bond_id), dec!(2000));

        let snapshot = h.engine.snapshot(h.bond_id, 10).await.unwrap();
        assert!(snapshot.bids.is_empty());
        assert!(snapshot.asks.is_empty());
    }

    #[tokio::test]
    async fn test_partial_fill_residual_rests() {
        let h = harness().await;
        let a = funded_user(&h);
        let b = funded_user(&h);

        limit(&h, a, OrderSide::Sell, dec!(99.00), dec!(50)).await;
        let buy = limit(&h, b, OrderSide::Buy, dec!(100.00), dec!(120)).await;

        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].price, dec!(99.00));
        assert_eq!(buy.trades[0].quantity, dec!(50));
        assert_eq!(buy.order.status, OrderStatus::Partial);
        assert_eq!(buy.order.filled_quantity, dec!(50));

        let snapshot = h.engine.snapshot(h.bond_id, 10).await.unwrap();
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.bids[0].price, dec!(100.00));
        assert_eq!(snapshot.bids[0].quantity, dec!(70));
        assert!(snapshot.asks.is_empty());
    }

    #[tokio::test]
    async fn test_price_time_priority() {
        let h = harness().await;
        let a1 = funded_user(&h);
        let a2 = funded_user(&h);
        let b = funded_user(&h);

        let first = limit(&h, a1, OrderSide::Sell, dec!(100.00), dec!(30)).await;
        let second = limit(&h, a2, OrderSide::Sell, dec!(100.00), dec!(30)).await;
        let buy = limit(&h, b, OrderSide::Buy, dec!(100.00), dec!(40)).await;

        assert_eq!(buy.trades.len(), 2);
        assert_eq!(buy.trades[0].sell_order_id, first.order.id);
        assert_eq!(buy.trades[0].quantity, dec!(30));
        assert_eq!(buy.trades[1].sell_order_id, second.order.id);
        assert_eq!(buy.trades[1].quantity, dec!(10));

        let second_row = h.store.fetch_order(second.order.id).await.unwrap().unwrap();
        assert_eq!(second_row.status, OrderStatus::Partial);
        assert_eq!(second_row.filled_quantity, dec!(10));

        let snapshot = h.engine.snapshot(h.bond_id, 10).await.unwrap();
        assert_eq!(snapshot.asks[0].quantity, dec!(20));
    }

    #[tokio::test]
    async fn test_taker_gets_price_improvement() {
        let h = harness().await;
        let a = funded_user(&h);
        let b = funded_user(&h);

        limit(&h, a, OrderSide::Sell, dec!(98.00), dec!(50)).await;
        let buy = limit(&h, b, OrderSide::Buy, dec!(100.00), dec!(50)).await;

        assert_eq!(buy.trades.len(), 1);
        // maker's price, not the taker's limit
        assert_eq!(buy.trades[0].price, dec!(98.00));
    }

    #[tokio::test]
    async fn test_self_trade_is_skipped() {
        let h = harness().await;
        let u = funded_user(&h);

        limit(&h, u, OrderSide::Sell, dec!(100.00), dec!(10)).await;
        let buy = limit(&h, u, OrderSide::Buy, dec!(100.00), dec!(10)).await;

        assert!(buy.trades.is_empty());
        assert_eq!(buy.order.status, OrderStatus::Open);

        let snapshot = h.engine.snapshot(h.bond_id, 10).await.unwrap();
        assert_eq!(snapshot.bids[0].price, dec!(100.00));
        assert_eq!(snapshot.bids[0].quantity, dec!(10));
        assert_eq!(snapshot.asks[0].price, dec!(100.00));
        assert_eq!(snapshot.asks[0].quantity, dec!(10));
        assert_eq!(h.engine.ledger().get(u, h.bond_id), dec!(1000));
    }

    #[tokio::test]
    async fn test_insufficient_holdings_rejects_atomically() {
        let h = harness().await;
        let u = user_holding(&h, dec!(5));
        let mut room = subscribe_room(&h, instrument_room(h.bond_id));

        let err = h
            .engine
            .submit(
                u,
                h.bond_id,
                OrderSide::Sell,
                OrderType::Limit,
                Some(dec!(99.00)),
                dec!(10),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TradingError::InsufficientHoldings));
        assert_eq!(h.store.order_count(), 0);
        assert_eq!(h.store.trade_count(), 0);
        assert_eq!(h.engine.ledger().get(u, h.bond_id), dec!(5));
        assert!(frame_types(&mut room).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_partial() {
        let h = harness().await;
        let a = funded_user(&h);
        let b = funded_user(&h);

        let buy = limit(&h, b, OrderSide::Buy, dec!(99.00), dec!(100)).await;
        limit(&h, a, OrderSide::Sell, dec!(99.00), dec!(40)).await;

        let cancelled = h.engine.cancel(buy.order.id, b).await.unwrap();
        assert!(cancelled);

        let row = h.store.fetch_order(buy.order.id).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Cancelled);
        assert_eq!(row.filled_quantity, dec!(40));

        let snapshot = h.engine.snapshot(h.bond_id, 10).await.unwrap();
        assert!(snapshot.bids.is_empty());

        // cancelling a terminal order is a no-op returning false
        let again = h.engine.cancel(buy.order.id, b).await.unwrap();
        assert!(!again);
        let row_after = h.store.fetch_order(buy.order.id).await.unwrap().unwrap();
        assert_eq!(row_after.status, OrderStatus::Cancelled);
        assert_eq!(row_after.filled_quantity, dec!(40));
    }

    #[tokio::test]
    async fn test_cancel_requires_ownership() {
        let h = harness().await;
        let a = funded_user(&h);
        let other = funded_user(&h);

        let sell = limit(&h, a, OrderSide::Sell, dec!(101.00), dec!(10)).await;
        let cancelled = h.engine.cancel(sell.order.id, other).await.unwrap();
        assert!(!cancelled);

        let snapshot = h.engine.snapshot(h.bond_id, 10).await.unwrap();
        assert_eq!(snapshot.asks[0].quantity, dec!(10));
    }

    #[tokio::test]
    async fn test_market_buy_discards_residual() {
        let h = harness().await;
        let a = funded_user(&h);
        let b = funded_user(&h);

        limit(&h, a, OrderSide::Sell, dec!(99.00), dec!(50)).await;
        let buy = h
            .engine
            .submit(b, h.bond_id, OrderSide::Buy, OrderType::Market, None, dec!(80))
            .await
            .unwrap();

        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].quantity, dec!(50));
        assert_eq!(buy.order.status, OrderStatus::Filled);
        assert_eq!(buy.order.filled_quantity, dec!(50));

        // residual is discarded, nothing rests
        let snapshot = h.engine.snapshot(h.bond_id, 10).await.unwrap();
        assert!(snapshot.bids.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_market_order_is_cancelled() {
        let h = harness().await;
        let b = funded_user(&h);

        let buy = h
            .engine
            .submit(b, h.bond_id, OrderSide::Buy, OrderType::Market, None, dec!(10))
            .await
            .unwrap();

        assert!(buy.trades.is_empty());
        assert_eq!(buy.order.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_validation_preconditions() {
        let h = harness_with_min_unit(dec!(5)).await;
        let u = funded_user(&h);

        let unknown_bond = h
            .engine
            .submit(
                u,
                Uuid::new_v4(),
                OrderSide::Buy,
                OrderType::Limit,
                Some(dec!(99)),
                dec!(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(unknown_bond, TradingError::UnknownInstrument(_)));

        let unknown_user = h
            .engine
            .submit(
                Uuid::new_v4(),
                h.bond_id,
                OrderSide::Buy,
                OrderType::Limit,
                Some(dec!(99)),
                dec!(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(unknown_user, TradingError::UnknownUser(_)));

        let bad_qty = h
            .engine
            .submit(
                u,
                h.bond_id,
                OrderSide::Buy,
                OrderType::Limit,
                Some(dec!(99)),
                dec!(7),
            )
            .await
            .unwrap_err();
        assert!(matches!(bad_qty, TradingError::BadQuantity(_)));

        let zero_qty = h
            .engine
            .submit(
                u,
                h.bond_id,
                OrderSide::Buy,
                OrderType::Limit,
                Some(dec!(99)),
                dec!(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(zero_qty, TradingError::BadQuantity(_)));

        let missing_price = h
            .engine
            .submit(u, h.bond_id, OrderSide::Buy, OrderType::Limit, None, dec!(5))
            .await
            .unwrap_err();
        assert!(matches!(missing_price, TradingError::BadPrice(_)));

        let zero_price = h
            .engine
            .submit(
                u,
                h.bond_id,
                OrderSide::Buy,
                OrderType::Limit,
                Some(dec!(0)),
                dec!(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(zero_price, TradingError::BadPrice(_)));
    }

    #[tokio::test]
    async fn test_draft_bond_rejects_orders() {
        let h = harness().await;
        let u = funded_user(&h);
        let mut draft = test_bond(dec!(1));
        draft.status = BondStatus::Draft;
        let draft_id = draft.id;
        h.store.add_bond(draft);

        let err = h
            .engine
            .submit(
                u,
                draft_id,
                OrderSide::Buy,
                OrderType::Limit,
                Some(dec!(99)),
                dec!(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::InstrumentNotTradable(_)));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_trace() {
        let h = harness().await;
        let a = funded_user(&h);
        let b = funded_user(&h);
        limit(&h, a, OrderSide::Sell, dec!(99.00), dec!(50)).await;

        let mut room = subscribe_room(&h, instrument_room(h.bond_id));
        h.store.set_fail_commits(true);

        let err = h
            .engine
            .submit(
                b,
                h.bond_id,
                OrderSide::Buy,
                OrderType::Limit,
                Some(dec!(99.00)),
                dec!(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::PersistenceFailure(_)));

        // book, ledger, store, and event stream are all untouched
        assert_eq!(h.store.order_count(), 1);
        assert_eq!(h.store.trade_count(), 0);
        assert_eq!(h.engine.ledger().get(a, h.bond_id), dec!(1000));
        assert_eq!(h.engine.ledger().get(b, h.bond_id), dec!(1000));
        let snapshot = h.engine.snapshot(h.bond_id, 10).await.unwrap();
        assert_eq!(snapshot.asks[0].quantity, dec!(50));
        assert!(frame_types(&mut room).is_empty());

        // and the same submission goes through once commits succeed
        h.store.set_fail_commits(false);
        let buy = limit(&h, b, OrderSide::Buy, dec!(99.00), dec!(50)).await;
        assert_eq!(buy.trades.len(), 1);
    }

    #[tokio::test]
    async fn test_overcommitted_seller_residual_is_cancelled() {
        let h = harness().await;
        let seller = user_holding(&h, dec!(10));
        let buyer = funded_user(&h);

        // both sells pass the submission-time check; only one can fill
        let first = limit(&h, seller, OrderSide::Sell, dec!(99.00), dec!(10)).await;
        let second = limit(&h, seller, OrderSide::Sell, dec!(100.00), dec!(10)).await;

        let buy = limit(&h, buyer, OrderSide::Buy, dec!(100.00), dec!(20)).await;

        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].sell_order_id, first.order.id);
        assert_eq!(buy.trades[0].quantity, dec!(10));
        assert_eq!(buy.order.status, OrderStatus::Partial);

        let second_row = h.store.fetch_order(second.order.id).await.unwrap().unwrap();
        assert_eq!(second_row.status, OrderStatus::Cancelled);

        assert_eq!(h.engine.ledger().get(seller, h.bond_id), Decimal::ZERO);
        assert!(h.engine.ledger().balances_for_user(seller).is_empty());
        assert_eq!(h.engine.ledger().get(buyer, h.bond_id), dec!(1010));
        let snapshot = h.engine.snapshot(h.bond_id, 10).await.unwrap();
        assert!(snapshot.asks.is_empty());
    }

    #[tokio::test]
    async fn test_fill_arithmetic_matches_trades() {
        let h = harness().await;
        let a = funded_user(&h);
        let b = funded_user(&h);
        let c = funded_user(&h);

        limit(&h, a, OrderSide::Sell, dec!(99.00), dec!(30)).await;
        limit(&h, b, OrderSide::Sell, dec!(99.50), dec!(30)).await;
        let buy = limit(&h, c, OrderSide::Buy, dec!(100.00), dec!(45)).await;

        let total: Decimal = buy.trades.iter().map(|t| t.quantity).sum();
        assert_eq!(buy.order.filled_quantity, total);

        for trade in &buy.trades {
            let maker = h
                .store
                .fetch_order(trade.sell_order_id)
                .await
                .unwrap()
                .unwrap();
            assert!(maker.filled_quantity <= maker.quantity);
        }
        // cross requirement: buy limit >= trade price >= sell limit
        for trade in &buy.trades {
            assert!(trade.price <= dec!(100.00));
            let maker = h
                .store
                .fetch_order(trade.sell_order_id)
                .await
                .unwrap()
                .unwrap();
            assert!(trade.price >= maker.price.unwrap());
        }
    }

    #[tokio::test]
    async fn test_event_order_trades_before_orderbook_update() {
        let h = harness().await;
        let a = funded_user(&h);
        let b = funded_user(&h);

        limit(&h, a, OrderSide::Sell, dec!(99.00), dec!(50)).await;
        let mut room = subscribe_room(&h, instrument_room(h.bond_id));
        let mut user_rx = subscribe_room(&h, user_room(b));

        limit(&h, b, OrderSide::Buy, dec!(99.00), dec!(50)).await;

        let types = frame_types(&mut room);
        assert_eq!(types, vec!["trade", "orderbook_update"]);

        let user_types = frame_types(&mut user_rx);
        assert!(user_types.contains(&"order_update".to_string()));
        assert!(user_types.contains(&"portfolio_update".to_string()));
    }

    #[tokio::test]
    async fn test_recovery_rebuilds_books_and_priority() {
        let h = harness().await;
        let a1 = funded_user(&h);
        let a2 = funded_user(&h);

        let first = limit(&h, a1, OrderSide::Sell, dec!(100.00), dec!(30)).await;
        limit(&h, a2, OrderSide::Sell, dec!(100.00), dec!(30)).await;

        // a second engine instance over the same store, as after a restart
        let arc_store: Arc<dyn TradingStore> = Arc::new(h.store.clone());
        let registry = Arc::new(Registry::new(arc_store.clone(), Duration::from_secs(5)));
        let ledger = Arc::new(HoldingsLedger::new());
        let broadcaster = Arc::new(Broadcaster::new(64));
        let recovered = Arc::new(MatchingEngine::new(
            arc_store,
            registry,
            ledger,
            broadcaster,
            10,
        ));
        let count = recovered.recover().await.unwrap();
        assert_eq!(count, 2);

        let snapshot = recovered.snapshot(h.bond_id, 10).await.unwrap();
        assert_eq!(snapshot.asks.len(), 1);
        assert_eq!(snapshot.asks[0].quantity, dec!(60));
        assert_eq!(snapshot.asks[0].orders_count, 2);

        // time priority survives the rebuild
        let b = {
            let user = User {
                id: Uuid::new_v4(),
                name: "buyer".to_string(),
                wallet_address: None,
                created_at: Utc::now(),
            };
            let id = user.id;
            h.store.add_user(user);
            h.store.set_holding(id, h.bond_id, dec!(1000));
            recovered.ledger().credit(id, h.bond_id, dec!(1000));
            id
        };
        let buy = recovered
            .submit(
                b,
                h.bond_id,
                OrderSide::Buy,
                OrderType::Limit,
                Some(dec!(100.00)),
                dec!(10),
            )
            .await
            .unwrap();
        assert_eq!(buy.trades[0].sell_order_id, first.order.id);
    }

    #[tokio::test]
    async fn test_conservation_across_mixed_activity() {
        let h = harness().await;
        let a = funded_user(&h);
        let b = funded_user(&h);
        let c = funded_user(&h);

        limit(&h, a, OrderSide::Sell, dec!(99.00), dec!(100)).await;
        limit(&h, b, OrderSide::Buy, dec!(99.00), dec!(60)).await;
        limit(&h, c, OrderSide::Buy, dec!(99.50), dec!(200)).await;
        limit(&h, a, OrderSide::Sell, dec!(99.50), dec!(50)).await;
        let _ = h
            .engine
            .submit(b, h.bond_id, OrderSide::Sell, OrderType::Market, None, dec!(30))
            .await
            .unwrap();

        assert_eq!(h.engine.ledger().total_for_bond(h.bond_id), dec!(3000));
    }
}
