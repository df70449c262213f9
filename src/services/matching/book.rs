//! Per-bond order book.
//!
//! Two price-indexed sides, each a `BTreeMap` from price level to a FIFO
//! queue of resting orders: bids are consumed highest-price-first, asks
//! lowest-price-first, ties broken by the book's insertion counter.
//!
//! Matching is split in two phases. `plan_match` walks the opposite side and
//! returns the fills that *would* happen without touching the book;
//! `apply_fills` mutates it once the submission has been committed. The
//! engine holds the bond's serializer across both phases, so the
//! intermediate state is never observable.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use super::types::{BookSnapshot, DepthLevel, Fill, MatchPlan, PriceLevel, RestingOrder};
use crate::models::OrderSide;

pub struct OrderBook {
    bond_id: Uuid,

    /// Bids sorted by price ascending in the map; consumed in reverse.
    bids: BTreeMap<PriceLevel, VecDeque<RestingOrder>>,

    /// Asks sorted by price ascending.
    asks: BTreeMap<PriceLevel, VecDeque<RestingOrder>>,

    /// Order ID to (side, price_level) mapping for O(1) cancellation
    order_index: HashMap<Uuid, (OrderSide, PriceLevel)>,

    /// Next insertion sequence number.
    next_seq: u64,
}

impl OrderBook {
    pub fn new(bond_id: Uuid) -> Self {
        Self {
            bond_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            order_index: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn bond_id(&self) -> Uuid {
        self.bond_id
    }

    pub fn order_count(&self) -> usize {
        self.order_index.len()
    }

    pub fn contains(&self, order_id: &Uuid) -> bool {
        self.order_index.contains_key(order_id)
    }

    pub fn get(&self, order_id: &Uuid) -> Option<&RestingOrder> {
        let (side, level) = self.order_index.get(order_id)?;
        let queue = match side {
            OrderSide::Buy => self.bids.get(level)?,
            OrderSide::Sell => self.asks.get(level)?,
        };
        queue.iter().find(|o| o.id == *order_id)
    }

    pub fn side_of(&self, order_id: &Uuid) -> Option<OrderSide> {
        self.order_index.get(order_id).map(|(side, _)| *side)
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().map(|p| p.to_decimal())
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().map(|p| p.to_decimal())
    }

    /// Append an order to the FIFO queue at its price, assigning the next
    /// insertion sequence number.
    pub fn insert(&mut self, side: OrderSide, mut entry: RestingOrder) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        entry.seq = seq;

        let level = PriceLevel::from_decimal(entry.price);
        let order_id = entry.id;

        let book = match side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        };
        book.entry(level).or_insert_with(VecDeque::new).push_back(entry);

        self.order_index.insert(order_id, (side, level));
        seq
    }

    /// Remove an order by ID, returning it if present.
    pub fn remove(&mut self, order_id: &Uuid) -> Option<RestingOrder> {
        let (side, level) = self.order_index.remove(order_id)?;

        let book = match side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        };
        let queue = book.get_mut(&level)?;
        let pos = queue.iter().position(|o| o.id == *order_id)?;
        let entry = queue.remove(pos);
        if queue.is_empty() {
            book.remove(&level);
        }
        entry
    }

    /// Walk the opposite side for an incoming order under price-time
    /// priority and return the prospective fills.
    ///
    /// Same-user makers are skipped in place, keeping their original queue
    /// position. For an incoming buy, each prospective fill is capped at the
    /// seller's remaining holdings (`seller_available`, net of fills already
    /// planned for that seller in this walk); a maker whose residual can no
    /// longer be covered is reported in `exhausted` for cancellation.
    pub fn plan_match<F>(
        &self,
        taker_user_id: Uuid,
        taker_side: OrderSide,
        limit_price: Option<Decimal>,
        quantity: Decimal,
        seller_available: F,
    ) -> MatchPlan
    where
        F: Fn(Uuid) -> Decimal,
    {
        let mut plan = MatchPlan::default();
        let mut remaining = quantity;
        let mut planned_debits: HashMap<Uuid, Decimal> = HashMap::new();

        let levels: Box<dyn Iterator<Item = (&PriceLevel, &VecDeque<RestingOrder>)>> =
            match taker_side {
                // Buy consumes asks, lowest first
                OrderSide::Buy => Box::new(self.asks.iter()),
                // Sell consumes bids, highest first
                OrderSide::Sell => Box::new(self.bids.iter().rev()),
            };

        'levels: for (level, queue) in levels {
            if remaining <= Decimal::ZERO {
                break;
            }

            let level_price = level.to_decimal();
            if let Some(limit) = limit_price {
                let crossed = match taker_side {
                    OrderSide::Buy => level_price <= limit,
                    OrderSide::Sell => level_price >= limit,
                };
                if !crossed {
                    break 'levels;
                }
            }

            for maker in queue.iter() {
                if remaining <= Decimal::ZERO {
                    break 'levels;
                }
                if maker.user_id == taker_user_id {
                    continue;
                }

                let mut cover = maker.remaining();
                if taker_side == OrderSide::Buy {
                    let debited = planned_debits
                        .get(&maker.user_id)
                        .copied()
                        .unwrap_or(Decimal::ZERO);
                    let available = seller_available(maker.user_id) - debited;
                    cover = cover.min(available);
                    if cover <= Decimal::ZERO {
                        plan.exhausted.push(maker.id);
                        continue;
                    }
                }

                let qty = remaining.min(cover);
                plan.fills.push(Fill {
                    maker_order_id: maker.id,
                    maker_user_id: maker.user_id,
                    price: maker.price,
                    quantity: qty,
                });
                remaining -= qty;

                if taker_side == OrderSide::Buy {
                    *planned_debits
                        .entry(maker.user_id)
                        .or_insert(Decimal::ZERO) += qty;
                    // Seller ran dry mid-order: the unfilled residual is no
                    // longer backed by holdings.
                    if qty == cover && cover < maker.remaining() {
                        plan.exhausted.push(maker.id);
                    }
                }
            }
        }

        plan
    }

    /// Apply committed fills: bump maker fill quantities and drop fully
    /// filled makers from the book.
    pub fn apply_fills(&mut self, taker_side: OrderSide, fills: &[Fill]) {
        let maker_side = taker_side.opposite();
        for fill in fills {
            let level = match self.order_index.get(&fill.maker_order_id) {
                Some((_, level)) => *level,
                None => continue,
            };
            let book = match maker_side {
                OrderSide::Buy => &mut self.bids,
                OrderSide::Sell => &mut self.asks,
            };
            if let Some(queue) = book.get_mut(&level) {
                if let Some(pos) = queue.iter().position(|o| o.id == fill.maker_order_id) {
                    queue[pos].filled_quantity += fill.quantity;
                    if queue[pos].remaining() <= Decimal::ZERO {
                        queue.remove(pos);
                        self.order_index.remove(&fill.maker_order_id);
                    }
                }
                if queue.is_empty() {
                    book.remove(&level);
                }
            }
        }
    }

    /// Aggregate the top `top_k` price levels of one side.
    pub fn depth(&self, side: OrderSide, top_k: usize) -> Vec<DepthLevel> {
        let levels: Box<dyn Iterator<Item = (&PriceLevel, &VecDeque<RestingOrder>)>> = match side {
            OrderSide::Buy => Box::new(self.bids.iter().rev()),
            OrderSide::Sell => Box::new(self.asks.iter()),
        };

        levels
            .take(top_k)
            .map(|(level, orders)| DepthLevel {
                price: level.to_decimal(),
                quantity: orders.iter().map(|o| o.remaining()).sum(),
                orders_count: orders.len(),
            })
            .collect()
    }

    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        BookSnapshot {
            bond_id: self.bond_id,
            bids: self.depth(OrderSide::Buy, depth),
            asks: self.depth(OrderSide::Sell, depth),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
