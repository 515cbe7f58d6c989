//! Price-time priority limit order book for a single market.
//!
//! Bids are kept sorted by price descending, asks by price ascending; within
//! a price level, the lower insertion sequence goes first. Matching is fully
//! deterministic: the same insertion sequence produces the same trades, and
//! the wall clock is consulted only to stamp events.

use crate::error::{GameError, Result};
use common::{new_id, now_ms, MarketId, Order, OrderId, Side, Trade};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Fill validator consulted before each prospective fill. Returning `false`
/// stops the matching loop; the incoming order stays resting.
pub type FillValidator<'a> = dyn Fn(&str, &str, &str, u32) -> bool + 'a;

/// Order book scoped to exactly one market.
#[derive(Debug)]
pub struct OrderBook {
    market_id: MarketId,
    /// Sorted: price descending, then sequence ascending.
    bids: Vec<Order>,
    /// Sorted: price ascending, then sequence ascending.
    asks: Vec<Order>,
    /// Order id → side, for cancellation lookups.
    index: HashMap<OrderId, Side>,
    next_sequence: u64,
    last_trade_price: Option<f64>,
}

/// One aggregated price level of the book snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: u64,
    pub player_ids: Vec<String>,
}

/// Aggregated view of the resting book, broadcast to the room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSnapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_price: Option<f64>,
}

impl OrderBook {
    /// Create an empty book for the given market.
    pub fn new(market_id: MarketId) -> Self {
        Self {
            market_id,
            bids: Vec::new(),
            asks: Vec::new(),
            index: HashMap::new(),
            next_sequence: 0,
            last_trade_price: None,
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    /// Insert a limit order and run the matching loop.
    ///
    /// Returns the inserted order with its remaining quantity post-match
    /// (zero if fully filled) and the trades produced, in match order.
    pub fn add_order(
        &mut self,
        player_id: &str,
        side: Side,
        price: f64,
        quantity: u32,
        validator: Option<&FillValidator>,
    ) -> Result<(Order, Vec<Trade>)> {
        if !(price.is_finite() && price > 0.0) || quantity == 0 {
            return Err(GameError::InvalidOrder);
        }

        let order = Order {
            id: new_id(),
            market_id: self.market_id.clone(),
            player_id: player_id.to_string(),
            side,
            price,
            quantity,
            remaining_quantity: quantity,
            created_at: now_ms(),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.index.insert(order.id.clone(), side);

        match side {
            Side::Bid => {
                self.bids.push(order.clone());
                self.bids.sort_by(cmp_bids);
            }
            Side::Ask => {
                self.asks.push(order.clone());
                self.asks.sort_by(cmp_asks);
            }
        }

        let trades = self.match_crossing(validator);

        // Report the post-match remaining quantity; a fully filled order has
        // already been removed from its side.
        let mut placed = order;
        placed.remaining_quantity = self
            .find(&placed.id)
            .map(|o| o.remaining_quantity)
            .unwrap_or(0);
        Ok((placed, trades))
    }

    /// Remove a resting order. Returns false for unknown or fully filled ids.
    pub fn cancel_order(&mut self, order_id: &str) -> bool {
        let Some(side) = self.index.remove(order_id) else {
            return false;
        };
        let orders = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        match orders.iter().position(|o| o.id == order_id) {
            Some(i) => {
                orders.remove(i);
                true
            }
            None => false,
        }
    }

    /// Aggregate resting orders into price levels, sorted to match each
    /// side's ordering. Level quantities sum to the side's resting total.
    pub fn snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            bids: aggregate_levels(&self.bids),
            asks: aggregate_levels(&self.asks),
            last_trade_price: self.last_trade_price,
        }
    }

    /// `best ask − best bid`, if both sides are non-empty.
    pub fn spread(&self) -> Option<f64> {
        match (self.bids.first(), self.asks.first()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    fn find(&self, order_id: &str) -> Option<&Order> {
        self.bids
            .iter()
            .chain(self.asks.iter())
            .find(|o| o.id == order_id)
    }

    /// Matching loop: while the best bid crosses the best ask, fill
    /// `min(remaining)` at the price of whichever order was inserted earlier.
    /// A validator veto stops the loop with the trades accumulated so far.
    fn match_crossing(&mut self, validator: Option<&FillValidator>) -> Vec<Trade> {
        let mut trades = Vec::new();

        loop {
            let (Some(bid), Some(ask)) = (self.bids.first(), self.asks.first()) else {
                break;
            };
            if bid.price < ask.price {
                break;
            }

            let quantity = bid.remaining_quantity.min(ask.remaining_quantity);
            if let Some(validator) = validator {
                if !validator(&bid.player_id, &ask.player_id, &self.market_id, quantity) {
                    break;
                }
            }

            // Passive-price priority: the earlier insertion sets the price.
            let price = if bid.sequence < ask.sequence {
                bid.price
            } else {
                ask.price
            };

            trades.push(Trade {
                id: new_id(),
                market_id: self.market_id.clone(),
                buyer_id: bid.player_id.clone(),
                seller_id: ask.player_id.clone(),
                bid_order_id: bid.id.clone(),
                ask_order_id: ask.id.clone(),
                price,
                quantity,
                executed_at: now_ms(),
            });
            self.last_trade_price = Some(price);

            self.bids[0].remaining_quantity -= quantity;
            self.asks[0].remaining_quantity -= quantity;
            if self.bids[0].remaining_quantity == 0 {
                let filled = self.bids.remove(0);
                self.index.remove(&filled.id);
            }
            if self.asks[0].remaining_quantity == 0 {
                let filled = self.asks.remove(0);
                self.index.remove(&filled.id);
            }
        }

        trades
    }
}

fn cmp_bids(a: &Order, b: &Order) -> Ordering {
    b.price
        .partial_cmp(&a.price)
        .unwrap_or(Ordering::Equal)
        .then(a.sequence.cmp(&b.sequence))
}

fn cmp_asks(a: &Order, b: &Order) -> Ordering {
    a.price
        .partial_cmp(&b.price)
        .unwrap_or(Ordering::Equal)
        .then(a.sequence.cmp(&b.sequence))
}

fn aggregate_levels(orders: &[Order]) -> Vec<PriceLevel> {
    let mut levels: Vec<PriceLevel> = Vec::new();
    for order in orders {
        match levels.last_mut() {
            Some(level) if level.price == order.price => {
                level.quantity += order.remaining_quantity as u64;
                if !level.player_ids.contains(&order.player_id) {
                    level.player_ids.push(order.player_id.clone());
                }
            }
            _ => levels.push(PriceLevel {
                price: order.price,
                quantity: order.remaining_quantity as u64,
                player_ids: vec![order.player_id.clone()],
            }),
        }
    }
    levels
}

// ============================================================================
// Tests
// ============================================================================
