//! Order Book
//!
//! Per-symbol limit order book under strict price-time priority. Two BTreeMap
//! price-level trees (bids matched highest-first, asks lowest-first), a slab
//! arena owning the live orders, and an id index for cancellation lookup.
//! Both the level FIFOs and the id index store arena handles, so an order has
//! exactly one owner while it rests.
//!
//! The book never suspends; callers serialize access per symbol.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use slab::Slab;

use crate::models::{MarketDepth, MarketDepthLevel, Order, OrderId, OrderModify, OrderType, Price, Side, TopOfBook, Trade};

use super::level::PriceLevel;

/// Book operation failures. All leave the book unchanged.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BookError {
    #[error("order {0} already exists in the book")]
    Duplicate(OrderId),

    #[error("order {0} not found")]
    NotFound(OrderId),

    #[error("order {0} cannot fill at its limit price")]
    CannotMatch(OrderId),
}

#[derive(Debug)]
struct OrderNode {
    order: Order,
    /// Insertion stamp; the lower of two crossing heads is the maker.
    arrival: u64,
}

pub struct OrderBook {
    symbol: String,
    bids: BTreeMap<Price, PriceLevel>,
    asks: BTreeMap<Price, PriceLevel>,
    arena: Slab<OrderNode>,
    index: HashMap<OrderId, usize>,
    arrivals: u64,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            arena: Slab::new(),
            index: HashMap::new(),
            arrivals: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Number of resting orders.
    pub fn size(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, id: OrderId) -> bool {
        self.index.contains_key(&id)
    }

    /// Whether an incoming order at this price would cross the opposite side.
    fn can_match(&self, side: Side, price: Price) -> bool {
        match side {
            Side::Bid => match self.asks.keys().next() {
                Some(&best_ask) => price >= best_ask,
                None => false,
            },
            Side::Ask => match self.bids.keys().next_back() {
                Some(&best_bid) => price <= best_bid,
                None => false,
            },
        }
    }

    /// Insert an order and run the match loop.
    ///
    /// FILL_AND_KILL orders are rejected outright when they cannot cross, and
    /// any remainder left after matching is canceled before returning.
    pub fn add(&mut self, order: Order) -> Result<Vec<Trade>, BookError> {
        debug_assert!(order.remaining_quantity > 0);

        if self.index.contains_key(&order.id) {
            return Err(BookError::Duplicate(order.id));
        }

        if order.kind == OrderType::FillAndKill && !self.can_match(order.side, order.price) {
            return Err(BookError::CannotMatch(order.id));
        }

        let id = order.id;
        let side = order.side;
        let price = order.price;
        let remaining = order.remaining_quantity;
        let kind = order.kind;

        self.arrivals += 1;
        let handle = self.arena.insert(OrderNode {
            order,
            arrival: self.arrivals,
        });
        self.index.insert(id, handle);

        self.tree_mut(side)
            .entry(price)
            .or_insert_with(PriceLevel::new)
            .push(handle, remaining);

        let trades = self.match_loop();

        // Unmatched FAK remainder does not rest.
        if kind == OrderType::FillAndKill && self.index.contains_key(&id) {
            let _ = self.cancel(id);
        }

        Ok(trades)
    }

    /// Cross the book while the best bid meets the best ask.
    fn match_loop(&mut self) -> Vec<Trade> {
        let mut trades = Vec::new();

        loop {
            let Some(&ask_price) = self.asks.keys().next() else {
                break;
            };
            let Some(&bid_price) = self.bids.keys().next_back() else {
                break;
            };
            if bid_price < ask_price {
                break;
            }

            // Walk the heads of the two crossing levels.
            loop {
                let Some(ask_handle) = self.asks.get(&ask_price).and_then(PriceLevel::peek_front)
                else {
                    break;
                };
                let Some(bid_handle) = self.bids.get(&bid_price).and_then(PriceLevel::peek_front)
                else {
                    break;
                };

                let (ask_id, ask_remaining, ask_limit, ask_arrival) = {
                    let node = &self.arena[ask_handle];
                    (
                        node.order.id,
                        node.order.remaining_quantity,
                        node.order.price,
                        node.arrival,
                    )
                };
                let (bid_id, bid_remaining, bid_limit, bid_arrival) = {
                    let node = &self.arena[bid_handle];
                    (
                        node.order.id,
                        node.order.remaining_quantity,
                        node.order.price,
                        node.arrival,
                    )
                };

                let fill = ask_remaining.min(bid_remaining);

                // The trade prices at the resting order's limit.
                let (price, maker_id, taker_id, taker_side) = if ask_arrival < bid_arrival {
                    (ask_limit, ask_id, bid_id, Side::Bid)
                } else {
                    (bid_limit, bid_id, ask_id, Side::Ask)
                };

                self.arena[ask_handle].order.fill(fill);
                self.arena[bid_handle].order.fill(fill);

                trades.push(Trade {
                    maker_id,
                    taker_id,
                    price,
                    quantity: fill,
                    side: taker_side,
                    symbol: self.symbol.clone(),
                    timestamp: Utc::now(),
                });

                self.asks.get_mut(&ask_price).expect("crossing ask level").reduce(fill);
                self.bids.get_mut(&bid_price).expect("crossing bid level").reduce(fill);

                if self.arena[ask_handle].order.is_filled() {
                    self.asks.get_mut(&ask_price).expect("crossing ask level").pop_front();
                    self.index.remove(&ask_id);
                    self.arena.remove(ask_handle);
                }
                if self.arena.contains(bid_handle) && self.arena[bid_handle].order.is_filled() {
                    self.bids.get_mut(&bid_price).expect("crossing bid level").pop_front();
                    self.index.remove(&bid_id);
                    self.arena.remove(bid_handle);
                }
            }

            if self.asks.get(&ask_price).is_some_and(PriceLevel::is_empty) {
                self.asks.remove(&ask_price);
            }
            if self.bids.get(&bid_price).is_some_and(PriceLevel::is_empty) {
                self.bids.remove(&bid_price);
            }
        }

        trades
    }

    /// Remove a resting order, crediting its remaining quantity back out of
    /// the level's aggregate volume.
    pub fn cancel(&mut self, id: OrderId) -> Result<(), BookError> {
        let handle = *self.index.get(&id).ok_or(BookError::NotFound(id))?;
        let (side, price, remaining) = {
            let node = &self.arena[handle];
            (node.order.side, node.order.price, node.order.remaining_quantity)
        };

        let tree = self.tree_mut(side);
        if let Some(level) = tree.get_mut(&price) {
            level.remove(handle, remaining);
            if level.is_empty() {
                tree.remove(&price);
            }
        }

        self.index.remove(&id);
        self.arena.remove(handle);
        Ok(())
    }

    /// Cancel-then-add with the supplied parameters. The replacement order
    /// joins the tail of its level (time priority forfeited) and may match
    /// immediately.
    pub fn modify(&mut self, modify: OrderModify, kind: OrderType) -> Result<Vec<Trade>, BookError> {
        let handle = *self.index.get(&modify.id).ok_or(BookError::NotFound(modify.id))?;
        let user_id = self.arena[handle].order.user_id;
        self.cancel(modify.id)?;
        self.add(modify.into_order(user_id, kind))
    }

    pub fn top_of_book(&self) -> TopOfBook {
        let best_bid = self
            .bids
            .iter()
            .next_back()
            .map(|(&price, level)| MarketDepthLevel {
                price,
                volume: level.aggregate_volume(),
                order_count: level.order_count(),
            });
        let best_ask = self.asks.iter().next().map(|(&price, level)| MarketDepthLevel {
            price,
            volume: level.aggregate_volume(),
            order_count: level.order_count(),
        });
        let spread = match (&best_bid, &best_ask) {
            (Some(bid), Some(ask)) => Some(ask.price as i64 - bid.price as i64),
            _ => None,
        };
        TopOfBook {
            best_bid,
            best_ask,
            spread,
        }
    }

    /// Top-N aggregated levels per side.
    pub fn depth(&self, levels: usize) -> MarketDepth {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(levels)
            .map(|(&price, level)| MarketDepthLevel {
                price,
                volume: level.aggregate_volume(),
                order_count: level.order_count(),
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(levels)
            .map(|(&price, level)| MarketDepthLevel {
                price,
                volume: level.aggregate_volume(),
                order_count: level.order_count(),
            })
            .collect();
        MarketDepth {
            bids,
            asks,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn tree_mut(&mut self, side: Side) -> &mut BTreeMap<Price, PriceLevel> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        // Every indexed order appears in exactly one level of matching side
        // and price, and level volumes equal the sum of their remainders.
        for (side, tree) in [(Side::Bid, &self.bids), (Side::Ask, &self.asks)] {
            for (&price, level) in tree {
                assert!(!level.is_empty(), "empty level {price} left in tree");
                let mut sum = 0;
                for handle in level.handles() {
                    let node = &self.arena[handle];
                    assert_eq!(node.order.side, side);
                    assert_eq!(node.order.price, price);
                    assert_eq!(self.index.get(&node.order.id), Some(&handle));
                    assert!(node.order.remaining_quantity > 0);
                    sum += node.order.remaining_quantity;
                }
                assert_eq!(level.aggregate_volume(), sum);
            }
        }
        let in_levels: usize = self
            .bids
            .values()
            .chain(self.asks.values())
            .map(PriceLevel::order_count)
            .sum();
        assert_eq!(in_levels, self.index.len());

        // No crossed book once matching has completed.
        if let (Some(&bid), Some(&ask)) = (self.bids.keys().next_back(), self.asks.keys().next()) {
            assert!(bid < ask, "crossed book: bid {bid} >= ask {ask}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderType::{FillAndKill, GoodTillCancel};

    fn order(id: OrderId, side: Side, price: Price, quantity: u64, kind: OrderType) -> Order {
        Order::new(id, id as i64, side, price, quantity, kind)
    }

    fn level(price: Price, volume: u64, order_count: usize) -> MarketDepthLevel {
        MarketDepthLevel {
            price,
            volume,
            order_count,
        }
    }

    #[test]
    fn rest_then_match_at_maker_price() {
        let mut book = OrderBook::new("ACMEUSD");

        let trades = book.add(order(1, Side::Ask, 10_000, 10, GoodTillCancel)).unwrap();
        assert!(trades.is_empty());
        let depth = book.depth(10);
        assert_eq!(depth.asks, vec![level(10_000, 10, 1)]);
        assert!(depth.bids.is_empty());

        // Bid below the ask rests.
        let trades = book.add(order(2, Side::Bid, 9_000, 10, GoodTillCancel)).unwrap();
        assert!(trades.is_empty());
        let depth = book.depth(10);
        assert_eq!(depth.asks, vec![level(10_000, 10, 1)]);
        assert_eq!(depth.bids, vec![level(9_000, 10, 1)]);
        book.check_invariants();

        // Crossing bid takes the resting ask at the ask's price.
        let trades = book.add(order(3, Side::Bid, 10_000, 10, GoodTillCancel)).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].maker_id, 1);
        assert_eq!(trades[0].taker_id, 3);
        assert_eq!(trades[0].price, 10_000);
        assert_eq!(trades[0].quantity, 10);
        assert_eq!(trades[0].side, Side::Bid);

        let depth = book.depth(10);
        assert!(depth.asks.is_empty());
        assert_eq!(depth.bids, vec![level(9_000, 10, 1)]);
        book.check_invariants();
    }

    #[test]
    fn duplicate_id_rejected_book_unchanged() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(1, Side::Ask, 100, 10, GoodTillCancel)).unwrap();
        let err = book.add(order(1, Side::Ask, 200, 5, GoodTillCancel)).unwrap_err();
        assert_eq!(err, BookError::Duplicate(1));
        assert_eq!(book.size(), 1);
        assert_eq!(book.depth(10).asks, vec![level(100, 10, 1)]);
        book.check_invariants();
    }

    #[test]
    fn fill_and_kill_rejected_on_empty_book() {
        let mut book = OrderBook::new("ACMEUSD");
        let err = book.add(order(5, Side::Bid, 9_000, 5, FillAndKill)).unwrap_err();
        assert_eq!(err, BookError::CannotMatch(5));
        assert_eq!(book.size(), 0);
        book.check_invariants();
    }

    #[test]
    fn fill_and_kill_remainder_never_rests() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(1, Side::Ask, 100, 4, GoodTillCancel)).unwrap();
        let trades = book.add(order(2, Side::Bid, 100, 10, FillAndKill)).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, 4);
        // The 6-lot remainder is canceled, not rested.
        assert!(!book.contains(2));
        assert_eq!(book.size(), 0);
        book.check_invariants();
    }

    #[test]
    fn partial_fill_leaves_remainder_resting() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(1, Side::Ask, 100, 10, GoodTillCancel)).unwrap();
        let trades = book.add(order(2, Side::Bid, 100, 3, GoodTillCancel)).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, 3);
        assert_eq!(trades[0].maker_id, 1);
        assert_eq!(book.depth(10).asks, vec![level(100, 7, 1)]);
        assert!(book.contains(1));
        assert!(!book.contains(2));
        book.check_invariants();
    }

    #[test]
    fn fifo_within_level() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(1, Side::Ask, 100, 5, GoodTillCancel)).unwrap();
        book.add(order(2, Side::Ask, 100, 5, GoodTillCancel)).unwrap();
        book.add(order(3, Side::Ask, 100, 5, GoodTillCancel)).unwrap();

        let trades = book.add(order(4, Side::Bid, 100, 12, GoodTillCancel)).unwrap();
        assert_eq!(
            trades.iter().map(|t| t.maker_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            trades.iter().map(|t| t.quantity).collect::<Vec<_>>(),
            vec![5, 5, 2]
        );
        assert_eq!(book.depth(10).asks, vec![level(100, 3, 1)]);
        book.check_invariants();
    }

    #[test]
    fn better_priced_levels_match_first() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(1, Side::Ask, 110, 5, GoodTillCancel)).unwrap();
        book.add(order(2, Side::Ask, 100, 5, GoodTillCancel)).unwrap();
        let trades = book.add(order(3, Side::Bid, 120, 8, GoodTillCancel)).unwrap();
        assert_eq!(trades.len(), 2);
        // Lowest ask first, each at its own limit.
        assert_eq!((trades[0].maker_id, trades[0].price, trades[0].quantity), (2, 100, 5));
        assert_eq!((trades[1].maker_id, trades[1].price, trades[1].quantity), (1, 110, 3));
        book.check_invariants();
    }

    #[test]
    fn cancel_removes_order_and_empty_level() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(4, Side::Bid, 50, 10, GoodTillCancel)).unwrap();
        book.cancel(4).unwrap();
        assert_eq!(book.size(), 0);
        assert!(book.depth(10).bids.is_empty());
        assert_eq!(book.cancel(4), Err(BookError::NotFound(4)));
        book.check_invariants();
    }

    #[test]
    fn cancel_mid_level_keeps_volume_consistent() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(1, Side::Bid, 50, 10, GoodTillCancel)).unwrap();
        book.add(order(2, Side::Bid, 50, 7, GoodTillCancel)).unwrap();
        book.add(order(3, Side::Bid, 50, 3, GoodTillCancel)).unwrap();
        book.cancel(2).unwrap();
        assert_eq!(book.depth(10).bids, vec![level(50, 13, 2)]);
        book.check_invariants();
    }

    #[test]
    fn modify_forfeits_time_priority() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(1, Side::Ask, 100, 5, GoodTillCancel)).unwrap();
        book.add(order(2, Side::Ask, 100, 5, GoodTillCancel)).unwrap();

        let trades = book
            .modify(
                OrderModify {
                    id: 1,
                    side: Side::Ask,
                    price: 100,
                    quantity: 5,
                },
                GoodTillCancel,
            )
            .unwrap();
        assert!(trades.is_empty());

        // The untouched order now matches first.
        let trades = book.add(order(3, Side::Bid, 100, 5, GoodTillCancel)).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].maker_id, 2);
        book.check_invariants();
    }

    #[test]
    fn modify_can_cross_immediately() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(1, Side::Ask, 100, 5, GoodTillCancel)).unwrap();
        book.add(order(2, Side::Bid, 90, 5, GoodTillCancel)).unwrap();

        let trades = book
            .modify(
                OrderModify {
                    id: 2,
                    side: Side::Bid,
                    price: 100,
                    quantity: 5,
                },
                GoodTillCancel,
            )
            .unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].maker_id, 1);
        assert_eq!(trades[0].price, 100);
        assert_eq!(book.size(), 0);
        book.check_invariants();
    }

    #[test]
    fn cancel_add_round_trip_restores_depth() {
        let mut book = OrderBook::new("ACMEUSD");
        book.add(order(1, Side::Bid, 50, 10, GoodTillCancel)).unwrap();
        book.add(order(2, Side::Bid, 50, 4, GoodTillCancel)).unwrap();
        let before = book.depth(10);

        book.cancel(1).unwrap();
        book.add(order(1, Side::Bid, 50, 10, GoodTillCancel)).unwrap();

        let after = book.depth(10);
        assert_eq!(before.bids, after.bids);
        assert_eq!(before.asks, after.asks);
        // Time priority moved to the tail: order 2 now matches first.
        let trades = book.add(order(3, Side::Ask, 50, 4, GoodTillCancel)).unwrap();
        assert_eq!(trades[0].maker_id, 2);
        book.check_invariants();
    }

    #[test]
    fn top_of_book_and_spread() {
        let mut book = OrderBook::new("ACMEUSD");
        assert!(book.top_of_book().best_bid.is_none());

        book.add(order(1, Side::Bid, 90, 10, GoodTillCancel)).unwrap();
        book.add(order(2, Side::Bid, 95, 2, GoodTillCancel)).unwrap();
        book.add(order(3, Side::Ask, 100, 5, GoodTillCancel)).unwrap();

        let top = book.top_of_book();
        assert_eq!(top.best_bid, Some(level(95, 2, 1)));
        assert_eq!(top.best_ask, Some(level(100, 5, 1)));
        assert_eq!(top.spread, Some(5));
    }

    #[test]
    fn taker_sweeping_multiple_makers_keeps_arena_compact() {
        let mut book = OrderBook::new("ACMEUSD");
        for id in 1..=20 {
            book.add(order(id, Side::Ask, 100 + id, 2, GoodTillCancel)).unwrap();
        }
        let trades = book.add(order(100, Side::Bid, 200, 40, GoodTillCancel)).unwrap();
        assert_eq!(trades.len(), 20);
        assert_eq!(trades.iter().map(|t| t.quantity).sum::<u64>(), 40);
        assert_eq!(book.size(), 0);
        book.check_invariants();
    }
}
