//! Order Types
//!
//! The order as the matching engine sees it, plus the enums shared with the
//! HTTP layer and the persistent store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Price in integer minor units (e.g. cents).
pub type Price = u64;

/// Quantity in whole units.
pub type Quantity = u64;

/// Globally unique, strictly increasing per process.
pub type OrderId = u64;

/// Database user key.
pub type UserId = i64;

// ============================================================================
// Enums
// ============================================================================

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    /// Store encoding (`orders.side SMALLINT`).
    pub fn as_i16(&self) -> i16 {
        match self {
            Side::Bid => 0,
            Side::Ask => 1,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Side::Bid),
            1 => Some(Side::Ask),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Bid => write!(f, "BID"),
            Side::Ask => write!(f, "ASK"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Match immediately at the limit price or better; cancel any remainder.
    FillAndKill,
    /// Rest in the book until filled or canceled.
    GoodTillCancel,
}

impl OrderType {
    pub fn as_i16(&self) -> i16 {
        match self {
            OrderType::FillAndKill => 0,
            OrderType::GoodTillCancel => 1,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(OrderType::FillAndKill),
            1 => Some(OrderType::GoodTillCancel),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::FillAndKill => write!(f, "FILL_AND_KILL"),
            OrderType::GoodTillCancel => write!(f, "GOOD_TILL_CANCEL"),
        }
    }
}

/// Per-order lifecycle. `Filled` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    New,
    Reserved,
    Resting,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::New => write!(f, "new"),
            OrderStatus::Reserved => write!(f, "reserved"),
            OrderStatus::Resting => write!(f, "resting"),
            OrderStatus::PartiallyFilled => write!(f, "partially_filled"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Canceled => write!(f, "canceled"),
        }
    }
}

// ============================================================================
// Order
// ============================================================================

/// A live order. Owned exclusively by the book while resting; remaining and
/// initial quantity satisfy `filled = initial - remaining` at all times.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub side: Side,
    pub price: Price,
    pub initial_quantity: Quantity,
    pub remaining_quantity: Quantity,
    pub kind: OrderType,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        id: OrderId,
        user_id: UserId,
        side: Side,
        price: Price,
        quantity: Quantity,
        kind: OrderType,
    ) -> Self {
        Self {
            id,
            user_id,
            side,
            price,
            initial_quantity: quantity,
            remaining_quantity: quantity,
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn filled_quantity(&self) -> Quantity {
        self.initial_quantity - self.remaining_quantity
    }

    /// Reduce the remaining quantity by a fill. Quantity must not exceed the
    /// remainder.
    pub fn fill(&mut self, quantity: Quantity) {
        debug_assert!(quantity <= self.remaining_quantity);
        self.remaining_quantity -= quantity;
    }

    pub fn is_filled(&self) -> bool {
        self.remaining_quantity == 0
    }
}

/// Replacement parameters for an existing order. Applying a modify forfeits
/// time priority at the level.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OrderModify {
    pub id: OrderId,
    pub side: Side,
    pub price: Price,
    pub quantity: Quantity,
}

impl OrderModify {
    pub fn into_order(self, user_id: UserId, kind: OrderType) -> Order {
        Order::new(self.id, user_id, self.side, self.price, self.quantity, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_tracks_remaining_and_filled() {
        let mut order = Order::new(1, 7, Side::Bid, 100, 10, OrderType::GoodTillCancel);
        assert_eq!(order.filled_quantity(), 0);
        order.fill(4);
        assert_eq!(order.remaining_quantity, 6);
        assert_eq!(order.filled_quantity(), 4);
        assert!(!order.is_filled());
        order.fill(6);
        assert!(order.is_filled());
        assert_eq!(order.filled_quantity(), 10);
    }

    #[test]
    fn modify_resets_quantities() {
        let modify = OrderModify {
            id: 9,
            side: Side::Ask,
            price: 250,
            quantity: 5,
        };
        let order = modify.into_order(3, OrderType::GoodTillCancel);
        assert_eq!(order.id, 9);
        assert_eq!(order.initial_quantity, 5);
        assert_eq!(order.remaining_quantity, 5);
        assert_eq!(order.price, 250);
    }

    #[test]
    fn side_serde_uses_wire_names() {
        assert_eq!(serde_json::to_string(&Side::Bid).unwrap(), "\"BID\"");
        assert_eq!(
            serde_json::from_str::<OrderType>("\"FILL_AND_KILL\"").unwrap(),
            OrderType::FillAndKill
        );
        assert_eq!(Side::from_i16(Side::Ask.as_i16()), Some(Side::Ask));
    }
}
