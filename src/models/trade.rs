//! Trade Type

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::order::{OrderId, Price, Quantity, Side};

/// One execution between a resting (maker) and an aggressing (taker) order.
/// Immutable once emitted by the match loop. The trade prices at the maker's
/// limit; `side` is the taker's direction. The publication sequence number is
/// stamped by the trade hub, not here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub maker_id: OrderId,
    pub taker_id: OrderId,
    pub price: Price,
    pub quantity: Quantity,
    pub side: Side,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
}
