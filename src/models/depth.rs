//! Market Depth Types

use serde::Serialize;

use super::order::{Price, Quantity};

/// One aggregated price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDepthLevel {
    pub price: Price,
    pub volume: Quantity,
    pub order_count: usize,
}

/// Top-N levels of both sides. Bids highest-first, asks lowest-first.
#[derive(Debug, Clone, Serialize)]
pub struct MarketDepth {
    pub bids: Vec<MarketDepthLevel>,
    pub asks: Vec<MarketDepthLevel>,
    pub timestamp: i64,
}

/// Best bid and ask.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopOfBook {
    pub best_bid: Option<MarketDepthLevel>,
    pub best_ask: Option<MarketDepthLevel>,
    /// Ask minus bid when both sides are present.
    pub spread: Option<i64>,
}
