//! Trade Hub
//!
//! Real-time trade fan-out. A single event-loop task owns every piece of
//! subscription state; connections talk to it over bounded channels and are
//! evicted when they fall too far behind.

mod client;
mod hub;

pub use client::serve_ws;
pub use hub::{ClientId, Hub, HubHandle};

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub(crate) const WRITE_WAIT: Duration = Duration::from_secs(10);
pub(crate) const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping interval is 0.9 of the pong deadline.
pub(crate) const PING_PERIOD: Duration = Duration::from_secs(54);
pub(crate) const MAX_MESSAGE_SIZE: usize = 512 * 1024;
pub(crate) const SEND_BUF: usize = 256;
pub(crate) const PUBLISH_BUF: usize = 4096;
pub(crate) const MAX_CONSECUTIVE_DROPS: u32 = 50;

/// Wire payload for one published trade. `seq` is strictly increasing per
/// symbol; a gap tells the consumer it was dropped on backpressure.
#[derive(Debug, Clone, Serialize)]
pub struct TradeFeed {
    pub symbol: String,
    pub price: u64,
    pub qty: u64,
    pub side: String,
    /// Unix milliseconds.
    pub ts: i64,
    pub seq: u64,
}

/// Inbound client command frame.
#[derive(Debug, Deserialize)]
pub struct ClientCommand {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub symbol: String,
}
