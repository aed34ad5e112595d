//! Domain Model
//!
//! Core trading types shared by the matching engine, the order service and
//! the wire layer. Prices and quantities are unsigned integer minor units;
//! there are no fractional quantities.

pub mod depth;
pub mod order;
pub mod trade;

pub use depth::{MarketDepth, MarketDepthLevel, TopOfBook};
pub use order::{Order, OrderId, OrderModify, OrderStatus, OrderType, Price, Quantity, Side, UserId};
pub use trade::Trade;
