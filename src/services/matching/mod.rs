//! Matching Engine
//!
//! Price-time priority limit order books, one per symbol, plus the registry
//! that owns them. Book operations are synchronous and never suspend; the
//! order service serializes access per symbol through the registry's
//! per-book mutex.

mod book;
mod level;
mod registry;

pub use book::{BookError, OrderBook};
pub use registry::BookRegistry;
