//! Book Registry
//!
//! Symbol-keyed registry of order books. Books are created lazily on first
//! touch; the map's entry lock serializes creation, and lookups after that
//! take no global lock. All mutations of one book serialize on its mutex:
//! one writer per symbol, symbols independent of each other.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::book::OrderBook;

#[derive(Default)]
pub struct BookRegistry {
    books: DashMap<String, Arc<Mutex<OrderBook>>>,
}

impl BookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the book for a symbol, creating it on first touch.
    pub fn get_or_create(&self, symbol: &str) -> Arc<Mutex<OrderBook>> {
        if let Some(book) = self.books.get(symbol) {
            return Arc::clone(&book);
        }
        Arc::clone(
            &self
                .books
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new(symbol)))),
        )
    }

    /// Fetch an existing book without creating one.
    pub fn get(&self, symbol: &str) -> Option<Arc<Mutex<OrderBook>>> {
        self.books.get(symbol).map(|b| Arc::clone(&b))
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderType, Side};

    #[test]
    fn get_or_create_returns_same_book() {
        let registry = BookRegistry::new();
        let a = registry.get_or_create("ACMEUSD");
        let b = registry.get_or_create("ACMEUSD");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("OTHER").is_none());
    }

    #[test]
    fn books_are_independent_per_symbol() {
        let registry = BookRegistry::new();
        let a = registry.get_or_create("AUSD");
        let b = registry.get_or_create("BUSD");

        a.lock()
            .add(Order::new(1, 1, Side::Ask, 100, 5, OrderType::GoodTillCancel))
            .unwrap();
        assert_eq!(a.lock().size(), 1);
        assert_eq!(b.lock().size(), 0);
        assert_eq!(registry.symbols().len(), 2);
    }
}
