//! Multi-symbol limit-order-book trading core with double-entry settlement.
//!
//! Orders are validated and funded against a TigerBeetle ledger (reservation
//! into per-symbol escrow), matched under price-time priority in per-symbol
//! in-memory books, settled as paired escrow transfers, persisted to
//! Postgres, and published to websocket subscribers in real time.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod websocket;

use crate::config::AppConfig;
use crate::db::Database;
use crate::services::orders::OrderService;
use crate::websocket::HubHandle;

pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub orders: OrderService,
    pub hub: HubHandle,
}
