//! Storage for the candle pipeline.
//!
//! This crate provides:
//! - `DatabaseClient` for `PostgreSQL`/TimescaleDB with embedded migrations
//! - Repositories implementing the core `CandleStore`/`OrderStore` traits
//! - A Postgres-backed message bus
//! - In-memory stores for tests and single-process runs

pub mod database;
pub mod memory;
pub mod models;
pub mod repositories;

pub use database::DatabaseClient;
pub use memory::{MemoryCandleStore, MemoryOrderStore};
pub use models::{MarketOhlcRecord, OrderRow};
pub use repositories::{MarketRepository, OrderRepository, PgBus, PgBusSubscriber};
