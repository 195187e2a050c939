//! Postgres-backed implementations of the pipeline's storage and bus traits.

pub mod bus_repo;
pub mod market_repo;
pub mod order_repo;

pub use bus_repo::{PgBus, PgBusSubscriber};
pub use market_repo::MarketRepository;
pub use order_repo::OrderRepository;
