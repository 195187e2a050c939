//! Shared contracts for the candle pipeline: bus messages and order records,
//! the traits at each external seam (bus, storage, exchange), configuration,
//! and the stage runner every pipeline stage is driven by.

pub mod bus;
pub mod config;
pub mod config_loader;
pub mod engine;
pub mod error;
pub mod events;
pub mod traits;

pub use bus::{InMemoryBus, InMemorySubscriber};
pub use config::{
    AppConfig, BusBackend, BusConfig, DatabaseConfig, EmaSeed, IndicatorConfig, MarketConfig,
    OrderConfig, PipelineConfig, StrategyConfig, TechnicalAnalysisConfig,
};
pub use config_loader::ConfigLoader;
pub use engine::{Stage, StageRunner, StepOutcome};
pub use error::StageError;
pub use events::{
    BusMessage, Candle, EnrichedCandle, IndicatorMap, IndicatorValue, OrderAction, OrderFill,
    OrderRecord, OrderRequest, OrderState, Signal, SignalMap, StoredCandle, Topic,
};
pub use traits::{
    publish_message, BusPublisher, BusRecord, BusSubscriber, CandleFeed, CandleStore,
    ExecutionHandler, OrderStore, UpsertOutcome,
};
