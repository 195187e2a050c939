//! Builds stages from configuration and runs them.

use algo_pipeline_core::{
    AppConfig, BusBackend, BusConfig, BusPublisher, BusSubscriber, CandleStore, InMemoryBus,
    OrderStore, Stage, StageRunner, Topic,
};
use algo_pipeline_data::{
    DatabaseClient, MarketRepository, MemoryCandleStore, MemoryOrderStore, OrderRepository,
    PgBus,
};
use algo_pipeline_kraken::{KrakenCandleFeed, PaperExecutionHandler};
use algo_pipeline_stages::{
    AggregatorStage, OrderCoordinatorStage, StrategyStage, TechnicalAnalysisStage, AGGREGATE,
    ANALYZE, COORDINATE, EVALUATE,
};
use algo_pipeline_strategy::StrategyEvaluator;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Aggregate,
    Analyze,
    Evaluate,
    Coordinate,
}

impl StageKind {
    pub const ALL: [Self; 4] = [
        Self::Aggregate,
        Self::Analyze,
        Self::Evaluate,
        Self::Coordinate,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aggregate => AGGREGATE,
            Self::Analyze => ANALYZE,
            Self::Evaluate => EVALUATE,
            Self::Coordinate => COORDINATE,
        }
    }
}

/// Bus and stores shared by every stage of one `run-all --in-memory`
/// process.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    bus: InMemoryBus,
    candles: MemoryCandleStore,
    orders: MemoryOrderStore,
}

/// Storage and bus handles owned by one stage.
enum Connections {
    Postgres(DatabaseClient),
    Memory(MemoryBackend),
}

impl Connections {
    async fn open(config: &AppConfig, memory: Option<&MemoryBackend>) -> Result<Self> {
        match memory {
            Some(backend) => Ok(Self::Memory(backend.clone())),
            None => Ok(Self::Postgres(
                DatabaseClient::connect(&config.database).await?,
            )),
        }
    }

    fn publisher(&self) -> Box<dyn BusPublisher> {
        match self {
            Self::Postgres(db) => Box::new(PgBus::new(db.pool())),
            Self::Memory(backend) => Box::new(backend.bus.clone()),
        }
    }

    fn subscriber(
        &self,
        bus: &BusConfig,
        stage: StageKind,
        topic: Topic,
    ) -> Box<dyn BusSubscriber> {
        let group = bus.group_for(stage.name());
        match self {
            Self::Postgres(db) => {
                Box::new(PgBus::new(db.pool()).subscriber(&group, topic, bus.poll_interval()))
            }
            Self::Memory(backend) => Box::new(backend.bus.subscriber(&group, topic)),
        }
    }

    fn candle_store(&self) -> Box<dyn CandleStore> {
        match self {
            Self::Postgres(db) => Box::new(MarketRepository::new(db.pool())),
            Self::Memory(backend) => Box::new(backend.candles.clone()),
        }
    }

    fn order_store(&self) -> Box<dyn OrderStore> {
        match self {
            Self::Postgres(db) => Box::new(OrderRepository::new(db.pool())),
            Self::Memory(backend) => Box::new(backend.orders.clone()),
        }
    }
}

/// Builds `kind` from configuration, connecting its own storage unless an
/// in-memory backend is supplied.
///
/// # Errors
/// Returns an error if the database is unreachable or the configuration is
/// invalid for the stage.
pub async fn build_stage(
    kind: StageKind,
    config: &AppConfig,
    memory: Option<&MemoryBackend>,
) -> Result<Box<dyn Stage>> {
    let conns = Connections::open(config, memory).await?;
    let poll_timeout = config.bus.poll_timeout();
    let symbols = config.market.symbols.clone();

    let stage: Box<dyn Stage> = match kind {
        StageKind::Aggregate => Box::new(AggregatorStage::new(
            Box::new(KrakenCandleFeed::new(config.market.ws_url.clone())),
            conns.candle_store(),
            conns.publisher(),
            symbols,
            config.market.interval_mins,
        )),
        StageKind::Analyze => Box::new(TechnicalAnalysisStage::new(
            conns.subscriber(&config.bus, kind, Topic::MarketData),
            conns.publisher(),
            conns.candle_store(),
            &config.technical_analysis,
            symbols,
            poll_timeout,
        )?),
        StageKind::Evaluate => Box::new(StrategyStage::new(
            conns.subscriber(&config.bus, kind, Topic::MarketIndicators),
            conns.publisher(),
            StrategyEvaluator::new(config.strategies.clone())?,
            poll_timeout,
        )),
        StageKind::Coordinate => Box::new(OrderCoordinatorStage::new(
            conns.subscriber(&config.bus, kind, Topic::Signals),
            conns.order_store(),
            Box::new(PaperExecutionHandler::new(config.orders.slippage_bps)?),
            config.orders.volume,
            poll_timeout,
        )),
    };

    tracing::debug!(stage = kind.name(), "Stage built");
    Ok(stage)
}

/// Runs one stage until shutdown or failure.
///
/// # Errors
/// Returns the error that stopped the stage.
pub async fn run_stage(
    kind: StageKind,
    config: &AppConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    anyhow::ensure!(
        config.bus.backend == BusBackend::Postgres,
        "The in-memory bus only connects stages inside `run-all`"
    );

    let mut stage = build_stage(kind, config, None).await?;
    StageRunner::new(config.pipeline.idle_sleep())
        .run(stage.as_mut(), shutdown)
        .await
        .with_context(|| format!("Stage {} failed", kind.name()))
}

/// Runs all four stages as tasks of this process. The first stage to fail
/// shuts the others down.
///
/// # Errors
/// Returns an error if a stage could not be built or any stage failed.
pub async fn run_all(
    config: &AppConfig,
    in_memory: bool,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<()> {
    let memory = (in_memory || config.bus.backend == BusBackend::Memory)
        .then(MemoryBackend::default);
    if memory.is_some() {
        tracing::warn!("Using the in-memory bus and stores; nothing is persisted");
    }

    let mut stages = Vec::with_capacity(StageKind::ALL.len());
    for kind in StageKind::ALL {
        stages.push((kind, build_stage(kind, config, memory.as_ref()).await?));
    }

    let runner = Arc::new(StageRunner::new(config.pipeline.idle_sleep()));
    let mut handles = Vec::with_capacity(stages.len());
    for (kind, mut stage) in stages {
        let runner = Arc::clone(&runner);
        let shutdown = Arc::clone(&shutdown);
        let receiver = shutdown.subscribe();
        handles.push((
            kind,
            tokio::spawn(async move {
                let result = runner.run(stage.as_mut(), receiver).await;
                if result.is_err() {
                    shutdown.send_replace(true);
                }
                result
            }),
        ));
    }

    let mut failures = Vec::new();
    for (kind, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(format!("{}: {e}", kind.name())),
            Err(e) => failures.push(format!("{}: task failed: {e}", kind.name())),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(StageFailures(failures).into())
    }
}

#[derive(Debug)]
struct StageFailures(Vec<String>);

impl std::fmt::Display for StageFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} stage(s) failed: {}", self.0.len(), self.0.join("; "))
    }
}

impl std::error::Error for StageFailures {}
