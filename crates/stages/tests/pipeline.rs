//! Drives all four stages over the in-memory bus, in-memory stores and paper
//! execution.

use algo_pipeline_core::{
    BusConfig, Candle, CandleFeed, CandleStore, EmaSeed, EnrichedCandle, IndicatorConfig,
    InMemoryBus, OrderAction, OrderState, Signal, SignalMap, Stage, StageError, StageRunner,
    StepOutcome, StrategyConfig, TechnicalAnalysisConfig, Topic,
};
use algo_pipeline_data::{MemoryCandleStore, MemoryOrderStore};
use algo_pipeline_kraken::PaperExecutionHandler;
use algo_pipeline_stages::{
    AggregatorStage, OrderCoordinatorStage, StrategyStage, TechnicalAnalysisStage, ANALYZE,
    COORDINATE, EVALUATE,
};
use algo_pipeline_strategy::StrategyEvaluator;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;

const POLL: Duration = Duration::from_millis(5);
const SYMBOL: &str = "BTC/USD";

struct ScriptedFeed {
    batches: VecDeque<Vec<Candle>>,
}

#[async_trait]
impl CandleFeed for ScriptedFeed {
    async fn subscribe(&mut self, _symbols: &[String], _interval_mins: u32) -> Result<()> {
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<Candle>>> {
        Ok(self.batches.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn raw(minute: u32, close: f64) -> Candle {
    Candle {
        symbol: SYMBOL.to_string(),
        interval_begin: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
    }
}

/// Closes 10, 20, 30, 20, 10 with a correction to the first interval; the
/// last candle stays open. MACD(2,3,2) crosses up on the first candle and
/// down on the fourth.
fn feed() -> ScriptedFeed {
    ScriptedFeed {
        batches: VecDeque::from(vec![
            vec![raw(0, 5.0)],
            vec![raw(0, 10.0), raw(1, 20.0)],
            vec![raw(2, 30.0)],
            vec![raw(3, 20.0), raw(4, 10.0)],
            vec![raw(5, 10.0)],
        ]),
    }
}

struct Pipeline {
    bus: InMemoryBus,
    candles: MemoryCandleStore,
    orders: MemoryOrderStore,
    aggregator: AggregatorStage,
    analysis: TechnicalAnalysisStage,
    strategy: StrategyStage,
    coordinator: OrderCoordinatorStage,
}

fn pipeline() -> Pipeline {
    let bus = InMemoryBus::new();
    let candles = MemoryCandleStore::new();
    let orders = MemoryOrderStore::new();
    let groups = BusConfig::default();
    // A group that never acks keeps every record readable through `messages`.
    for topic in [Topic::MarketData, Topic::MarketIndicators, Topic::Signals] {
        let _ = bus.subscriber("history", topic);
    }

    let indicators = TechnicalAnalysisConfig {
        warmup_candles: 0,
        indicators: vec![
            IndicatorConfig::Sma {
                period: 3,
                name: None,
            },
            IndicatorConfig::Macd {
                fast: 2,
                slow: 3,
                signal: 2,
                name: None,
                seed: EmaSeed::Zero,
            },
        ],
    };

    let aggregator = AggregatorStage::new(
        Box::new(feed()),
        Box::new(candles.clone()),
        Box::new(bus.clone()),
        vec![SYMBOL.to_string()],
        1,
    );
    let analysis = TechnicalAnalysisStage::new(
        Box::new(bus.subscriber(&groups.group_for(ANALYZE), Topic::MarketData)),
        Box::new(bus.clone()),
        Box::new(candles.clone()),
        &indicators,
        vec![SYMBOL.to_string()],
        POLL,
    )
    .unwrap();
    let strategy = StrategyStage::new(
        Box::new(bus.subscriber(&groups.group_for(EVALUATE), Topic::MarketIndicators)),
        Box::new(bus.clone()),
        StrategyEvaluator::new(vec![StrategyConfig::SimpleMacd {
            name: None,
            indicator: Some("MACD_2_3_2".to_string()),
        }])
        .unwrap(),
        POLL,
    );
    let coordinator = OrderCoordinatorStage::new(
        Box::new(bus.subscriber(&groups.group_for(COORDINATE), Topic::Signals)),
        Box::new(orders.clone()),
        Box::new(PaperExecutionHandler::new(0.0).unwrap()),
        dec!(1),
        POLL,
    );

    Pipeline {
        bus,
        candles,
        orders,
        aggregator,
        analysis,
        strategy,
        coordinator,
    }
}

async fn drain(stage: &mut dyn Stage) {
    while stage.step().await.unwrap() == StepOutcome::Processed {}
}

#[tokio::test]
async fn test_candles_flow_through_to_orders() {
    let mut p = pipeline();

    p.aggregator.start().await.unwrap();
    for _ in 0..5 {
        p.aggregator.step().await.unwrap();
    }
    assert!(matches!(
        p.aggregator.step().await,
        Err(StageError::Exchange(_))
    ));

    drain(&mut p.analysis).await;
    drain(&mut p.strategy).await;
    drain(&mut p.coordinator).await;

    // Five closed intervals; the sixth is still open.
    let closed: Vec<Candle> = p
        .bus
        .messages(Topic::MarketData)
        .into_iter()
        .map(|v| serde_json::from_value(v).unwrap())
        .collect();
    assert_eq!(closed.len(), 5);
    assert_eq!(closed[0].close, 10.0);
    assert_eq!(p.candles.len(), 5);

    let enriched: Vec<EnrichedCandle> = p
        .bus
        .messages(Topic::MarketIndicators)
        .into_iter()
        .map(|v| serde_json::from_value(v).unwrap())
        .collect();
    assert!(!enriched[1].indicators.contains_key("SMA_3"));
    assert!(enriched[2].indicators.contains_key("SMA_3"));
    let stored = p
        .candles
        .fetch_candle(SYMBOL, enriched[4].candle.interval_begin)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.indicators, Some(enriched[4].indicators.clone()));

    let signals: Vec<Signal> = p
        .bus
        .messages(Topic::Signals)
        .into_iter()
        .map(|v| serde_json::from_value::<SignalMap>(v).unwrap().signals["Simple_MACD"])
        .collect();
    assert_eq!(
        signals,
        vec![
            Signal::Buy,
            Signal::Hold,
            Signal::Hold,
            Signal::Sell,
            Signal::Hold
        ]
    );

    let orders = p.orders.orders();
    assert_eq!(orders.len(), 1);
    let order = &orders[0];
    assert_eq!(order.signal_name, "Simple_MACD@BTC/USD");
    assert_eq!(order.action, OrderAction::Buy);
    assert_eq!(order.state, OrderState::Closed);
    assert_eq!(order.open_price, Some(dec!(10)));
    assert_eq!(order.close_price, Some(dec!(20)));
    assert_eq!(order.pnl, dec!(10));
}

#[tokio::test]
async fn test_runners_stop_on_shutdown() {
    let Pipeline {
        orders,
        mut aggregator,
        mut analysis,
        mut strategy,
        mut coordinator,
        ..
    } = pipeline();
    let (tx, rx) = watch::channel(false);

    let feed_done = {
        let rx = rx.clone();
        tokio::spawn(async move { runner_for(&mut aggregator, rx).await })
    };
    let handles = vec![
        tokio::spawn({
            let rx = rx.clone();
            async move { runner_for(&mut analysis, rx).await }
        }),
        tokio::spawn({
            let rx = rx.clone();
            async move { runner_for(&mut strategy, rx).await }
        }),
        tokio::spawn(async move { runner_for(&mut coordinator, rx).await }),
    ];

    tokio::time::timeout(Duration::from_secs(5), async {
        while orders
            .orders()
            .first()
            .map_or(true, |o| o.state != OrderState::Closed)
        {
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .unwrap();

    // The scripted feed ends, which stops the aggregator with an error.
    assert!(matches!(
        feed_done.await.unwrap(),
        Err(StageError::Exchange(_))
    ));

    tx.send(true).unwrap();
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}

async fn runner_for<S: Stage>(
    stage: &mut S,
    shutdown: watch::Receiver<bool>,
) -> Result<(), StageError> {
    StageRunner::new(POLL).run(stage, shutdown).await
}
