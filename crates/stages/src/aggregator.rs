//! Closes candles from a raw exchange stream.
//!
//! Exchanges stream the still-open candle repeatedly while its interval is
//! running. A candle is only known to be final once a candle with a later
//! `interval_begin` arrives for the same symbol, so every closed candle is
//! emitted one update late.

use algo_pipeline_core::{
    publish_message, BusPublisher, Candle, CandleFeed, CandleStore, Stage, StageError,
    StepOutcome, UpsertOutcome,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Per-symbol cache of the latest (still open) candle.
#[derive(Debug, Default)]
pub struct CandleAggregator {
    open: HashMap<String, Candle>,
}

impl CandleAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches `candle` as the symbol's open candle and returns the candle it
    /// closed, if any.
    pub fn observe(&mut self, candle: Candle) -> Option<Candle> {
        let Some(cached) = self.open.get(&candle.symbol) else {
            self.open.insert(candle.symbol.clone(), candle);
            return None;
        };

        let closes_cached = candle.interval_begin > cached.interval_begin;
        if candle.interval_begin < cached.interval_begin {
            tracing::warn!(
                symbol = %candle.symbol,
                cached = %cached.interval_begin,
                received = %candle.interval_begin,
                "Received a candle older than the open one"
            );
        }

        let previous = self.open.insert(candle.symbol.clone(), candle);
        if closes_cached {
            previous
        } else {
            None
        }
    }

    /// The open candle for `symbol`, if one is cached.
    #[must_use]
    pub fn open_candle(&self, symbol: &str) -> Option<&Candle> {
        self.open.get(symbol)
    }
}

/// Reads raw candles from the exchange, persists every closed candle and
/// publishes it on `market_data`.
pub struct AggregatorStage {
    feed: Box<dyn CandleFeed>,
    store: Box<dyn CandleStore>,
    publisher: Box<dyn BusPublisher>,
    symbols: Vec<String>,
    interval_mins: u32,
    aggregator: CandleAggregator,
}

impl AggregatorStage {
    #[must_use]
    pub fn new(
        feed: Box<dyn CandleFeed>,
        store: Box<dyn CandleStore>,
        publisher: Box<dyn BusPublisher>,
        symbols: Vec<String>,
        interval_mins: u32,
    ) -> Self {
        Self {
            feed,
            store,
            publisher,
            symbols,
            interval_mins,
            aggregator: CandleAggregator::new(),
        }
    }

    async fn emit(
        store: &dyn CandleStore,
        publisher: &dyn BusPublisher,
        closed: &Candle,
    ) -> Result<(), StageError> {
        // The row must exist before technical analysis patches its indicators.
        let outcome = store
            .upsert_candle(closed)
            .await
            .map_err(StageError::Storage)?;

        publish_message(publisher, closed)
            .await
            .map_err(StageError::Bus)?;

        tracing::info!(
            symbol = %closed.symbol,
            interval_begin = %closed.interval_begin,
            close = closed.close,
            replaced = outcome == UpsertOutcome::Updated,
            "Candle closed"
        );
        Ok(())
    }
}

#[async_trait]
impl Stage for AggregatorStage {
    fn name(&self) -> &str {
        crate::AGGREGATE
    }

    async fn start(&mut self) -> Result<(), StageError> {
        self.feed
            .subscribe(&self.symbols, self.interval_mins)
            .await
            .map_err(StageError::Exchange)
    }

    async fn step(&mut self) -> Result<StepOutcome, StageError> {
        let batch = self
            .feed
            .next_batch()
            .await
            .map_err(StageError::Exchange)?
            .ok_or_else(|| StageError::Exchange(anyhow::anyhow!("Candle feed ended")))?;

        for candle in batch {
            tracing::debug!(
                symbol = %candle.symbol,
                interval_begin = %candle.interval_begin,
                close = candle.close,
                "Raw candle"
            );
            if let Some(closed) = self.aggregator.observe(candle) {
                Self::emit(self.store.as_ref(), self.publisher.as_ref(), &closed).await?;
            }
        }

        Ok(StepOutcome::Processed)
    }

    async fn close(&mut self) -> Result<(), StageError> {
        let feed = self.feed.close().await.map_err(StageError::Exchange);
        let store = self.store.close().await.map_err(StageError::Storage);
        let publisher = self.publisher.close().await.map_err(StageError::Bus);
        feed.and(store).and(publisher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algo_pipeline_core::{InMemoryBus, StageRunner, Topic};
    use algo_pipeline_data::MemoryCandleStore;
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::watch;

    fn candle(symbol: &str, minute: u32, close: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval_begin: Utc.with_ymd_and_hms(2023, 1, 1, 0, minute, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

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

    /// A connected feed on which nothing ever trades.
    struct QuietFeed;

    #[async_trait]
    impl CandleFeed for QuietFeed {
        async fn subscribe(&mut self, _symbols: &[String], _interval_mins: u32) -> Result<()> {
            Ok(())
        }

        async fn next_batch(&mut self) -> Result<Option<Vec<Candle>>> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Some(Vec::new()))
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_quiet_feed_still_stops_on_shutdown() {
        let bus = InMemoryBus::new();
        let mut stage = AggregatorStage::new(
            Box::new(QuietFeed),
            Box::new(MemoryCandleStore::new()),
            Box::new(bus.clone()),
            vec!["BTC/USD".to_string()],
            1,
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            StageRunner::new(Duration::from_millis(5))
                .run(&mut stage, rx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(bus.messages(Topic::MarketData).is_empty());
    }

    #[test]
    fn test_update_to_open_interval_publishes_once() {
        let mut aggregator = CandleAggregator::new();

        assert!(aggregator.observe(candle("BTC/USD", 0, 1.0)).is_none());
        assert!(aggregator.observe(candle("BTC/USD", 0, 2.0)).is_none());
        let closed = aggregator.observe(candle("BTC/USD", 1, 3.0)).unwrap();

        assert!((closed.close - 2.0).abs() < f64::EPSILON);
        assert!((aggregator.open_candle("BTC/USD").unwrap().close - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_symbols_are_tracked_independently() {
        let mut aggregator = CandleAggregator::new();

        assert!(aggregator.observe(candle("BTC/USD", 0, 1.0)).is_none());
        assert!(aggregator.observe(candle("ETH/USD", 1, 10.0)).is_none());
        let closed = aggregator.observe(candle("BTC/USD", 1, 2.0)).unwrap();
        assert_eq!(closed.symbol, "BTC/USD");
    }

    #[test]
    fn test_older_candle_replaces_cache_without_publishing() {
        let mut aggregator = CandleAggregator::new();

        aggregator.observe(candle("BTC/USD", 5, 1.0));
        assert!(aggregator.observe(candle("BTC/USD", 3, 2.0)).is_none());
        assert_eq!(
            aggregator.open_candle("BTC/USD").unwrap().interval_begin,
            candle("BTC/USD", 3, 0.0).interval_begin
        );
    }

    #[tokio::test]
    async fn test_closed_candle_is_stored_and_published() {
        let bus = InMemoryBus::new();
        let store = MemoryCandleStore::new();
        let feed = ScriptedFeed {
            batches: VecDeque::from(vec![
                vec![candle("BTC/USD", 0, 1.0), candle("BTC/USD", 0, 2.0)],
                vec![],
                vec![candle("BTC/USD", 1, 3.0)],
            ]),
        };
        let mut stage = AggregatorStage::new(
            Box::new(feed),
            Box::new(store.clone()),
            Box::new(bus.clone()),
            vec!["BTC/USD".to_string()],
            1,
        );

        stage.start().await.unwrap();
        for _ in 0..3 {
            assert_eq!(stage.step().await.unwrap(), StepOutcome::Processed);
        }

        let published = bus.messages(Topic::MarketData);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["close"], 2.0);
        assert_eq!(store.len(), 1);

        let err = stage.step().await.unwrap_err();
        assert_eq!(err.kind(), "exchange");
    }
}
