//! Enriches closed candles with indicator values.

use crate::{receive, Received};
use algo_pipeline_core::{
    publish_message, BusPublisher, BusSubscriber, Candle, CandleStore, EnrichedCandle,
    IndicatorConfig, IndicatorMap, Stage, StageError, StepOutcome, StoredCandle,
    TechnicalAnalysisConfig,
};
use algo_pipeline_indicators::IndicatorSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

/// Consumes `market_data`, runs every configured indicator, stores the
/// values on the candle's row and publishes the enriched candle on
/// `market_indicators`.
///
/// Indicator state lives per symbol. A candle at or before the last one fed
/// for its symbol (a redelivery, or one already covered by warm-up) is not
/// fed again; its stored values are republished instead.
pub struct TechnicalAnalysisStage {
    subscriber: Box<dyn BusSubscriber>,
    publisher: Box<dyn BusPublisher>,
    store: Box<dyn CandleStore>,
    indicators: Vec<IndicatorConfig>,
    symbols: Vec<String>,
    warmup_candles: usize,
    poll_timeout: Duration,
    sets: HashMap<String, IndicatorSet>,
    last_fed: HashMap<String, DateTime<Utc>>,
}

impl TechnicalAnalysisStage {
    /// # Errors
    /// Returns [`StageError::Config`] if the indicator list is invalid.
    pub fn new(
        subscriber: Box<dyn BusSubscriber>,
        publisher: Box<dyn BusPublisher>,
        store: Box<dyn CandleStore>,
        config: &TechnicalAnalysisConfig,
        symbols: Vec<String>,
        poll_timeout: Duration,
    ) -> Result<Self, StageError> {
        IndicatorSet::from_configs(&config.indicators).map_err(StageError::Config)?;

        Ok(Self {
            subscriber,
            publisher,
            store,
            indicators: config.indicators.clone(),
            symbols,
            warmup_candles: config.warmup_candles,
            poll_timeout,
            sets: HashMap::new(),
            last_fed: HashMap::new(),
        })
    }

    fn indicators_for(&mut self, symbol: &str) -> Result<&mut IndicatorSet, StageError> {
        match self.sets.entry(symbol.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let set = IndicatorSet::from_configs(&self.indicators).map_err(StageError::Config)?;
                Ok(entry.insert(set))
            }
        }
    }

    fn already_fed(&self, candle: &Candle) -> bool {
        self.last_fed
            .get(&candle.symbol)
            .is_some_and(|last| candle.interval_begin <= *last)
    }

    fn feed(&mut self, candle: &Candle) -> Result<IndicatorMap, StageError> {
        let values = self
            .indicators_for(&candle.symbol)?
            .calculate(candle.close_price());
        self.last_fed
            .insert(candle.symbol.clone(), candle.interval_begin);
        Ok(values)
    }

    /// Feeds already-processed history through fresh indicators without
    /// storing or publishing anything. Returns the number of candles fed.
    fn replay(&mut self, history: &[StoredCandle]) -> Result<usize, StageError> {
        let mut fed = 0;
        // Unprocessed candles are still pending on the bus.
        for row in history.iter().filter(|row| row.is_processed()) {
            self.feed(&row.candle)?;
            fed += 1;
        }
        Ok(fed)
    }
}

#[async_trait]
impl Stage for TechnicalAnalysisStage {
    fn name(&self) -> &str {
        crate::ANALYZE
    }

    async fn start(&mut self) -> Result<(), StageError> {
        if self.warmup_candles == 0 {
            return Ok(());
        }

        for symbol in self.symbols.clone() {
            let history = self
                .store
                .recent_candles(&symbol, self.warmup_candles)
                .await
                .map_err(StageError::Storage)?;
            let fed = self.replay(&history)?;
            tracing::info!(%symbol, fed, "Indicators warmed up from stored candles");
        }
        Ok(())
    }

    async fn step(&mut self) -> Result<StepOutcome, StageError> {
        let (record, candle) =
            match receive::<Candle>(self.subscriber.as_mut(), self.poll_timeout).await? {
                Received::Nothing => return Ok(StepOutcome::Idle),
                Received::Skipped => return Ok(StepOutcome::Processed),
                Received::Message(record, candle) => (record, candle),
            };

        let indicators = if self.already_fed(&candle) {
            tracing::debug!(
                symbol = %candle.symbol,
                interval_begin = %candle.interval_begin,
                "Candle already fed, republishing stored indicators"
            );
            self.store
                .fetch_candle(&candle.symbol, candle.interval_begin)
                .await
                .map_err(StageError::Storage)?
                .and_then(|stored| stored.indicators)
                .unwrap_or_default()
        } else {
            let indicators = self.feed(&candle)?;
            let updated = self
                .store
                .update_indicators(&candle.symbol, candle.interval_begin, &indicators)
                .await
                .map_err(StageError::Storage)?;
            if !updated {
                tracing::error!(
                    symbol = %candle.symbol,
                    interval_begin = %candle.interval_begin,
                    "No stored candle to attach indicators to"
                );
            }
            indicators
        };

        tracing::debug!(
            symbol = %candle.symbol,
            interval_begin = %candle.interval_begin,
            indicators = indicators.len(),
            "Candle enriched"
        );

        publish_message(
            self.publisher.as_ref(),
            &EnrichedCandle { candle, indicators },
        )
        .await
        .map_err(StageError::Bus)?;

        self.subscriber
            .ack(&record)
            .await
            .map_err(StageError::Bus)?;
        Ok(StepOutcome::Processed)
    }

    async fn close(&mut self) -> Result<(), StageError> {
        let subscriber = self.subscriber.close().await.map_err(StageError::Bus);
        let publisher = self.publisher.close().await.map_err(StageError::Bus);
        let store = self.store.close().await.map_err(StageError::Storage);
        subscriber.and(publisher).and(store)
    }
}
