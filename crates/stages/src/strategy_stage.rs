use crate::{receive, Received};
use algo_pipeline_core::{
    publish_message, BusPublisher, BusSubscriber, EnrichedCandle, Stage, StageError,
    StepOutcome,
};
use algo_pipeline_strategy::StrategyEvaluator;
use async_trait::async_trait;
use std::time::Duration;

/// Consumes `market_indicators` and publishes one signal map per enriched
/// candle on `signals`, including maps where every strategy holds.
pub struct StrategyStage {
    subscriber: Box<dyn BusSubscriber>,
    publisher: Box<dyn BusPublisher>,
    evaluator: StrategyEvaluator,
    poll_timeout: Duration,
}

impl StrategyStage {
    #[must_use]
    pub fn new(
        subscriber: Box<dyn BusSubscriber>,
        publisher: Box<dyn BusPublisher>,
        evaluator: StrategyEvaluator,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            subscriber,
            publisher,
            evaluator,
            poll_timeout,
        }
    }
}

#[async_trait]
impl Stage for StrategyStage {
    fn name(&self) -> &str {
        crate::EVALUATE
    }

    async fn start(&mut self) -> Result<(), StageError> {
        tracing::info!(strategies = ?self.evaluator.strategy_names(), "Strategies loaded");
        Ok(())
    }

    async fn step(&mut self) -> Result<StepOutcome, StageError> {
        let (record, candle) =
            match receive::<EnrichedCandle>(self.subscriber.as_mut(), self.poll_timeout).await? {
                Received::Nothing => return Ok(StepOutcome::Idle),
                Received::Skipped => return Ok(StepOutcome::Processed),
                Received::Message(record, candle) => (record, candle),
            };

        let signals = self.evaluator.evaluate(&candle);
        tracing::debug!(
            symbol = %signals.symbol,
            interval_begin = %signals.interval_begin,
            signals = ?signals.signals,
            "Signals evaluated"
        );

        publish_message(self.publisher.as_ref(), &signals)
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
        subscriber.and(publisher)
    }
}
