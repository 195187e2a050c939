//! The four pipeline stages, each driven by [`StageRunner`].
//!
//! ```text
//! CandleFeed -> Aggregator -> market_data -> TechnicalAnalysis
//!     -> market_indicators -> Strategy -> signals -> OrderCoordinator
//! ```
//!
//! [`StageRunner`]: algo_pipeline_core::StageRunner

pub mod aggregator;
pub mod order_coordinator;
pub mod strategy_stage;
pub mod technical_analysis;

pub use aggregator::{AggregatorStage, CandleAggregator};
pub use order_coordinator::{next_order, OrderCoordinatorStage};
pub use strategy_stage::StrategyStage;
pub use technical_analysis::TechnicalAnalysisStage;

use algo_pipeline_core::{BusMessage, BusRecord, BusSubscriber, StageError};
use std::time::Duration;

/// Stage names, also used as consumer-group suffixes.
pub const AGGREGATE: &str = "aggregate";
pub const ANALYZE: &str = "analyze";
pub const EVALUATE: &str = "evaluate";
pub const COORDINATE: &str = "coordinate";

/// Result of one bus poll.
pub(crate) enum Received<M> {
    /// Poll timed out.
    Nothing,
    /// A record that could not be decoded was acked and dropped.
    Skipped,
    Message(BusRecord, M),
}

/// Polls once and decodes the record. Undecodable records are logged,
/// acknowledged and skipped so they cannot block the topic.
pub(crate) async fn receive<M: BusMessage>(
    subscriber: &mut dyn BusSubscriber,
    timeout: Duration,
) -> Result<Received<M>, StageError> {
    let Some(record) = subscriber.poll(timeout).await.map_err(StageError::Bus)? else {
        return Ok(Received::Nothing);
    };

    match record.decode::<M>() {
        Ok(message) => Ok(Received::Message(record, message)),
        Err(e) => {
            tracing::warn!(
                topic = %record.topic,
                offset = record.offset,
                error = %format!("{e:#}"),
                "Skipping undecodable message"
            );
            subscriber.ack(&record).await.map_err(StageError::Bus)?;
            Ok(Received::Skipped)
        }
    }
}
