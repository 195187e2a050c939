use crate::events::{
    BusMessage, Candle, IndicatorMap, OrderFill, OrderRecord, OrderRequest, StoredCandle, Topic,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Stream of raw (possibly still open) candles from an exchange.
#[async_trait]
pub trait CandleFeed: Send {
    async fn subscribe(&mut self, symbols: &[String], interval_mins: u32) -> Result<()>;

    /// Waits a bounded time for the next message and returns the candles it
    /// carried (empty for heartbeats, acks, or when nothing arrived), or
    /// `None` once the stream has ended.
    async fn next_batch(&mut self) -> Result<Option<Vec<Candle>>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn submit_order(&mut self, request: &OrderRequest) -> Result<OrderFill>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Time-series storage keyed by (`interval_begin`, `symbol`).
#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn fetch_candle(
        &self,
        symbol: &str,
        interval_begin: DateTime<Utc>,
    ) -> Result<Option<StoredCandle>>;

    /// Inserts the candle or overwrites OHLCV of the existing row. Never
    /// touches the stored indicator map; a new row has none.
    async fn upsert_candle(&self, candle: &Candle) -> Result<UpsertOutcome>;

    /// Replaces the indicator map of an existing row. Returns `false` when
    /// no row exists for the key.
    async fn update_indicators(
        &self,
        symbol: &str,
        interval_begin: DateTime<Utc>,
        indicators: &IndicatorMap,
    ) -> Result<bool>;

    /// The most recent `limit` stored candles for `symbol` with their
    /// indicator maps, oldest first.
    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<StoredCandle>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Order storage keyed by the unique `signal_name`.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn fetch_order_by_signal(&self, signal_name: &str) -> Result<Option<OrderRecord>>;

    async fn upsert_order(&self, order: &OrderRecord) -> Result<UpsertOutcome>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A message as delivered by the bus. `offset` identifies it for `ack`.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: Topic,
    pub offset: i64,
    pub payload: serde_json::Value,
}

impl BusRecord {
    /// Decodes the payload, ignoring fields the message type does not know.
    ///
    /// # Errors
    /// Returns an error if the payload does not match `M`.
    pub fn decode<M: BusMessage>(&self) -> Result<M> {
        serde_json::from_value(self.payload.clone())
            .with_context(|| format!("Malformed message on topic {}", self.topic))
    }
}

#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: Topic, payload: &serde_json::Value) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// At-least-once consumer bound to one topic and consumer group.
///
/// A record that is not acked is delivered again by the next `poll`.
#[async_trait]
pub trait BusSubscriber: Send {
    fn topic(&self) -> Topic;

    /// Waits up to `timeout` for the next unacknowledged record.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BusRecord>>;

    async fn ack(&mut self, record: &BusRecord) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Serializes `message` and publishes it on its topic.
///
/// # Errors
/// Returns an error if serialization or the publish fails.
pub async fn publish_message<M: BusMessage>(
    publisher: &dyn BusPublisher,
    message: &M,
) -> Result<()> {
    let payload = serde_json::to_value(message).context("Failed to serialize bus message")?;
    publisher.publish(M::TOPIC, &payload).await
}
