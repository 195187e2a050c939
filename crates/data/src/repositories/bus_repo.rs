//! Message bus stored in Postgres.
//!
//! Topics are rows in `bus_messages` ordered by their `BIGSERIAL` id; each
//! consumer group commits the last id it has processed in `bus_offsets`.
//! Ids are assigned at insert time, so each topic is expected to have a
//! single publishing stage.

use algo_pipeline_core::{BusPublisher, BusRecord, BusSubscriber, Topic};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PgBus {
    pool: PgPool,
}

impl PgBus {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn subscriber(
        &self,
        consumer_group: &str,
        topic: Topic,
        poll_interval: Duration,
    ) -> PgBusSubscriber {
        PgBusSubscriber {
            pool: self.pool.clone(),
            consumer_group: consumer_group.to_string(),
            topic,
            poll_interval,
            closed: false,
        }
    }
}

#[async_trait]
impl BusPublisher for PgBus {
    async fn publish(&self, topic: Topic, payload: &serde_json::Value) -> Result<()> {
        sqlx::query("INSERT INTO bus_messages (topic, payload) VALUES ($1, $2)")
            .bind(topic.as_str())
            .bind(Json(payload))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to publish to {topic}"))?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

pub struct PgBusSubscriber {
    pool: PgPool,
    consumer_group: String,
    topic: Topic,
    poll_interval: Duration,
    closed: bool,
}

impl PgBusSubscriber {
    async fn next_record(&self) -> Result<Option<BusRecord>> {
        let row: Option<(i64, Json<serde_json::Value>)> = sqlx::query_as(
            r"
            SELECT id, payload
            FROM bus_messages
            WHERE topic = $1
              AND id > COALESCE(
                  (SELECT last_id FROM bus_offsets WHERE consumer_group = $2 AND topic = $1),
                  0)
            ORDER BY id
            LIMIT 1
            ",
        )
        .bind(self.topic.as_str())
        .bind(&self.consumer_group)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to poll {}", self.topic))?;

        Ok(row.map(|(id, payload)| BusRecord {
            topic: self.topic,
            offset: id,
            payload: payload.0,
        }))
    }
}

#[async_trait]
impl BusSubscriber for PgBusSubscriber {
    fn topic(&self) -> Topic {
        self.topic
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<BusRecord>> {
        if self.closed {
            bail!("Subscriber for {} is closed", self.topic);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.next_record().await? {
                return Ok(Some(record));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&mut self, record: &BusRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO bus_offsets (consumer_group, topic, last_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (consumer_group, topic) DO UPDATE
            SET last_id = GREATEST(bus_offsets.last_id, EXCLUDED.last_id)
            ",
        )
        .bind(&self.consumer_group)
        .bind(record.topic.as_str())
        .bind(record.offset)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to ack offset {} on {}", record.offset, record.topic))?;

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.pool.close().await;
        Ok(())
    }
}
