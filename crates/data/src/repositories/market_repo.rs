//! Candle repository over `market_ohlc`.

use algo_pipeline_core::{Candle, CandleStore, IndicatorMap, StoredCandle, UpsertOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::MarketOhlcRecord;

#[derive(Debug, Clone)]
pub struct MarketRepository {
    pool: PgPool,
}

impl MarketRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandleStore for MarketRepository {
    async fn fetch_candle(
        &self,
        symbol: &str,
        interval_begin: DateTime<Utc>,
    ) -> Result<Option<StoredCandle>> {
        let record = sqlx::query_as::<_, MarketOhlcRecord>(
            r"
            SELECT timestamp, symbol, open, high, low, close, volume, indicators
            FROM market_ohlc
            WHERE timestamp = $1 AND symbol = $2
            ",
        )
        .bind(interval_begin)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch candle")?;

        Ok(record.map(MarketOhlcRecord::into_stored))
    }

    /// Inserts the candle or overwrites OHLCV in place. `indicators` is left
    /// as stored so a re-delivered candle does not wipe computed values.
    async fn upsert_candle(&self, candle: &Candle) -> Result<UpsertOutcome> {
        // xmax is 0 only for a freshly inserted tuple
        let (inserted,): (bool,) = sqlx::query_as(
            r"
            INSERT INTO market_ohlc (timestamp, symbol, open, high, low, close, volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (timestamp, symbol) DO UPDATE
            SET open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume
            RETURNING (xmax = 0) AS inserted
            ",
        )
        .bind(candle.interval_begin)
        .bind(&candle.symbol)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert candle for {}", candle.symbol))?;

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn update_indicators(
        &self,
        symbol: &str,
        interval_begin: DateTime<Utc>,
        indicators: &IndicatorMap,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE market_ohlc
            SET indicators = $3
            WHERE timestamp = $1 AND symbol = $2
            ",
        )
        .bind(interval_begin)
        .bind(symbol)
        .bind(Json(indicators))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update indicators for {symbol}"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<StoredCandle>> {
        let limit = i64::try_from(limit).context("Candle limit out of range")?;
        let mut records = sqlx::query_as::<_, MarketOhlcRecord>(
            r"
            SELECT timestamp, symbol, open, high, low, close, volume, indicators
            FROM market_ohlc
            WHERE symbol = $1
            ORDER BY timestamp DESC
            LIMIT $2
            ",
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to query recent candles for {symbol}"))?;

        records.reverse();
        Ok(records
            .into_iter()
            .map(MarketOhlcRecord::into_stored)
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
