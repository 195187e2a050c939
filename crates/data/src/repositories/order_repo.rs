//! Order repository over `orders`, keyed by `signal_name`.

use algo_pipeline_core::{OrderRecord, OrderStore, UpsertOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::OrderRow;

#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for OrderRepository {
    async fn fetch_order_by_signal(&self, signal_name: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT signal_name, id, symbol, action, volume, open_price, state, pnl,
                   close_price, timestamp, signal_interval
            FROM orders
            WHERE signal_name = $1
            ",
        )
        .bind(signal_name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch order {signal_name}"))?;

        row.map(OrderRecord::try_from).transpose()
    }

    /// Writes every column of the order in one statement.
    async fn upsert_order(&self, order: &OrderRecord) -> Result<UpsertOutcome> {
        let (inserted,): (bool,) = sqlx::query_as(
            r"
            INSERT INTO orders
                (signal_name, id, symbol, action, volume, open_price, state, pnl,
                 close_price, timestamp, signal_interval)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (signal_name) DO UPDATE
            SET id = EXCLUDED.id,
                symbol = EXCLUDED.symbol,
                action = EXCLUDED.action,
                volume = EXCLUDED.volume,
                open_price = EXCLUDED.open_price,
                state = EXCLUDED.state,
                pnl = EXCLUDED.pnl,
                close_price = EXCLUDED.close_price,
                timestamp = EXCLUDED.timestamp,
                signal_interval = EXCLUDED.signal_interval
            RETURNING (xmax = 0) AS inserted
            ",
        )
        .bind(&order.signal_name)
        .bind(&order.id)
        .bind(&order.symbol)
        .bind(order.action.as_str())
        .bind(order.volume)
        .bind(order.open_price)
        .bind(order.state.as_str())
        .bind(order.pnl)
        .bind(order.close_price)
        .bind(order.timestamp)
        .bind(order.signal_interval)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert order {}", order.signal_name))?;

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
