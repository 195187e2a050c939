//! In-process stores with the same semantics as the Postgres repositories.
//!
//! Used by `run-all --in-memory` and by tests. Handles are cheap clones of a
//! shared map, so a test can keep one to inspect what a stage wrote.

use algo_pipeline_core::{
    Candle, CandleStore, IndicatorMap, OrderRecord, OrderStore, StoredCandle, UpsertOutcome,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type CandleKey = (String, DateTime<Utc>);

#[derive(Debug, Clone, Default)]
pub struct MemoryCandleStore {
    rows: Arc<Mutex<BTreeMap<CandleKey, StoredCandle>>>,
}

impl MemoryCandleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn fetch_candle(
        &self,
        symbol: &str,
        interval_begin: DateTime<Utc>,
    ) -> Result<Option<StoredCandle>> {
        Ok(self
            .rows
            .lock()
            .get(&(symbol.to_string(), interval_begin))
            .cloned())
    }

    async fn upsert_candle(&self, candle: &Candle) -> Result<UpsertOutcome> {
        let mut rows = self.rows.lock();
        let key = (candle.symbol.clone(), candle.interval_begin);
        if let Some(existing) = rows.get_mut(&key) {
            existing.candle = candle.clone();
            return Ok(UpsertOutcome::Updated);
        }

        rows.insert(
            key,
            StoredCandle {
                candle: candle.clone(),
                indicators: None,
            },
        );
        Ok(UpsertOutcome::Inserted)
    }

    async fn update_indicators(
        &self,
        symbol: &str,
        interval_begin: DateTime<Utc>,
        indicators: &IndicatorMap,
    ) -> Result<bool> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&(symbol.to_string(), interval_begin)) else {
            return Ok(false);
        };
        row.indicators = Some(indicators.clone());
        Ok(true)
    }

    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<StoredCandle>> {
        let rows = self.rows.lock();
        let mut candles: Vec<StoredCandle> = rows
            .values()
            .filter(|row| row.candle.symbol == symbol)
            .rev()
            .take(limit)
            .cloned()
            .collect();
        candles.reverse();
        Ok(candles)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryOrderStore {
    rows: Arc<Mutex<HashMap<String, OrderRecord>>>,
}

impl MemoryOrderStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored order, sorted by `signal_name`.
    #[must_use]
    pub fn orders(&self) -> Vec<OrderRecord> {
        let mut orders: Vec<OrderRecord> = self.rows.lock().values().cloned().collect();
        orders.sort_by(|a, b| a.signal_name.cmp(&b.signal_name));
        orders
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn fetch_order_by_signal(&self, signal_name: &str) -> Result<Option<OrderRecord>> {
        Ok(self.rows.lock().get(signal_name).cloned())
    }

    async fn upsert_order(&self, order: &OrderRecord) -> Result<UpsertOutcome> {
        let previous = self
            .rows
            .lock()
            .insert(order.signal_name.clone(), order.clone());
        Ok(if previous.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algo_pipeline_core::{IndicatorValue, OrderAction, OrderState};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle(symbol: &str, minute: u32, close: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval_begin: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn test_upsert_twice_leaves_one_row_with_latest_values() {
        let store = MemoryCandleStore::new();
        let first = candle("BTC/USD", 0, 1.0);
        let second = candle("BTC/USD", 0, 2.0);

        assert_eq!(store.upsert_candle(&first).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_candle(&second).await.unwrap(), UpsertOutcome::Updated);

        assert_eq!(store.len(), 1);
        let stored = store
            .fetch_candle("BTC/USD", first.interval_begin)
            .await
            .unwrap()
            .unwrap();
        assert!((stored.candle.close - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_upsert_keeps_indicators() {
        let store = MemoryCandleStore::new();
        let c = candle("BTC/USD", 0, 1.0);
        store.upsert_candle(&c).await.unwrap();

        let mut indicators = IndicatorMap::new();
        indicators.insert("SMA_3".to_string(), IndicatorValue::Scalar(1.0));
        assert!(store
            .update_indicators("BTC/USD", c.interval_begin, &indicators)
            .await
            .unwrap());

        store.upsert_candle(&c).await.unwrap();
        let stored = store
            .fetch_candle("BTC/USD", c.interval_begin)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.indicators, Some(indicators));
    }

    #[tokio::test]
    async fn test_empty_indicator_map_marks_candle_processed() {
        let store = MemoryCandleStore::new();
        let c = candle("BTC/USD", 0, 1.0);
        store.upsert_candle(&c).await.unwrap();

        let fresh = store.fetch_candle("BTC/USD", c.interval_begin).await.unwrap().unwrap();
        assert!(!fresh.is_processed());

        store
            .update_indicators("BTC/USD", c.interval_begin, &IndicatorMap::new())
            .await
            .unwrap();
        let processed = store.fetch_candle("BTC/USD", c.interval_begin).await.unwrap().unwrap();
        assert!(processed.is_processed());
        assert_eq!(processed.indicators, Some(IndicatorMap::new()));
    }

    #[tokio::test]
    async fn test_update_indicators_without_row() {
        let store = MemoryCandleStore::new();
        let updated = store
            .update_indicators("BTC/USD", Utc::now(), &IndicatorMap::new())
            .await
            .unwrap();
        assert!(!updated);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_recent_candles_oldest_first_per_symbol() {
        let store = MemoryCandleStore::new();
        for minute in 0..5 {
            store
                .upsert_candle(&candle("BTC/USD", minute, f64::from(minute)))
                .await
                .unwrap();
            store
                .upsert_candle(&candle("ETH/USD", minute, 100.0))
                .await
                .unwrap();
        }

        let recent = store.recent_candles("BTC/USD", 3).await.unwrap();
        let closes: Vec<f64> = recent.iter().map(|c| c.candle.close).collect();
        assert_eq!(closes, vec![2.0, 3.0, 4.0]);
        assert!(recent.iter().all(|c| c.candle.symbol == "BTC/USD"));
    }

    #[tokio::test]
    async fn test_order_upsert_is_keyed_by_signal_name() {
        let store = MemoryOrderStore::new();
        let mut order = OrderRecord {
            signal_name: "S1".to_string(),
            id: Some("PAPER-1".to_string()),
            symbol: "BTC/USD".to_string(),
            action: OrderAction::Buy,
            volume: dec!(1),
            open_price: Some(dec!(100)),
            state: OrderState::Open,
            pnl: dec!(0),
            close_price: None,
            timestamp: Utc::now(),
            signal_interval: None,
        };

        assert_eq!(store.upsert_order(&order).await.unwrap(), UpsertOutcome::Inserted);
        order.state = OrderState::Closed;
        order.close_price = Some(dec!(110));
        assert_eq!(store.upsert_order(&order).await.unwrap(), UpsertOutcome::Updated);

        let orders = store.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].state, OrderState::Closed);
        assert!(store.fetch_order_by_signal("S2").await.unwrap().is_none());
    }
}
