//! Row types for the pipeline tables and their conversion to domain types.

use algo_pipeline_core::{Candle, IndicatorMap, OrderRecord, StoredCandle};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;

/// A row of `market_ohlc`. `indicators` is NULL until the candle has been
/// processed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MarketOhlcRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub indicators: Option<Json<IndicatorMap>>,
}

impl MarketOhlcRecord {
    #[must_use]
    pub fn into_stored(self) -> StoredCandle {
        StoredCandle {
            candle: Candle {
                symbol: self.symbol,
                interval_begin: self.timestamp,
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
                volume: self.volume,
            },
            indicators: self.indicators.map(|json| json.0),
        }
    }
}

/// A row of `orders`. `action` and `state` are stored as lowercase text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRow {
    pub signal_name: String,
    pub id: Option<String>,
    pub symbol: String,
    pub action: String,
    pub volume: Decimal,
    pub open_price: Option<Decimal>,
    pub state: String,
    pub pnl: Decimal,
    pub close_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub signal_interval: Option<DateTime<Utc>>,
}

impl TryFrom<OrderRow> for OrderRecord {
    type Error = anyhow::Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(Self {
            action: row
                .action
                .parse()
                .with_context(|| format!("Bad action on order {}", row.signal_name))?,
            state: row
                .state
                .parse()
                .with_context(|| format!("Bad state on order {}", row.signal_name))?,
            signal_name: row.signal_name,
            id: row.id,
            symbol: row.symbol,
            volume: row.volume,
            open_price: row.open_price,
            pnl: row.pnl,
            close_price: row.close_price,
            timestamp: row.timestamp,
            signal_interval: row.signal_interval,
        })
    }
}
