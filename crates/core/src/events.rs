use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Logical bus topics connecting the pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Closed candles, produced by the aggregator.
    MarketData,
    /// Candles enriched with indicator values.
    MarketIndicators,
    /// One signal map per enriched candle.
    Signals,
}

impl Topic {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::MarketIndicators => "market_indicators",
            Self::Signals => "signals",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binds a payload type to the topic it travels on.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync {
    const TOPIC: Topic;
}

/// One OHLCV bar for a symbol over a fixed interval.
///
/// `interval_begin` is the inclusive UTC start of the interval and, together
/// with `symbol`, the storage key. Older producers call it `timestamp`.
///
/// A missing or `null` close decodes as NaN, which [`Candle::close_price`]
/// reports as absent. NaN is written back out as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    #[serde(alias = "timestamp")]
    pub interval_begin: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    #[serde(default = "missing_price", deserialize_with = "nullable_price")]
    pub close: f64,
    pub volume: f64,
}

const fn missing_price() -> f64 {
    f64::NAN
}

fn nullable_price<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

impl Candle {
    /// Close price, or `None` when the feed delivered a non-finite value.
    #[must_use]
    pub fn close_price(&self) -> Option<f64> {
        self.close.is_finite().then_some(self.close)
    }
}

impl BusMessage for Candle {
    const TOPIC: Topic = Topic::MarketData;
}

/// Output of a single indicator for one candle.
///
/// Serialized as a bare number for scalar indicators and as
/// `{"macd": .., "signal": ..}` for MACD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndicatorValue {
    Scalar(f64),
    Macd { macd: f64, signal: f64 },
}

impl IndicatorValue {
    #[must_use]
    pub const fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(value) => Some(*value),
            Self::Macd { .. } => None,
        }
    }

    #[must_use]
    pub const fn as_macd(&self) -> Option<(f64, f64)> {
        match self {
            Self::Macd { macd, signal } => Some((*macd, *signal)),
            Self::Scalar(_) => None,
        }
    }
}

/// Indicator name (e.g. `EMA_50`) to its latest value.
pub type IndicatorMap = BTreeMap<String, IndicatorValue>;

/// A closed candle paired with the indicator values computed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedCandle {
    #[serde(flatten)]
    pub candle: Candle,
    #[serde(default)]
    pub indicators: IndicatorMap,
}

impl BusMessage for EnrichedCandle {
    const TOPIC: Topic = Topic::MarketIndicators;
}

/// A stored candle row. `indicators` is `None` until technical analysis has
/// processed the candle; a processed candle whose indicators all had no
/// value stores an empty map.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCandle {
    pub candle: Candle,
    pub indicators: Option<IndicatorMap>,
}

impl StoredCandle {
    #[must_use]
    pub const fn is_processed(&self) -> bool {
        self.indicators.is_some()
    }
}

/// Directional output of a strategy for one candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// The order side this signal asks for, `None` for `Hold`.
    #[must_use]
    pub const fn action(self) -> Option<OrderAction> {
        match self {
            Self::Buy => Some(OrderAction::Buy),
            Self::Sell => Some(OrderAction::Sell),
            Self::Hold => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
            Self::Hold => f.write_str("HOLD"),
        }
    }
}

/// Strategy name to signal, plus the candle the signals were computed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMap {
    pub symbol: String,
    pub interval_begin: DateTime<Utc>,
    #[serde(default = "missing_price", deserialize_with = "nullable_price")]
    pub close: f64,
    pub signals: BTreeMap<String, Signal>,
}

impl SignalMap {
    /// Order row key for `strategy` on this map's symbol, `<strategy>@<symbol>`.
    #[must_use]
    pub fn order_key(&self, strategy: &str) -> String {
        format!("{strategy}@{}", self.symbol)
    }
}

impl BusMessage for SignalMap {
    const TOPIC: Topic = Topic::Signals;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            _ => Err(anyhow::anyhow!("Invalid order action: '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    /// Filled and holding a position.
    Open,
    /// Position flattened; `close_price` and `pnl` are final for the leg.
    Closed,
}

impl OrderState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for OrderState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(anyhow::anyhow!("Invalid order state: '{s}'")),
        }
    }
}

/// Persisted trading intent/result, one row per strategy and symbol
/// (`signal_name`, see [`SignalMap::order_key`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub signal_name: String,
    /// Exchange-assigned id of the fill that opened the current leg.
    pub id: Option<String>,
    pub symbol: String,
    pub action: OrderAction,
    pub volume: Decimal,
    pub open_price: Option<Decimal>,
    pub state: OrderState,
    /// Cumulative realized PnL across all closed legs of this strategy.
    pub pnl: Decimal,
    pub close_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    /// `interval_begin` of the signal map that last changed this row.
    #[serde(default)]
    pub signal_interval: Option<DateTime<Utc>>,
}

impl OrderRecord {
    /// PnL of closing the current leg at `close_price`.
    #[must_use]
    pub fn realized_pnl(&self, close_price: Decimal) -> Decimal {
        let Some(open_price) = self.open_price else {
            return Decimal::ZERO;
        };
        match self.action {
            OrderAction::Buy => (close_price - open_price) * self.volume,
            OrderAction::Sell => (open_price - close_price) * self.volume,
        }
    }
}

/// Market order sent to an execution handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub action: OrderAction,
    pub volume: Decimal,
    /// Last known close, used by simulated execution.
    pub reference_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub id: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}
