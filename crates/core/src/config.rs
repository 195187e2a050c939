use anyhow::{ensure, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub pipeline: PipelineConfig,
    pub market: MarketConfig,
    pub technical_analysis: TechnicalAnalysisConfig,
    pub strategies: Vec<StrategyConfig>,
    pub orders: OrderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// Shared in-process log; only usable when all stages run in one process.
    Memory,
    /// `bus_messages` table in the pipeline database.
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    /// Prefix for consumer groups; each stage appends its own name.
    pub consumer_group: String,
    pub poll_timeout_ms: u64,
    /// How often the Postgres bus re-checks for new rows within one poll.
    pub poll_interval_ms: u64,
}

impl BusConfig {
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn group_for(&self, stage: &str) -> String {
        format!("{}-{stage}", self.consumer_group)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sleep between polls when a stage found nothing to do.
    pub idle_sleep_ms: u64,
}

impl PipelineConfig {
    #[must_use]
    pub const fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub ws_url: String,
    pub symbols: Vec<String>,
    pub interval_mins: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TechnicalAnalysisConfig {
    /// Stored candles replayed through fresh indicators on start (0 = off).
    pub warmup_candles: usize,
    pub indicators: Vec<IndicatorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    pub volume: Decimal,
    /// Slippage applied by paper execution, in basis points.
    pub slippage_bps: f64,
}

/// How an EMA initialises its carried value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmaSeed {
    /// Start from 0. Skews the first outputs toward zero; kept as the
    /// default so values match rows already stored.
    #[default]
    Zero,
    /// Start from the first observed close.
    FirstClose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorConfig {
    Sma {
        period: usize,
        #[serde(default)]
        name: Option<String>,
    },
    Ema {
        period: usize,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        seed: EmaSeed,
    },
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        seed: EmaSeed,
    },
}

impl IndicatorConfig {
    /// Storage key for the indicator's value, derived from its parameters
    /// unless overridden.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Sma { period, name } => name.clone().unwrap_or_else(|| format!("SMA_{period}")),
            Self::Ema { period, name, .. } => {
                name.clone().unwrap_or_else(|| format!("EMA_{period}"))
            }
            Self::Macd {
                fast,
                slow,
                signal,
                name,
                ..
            } => name
                .clone()
                .unwrap_or_else(|| format!("MACD_{fast}_{slow}_{signal}")),
        }
    }

    fn periods(&self) -> Vec<usize> {
        match self {
            Self::Sma { period, .. } | Self::Ema { period, .. } => vec![*period],
            Self::Macd {
                fast, slow, signal, ..
            } => vec![*fast, *slow, *signal],
        }
    }
}

pub const DEFAULT_MACD_STRATEGY_NAME: &str = "Simple_MACD";
pub const DEFAULT_MACD_INDICATOR: &str = "MACD_12_26_9";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// MACD/signal-line crossover with repeat suppression.
    SimpleMacd {
        #[serde(default)]
        name: Option<String>,
        /// Name of the MACD indicator to read.
        #[serde(default)]
        indicator: Option<String>,
    },
}

impl StrategyConfig {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::SimpleMacd { name, .. } => name
                .clone()
                .unwrap_or_else(|| DEFAULT_MACD_STRATEGY_NAME.to_string()),
        }
    }

    fn indicator(&self) -> String {
        match self {
            Self::SimpleMacd { indicator, .. } => indicator
                .clone()
                .unwrap_or_else(|| DEFAULT_MACD_INDICATOR.to_string()),
        }
    }
}

impl AppConfig {
    /// Checks cross-field constraints that serde cannot express.
    ///
    /// # Errors
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.market.symbols.is_empty(),
            "market.symbols must list at least one symbol"
        );
        ensure!(self.market.interval_mins > 0, "market.interval_mins must be > 0");
        ensure!(self.orders.volume > Decimal::ZERO, "orders.volume must be > 0");
        ensure!(
            self.orders.slippage_bps >= 0.0,
            "orders.slippage_bps must not be negative"
        );
        ensure!(self.bus.poll_timeout_ms > 0, "bus.poll_timeout_ms must be > 0");

        let mut indicator_names = HashSet::new();
        for indicator in &self.technical_analysis.indicators {
            let name = indicator.name();
            ensure!(
                indicator.periods().iter().all(|p| *p > 0),
                "indicator {name} has a zero period"
            );
            ensure!(
                indicator_names.insert(name.clone()),
                "duplicate indicator name {name}"
            );
        }

        let mut strategy_names = HashSet::new();
        for strategy in &self.strategies {
            let name = strategy.name();
            ensure!(
                strategy_names.insert(name.clone()),
                "duplicate strategy name {name}"
            );
            let indicator = strategy.indicator();
            ensure!(
                indicator_names.contains(&indicator),
                "strategy {name} reads indicator {indicator}, which is not configured"
            );
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            bus: BusConfig::default(),
            pipeline: PipelineConfig::default(),
            market: MarketConfig::default(),
            technical_analysis: TechnicalAnalysisConfig::default(),
            strategies: vec![StrategyConfig::SimpleMacd {
                name: None,
                indicator: None,
            }],
            orders: OrderConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/algo_pipeline".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Postgres,
            consumer_group: "algo-pipeline".to_string(),
            poll_timeout_ms: 1000,
            poll_interval_ms: 100,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { idle_sleep_ms: 1000 }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws.kraken.com/v2".to_string(),
            symbols: vec!["BTC/USD".to_string()],
            interval_mins: 1,
        }
    }
}

impl Default for TechnicalAnalysisConfig {
    fn default() -> Self {
        Self {
            warmup_candles: 0,
            indicators: vec![
                IndicatorConfig::Sma {
                    period: 50,
                    name: None,
                },
                IndicatorConfig::Ema {
                    period: 50,
                    name: None,
                    seed: EmaSeed::Zero,
                },
                IndicatorConfig::Macd {
                    fast: 12,
                    slow: 26,
                    signal: 9,
                    name: None,
                    seed: EmaSeed::Zero,
                },
            ],
        }
    }
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            volume: Decimal::ONE,
            slippage_bps: 0.0,
        }
    }
}
