//! Strategies turn indicator-enriched candles into BUY/SELL/HOLD signals.

pub mod simple_macd;

pub use simple_macd::SimpleMacdStrategy;

use algo_pipeline_core::{EnrichedCandle, Signal, SignalMap, StrategyConfig};
use anyhow::{ensure, Result};
use std::collections::{BTreeMap, HashMap, HashSet};

pub trait Strategy: Send {
    /// Key the strategy's signal is published and its orders stored under.
    fn name(&self) -> &str;

    /// Evaluates one candle. An error only affects this strategy's entry.
    fn evaluate(&mut self, candle: &EnrichedCandle) -> Result<Signal>;
}

#[must_use]
pub fn build_strategy(config: &StrategyConfig) -> Box<dyn Strategy> {
    match config {
        StrategyConfig::SimpleMacd { name, indicator } => {
            Box::new(SimpleMacdStrategy::new(name.clone(), indicator.clone()))
        }
    }
}

/// Runs every configured strategy over each enriched candle.
///
/// Strategy state is kept per symbol; instances for a symbol are created
/// from the configuration the first time that symbol is seen.
pub struct StrategyEvaluator {
    configs: Vec<StrategyConfig>,
    by_symbol: HashMap<String, Vec<Box<dyn Strategy>>>,
}

impl StrategyEvaluator {
    /// # Errors
    /// Returns an error if two strategies share a name.
    pub fn new(configs: Vec<StrategyConfig>) -> Result<Self> {
        let mut seen = HashSet::new();
        for config in &configs {
            let name = config.name();
            ensure!(seen.insert(name.clone()), "duplicate strategy name {name}");
        }

        Ok(Self {
            configs,
            by_symbol: HashMap::new(),
        })
    }

    #[must_use]
    pub fn strategy_names(&self) -> Vec<String> {
        self.configs.iter().map(StrategyConfig::name).collect()
    }

    /// Builds the signal map for `candle`. Strategies that fail are logged
    /// and left out of the map.
    pub fn evaluate(&mut self, candle: &EnrichedCandle) -> SignalMap {
        let symbol = &candle.candle.symbol;
        let configs = &self.configs;
        let strategies = self
            .by_symbol
            .entry(symbol.clone())
            .or_insert_with(|| configs.iter().map(build_strategy).collect());

        let mut signals = BTreeMap::new();
        for strategy in strategies.iter_mut() {
            match strategy.evaluate(candle) {
                Ok(signal) => {
                    tracing::debug!(
                        strategy = strategy.name(),
                        %symbol,
                        %signal,
                        "Strategy evaluated"
                    );
                    signals.insert(strategy.name().to_string(), signal);
                }
                Err(e) => {
                    tracing::warn!(
                        strategy = strategy.name(),
                        %symbol,
                        error = %e,
                        "Strategy failed, omitting its signal"
                    );
                }
            }
        }

        SignalMap {
            symbol: symbol.clone(),
            interval_begin: candle.candle.interval_begin,
            close: candle.candle.close,
            signals,
        }
    }
}
