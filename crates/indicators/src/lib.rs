//! Incremental indicator recurrences.
//!
//! Every indicator consumes one close per candle and carries only the state
//! its recurrence needs. Closes for one instance must arrive in
//! non-decreasing `interval_begin` order for a single symbol; a missing or
//! non-finite close produces no value and leaves the state untouched.

pub mod ema;
pub mod macd;
pub mod sma;

pub use ema::Ema;
pub use macd::Macd;
pub use sma::Sma;

use algo_pipeline_core::{IndicatorConfig, IndicatorMap, IndicatorValue};
use anyhow::{ensure, Result};
use std::collections::HashSet;

/// The declared form of an indicator's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    Scalar,
    MacdPair,
}

impl OutputShape {
    #[must_use]
    pub const fn matches(self, value: &IndicatorValue) -> bool {
        matches!(
            (self, value),
            (Self::Scalar, IndicatorValue::Scalar(_)) | (Self::MacdPair, IndicatorValue::Macd { .. })
        )
    }
}

pub trait Indicator: Send {
    /// Stable key the value is stored and published under.
    fn name(&self) -> &str;

    fn shape(&self) -> OutputShape;

    /// Feeds one close and returns the new value, or `None` while there is
    /// not enough information.
    fn calculate(&mut self, close: Option<f64>) -> Option<IndicatorValue>;
}

/// Builds an indicator from its configuration.
///
/// # Errors
/// Returns an error if a period is zero.
pub fn build_indicator(config: &IndicatorConfig) -> Result<Box<dyn Indicator>> {
    let indicator: Box<dyn Indicator> = match config {
        IndicatorConfig::Sma { period, name } => Box::new(Sma::with_name(*period, name.clone())?),
        IndicatorConfig::Ema { period, name, seed } => {
            Box::new(Ema::with_options(*period, name.clone(), *seed)?)
        }
        IndicatorConfig::Macd {
            fast,
            slow,
            signal,
            name,
            seed,
        } => Box::new(Macd::with_options(
            *fast,
            *slow,
            *signal,
            name.clone(),
            *seed,
        )?),
    };
    Ok(indicator)
}

/// The indicators of one symbol, all fed the same candle together.
pub struct IndicatorSet {
    indicators: Vec<Box<dyn Indicator>>,
}

impl IndicatorSet {
    /// # Errors
    /// Returns an error if a configuration is invalid or two indicators
    /// resolve to the same name.
    pub fn from_configs(configs: &[IndicatorConfig]) -> Result<Self> {
        let indicators = configs
            .iter()
            .map(build_indicator)
            .collect::<Result<Vec<_>>>()?;
        Self::new(indicators)
    }

    /// # Errors
    /// Returns an error if two indicators share a name.
    pub fn new(indicators: Vec<Box<dyn Indicator>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for indicator in &indicators {
            ensure!(
                seen.insert(indicator.name().to_string()),
                "duplicate indicator name {}",
                indicator.name()
            );
        }
        Ok(Self { indicators })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.indicators.iter().map(|i| i.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    /// Feeds `close` to every indicator. Indicators without a value are left
    /// out of the map; so is any value that does not match its indicator's
    /// declared shape.
    pub fn calculate(&mut self, close: Option<f64>) -> IndicatorMap {
        let mut values = IndicatorMap::new();

        for indicator in &mut self.indicators {
            let Some(value) = indicator.calculate(close) else {
                tracing::trace!(indicator = indicator.name(), "No value yet");
                continue;
            };

            if !indicator.shape().matches(&value) {
                tracing::warn!(
                    indicator = indicator.name(),
                    shape = ?indicator.shape(),
                    ?value,
                    "Indicator produced a value of the wrong shape, skipping"
                );
                continue;
            }

            values.insert(indicator.name().to_string(), value);
        }

        values
    }
}
