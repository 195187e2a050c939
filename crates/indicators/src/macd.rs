use crate::ema::Ema;
use crate::{Indicator, OutputShape};
use algo_pipeline_core::{EmaSeed, IndicatorValue};
use anyhow::Result;

/// MACD line (fast EMA - slow EMA) and its signal line (EMA of the MACD
/// line).
#[derive(Debug, Clone)]
pub struct Macd {
    name: String,
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    /// # Errors
    /// Returns an error if any period is zero.
    pub fn new(fast: usize, slow: usize, signal: usize) -> Result<Self> {
        Self::with_options(fast, slow, signal, None, EmaSeed::Zero)
    }

    /// # Errors
    /// Returns an error if any period is zero.
    pub fn with_options(
        fast: usize,
        slow: usize,
        signal: usize,
        name: Option<String>,
        seed: EmaSeed,
    ) -> Result<Self> {
        Ok(Self {
            name: name.unwrap_or_else(|| format!("MACD_{fast}_{slow}_{signal}")),
            fast: Ema::with_options(fast, None, seed)?,
            slow: Ema::with_options(slow, None, seed)?,
            signal: Ema::with_options(signal, None, seed)?,
        })
    }

    /// Returns `(macd, signal)`.
    pub fn update(&mut self, close: Option<f64>) -> Option<(f64, f64)> {
        let close = close.filter(|c| c.is_finite())?;

        let fast = self.fast.update(Some(close));
        let slow = self.slow.update(Some(close));
        let (Some(fast), Some(slow)) = (fast, slow) else {
            return None;
        };

        let macd = fast - slow;
        let signal = self.signal.update(Some(macd))?;
        Some((macd, signal))
    }
}

impl Indicator for Macd {
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> OutputShape {
        OutputShape::MacdPair
    }

    fn calculate(&mut self, close: Option<f64>) -> Option<IndicatorValue> {
        self.update(close)
            .map(|(macd, signal)| IndicatorValue::Macd { macd, signal })
    }
}
