use crate::{Indicator, OutputShape};
use algo_pipeline_core::{EmaSeed, IndicatorValue};
use anyhow::{ensure, Result};

/// Exponential moving average.
///
/// `alpha = 2 / (period + 1)` and `ema = close * alpha + prev * (1 - alpha)`.
/// With [`EmaSeed::Zero`] `prev` starts at 0, so the first outputs lean
/// toward zero; [`EmaSeed::FirstClose`] starts from the first close instead.
/// Either way a value is produced from the very first close.
#[derive(Debug, Clone)]
pub struct Ema {
    name: String,
    alpha: f64,
    seed: EmaSeed,
    last: Option<f64>,
}

impl Ema {
    /// # Errors
    /// Returns an error if `period` is zero.
    pub fn new(period: usize) -> Result<Self> {
        Self::with_options(period, None, EmaSeed::Zero)
    }

    /// # Errors
    /// Returns an error if `period` is zero.
    pub fn with_options(period: usize, name: Option<String>, seed: EmaSeed) -> Result<Self> {
        ensure!(period > 0, "EMA period must be > 0");
        #[allow(clippy::cast_precision_loss)]
        let alpha = 2.0 / (period as f64 + 1.0);
        Ok(Self {
            name: name.unwrap_or_else(|| format!("EMA_{period}")),
            alpha,
            seed,
            last: None,
        })
    }

    pub fn update(&mut self, close: Option<f64>) -> Option<f64> {
        let close = close.filter(|c| c.is_finite())?;

        let prev = match (self.last, self.seed) {
            (Some(prev), _) => prev,
            (None, EmaSeed::Zero) => 0.0,
            (None, EmaSeed::FirstClose) => close,
        };

        let ema = close * self.alpha + prev * (1.0 - self.alpha);
        self.last = Some(ema);
        Some(ema)
    }
}

impl Indicator for Ema {
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> OutputShape {
        OutputShape::Scalar
    }

    fn calculate(&mut self, close: Option<f64>) -> Option<IndicatorValue> {
        self.update(close).map(IndicatorValue::Scalar)
    }
}
