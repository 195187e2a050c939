use crate::{Indicator, OutputShape};
use algo_pipeline_core::IndicatorValue;
use anyhow::{ensure, Result};
use std::collections::VecDeque;

/// Simple moving average over the last `period` closes.
///
/// Keeps a FIFO window and a running sum; yields nothing until the window
/// is full.
#[derive(Debug, Clone)]
pub struct Sma {
    name: String,
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl Sma {
    /// # Errors
    /// Returns an error if `period` is zero.
    pub fn new(period: usize) -> Result<Self> {
        Self::with_name(period, None)
    }

    /// # Errors
    /// Returns an error if `period` is zero.
    pub fn with_name(period: usize, name: Option<String>) -> Result<Self> {
        ensure!(period > 0, "SMA period must be > 0");
        Ok(Self {
            name: name.unwrap_or_else(|| format!("SMA_{period}")),
            period,
            window: VecDeque::with_capacity(period + 1),
            sum: 0.0,
        })
    }

    pub fn update(&mut self, close: Option<f64>) -> Option<f64> {
        let close = close.filter(|c| c.is_finite())?;

        self.window.push_back(close);
        self.sum += close;

        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }

        if self.window.len() < self.period {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        Some(self.sum / self.period as f64)
    }
}

impl Indicator for Sma {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_warms_up_then_slides() {
        let mut sma = Sma::new(3).unwrap();

        assert_eq!(sma.update(Some(10.0)), None);
        assert_eq!(sma.update(Some(12.0)), None);
        assert_eq!(sma.update(Some(14.0)), Some(12.0));
        assert_eq!(sma.update(Some(16.0)), Some(14.0));
    }

    #[test]
    fn test_missing_close_is_no_value_and_leaves_state() {
        let mut sma = Sma::new(2).unwrap();
        assert_eq!(sma.update(Some(4.0)), None);
        assert_eq!(sma.update(None), None);
        assert_eq!(sma.update(Some(f64::NAN)), None);
        assert_eq!(sma.update(Some(6.0)), Some(5.0));
    }

    #[test]
    fn test_matches_window_mean_over_long_sequence() {
        let mut sma = Sma::new(5).unwrap();
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + f64::from(i % 17) * 0.25).collect();

        for (i, close) in closes.iter().enumerate() {
            let value = sma.update(Some(*close));
            if i < 4 {
                assert_eq!(value, None);
            } else {
                let expected: f64 = closes[i - 4..=i].iter().sum::<f64>() / 5.0;
                assert!((value.unwrap() - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_name_and_zero_period() {
        assert_eq!(Sma::new(3).unwrap().name(), "SMA_3");
        assert_eq!(
            Sma::with_name(3, Some("fast".to_string())).unwrap().name(),
            "fast"
        );
        assert!(Sma::new(0).is_err());
    }

    #[test]
    fn test_calculate_yields_scalar() {
        let mut sma = Sma::new(1).unwrap();
        assert_eq!(sma.shape(), OutputShape::Scalar);
        assert_eq!(sma.calculate(Some(7.0)), Some(IndicatorValue::Scalar(7.0)));
    }
}
