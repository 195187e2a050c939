use crate::Strategy;
use algo_pipeline_core::config::{DEFAULT_MACD_INDICATOR, DEFAULT_MACD_STRATEGY_NAME};
use algo_pipeline_core::{EnrichedCandle, IndicatorValue, Signal};
use anyhow::{bail, Result};
use std::cmp::Ordering;

/// MACD/signal-line crossover.
///
/// Remembers the last non-HOLD signal it emitted and only signals again when
/// the regime flips, so a MACD that stays above its signal line produces a
/// single BUY followed by HOLDs.
#[derive(Debug, Clone)]
pub struct SimpleMacdStrategy {
    name: String,
    indicator: String,
    last_signal: Signal,
}

impl SimpleMacdStrategy {
    #[must_use]
    pub fn new(name: Option<String>, indicator: Option<String>) -> Self {
        Self {
            name: name.unwrap_or_else(|| DEFAULT_MACD_STRATEGY_NAME.to_string()),
            indicator: indicator.unwrap_or_else(|| DEFAULT_MACD_INDICATOR.to_string()),
            last_signal: Signal::Hold,
        }
    }

    #[must_use]
    pub const fn last_signal(&self) -> Signal {
        self.last_signal
    }

    /// Applies one `(macd, signal)` observation to the crossover state.
    pub fn on_pair(&mut self, pair: Option<(f64, f64)>) -> Signal {
        let Some((macd, signal)) = pair else {
            return Signal::Hold;
        };

        let candidate = match macd.partial_cmp(&signal) {
            Some(Ordering::Greater) => Signal::Buy,
            Some(Ordering::Less) => Signal::Sell,
            Some(Ordering::Equal) | None => return Signal::Hold,
        };

        // Only emit on crossover (regime change)
        if candidate == self.last_signal {
            return Signal::Hold;
        }

        self.last_signal = candidate;
        candidate
    }
}

impl Default for SimpleMacdStrategy {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl Strategy for SimpleMacdStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, candle: &EnrichedCandle) -> Result<Signal> {
        let pair = match candle.indicators.get(&self.indicator) {
            None => None,
            Some(IndicatorValue::Macd { macd, signal }) => Some((*macd, *signal)),
            Some(IndicatorValue::Scalar(_)) => {
                bail!("Indicator {} is not a MACD pair", self.indicator)
            }
        };

        Ok(self.on_pair(pair))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algo_pipeline_core::{Candle, IndicatorMap};
    use chrono::{TimeZone, Utc};

    fn enriched(indicators: IndicatorMap) -> EnrichedCandle {
        EnrichedCandle {
            candle: Candle {
                symbol: "BTC/USD".to_string(),
                interval_begin: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
            },
            indicators,
        }
    }

    fn macd(macd: f64, signal: f64) -> EnrichedCandle {
        let mut indicators = IndicatorMap::new();
        indicators.insert(
            DEFAULT_MACD_INDICATOR.to_string(),
            IndicatorValue::Macd { macd, signal },
        );
        enriched(indicators)
    }

    #[test]
    fn test_repeat_regime_collapses_to_hold() {
        let mut strategy = SimpleMacdStrategy::default();
        let signals: Vec<Signal> = [(1.0, 1.0), (10.0, 4.0), (10.0, 4.0), (4.0, 10.0)]
            .into_iter()
            .map(|(m, s)| strategy.evaluate(&macd(m, s)).unwrap())
            .collect();

        assert_eq!(
            signals,
            vec![Signal::Hold, Signal::Buy, Signal::Hold, Signal::Sell]
        );
        assert_eq!(strategy.last_signal(), Signal::Sell);
    }

    #[test]
    fn test_equal_lines_do_not_reset_state() {
        let mut strategy = SimpleMacdStrategy::default();
        assert_eq!(strategy.on_pair(Some((2.0, 1.0))), Signal::Buy);
        assert_eq!(strategy.on_pair(Some((1.0, 1.0))), Signal::Hold);
        assert_eq!(strategy.on_pair(Some((2.0, 1.0))), Signal::Hold);
        assert_eq!(strategy.on_pair(Some((f64::NAN, 1.0))), Signal::Hold);
    }

    #[test]
    fn test_missing_indicator_is_hold() {
        let mut strategy = SimpleMacdStrategy::default();
        let signal = strategy.evaluate(&enriched(IndicatorMap::new())).unwrap();
        assert_eq!(signal, Signal::Hold);
        assert_eq!(strategy.last_signal(), Signal::Hold);
    }

    #[test]
    fn test_scalar_under_macd_key_is_an_error() {
        let mut strategy = SimpleMacdStrategy::default();
        let mut indicators = IndicatorMap::new();
        indicators.insert(
            DEFAULT_MACD_INDICATOR.to_string(),
            IndicatorValue::Scalar(3.0),
        );
        assert!(strategy.evaluate(&enriched(indicators)).is_err());
    }

    #[test]
    fn test_custom_names() {
        let mut strategy =
            SimpleMacdStrategy::new(Some("fast".to_string()), Some("MACD_5_10_3".to_string()));
        assert_eq!(strategy.name(), "fast");

        let mut indicators = IndicatorMap::new();
        indicators.insert(
            "MACD_5_10_3".to_string(),
            IndicatorValue::Macd {
                macd: -1.0,
                signal: 0.0,
            },
        );
        assert_eq!(strategy.evaluate(&enriched(indicators)).unwrap(), Signal::Sell);
    }
}
