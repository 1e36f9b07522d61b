//! Oscillators
//!
//! - Relative Strength Index (RSI) with Wilder smoothing
//! - Moving Average Convergence Divergence (MACD)

use crate::moving_averages::ExponentialMovingAverage;
use crate::{require_finite, require_period, Indicator, IndicatorError, Result};
use serde::{Deserialize, Serialize};

/// Relative Strength Index (0-100)
#[derive(Debug, Clone)]
pub struct RelativeStrengthIndex {
    period: usize,
    previous: Option<f64>,
    changes_seen: usize,
    gain_sum: f64,
    loss_sum: f64,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
}

impl RelativeStrengthIndex {
    /// Create a new RSI; the first value needs `period + 1` observations
    pub fn new(period: usize) -> Result<Self> {
        require_period(period, "RSI")?;
        Ok(Self {
            period,
            previous: None,
            changes_seen: 0,
            gain_sum: 0.0,
            loss_sum: 0.0,
            avg_gain: None,
            avg_loss: None,
        })
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

impl Indicator for RelativeStrengthIndex {
    type Output = f64;

    fn update(&mut self, value: f64) -> Result<()> {
        require_finite(value)?;

        if let Some(previous) = self.previous {
            let change = value - previous;
            let gain = change.max(0.0);
            let loss = (-change).max(0.0);
            self.changes_seen += 1;

            match (self.avg_gain, self.avg_loss) {
                (Some(avg_gain), Some(avg_loss)) => {
                    let n = self.period as f64;
                    self.avg_gain = Some((avg_gain * (n - 1.0) + gain) / n);
                    self.avg_loss = Some((avg_loss * (n - 1.0) + loss) / n);
                }
                _ => {
                    self.gain_sum += gain;
                    self.loss_sum += loss;
                    if self.changes_seen == self.period {
                        self.avg_gain = Some(self.gain_sum / self.period as f64);
                        self.avg_loss = Some(self.loss_sum / self.period as f64);
                    }
                }
            }
        }

        self.previous = Some(value);
        Ok(())
    }

    fn value(&self) -> Result<f64> {
        match (self.avg_gain, self.avg_loss) {
            (Some(avg_gain), Some(avg_loss)) => {
                if avg_loss == 0.0 {
                    // flat series reads as neutral, pure gains as fully overbought
                    return Ok(if avg_gain == 0.0 { 50.0 } else { 100.0 });
                }
                let rs = avg_gain / avg_loss;
                Ok(100.0 - 100.0 / (1.0 + rs))
            }
            _ => Err(IndicatorError::InsufficientData(format!(
                "RSI needs {} values, have {}",
                self.period + 1,
                self.changes_seen + usize::from(self.previous.is_some())
            ))),
        }
    }

    fn warmup(&self) -> usize {
        self.period + 1
    }

    fn reset(&mut self) {
        self.previous = None;
        self.changes_seen = 0;
        self.gain_sum = 0.0;
        self.loss_sum = 0.0;
        self.avg_gain = None;
        self.avg_loss = None;
    }
}

/// One MACD reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdOutput {
    /// Fast EMA minus slow EMA
    pub macd: f64,
    /// EMA of the MACD line
    pub signal: f64,
    /// MACD minus signal
    pub histogram: f64,
}

/// Moving Average Convergence Divergence
#[derive(Debug, Clone)]
pub struct Macd {
    fast: ExponentialMovingAverage,
    slow: ExponentialMovingAverage,
    signal: ExponentialMovingAverage,
}

impl Macd {
    /// Create a new MACD; `fast_period` must be shorter than `slow_period`
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Result<Self> {
        if fast_period >= slow_period {
            return Err(IndicatorError::InvalidInput(format!(
                "MACD fast period ({}) must be smaller than slow period ({})",
                fast_period, slow_period
            )));
        }
        Ok(Self {
            fast: ExponentialMovingAverage::new(fast_period)?,
            slow: ExponentialMovingAverage::new(slow_period)?,
            signal: ExponentialMovingAverage::new(signal_period)?,
        })
    }

    /// MACD line alone, available before the signal line warms up
    pub fn macd_line(&self) -> Result<f64> {
        Ok(self.fast.value()? - self.slow.value()?)
    }
}

impl Indicator for Macd {
    type Output = MacdOutput;

    fn update(&mut self, value: f64) -> Result<()> {
        self.fast.update(value)?;
        self.slow.update(value)?;
        if let Ok(line) = self.macd_line() {
            self.signal.update(line)?;
        }
        Ok(())
    }

    fn value(&self) -> Result<MacdOutput> {
        let macd = self.macd_line()?;
        let signal = self.signal.value().map_err(|_| {
            IndicatorError::InsufficientData(format!(
                "MACD signal line needs {} values",
                self.warmup()
            ))
        })?;
        Ok(MacdOutput {
            macd,
            signal,
            histogram: macd - signal,
        })
    }

    fn warmup(&self) -> usize {
        self.slow.period() + self.signal.period() - 1
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_rsi_falls_on_down_move() {
        let mut rsi = RelativeStrengthIndex::new(3).unwrap();
        for price in [10.0, 10.5, 11.0] {
            rsi.update(price).unwrap();
        }
        assert!(rsi.value().is_err());

        rsi.update(10.5).unwrap();
        let first = rsi.value().unwrap();
        assert!((0.0..=100.0).contains(&first));

        rsi.update(10.0).unwrap();
        assert!(rsi.value().unwrap() < first);
    }

    #[test]
    fn test_rsi_extremes() {
        let mut rising = RelativeStrengthIndex::new(2).unwrap();
        let mut flat = RelativeStrengthIndex::new(2).unwrap();
        for i in 0..5 {
            rising.update(i as f64).unwrap();
            flat.update(1.0).unwrap();
        }
        assert_abs_diff_eq!(rising.value().unwrap(), 100.0);
        assert_abs_diff_eq!(flat.value().unwrap(), 50.0);
    }

    #[test]
    fn test_macd_positive_in_uptrend() {
        let mut macd = Macd::new(3, 6, 2).unwrap();
        assert_eq!(macd.warmup(), 7);
        for i in 0..12 {
            macd.update(100.0 + i as f64 * 2.0).unwrap();
        }
        let out = macd.value().unwrap();
        assert!(out.macd > 0.0);
        assert_abs_diff_eq!(out.histogram, out.macd - out.signal);
    }

    #[test]
    fn test_macd_rejects_inverted_periods() {
        assert!(Macd::new(26, 12, 9).is_err());
    }
}
