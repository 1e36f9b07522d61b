//! Moving averages
//!
//! - Simple Moving Average (SMA)
//! - Exponential Moving Average (EMA), seeded with the SMA of its first window

use crate::{require_finite, require_period, Indicator, IndicatorError, Result};
use std::collections::VecDeque;

/// Simple Moving Average over a fixed trailing window
#[derive(Debug, Clone)]
pub struct SimpleMovingAverage {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl SimpleMovingAverage {
    /// Create a new SMA with the given window length
    pub fn new(period: usize) -> Result<Self> {
        require_period(period, "SMA")?;
        Ok(Self {
            period,
            window: VecDeque::with_capacity(period + 1),
            sum: 0.0,
        })
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Observations currently inside the window, oldest first
    pub fn window(&self) -> impl Iterator<Item = &f64> {
        self.window.iter()
    }
}

impl Indicator for SimpleMovingAverage {
    type Output = f64;

    fn update(&mut self, value: f64) -> Result<()> {
        require_finite(value)?;
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
        Ok(())
    }

    fn value(&self) -> Result<f64> {
        if self.window.len() < self.period {
            return Err(IndicatorError::InsufficientData(format!(
                "SMA needs {} values, have {}",
                self.period,
                self.window.len()
            )));
        }
        Ok(self.sum / self.period as f64)
    }

    fn warmup(&self) -> usize {
        self.period
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}

/// Exponential Moving Average with multiplier `2 / (period + 1)`
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    period: usize,
    multiplier: f64,
    seed_sum: f64,
    values_seen: usize,
    current: Option<f64>,
}

impl ExponentialMovingAverage {
    /// Create a new EMA with the given period
    pub fn new(period: usize) -> Result<Self> {
        require_period(period, "EMA")?;
        Ok(Self {
            period,
            multiplier: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            values_seen: 0,
            current: None,
        })
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

impl Indicator for ExponentialMovingAverage {
    type Output = f64;

    fn update(&mut self, value: f64) -> Result<()> {
        require_finite(value)?;
        self.values_seen += 1;

        match self.current {
            Some(previous) => {
                self.current = Some((value - previous) * self.multiplier + previous);
            }
            None => {
                self.seed_sum += value;
                if self.values_seen == self.period {
                    self.current = Some(self.seed_sum / self.period as f64);
                }
            }
        }
        Ok(())
    }

    fn value(&self) -> Result<f64> {
        self.current.ok_or_else(|| {
            IndicatorError::InsufficientData(format!(
                "EMA needs {} values, have {}",
                self.period, self.values_seen
            ))
        })
    }

    fn warmup(&self) -> usize {
        self.period
    }

    fn reset(&mut self) {
        self.seed_sum = 0.0;
        self.values_seen = 0;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_sma_slides_window() {
        let mut sma = SimpleMovingAverage::new(3).unwrap();
        assert!(sma.value().is_err());

        sma.update(2.0).unwrap();
        sma.update(4.0).unwrap();
        assert!(sma.value().is_err());

        sma.update(6.0).unwrap();
        assert_abs_diff_eq!(sma.value().unwrap(), 4.0);

        sma.update(8.0).unwrap();
        assert_abs_diff_eq!(sma.value().unwrap(), 6.0);
    }

    #[test]
    fn test_ema_seeds_with_sma() {
        let mut ema = ExponentialMovingAverage::new(3).unwrap();
        ema.update(2.0).unwrap();
        ema.update(4.0).unwrap();
        assert!(ema.value().is_err());

        ema.update(6.0).unwrap();
        assert_abs_diff_eq!(ema.value().unwrap(), 4.0);

        // multiplier = 0.5
        ema.update(8.0).unwrap();
        assert_abs_diff_eq!(ema.value().unwrap(), 6.0);
    }

    #[test]
    fn test_rejects_zero_period_and_nan() {
        assert!(SimpleMovingAverage::new(0).is_err());
        assert!(ExponentialMovingAverage::new(0).is_err());

        let mut sma = SimpleMovingAverage::new(2).unwrap();
        assert!(matches!(
            sma.update(f64::NAN),
            Err(IndicatorError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut ema = ExponentialMovingAverage::new(2).unwrap();
        ema.update(1.0).unwrap();
        ema.update(3.0).unwrap();
        assert!(ema.value().is_ok());
        ema.reset();
        assert!(ema.value().is_err());
    }
}
