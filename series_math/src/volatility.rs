//! Dispersion indicators
//!
//! - Bollinger Bands
//! - Rolling population standard deviation

use crate::moving_averages::SimpleMovingAverage;
use crate::{require_finite, require_period, Indicator, IndicatorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Rolling population standard deviation
#[derive(Debug, Clone)]
pub struct StandardDeviation {
    period: usize,
    window: VecDeque<f64>,
}

impl StandardDeviation {
    pub fn new(period: usize) -> Result<Self> {
        require_period(period, "Standard deviation")?;
        Ok(Self {
            period,
            window: VecDeque::with_capacity(period + 1),
        })
    }
}

impl Indicator for StandardDeviation {
    type Output = f64;

    fn update(&mut self, value: f64) -> Result<()> {
        require_finite(value)?;
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        Ok(())
    }

    fn value(&self) -> Result<f64> {
        if self.window.len() < self.period {
            return Err(IndicatorError::InsufficientData(format!(
                "Standard deviation needs {} values, have {}",
                self.period,
                self.window.len()
            )));
        }
        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self.window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Ok(variance.sqrt())
    }

    fn warmup(&self) -> usize {
        self.period
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

/// One Bollinger Bands reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerOutput {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// `(upper - lower) / |middle| * 100`, absent when the middle band is zero
    pub bandwidth: Option<f64>,
    /// Position of the latest observation between the bands (0 = lower, 1 = upper),
    /// absent when the bands coincide
    pub percent_b: Option<f64>,
}

/// Bollinger Bands: SMA middle band with bands at `k` standard deviations
#[derive(Debug, Clone)]
pub struct BollingerBands {
    std_dev_multiplier: f64,
    sma: SimpleMovingAverage,
    std_dev: StandardDeviation,
    last: Option<f64>,
}

impl BollingerBands {
    pub fn new(period: usize, std_dev_multiplier: f64) -> Result<Self> {
        if std_dev_multiplier.is_nan() || std_dev_multiplier <= 0.0 {
            return Err(IndicatorError::InvalidInput(
                "Standard deviation multiplier must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            std_dev_multiplier,
            sma: SimpleMovingAverage::new(period)?,
            std_dev: StandardDeviation::new(period)?,
            last: None,
        })
    }

    pub fn std_dev_multiplier(&self) -> f64 {
        self.std_dev_multiplier
    }
}

impl Indicator for BollingerBands {
    type Output = BollingerOutput;

    fn update(&mut self, value: f64) -> Result<()> {
        self.sma.update(value)?;
        self.std_dev.update(value)?;
        self.last = Some(value);
        Ok(())
    }

    fn value(&self) -> Result<BollingerOutput> {
        let middle = self.sma.value()?;
        let spread = self.std_dev.value()? * self.std_dev_multiplier;
        let upper = middle + spread;
        let lower = middle - spread;

        let bandwidth = (middle != 0.0).then(|| (upper - lower) / middle.abs() * 100.0);
        let percent_b = match self.last {
            Some(last) if upper > lower => Some((last - lower) / (upper - lower)),
            _ => None,
        };

        Ok(BollingerOutput {
            upper,
            middle,
            lower,
            bandwidth,
            percent_b,
        })
    }

    fn warmup(&self) -> usize {
        self.sma.period()
    }

    fn reset(&mut self) {
        self.sma.reset();
        self.std_dev.reset();
        self.last = None;
    }
}
