//! # Series Math
//!
//! Indicator and statistics primitives for numeric time series.
//!
//! Every indicator is a small state machine fed one observation at a time
//! through the [`Indicator`] trait. The [`series`] module runs an indicator over
//! a whole slice and also hosts the plain descriptive statistics (mean,
//! population standard deviation, z-scores, rolling median) that the forecast
//! engine uses for anomaly detection.
//!
//! ```
//! use series_math::moving_averages::SimpleMovingAverage;
//! use series_math::series;
//!
//! let values = [1.0, 2.0, 3.0, 4.0];
//! let sma = series::run(SimpleMovingAverage::new(2).unwrap(), &values).unwrap();
//! assert_eq!(sma, vec![None, Some(1.5), Some(2.5), Some(3.5)]);
//! ```

use thiserror::Error;

pub mod moving_averages;
pub mod oscillators;
pub mod regression;
pub mod series;
pub mod volatility;

/// Errors raised by indicator and statistics calculations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndicatorError {
    #[error("Insufficient data for calculation: {0}")]
    InsufficientData(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Calculation error: {0}")]
    CalculationError(String),
}

/// Result type for indicator operations
pub type Result<T> = std::result::Result<T, IndicatorError>;

/// A streaming indicator over a single numeric series.
pub trait Indicator {
    /// Value produced once the indicator is warmed up
    type Output;

    /// Feed the next observation
    fn update(&mut self, value: f64) -> Result<()>;

    /// Current value, or `InsufficientData` while warming up
    fn value(&self) -> Result<Self::Output>;

    /// Number of observations needed before `value` succeeds
    fn warmup(&self) -> usize;

    /// Clear all accumulated state
    fn reset(&mut self);
}

pub(crate) fn require_period(period: usize, what: &str) -> Result<()> {
    if period == 0 {
        return Err(IndicatorError::InvalidInput(format!(
            "{} period must be greater than zero",
            what
        )));
    }
    Ok(())
}

pub(crate) fn require_finite(value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(IndicatorError::InvalidInput(format!(
            "Non-finite observation: {}",
            value
        )));
    }
    Ok(())
}
