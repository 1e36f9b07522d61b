//! Trend descriptors of a forecast

use crate::error::{ForecastError, Result};
use serde::{Deserialize, Serialize};
use series_math::regression::fit_line;
use series_math::series::population_std_dev;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Upward,
    Downward,
    Sideways,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TrendDirection::Upward => "upward",
            TrendDirection::Downward => "downward",
            TrendDirection::Sideways => "sideways",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendDescriptor {
    pub direction: TrendDirection,
    /// `|slope|` divided by the value range
    pub strength: f64,
    /// Least-squares slope per forecast step
    pub slope: f64,
    /// Change from the last observed value to the last forecast, in percent;
    /// `None` when the last observed value is zero
    pub change_percent: Option<f64>,
    /// Standard deviation of step-to-step changes across the forecast
    pub volatility: f64,
    /// Fit quality of the slope, absent for a flat forecast
    pub r_squared: Option<f64>,
}

/// Describe the direction of `forecast`.
///
/// The value range is taken from `history` (falling back to the forecast's
/// own range when the history is flat). The trend is sideways when the
/// fitted line moves by no more than `sideways_band` of that range over the
/// forecast.
pub fn describe_trend(
    history: &[f64],
    forecast: &[f64],
    sideways_band: f64,
) -> Result<TrendDescriptor> {
    let last_observed = *history.last().ok_or_else(|| {
        ForecastError::Internal("trend needs at least one observed value".to_string())
    })?;
    if forecast.is_empty() {
        return Err(ForecastError::Internal(
            "trend needs at least one forecast value".to_string(),
        ));
    }

    // a single step is measured against the last observation
    let anchored: Vec<f64>;
    let fitted_over: &[f64] = if forecast.len() == 1 {
        anchored = vec![last_observed, forecast[0]];
        &anchored
    } else {
        forecast
    };
    let line = fit_line(fitted_over)?;

    let range = match value_range(history) {
        r if r > 0.0 => r,
        _ => value_range(forecast),
    };
    let travel = line.slope.abs() * forecast.len() as f64;
    let (direction, strength) = if range <= 0.0 {
        (TrendDirection::Sideways, 0.0)
    } else if travel <= sideways_band * range {
        (TrendDirection::Sideways, line.slope.abs() / range)
    } else if line.slope > 0.0 {
        (TrendDirection::Upward, line.slope.abs() / range)
    } else {
        (TrendDirection::Downward, line.slope.abs() / range)
    };

    let last_forecast = forecast[forecast.len() - 1];
    let change_percent = (last_observed != 0.0)
        .then(|| (last_forecast - last_observed) / last_observed.abs() * 100.0);

    let mut path = Vec::with_capacity(forecast.len() + 1);
    path.push(last_observed);
    path.extend_from_slice(forecast);
    let changes: Vec<f64> = path.windows(2).map(|w| w[1] - w[0]).collect();
    let volatility = population_std_dev(&changes).unwrap_or(0.0);

    Ok(TrendDescriptor {
        direction,
        strength,
        slope: line.slope,
        change_percent,
        volatility,
        r_squared: line.r_squared,
    })
}

fn value_range(values: &[f64]) -> f64 {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    if lo.is_finite() && hi.is_finite() {
        hi - lo
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rstest::rstest;

    #[rstest]
    #[case(&[10.0, 12.0, 14.0, 16.0], TrendDirection::Upward)]
    #[case(&[10.0, 8.0, 6.0, 4.0], TrendDirection::Downward)]
    #[case(&[10.0, 10.001, 10.0, 10.001], TrendDirection::Sideways)]
    fn test_direction(#[case] forecast: &[f64], #[case] expected: TrendDirection) {
        let history: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let trend = describe_trend(&history, forecast, 0.02).unwrap();
        assert_eq!(trend.direction, expected);
    }

    #[test]
    fn test_descriptor_values() {
        let history = [0.0, 50.0, 100.0];
        let forecast = [102.0, 104.0, 106.0];
        let trend = describe_trend(&history, &forecast, 0.02).unwrap();
        assert_abs_diff_eq!(trend.slope, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(trend.strength, 0.02, epsilon = 1e-12);
        assert_abs_diff_eq!(trend.change_percent.unwrap(), 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(trend.volatility, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_single_step_uses_last_observation() {
        let trend = describe_trend(&[0.0, 10.0], &[5.0], 0.02).unwrap();
        assert_eq!(trend.direction, TrendDirection::Downward);
        assert_abs_diff_eq!(trend.slope, -5.0);
    }

    #[test]
    fn test_flat_everything_is_sideways() {
        let trend = describe_trend(&[3.0, 3.0], &[3.0, 3.0, 3.0], 0.02).unwrap();
        assert_eq!(trend.direction, TrendDirection::Sideways);
        assert_eq!(trend.strength, 0.0);
    }

    #[test]
    fn test_zero_last_observation_has_no_change_percent() {
        let trend = describe_trend(&[1.0, 0.0], &[1.0, 2.0], 0.02).unwrap();
        assert_eq!(trend.change_percent, None);
    }
}
