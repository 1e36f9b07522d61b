//! Error metrics for evaluating forecasts against held-out actuals

use crate::error::{ForecastError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metrics of one validation block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastMetrics {
    /// Mean Absolute Error
    pub mae: f64,
    /// Root Mean Squared Error
    pub rmse: f64,
    /// Mean Absolute Percentage Error in percent, over non-zero actuals only;
    /// `None` when every actual is zero
    pub mape: Option<f64>,
    /// Points left out of MAPE because the actual was zero
    pub mape_excluded: usize,
    /// Coefficient of determination
    pub r2: f64,
    /// Fraction of steps whose predicted direction of change (relative to
    /// the previous actual) matches the actual direction
    pub directional_accuracy: Option<f64>,
    pub n: usize,
}

fn direction(change: f64) -> i8 {
    if change > 0.0 {
        1
    } else if change < 0.0 {
        -1
    } else {
        0
    }
}

/// Evaluate `predicted` against `actual`.
///
/// `previous` is the last actual before the block, if any; it provides the
/// reference for the first step's direction of change.
pub fn evaluate_forecast(
    actual: &[f64],
    predicted: &[f64],
    previous: Option<f64>,
) -> Result<ForecastMetrics> {
    if actual.len() != predicted.len() || actual.is_empty() {
        return Err(ForecastError::Internal(format!(
            "cannot score {} predictions against {} actuals",
            predicted.len(),
            actual.len()
        )));
    }
    let n = actual.len();
    let nf = n as f64;

    let errors: Vec<f64> = actual.iter().zip(predicted).map(|(a, p)| a - p).collect();
    let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / nf;
    let mse = errors.iter().map(|e| e * e).sum::<f64>() / nf;
    let rmse = mse.sqrt();

    let percentage: Vec<f64> = actual
        .iter()
        .zip(&errors)
        .filter(|(a, _)| **a != 0.0)
        .map(|(a, e)| (e / a).abs() * 100.0)
        .collect();
    let mape_excluded = n - percentage.len();
    let mape = (!percentage.is_empty())
        .then(|| percentage.iter().sum::<f64>() / percentage.len() as f64);

    let mean = actual.iter().sum::<f64>() / nf;
    let ss_total: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
    let ss_residual: f64 = errors.iter().map(|e| e * e).sum();
    let r2 = if ss_total > 0.0 {
        1.0 - ss_residual / ss_total
    } else if ss_residual == 0.0 {
        1.0
    } else {
        0.0
    };

    let references = previous.into_iter().chain(actual.iter().copied());
    let steps: Vec<bool> = references
        .zip(actual.iter().zip(predicted).skip(usize::from(previous.is_none())))
        .map(|(reference, (a, p))| direction(a - reference) == direction(p - reference))
        .collect();
    let directional_accuracy = (!steps.is_empty())
        .then(|| steps.iter().filter(|hit| **hit).count() as f64 / steps.len() as f64);

    let metrics = ForecastMetrics {
        mae,
        rmse,
        mape,
        mape_excluded,
        r2,
        directional_accuracy,
        n,
    };
    if !(mae.is_finite() && rmse.is_finite() && r2.is_finite()) {
        return Err(ForecastError::Internal(format!(
            "non-finite metrics {:?}",
            metrics
        )));
    }
    Ok(metrics)
}

impl fmt::Display for ForecastMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MAE {:.4}, RMSE {:.4}, R2 {:.4}", self.mae, self.rmse, self.r2)?;
        if let Some(mape) = self.mape {
            write!(f, ", MAPE {:.2}%", mape)?;
        }
        if let Some(da) = self.directional_accuracy {
            write!(f, ", direction {:.1}%", da * 100.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_basic_errors() {
        let m = evaluate_forecast(&[1.0, 2.0, 3.0], &[2.0, 2.0, 1.0], None).unwrap();
        assert_abs_diff_eq!(m.mae, 1.0);
        assert_abs_diff_eq!(m.rmse, (5.0f64 / 3.0).sqrt());
        // (100 + 0 + 66.67) / 3
        assert_abs_diff_eq!(m.mape.unwrap(), 500.0 / 9.0, epsilon = 1e-9);
        assert_abs_diff_eq!(m.r2, 1.0 - 5.0 / 2.0);
        assert_eq!(m.n, 3);
    }

    #[test]
    fn test_zero_actuals_are_excluded_from_mape() {
        let m = evaluate_forecast(&[0.0, 10.0], &[1.0, 11.0], None).unwrap();
        assert_eq!(m.mape_excluded, 1);
        assert_abs_diff_eq!(m.mape.unwrap(), 10.0);

        let all_zero = evaluate_forecast(&[0.0, 0.0], &[1.0, 1.0], None).unwrap();
        assert_eq!(all_zero.mape, None);
        assert_eq!(all_zero.mape_excluded, 2);
    }

    #[test]
    fn test_r2_with_constant_actuals() {
        assert_eq!(evaluate_forecast(&[5.0, 5.0], &[5.0, 5.0], None).unwrap().r2, 1.0);
        assert_eq!(evaluate_forecast(&[5.0, 5.0], &[4.0, 6.0], None).unwrap().r2, 0.0);
    }

    #[test]
    fn test_directional_accuracy_uses_previous_actual() {
        // reference 10: actual goes up, down, up; predicted up, up, up
        let m = evaluate_forecast(&[11.0, 9.0, 12.0], &[12.0, 12.0, 13.0], Some(10.0)).unwrap();
        // steps: 10->11 vs 10->12 hit, 11->9 vs 11->12 miss, 9->12 vs 9->13 hit
        assert_abs_diff_eq!(m.directional_accuracy.unwrap(), 2.0 / 3.0);

        let no_reference = evaluate_forecast(&[1.0, 2.0], &[1.0, 3.0], None).unwrap();
        assert_abs_diff_eq!(no_reference.directional_accuracy.unwrap(), 1.0);

        let single = evaluate_forecast(&[1.0], &[1.0], None).unwrap();
        assert_eq!(single.directional_accuracy, None);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(evaluate_forecast(&[1.0], &[1.0, 2.0], None).is_err());
        assert!(evaluate_forecast(&[], &[], None).is_err());
    }
}
