//! Least-squares line fitting against the observation index

use crate::{IndicatorError, Result};
use serde::{Deserialize, Serialize};

/// Fitted line `y = intercept + slope * x` with `x = 0, 1, 2, ...`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination, absent when the values have no variance
    pub r_squared: Option<f64>,
}

impl LineFit {
    /// Value of the line at index `x`
    pub fn at(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Fit a line through `values` indexed by position
pub fn fit_line<'a, I>(values: I) -> Result<LineFit>
where
    I: IntoIterator<Item = &'a f64>,
    I::IntoIter: Clone,
{
    let iter = values.into_iter();
    let n = iter.clone().count();
    if n < 2 {
        return Err(IndicatorError::InsufficientData(format!(
            "Line fit needs at least 2 points, have {}",
            n
        )));
    }

    let nf = n as f64;
    let x_mean = (nf - 1.0) / 2.0;
    let y_mean = iter.clone().sum::<f64>() / nf;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (i, &y) in iter.clone().enumerate() {
        let dx = i as f64 - x_mean;
        sxy += dx * (y - y_mean);
        sxx += dx * dx;
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    if !slope.is_finite() || !intercept.is_finite() {
        return Err(IndicatorError::CalculationError(
            "Line fit produced non-finite coefficients".to_string(),
        ));
    }

    let mut ss_total = 0.0;
    let mut ss_residual = 0.0;
    for (i, &y) in iter.enumerate() {
        ss_total += (y - y_mean).powi(2);
        ss_residual += (y - (intercept + slope * i as f64)).powi(2);
    }
    let r_squared = (ss_total > 0.0).then(|| 1.0 - ss_residual / ss_total);

    Ok(LineFit {
        slope,
        intercept,
        r_squared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_fit_line_exact() {
        let fit = fit_line(&[10.0, 20.0, 30.0]).unwrap();
        assert_abs_diff_eq!(fit.slope, 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.intercept, 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.r_squared.unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_flat_line_has_no_r_squared() {
        let fit = fit_line(&[3.0, 3.0, 3.0]).unwrap();
        assert_eq!(fit.slope, 0.0);
        assert_eq!(fit.r_squared, None);
    }

    #[test]
    fn test_needs_two_points() {
        assert!(fit_line(&[1.0]).is_err());
    }
}
