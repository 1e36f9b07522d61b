//! Ordinary least squares on standardized features, with optional ridge penalty

use super::{
    normalize_importance, roll_forward, Algorithm, FittedForecastModel, ForecastContext,
    ForecastModel, Standardizer, Uncertainty,
};
use crate::error::{ForecastError, Result};
use crate::features::FeatureMatrix;
use crate::request::{Hyperparameters, ParamValue};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    /// L2 penalty on the standardized coefficients
    pub ridge: f64,
}

impl Default for LinearModel {
    fn default() -> Self {
        Self { ridge: 0.0 }
    }
}

impl LinearModel {
    pub fn from_params(params: &Hyperparameters) -> Result<Self> {
        Ok(Self {
            ridge: params.non_negative_f64("ridge", 0.0)?,
        })
    }
}

/// Solve the symmetric positive semi-definite system `a x = b`.
///
/// Cholesky first; a rank-deficient system falls back to the SVD
/// minimum-norm solution.
pub(crate) fn solve_normal_equations(
    a: DMatrix<f64>,
    b: DVector<f64>,
    backend: Algorithm,
) -> Result<DVector<f64>> {
    if let Some(chol) = a.clone().cholesky() {
        let diag = chol.l_dirty().diagonal();
        let max = diag.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let min = diag.iter().fold(f64::INFINITY, |m, v| m.min(v.abs()));
        // squared pivot ratio approximates the reciprocal condition number
        if min * min > 1e-12 * max * max {
            let x = chol.solve(&b);
            if x.iter().all(|v| v.is_finite()) {
                return Ok(x);
            }
        }
    }
    debug!("{}: normal equations not positive definite, using SVD", backend);
    let x = a
        .svd(true, true)
        .solve(&b, 1e-10)
        .map_err(|e| ForecastError::fit(backend.id(), format!("singular matrix: {}", e)))?;
    if x.iter().all(|v| v.is_finite()) {
        Ok(x)
    } else {
        Err(ForecastError::fit(backend.id(), "singular matrix"))
    }
}

impl ForecastModel for LinearModel {
    type Fitted = FittedLinear;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Linear
    }

    fn params(&self) -> Hyperparameters {
        Hyperparameters::new().with("ridge", ParamValue::Float(self.ridge))
    }

    fn fit(&self, matrix: &FeatureMatrix, _seed: u64) -> Result<FittedLinear> {
        let n = matrix.len();
        if n < 2 {
            return Err(ForecastError::fit(
                Algorithm::Linear.id(),
                format!("need at least 2 rows, got {}", n),
            ));
        }
        let p = matrix.n_features();
        let scaler = Standardizer::fit(&matrix.rows, p);
        let active: Vec<usize> = (0..p).filter(|j| !scaler.is_constant(*j)).collect();
        let y_mean = matrix.target.iter().sum::<f64>() / n as f64;

        let mut coefficients = vec![0.0; p];
        if !active.is_empty() {
            let z = DMatrix::from_fn(n, active.len(), |i, k| {
                let j = active[k];
                (matrix.rows[i][j] - scaler.means[j]) / scaler.scales[j]
            });
            let y = DVector::from_iterator(n, matrix.target.iter().map(|v| v - y_mean));
            let mut gram = z.transpose() * &z;
            for k in 0..active.len() {
                gram[(k, k)] += self.ridge;
            }
            let rhs = z.transpose() * y;
            let beta = solve_normal_equations(gram, rhs, Algorithm::Linear)?;
            for (k, j) in active.iter().enumerate() {
                coefficients[*j] = beta[k];
            }
        }

        let mut fitted = FittedLinear {
            intercept: y_mean,
            coefficients,
            scaler,
            residual_std: 0.0,
        };
        let residuals: Vec<f64> = matrix
            .rows
            .iter()
            .zip(&matrix.target)
            .map(|(row, y)| y - fitted.predict_row(row))
            .collect();
        let ssr: f64 = residuals.iter().map(|r| r * r).sum();
        let dof = n.saturating_sub(active.len() + 1).max(1);
        fitted.residual_std = (ssr / dof as f64).sqrt();
        if !fitted.residual_std.is_finite() {
            return Err(ForecastError::fit(
                Algorithm::Linear.id(),
                "non-finite residual variance",
            ));
        }
        debug!(
            "linear fit: {} rows, {} active features, residual std {:.4}",
            n,
            active.len(),
            fitted.residual_std
        );
        Ok(fitted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedLinear {
    pub intercept: f64,
    /// Coefficients on the standardized features; zero for constant columns
    pub coefficients: Vec<f64>,
    scaler: Standardizer,
    pub residual_std: f64,
}

impl FittedLinear {
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        self.intercept
            + self
                .scaler
                .transform(row)
                .iter()
                .zip(&self.coefficients)
                .map(|(x, b)| x * b)
                .sum::<f64>()
    }

    /// Coefficients and intercept in the original feature units
    pub fn raw_coefficients(&self) -> (f64, Vec<f64>) {
        let slopes: Vec<f64> = self
            .coefficients
            .iter()
            .zip(&self.scaler.scales)
            .map(|(b, s)| b / s)
            .collect();
        let intercept = self.intercept
            - slopes
                .iter()
                .zip(&self.scaler.means)
                .map(|(b, m)| b * m)
                .sum::<f64>();
        (intercept, slopes)
    }
}

impl FittedForecastModel for FittedLinear {
    fn predict_horizon(&self, ctx: &ForecastContext<'_>) -> Result<Vec<f64>> {
        roll_forward(ctx, Algorithm::Linear, |row, _| Ok(self.predict_row(row)))
    }

    fn fitted_values(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
        Ok(matrix.rows.iter().map(|r| self.predict_row(r)).collect())
    }

    fn estimate_uncertainty(&self, horizon: usize) -> Result<Uncertainty> {
        Ok(Uncertainty::gaussian_sqrt_steps(self.residual_std, horizon))
    }

    fn feature_importance(&self) -> Option<Vec<f64>> {
        Some(normalize_importance(
            self.coefficients.iter().map(|b| b.abs()).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureOptions;
    use crate::models::test_support::matrix;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_recovers_exact_line() {
        let m = matrix(30, |i| 2.0 * i as f64 + 50.0, FeatureOptions::default());
        let fitted = LinearModel::default().fit(&m, 0).unwrap();
        let (intercept, slopes) = fitted.raw_coefficients();
        assert_abs_diff_eq!(intercept, 50.0, epsilon = 1e-8);
        assert_abs_diff_eq!(slopes[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fitted.residual_std, 0.0, epsilon = 1e-8);
        assert_eq!(fitted.feature_importance(), Some(vec![1.0]));
    }

    #[test]
    fn test_constant_feature_gets_zero_weight() {
        let options = FeatureOptions {
            calendar: true,
            ..Default::default()
        };
        // within January 2024 the month and year columns are constant
        let m = matrix(20, |i| i as f64, options);
        let fitted = LinearModel::default().fit(&m, 0).unwrap();
        let month = m.feature_names.iter().position(|n| n == "month").unwrap();
        assert_eq!(fitted.coefficients[month], 0.0);
        let importance = fitted.feature_importance().unwrap();
        assert_abs_diff_eq!(importance.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_forecast_continues_trend_with_covariates() {
        let m = matrix(40, |i| 3.0 * i as f64 - 1.0, FeatureOptions::default());
        let fitted = LinearModel::default().fit(&m, 0).unwrap();
        let last = m.last_timestamp().unwrap();
        let timestamps: Vec<_> = (1..=3).map(|d| last + chrono::Duration::days(d)).collect();
        let covariates = vec![vec![40.0], vec![41.0], vec![42.0]];
        let ctx = ForecastContext {
            history: &m,
            timestamps: &timestamps,
            covariates: &covariates,
        };
        let forecast = fitted.predict_horizon(&ctx).unwrap();
        assert_abs_diff_eq!(forecast[0], 119.0, epsilon = 1e-8);
        assert_abs_diff_eq!(forecast[2], 125.0, epsilon = 1e-8);
    }

    #[test]
    fn test_ridge_shrinks_coefficients() {
        let m = matrix(30, |i| i as f64, FeatureOptions::default());
        let plain = LinearModel::default().fit(&m, 0).unwrap();
        let ridge = LinearModel { ridge: 10.0 }.fit(&m, 0).unwrap();
        assert!(ridge.coefficients[0].abs() < plain.coefficients[0].abs());
    }

    #[test]
    fn test_rejects_single_row() {
        let m = matrix(1, |_| 1.0, FeatureOptions::default());
        assert!(matches!(
            LinearModel::default().fit(&m, 0),
            Err(ForecastError::BackendFit { .. })
        ));
    }
}
