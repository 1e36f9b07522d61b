//! Additive trend plus Fourier seasonality, fitted by least squares
//!
//! `y(t) = a + b t + weekly(t) + yearly(t)` with `t` in days since the first
//! training timestamp. Only the timestamps are used, so forecasting needs
//! no covariates.

use super::linear::solve_normal_equations;
use super::{Algorithm, FittedForecastModel, ForecastContext, ForecastModel, Uncertainty};
use crate::error::{ForecastError, Result};
use crate::features::FeatureMatrix;
use crate::request::{Hyperparameters, ParamValue};
use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use tracing::debug;

const SECONDS_PER_DAY: f64 = 86_400.0;
const WEEK_DAYS: f64 = 7.0;
const YEAR_DAYS: f64 = 365.25;

#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionModel {
    pub weekly_order: usize,
    pub yearly_order: usize,
    /// `None` enables the seasonality when the data span supports it
    pub weekly_seasonality: Option<bool>,
    pub yearly_seasonality: Option<bool>,
}

impl Default for DecompositionModel {
    fn default() -> Self {
        Self {
            weekly_order: 3,
            yearly_order: 6,
            weekly_seasonality: None,
            yearly_seasonality: None,
        }
    }
}

fn optional_bool(params: &Hyperparameters, key: &str) -> Result<Option<bool>> {
    match params.get(key) {
        None | Some(ParamValue::Null) => Ok(None),
        Some(ParamValue::Text(s)) if s.eq_ignore_ascii_case("auto") => Ok(None),
        Some(_) => params.bool(key, false).map(Some),
    }
}

impl DecompositionModel {
    pub fn from_params(params: &Hyperparameters) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            weekly_order: params.positive_usize("weekly_order", d.weekly_order)?,
            yearly_order: params.positive_usize("yearly_order", d.yearly_order)?,
            weekly_seasonality: optional_bool(params, "weekly_seasonality")?,
            yearly_seasonality: optional_bool(params, "yearly_seasonality")?,
        })
    }
}

fn auto_param(value: Option<bool>) -> ParamValue {
    value.map_or(ParamValue::Text("auto".to_string()), ParamValue::Bool)
}

impl ForecastModel for DecompositionModel {
    type Fitted = FittedDecomposition;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Decomposition
    }

    fn params(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("weekly_order", ParamValue::Int(self.weekly_order as i64))
            .with("yearly_order", ParamValue::Int(self.yearly_order as i64))
            .with("weekly_seasonality", auto_param(self.weekly_seasonality))
            .with("yearly_seasonality", auto_param(self.yearly_seasonality))
    }

    fn fit(&self, matrix: &FeatureMatrix, _seed: u64) -> Result<FittedDecomposition> {
        let n = matrix.len();
        if n < 3 {
            return Err(ForecastError::fit(
                Algorithm::Decomposition.id(),
                format!("need at least 3 rows, got {}", n),
            ));
        }
        let origin = matrix.timestamps[0];
        let days: Vec<f64> = matrix
            .timestamps
            .iter()
            .map(|ts| elapsed_days(origin, *ts))
            .collect();
        let span = days[n - 1] - days[0];
        if span <= 0.0 {
            return Err(ForecastError::fit(
                Algorithm::Decomposition.id(),
                "timestamps span no time",
            ));
        }
        let mut gaps: Vec<f64> = days.windows(2).map(|w| w[1] - w[0]).collect();
        gaps.sort_by(f64::total_cmp);
        let step_days = gaps[gaps.len() / 2];

        let mut weekly_order = match self.weekly_seasonality {
            Some(true) => self.weekly_order,
            Some(false) => 0,
            None if span >= 14.0 && step_days < WEEK_DAYS => self.weekly_order,
            None => 0,
        };
        let mut yearly_order = match self.yearly_seasonality {
            Some(true) => self.yearly_order,
            Some(false) => 0,
            None if span >= 730.0 => self.yearly_order,
            None => 0,
        };
        // keep the design strictly overdetermined
        while 2 + 2 * (weekly_order + yearly_order) >= n && weekly_order + yearly_order > 0 {
            if yearly_order > 0 {
                yearly_order -= 1;
            } else {
                weekly_order -= 1;
            }
        }

        let basis = Basis {
            origin,
            span,
            weekly_order,
            yearly_order,
        };
        let rows: Vec<Vec<f64>> = days.iter().map(|d| basis.row(*d)).collect();
        let design = DMatrix::from_fn(n, basis.width(), |i, j| rows[i][j]);
        let y = DVector::from_column_slice(&matrix.target);
        let gram = design.transpose() * &design;
        let coefficients = solve_normal_equations(
            gram.clone(),
            design.transpose() * &y,
            Algorithm::Decomposition,
        )?;

        let residuals = &y - &design * &coefficients;
        let dof = (n - basis.width()).max(1) as f64;
        let sigma2 = residuals.norm_squared() / dof;

        let slope_se = slope_standard_error(gram, sigma2, span)?;

        let fitted = FittedDecomposition {
            basis,
            coefficients: coefficients.iter().copied().collect(),
            sigma: sigma2.sqrt(),
            slope_se,
            step_days,
        };
        if !fitted.sigma.is_finite() || fitted.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ForecastError::fit(
                Algorithm::Decomposition.id(),
                "non-finite coefficients",
            ));
        }
        debug!(
            "prophet fit: span {:.1} days, weekly order {}, yearly order {}, sigma {:.4}",
            span, weekly_order, yearly_order, fitted.sigma
        );
        Ok(fitted)
    }
}

/// Standard error of the slope coefficient in per-day units, falling back to
/// the pseudo-inverse when the Gram matrix is rank deficient.
fn slope_standard_error(gram: DMatrix<f64>, sigma2: f64, span: f64) -> Result<f64> {
    let inverse = match gram.clone().try_inverse() {
        Some(inv) => inv,
        None => gram.pseudo_inverse(1e-10).map_err(|e| {
            ForecastError::fit(
                Algorithm::Decomposition.id(),
                format!("slope variance unavailable: {}", e),
            )
        })?,
    };
    let se = (sigma2 * inverse[(1, 1)]).max(0.0).sqrt() / span;
    if se.is_finite() {
        Ok(se)
    } else {
        Err(ForecastError::fit(
            Algorithm::Decomposition.id(),
            "slope variance is not finite",
        ))
    }
}

fn elapsed_days(origin: DateTime<Utc>, ts: DateTime<Utc>) -> f64 {
    (ts - origin).num_seconds() as f64 / SECONDS_PER_DAY
}

/// Regressors: intercept, scaled time, then sin/cos pairs per order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Basis {
    origin: DateTime<Utc>,
    span: f64,
    weekly_order: usize,
    yearly_order: usize,
}

impl Basis {
    fn width(&self) -> usize {
        2 + 2 * (self.weekly_order + self.yearly_order)
    }

    fn row(&self, day: f64) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.width());
        row.push(1.0);
        row.push(day / self.span);
        for (period, order) in [(WEEK_DAYS, self.weekly_order), (YEAR_DAYS, self.yearly_order)] {
            for k in 1..=order {
                let angle = 2.0 * PI * k as f64 * day / period;
                row.push(angle.sin());
                row.push(angle.cos());
            }
        }
        row
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedDecomposition {
    basis: Basis,
    coefficients: Vec<f64>,
    /// Observation noise standard deviation
    pub sigma: f64,
    /// Standard error of the trend slope per day
    pub slope_se: f64,
    step_days: f64,
}

impl FittedDecomposition {
    fn day(&self, ts: DateTime<Utc>) -> f64 {
        elapsed_days(self.basis.origin, ts)
    }

    /// Trend, weekly and yearly contributions at one timestamp
    fn parts(&self, ts: DateTime<Utc>) -> (f64, f64, f64) {
        let row = self.basis.row(self.day(ts));
        let c = &self.coefficients;
        let trend = c[0] * row[0] + c[1] * row[1];
        let weekly_end = 2 + 2 * self.basis.weekly_order;
        let weekly = (2..weekly_end).map(|j| c[j] * row[j]).sum();
        let yearly = (weekly_end..row.len()).map(|j| c[j] * row[j]).sum();
        (trend, weekly, yearly)
    }

    pub fn predict_at(&self, ts: DateTime<Utc>) -> f64 {
        let (trend, weekly, yearly) = self.parts(ts);
        trend + weekly + yearly
    }

    /// Trend slope in target units per day
    pub fn slope_per_day(&self) -> f64 {
        self.coefficients[1] / self.basis.span
    }

    pub fn components(&self, timestamps: &[DateTime<Utc>]) -> BTreeMap<String, Vec<f64>> {
        let parts: Vec<(f64, f64, f64)> = timestamps.iter().map(|ts| self.parts(*ts)).collect();
        let mut out = BTreeMap::new();
        out.insert("trend".to_string(), parts.iter().map(|p| p.0).collect());
        if self.basis.weekly_order > 0 {
            out.insert("weekly".to_string(), parts.iter().map(|p| p.1).collect());
        }
        if self.basis.yearly_order > 0 {
            out.insert("yearly".to_string(), parts.iter().map(|p| p.2).collect());
        }
        out
    }
}

impl FittedForecastModel for FittedDecomposition {
    fn predict_horizon(&self, ctx: &ForecastContext<'_>) -> Result<Vec<f64>> {
        let out: Vec<f64> = ctx.timestamps.iter().map(|ts| self.predict_at(*ts)).collect();
        if out.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::predict(
                Algorithm::Decomposition.id(),
                "produced a non-finite forecast",
            ));
        }
        Ok(out)
    }

    fn fitted_values(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
        Ok(matrix.timestamps.iter().map(|ts| self.predict_at(*ts)).collect())
    }

    /// Observation noise plus trend uncertainty growing with lead time
    fn estimate_uncertainty(&self, horizon: usize) -> Result<Uncertainty> {
        let std_dev = (1..=horizon)
            .map(|h| {
                let lead = h as f64 * self.step_days;
                (self.sigma.powi(2) + (lead * self.slope_se).powi(2)).sqrt()
            })
            .collect();
        Ok(Uncertainty::Gaussian { std_dev })
    }

    fn feature_importance(&self) -> Option<Vec<f64>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureOptions;
    use crate::models::test_support::matrix;
    use approx::assert_abs_diff_eq;
    use chrono::Duration;

    fn weekly_pattern(i: usize) -> f64 {
        100.0 + 0.5 * i as f64 + 8.0 * (2.0 * PI * i as f64 / 7.0).sin()
    }

    #[test]
    fn test_recovers_trend_and_weekly_season() {
        let m = matrix(70, weekly_pattern, FeatureOptions::default());
        let fitted = DecompositionModel::default().fit(&m, 0).unwrap();
        assert_abs_diff_eq!(fitted.slope_per_day(), 0.5, epsilon = 1e-6);
        assert!(fitted.sigma < 1e-6);

        let last = m.last_timestamp().unwrap();
        let next = last + Duration::days(1);
        assert_abs_diff_eq!(fitted.predict_at(next), weekly_pattern(70), epsilon = 1e-6);

        let components = fitted.components(&[next]);
        assert!(components.contains_key("weekly"));
        assert!(!components.contains_key("yearly"));
    }

    #[test]
    fn test_slope_error_survives_singular_gram() {
        let gram = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let se = slope_standard_error(gram, 4.0, 2.0).unwrap();
        assert_abs_diff_eq!(se, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_non_finite_slope_error_is_fit_failure() {
        let gram = DMatrix::<f64>::identity(2, 2);
        let err = slope_standard_error(gram, f64::INFINITY, 1.0).unwrap_err();
        assert!(err.is_backend_failure());
    }

    #[test]
    fn test_short_series_disables_weekly_season() {
        let m = matrix(10, |i| i as f64, FeatureOptions::default());
        let fitted = DecompositionModel::default().fit(&m, 0).unwrap();
        let components = fitted.components(&m.timestamps);
        assert_eq!(components.keys().collect::<Vec<_>>(), vec!["trend"]);
    }

    #[test]
    fn test_uncertainty_never_narrows() {
        let m = matrix(40, |i| i as f64 + ((i * 7919) % 13) as f64, FeatureOptions::default());
        let fitted = DecompositionModel::default().fit(&m, 0).unwrap();
        match fitted.estimate_uncertainty(20).unwrap() {
            Uncertainty::Gaussian { std_dev } => {
                assert!(std_dev.windows(2).all(|w| w[1] >= w[0]));
                assert!(std_dev[19] > std_dev[0]);
            }
            other => panic!("unexpected uncertainty {:?}", other),
        }
    }

    #[test]
    fn test_explicit_seasonality_flags() {
        let params = Hyperparameters::new()
            .with("weekly_seasonality", ParamValue::Bool(false))
            .with("yearly_seasonality", ParamValue::Text("auto".to_string()));
        let model = DecompositionModel::from_params(&params).unwrap();
        assert_eq!(model.weekly_seasonality, Some(false));
        assert_eq!(model.yearly_seasonality, None);
    }
}
