//! Model backends
//!
//! Every backend implements the same two-phase contract: a configured
//! [`ForecastModel`] is fitted on a [`FeatureMatrix`] into a
//! [`FittedForecastModel`], which forecasts a horizon, describes its own
//! uncertainty and optionally reports feature importance.
//!
//! The set of backends is closed ([`Algorithm`]); [`Backend`] and
//! [`FittedModel`] dispatch over it by `match`, so `auto` mode can iterate
//! [`Algorithm::ALL`] without any string lookup.

use crate::error::{ForecastError, Result};
use crate::features::FeatureMatrix;
use crate::request::Hyperparameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod decomposition;
pub mod forest;
pub mod linear;
pub mod sequence;

pub use decomposition::{DecompositionModel, FittedDecomposition};
pub use forest::{FittedForest, ForestModel};
pub use linear::{FittedLinear, LinearModel};
pub use sequence::{FittedSequence, SequenceModel};

/// Backend families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "linear")]
    Linear,
    #[serde(rename = "random_forest")]
    Ensemble,
    #[serde(rename = "lstm")]
    Sequence,
    #[serde(rename = "prophet")]
    Decomposition,
}

impl Algorithm {
    /// Every backend, in order of increasing complexity
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Linear,
        Algorithm::Decomposition,
        Algorithm::Ensemble,
        Algorithm::Sequence,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Algorithm::Linear => "linear",
            Algorithm::Ensemble => "random_forest",
            Algorithm::Sequence => "lstm",
            Algorithm::Decomposition => "prophet",
        }
    }

    /// Position in the simplicity order used to break metric ties
    pub fn complexity_rank(&self) -> usize {
        match self {
            Algorithm::Linear => 0,
            Algorithm::Decomposition => 1,
            Algorithm::Ensemble => 2,
            Algorithm::Sequence => 3,
        }
    }

    /// Whether forecasting needs the caller's covariates for future steps
    pub fn uses_covariates(&self) -> bool {
        !matches!(self, Algorithm::Decomposition)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Algorithm {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" | "linear_regression" => Ok(Algorithm::Linear),
            "random_forest" | "ensemble" => Ok(Algorithm::Ensemble),
            "lstm" | "sequence" => Ok(Algorithm::Sequence),
            "prophet" | "decomposition" => Ok(Algorithm::Decomposition),
            other => Err(ForecastError::validation(
                "algorithm",
                format!(
                    "unknown algorithm '{}', expected one of linear, random_forest, lstm, prophet, auto",
                    other
                ),
            )),
        }
    }
}

/// Everything a fitted model may use to forecast the steps after `history`
#[derive(Debug, Clone, Copy)]
pub struct ForecastContext<'a> {
    pub history: &'a FeatureMatrix,
    pub timestamps: &'a [DateTime<Utc>],
    /// Caller covariates per step, in the layout's covariate order
    pub covariates: &'a [Vec<f64>],
}

impl ForecastContext<'_> {
    pub fn horizon(&self) -> usize {
        self.timestamps.len()
    }
}

/// Per-step forecast error model of a fitted backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Uncertainty {
    /// Symmetric normal bands with the given standard deviation per step
    Gaussian { std_dev: Vec<f64> },
    /// Quantiles of sorted residuals, multiplied by a per-step scale
    Empirical { residuals: Vec<f64>, scale: Vec<f64> },
}

impl Uncertainty {
    /// Normal bands whose spread grows with the square root of the step
    pub fn gaussian_sqrt_steps(sigma: f64, horizon: usize) -> Self {
        Uncertainty::Gaussian {
            std_dev: sqrt_steps(horizon).into_iter().map(|s| sigma * s).collect(),
        }
    }

    pub fn empirical(mut residuals: Vec<f64>, scale: Vec<f64>) -> Self {
        residuals.sort_by(f64::total_cmp);
        Uncertainty::Empirical { residuals, scale }
    }

    pub fn horizon(&self) -> usize {
        match self {
            Uncertainty::Gaussian { std_dev } => std_dev.len(),
            Uncertainty::Empirical { scale, .. } => scale.len(),
        }
    }

    /// Distances `(below, above)` of the band at `level` around the point
    /// forecast of step `step` (0-based). Both are non-negative.
    pub fn offsets(&self, level: f64, step: usize) -> Result<(f64, f64)> {
        if !(level > 0.0 && level < 1.0) {
            return Err(ForecastError::Internal(format!(
                "confidence level {} outside (0, 1)",
                level
            )));
        }
        match self {
            Uncertainty::Gaussian { std_dev } => {
                let sd = step_value(std_dev, step)?;
                let z = normal_quantile(0.5 + level / 2.0)?;
                Ok((z * sd, z * sd))
            }
            Uncertainty::Empirical { residuals, scale } => {
                let s = step_value(scale, step)?;
                if residuals.is_empty() {
                    return Ok((0.0, 0.0));
                }
                let tail = (1.0 - level) / 2.0;
                let low = quantile_sorted(residuals, tail);
                let high = quantile_sorted(residuals, 1.0 - tail);
                Ok(((-low).max(0.0) * s, high.max(0.0) * s))
            }
        }
    }
}

fn step_value(values: &[f64], step: usize) -> Result<f64> {
    values.get(step).copied().ok_or_else(|| {
        ForecastError::Internal(format!(
            "uncertainty requested for step {} of a {}-step profile",
            step + 1,
            values.len()
        ))
    })
}

/// `sqrt(1), sqrt(2), ..., sqrt(horizon)`
pub fn sqrt_steps(horizon: usize) -> Vec<f64> {
    (1..=horizon).map(|h| (h as f64).sqrt()).collect()
}

/// Standard normal quantile
pub fn normal_quantile(p: f64) -> Result<f64> {
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| ForecastError::Internal(format!("standard normal: {}", e)))?;
    Ok(normal.inverse_cdf(p))
}

/// Linear-interpolated quantile of an ascending slice
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    }
}

/// Clamp negatives to zero and scale to sum 1; all-zero weights stay zero
pub fn normalize_importance(raw: Vec<f64>) -> Vec<f64> {
    let clamped: Vec<f64> = raw
        .into_iter()
        .map(|w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
        .collect();
    let total: f64 = clamped.iter().sum();
    if total > 0.0 {
        clamped.into_iter().map(|w| w / total).collect()
    } else {
        clamped
    }
}

/// Population standard deviation of residuals
pub fn residual_std(residuals: &[f64]) -> f64 {
    series_math::series::population_std_dev(residuals).unwrap_or(0.0)
}

/// Column-wise centring and scaling fitted on training rows.
///
/// Constant columns keep scale 1 and are reported by [`Standardizer::is_constant`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    constant: Vec<bool>,
}

impl Standardizer {
    pub fn fit(rows: &[Vec<f64>], width: usize) -> Self {
        let n = rows.len().max(1) as f64;
        let mut means = vec![0.0; width];
        for row in rows {
            for (m, v) in means.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut vars = vec![0.0; width];
        for row in rows {
            for ((s, v), m) in vars.iter_mut().zip(row).zip(&means) {
                *s += (v - m).powi(2) / n;
            }
        }
        let constant: Vec<bool> = vars.iter().map(|v| *v <= 1e-24).collect();
        let scales = vars
            .iter()
            .zip(&constant)
            .map(|(v, c)| if *c { 1.0 } else { v.sqrt() })
            .collect();
        Self {
            means,
            scales,
            constant,
        }
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(&self.means)
            .zip(&self.scales)
            .map(|((v, m), s)| (v - m) / s)
            .collect()
    }

    pub fn is_constant(&self, column: usize) -> bool {
        self.constant[column]
    }
}

/// Forecast step by step, feeding each prediction back into the target
/// history used to build the next row's lag and rolling features.
///
/// `step` receives the assembled feature row and the target history so far.
pub fn roll_forward<F>(ctx: &ForecastContext<'_>, backend: Algorithm, mut step: F) -> Result<Vec<f64>>
where
    F: FnMut(&[f64], &[f64]) -> Result<f64>,
{
    let layout = &ctx.history.layout;
    if ctx.covariates.len() != ctx.timestamps.len() {
        return Err(ForecastError::Internal(format!(
            "{} covariate rows for {} forecast steps",
            ctx.covariates.len(),
            ctx.timestamps.len()
        )));
    }

    let mut history = ctx.history.target_history();
    let mut out = Vec::with_capacity(ctx.horizon());
    for (ts, covariates) in ctx.timestamps.iter().zip(ctx.covariates) {
        if covariates.len() != layout.covariates.len() {
            return Err(ForecastError::MissingCovariates {
                columns: layout.covariates.clone(),
            });
        }
        let row = layout.row(*ts, covariates, &history).ok_or_else(|| {
            ForecastError::predict(backend.id(), "not enough history for lag features")
        })?;
        let value = step(&row, &history)?;
        if !value.is_finite() {
            return Err(ForecastError::predict(
                backend.id(),
                "produced a non-finite forecast",
            ));
        }
        history.push(value);
        out.push(value);
    }
    Ok(out)
}

/// A configured, not yet fitted backend
pub trait ForecastModel {
    type Fitted: FittedForecastModel;

    fn algorithm(&self) -> Algorithm;

    /// Full parameter set in effect, defaults included
    fn params(&self) -> Hyperparameters;

    /// Fit on every row of `matrix`. Any randomness is drawn from `seed`.
    fn fit(&self, matrix: &FeatureMatrix, seed: u64) -> Result<Self::Fitted>;
}

/// A fitted backend
pub trait FittedForecastModel {
    /// Point forecasts for each step of `ctx`, never reading future targets
    fn predict_horizon(&self, ctx: &ForecastContext<'_>) -> Result<Vec<f64>>;

    /// In-sample predictions for the rows of `matrix`
    fn fitted_values(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>>;

    /// Error model for `horizon` steps; spread never shrinks with the step
    fn estimate_uncertainty(&self, horizon: usize) -> Result<Uncertainty>;

    /// Non-negative weights aligned with the matrix features, summing to 1,
    /// or `None` for backends without a notion of importance
    fn feature_importance(&self) -> Option<Vec<f64>>;
}

/// Any configured backend
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    Linear(LinearModel),
    Ensemble(ForestModel),
    Sequence(SequenceModel),
    Decomposition(DecompositionModel),
}

impl Backend {
    /// Read the backend's parameters, rejecting invalid values
    pub fn configure(algorithm: Algorithm, params: &Hyperparameters) -> Result<Self> {
        Ok(match algorithm {
            Algorithm::Linear => Backend::Linear(LinearModel::from_params(params)?),
            Algorithm::Ensemble => Backend::Ensemble(ForestModel::from_params(params)?),
            Algorithm::Sequence => Backend::Sequence(SequenceModel::from_params(params)?),
            Algorithm::Decomposition => {
                Backend::Decomposition(DecompositionModel::from_params(params)?)
            }
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Backend::Linear(m) => m.algorithm(),
            Backend::Ensemble(m) => m.algorithm(),
            Backend::Sequence(m) => m.algorithm(),
            Backend::Decomposition(m) => m.algorithm(),
        }
    }

    pub fn params(&self) -> Hyperparameters {
        match self {
            Backend::Linear(m) => m.params(),
            Backend::Ensemble(m) => m.params(),
            Backend::Sequence(m) => m.params(),
            Backend::Decomposition(m) => m.params(),
        }
    }

    pub fn fit(&self, matrix: &FeatureMatrix, seed: u64) -> Result<FittedModel> {
        Ok(match self {
            Backend::Linear(m) => FittedModel::Linear(m.fit(matrix, seed)?),
            Backend::Ensemble(m) => FittedModel::Ensemble(m.fit(matrix, seed)?),
            Backend::Sequence(m) => FittedModel::Sequence(m.fit(matrix, seed)?),
            Backend::Decomposition(m) => FittedModel::Decomposition(m.fit(matrix, seed)?),
        })
    }
}

/// Any fitted backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "model")]
pub enum FittedModel {
    #[serde(rename = "linear")]
    Linear(FittedLinear),
    #[serde(rename = "random_forest")]
    Ensemble(FittedForest),
    #[serde(rename = "lstm")]
    Sequence(FittedSequence),
    #[serde(rename = "prophet")]
    Decomposition(FittedDecomposition),
}

impl FittedModel {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            FittedModel::Linear(_) => Algorithm::Linear,
            FittedModel::Ensemble(_) => Algorithm::Ensemble,
            FittedModel::Sequence(_) => Algorithm::Sequence,
            FittedModel::Decomposition(_) => Algorithm::Decomposition,
        }
    }

    /// Additive components at `timestamps`, for backends that decompose
    pub fn components(&self, timestamps: &[DateTime<Utc>]) -> Option<BTreeMap<String, Vec<f64>>> {
        match self {
            FittedModel::Decomposition(m) => Some(m.components(timestamps)),
            _ => None,
        }
    }
}

impl FittedForecastModel for FittedModel {
    fn predict_horizon(&self, ctx: &ForecastContext<'_>) -> Result<Vec<f64>> {
        match self {
            FittedModel::Linear(m) => m.predict_horizon(ctx),
            FittedModel::Ensemble(m) => m.predict_horizon(ctx),
            FittedModel::Sequence(m) => m.predict_horizon(ctx),
            FittedModel::Decomposition(m) => m.predict_horizon(ctx),
        }
    }

    fn fitted_values(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
        match self {
            FittedModel::Linear(m) => m.fitted_values(matrix),
            FittedModel::Ensemble(m) => m.fitted_values(matrix),
            FittedModel::Sequence(m) => m.fitted_values(matrix),
            FittedModel::Decomposition(m) => m.fitted_values(matrix),
        }
    }

    fn estimate_uncertainty(&self, horizon: usize) -> Result<Uncertainty> {
        match self {
            FittedModel::Linear(m) => m.estimate_uncertainty(horizon),
            FittedModel::Ensemble(m) => m.estimate_uncertainty(horizon),
            FittedModel::Sequence(m) => m.estimate_uncertainty(horizon),
            FittedModel::Decomposition(m) => m.estimate_uncertainty(horizon),
        }
    }

    fn feature_importance(&self) -> Option<Vec<f64>> {
        match self {
            FittedModel::Linear(m) => m.feature_importance(),
            FittedModel::Ensemble(m) => m.feature_importance(),
            FittedModel::Sequence(m) => m.feature_importance(),
            FittedModel::Decomposition(m) => m.feature_importance(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::data::DataRecord;
    use crate::features::{FeatureBuilder, FeatureMatrix, FeatureOptions};
    use chrono::{Duration, TimeZone, Utc};

    /// Daily records with `y = f(i, x)` and `x = i`
    pub fn daily_records<F: Fn(usize) -> f64>(n: usize, f: F) -> Vec<DataRecord> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                DataRecord::new()
                    .with("date", (start + Duration::days(i as i64)).to_rfc3339())
                    .with("x", i as f64)
                    .with("y", f(i))
            })
            .collect()
    }

    pub fn matrix<F: Fn(usize) -> f64>(n: usize, f: F, options: FeatureOptions) -> FeatureMatrix {
        FeatureBuilder::new(options)
            .build(&daily_records(n, f), "y", &["x".to_string()])
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_algorithm_ids_round_trip_through_parse() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.id().parse::<Algorithm>().unwrap(), algorithm);
        }
        assert!(matches!(
            "arima".parse::<Algorithm>(),
            Err(ForecastError::Validation { .. })
        ));
    }

    #[test]
    fn test_complexity_order_matches_all() {
        let ranks: Vec<usize> = Algorithm::ALL.iter().map(|a| a.complexity_rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_gaussian_offsets_grow_with_step_and_level() {
        let u = Uncertainty::gaussian_sqrt_steps(2.0, 4);
        let (b1, a1) = u.offsets(0.95, 0).unwrap();
        let (b4, a4) = u.offsets(0.95, 3).unwrap();
        let (b80, _) = u.offsets(0.80, 0).unwrap();
        assert_abs_diff_eq!(b1, a1);
        assert_abs_diff_eq!(a1, 1.959964 * 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(a4, 2.0 * a1, epsilon = 1e-12);
        assert!(b4 > b1 && b80 < b1);
        assert!(u.offsets(0.95, 4).is_err());
    }

    #[test]
    fn test_empirical_offsets_are_non_negative() {
        let u = Uncertainty::empirical(vec![3.0, 1.0, 2.0], vec![1.0, 2.0]);
        let (below, above) = u.offsets(0.8, 0).unwrap();
        // every residual is positive, so the band never reaches below the point
        assert_eq!(below, 0.0);
        assert!(above > 0.0);
        let (_, above2) = u.offsets(0.8, 1).unwrap();
        assert_abs_diff_eq!(above2, 2.0 * above);
    }

    #[test]
    fn test_quantile_and_importance_helpers() {
        assert_abs_diff_eq!(quantile_sorted(&[0.0, 10.0], 0.25), 2.5);
        assert_eq!(normalize_importance(vec![1.0, 3.0]), vec![0.25, 0.75]);
        assert_eq!(normalize_importance(vec![0.0, -1.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_standardizer_flags_constant_columns() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let s = Standardizer::fit(&rows, 2);
        assert!(s.is_constant(1) && !s.is_constant(0));
        assert_eq!(s.transform(&[3.0, 5.0]), vec![1.0, 0.0]);
    }
}
