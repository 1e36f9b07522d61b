//! Expanding-window cross-validation
//!
//! Fold `i` trains on rows `[0, split_i)` and validates on the block that
//! follows, with split points strictly increasing. Rows are never shuffled.

use crate::config::EngineConfig;
use crate::error::{ForecastError, Result};
use crate::features::FeatureMatrix;
use crate::metrics::{evaluate_forecast, ForecastMetrics};
use crate::models::{residual_std, Backend, FittedForecastModel, ForecastContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Smallest number of folds a run may be reduced to
pub const MIN_FOLDS: usize = 2;

/// Smallest first training slice
pub const MIN_TRAIN_ROWS: usize = 3;

/// Shared flag the caller sets to abandon a run; checked between folds
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ForecastError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Rows needed before any model is fitted for `horizon`
pub fn required_rows(config: &EngineConfig, horizon: usize) -> usize {
    config.engine.min_training_rows.max(2 * horizon)
}

/// One train/validate split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub index: usize,
    pub train: Range<usize>,
    pub validation: Range<usize>,
}

/// Expanding-window splits of `n_rows` rows into `k` validation blocks of
/// `n_rows / (k + 1)` rows each, the last block ending at the final row
pub fn expanding_window_splits(n_rows: usize, k: usize) -> Vec<Fold> {
    let block = n_rows / (k + 1);
    if k == 0 || block == 0 {
        return Vec::new();
    }
    (0..k)
        .map(|i| {
            let split = n_rows - (k - i) * block;
            Fold {
                index: i,
                train: 0..split,
                validation: split..split + block,
            }
        })
        .collect()
}

/// Splits for up to `requested` folds, reducing the count until every
/// fold has a validation block and a usable training slice.
pub fn plan_folds(n_rows: usize, requested: usize) -> Result<Vec<Fold>> {
    let mut k = requested.max(MIN_FOLDS);
    while k >= MIN_FOLDS {
        let folds = expanding_window_splits(n_rows, k);
        if folds.len() == k && folds[0].train.len() >= MIN_TRAIN_ROWS {
            if k < requested {
                debug!("Reduced folds from {} to {} for {} rows", requested, k, n_rows);
            }
            return Ok(folds);
        }
        k -= 1;
    }
    // two folds of one row each after the minimum training slice
    Err(ForecastError::InsufficientData {
        required: MIN_TRAIN_ROWS.max(MIN_FOLDS + 1) + MIN_FOLDS,
        available: n_rows,
    })
}

/// Mean and population standard deviation of a metric across folds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std: f64,
}

impl MetricSummary {
    pub fn of(values: &[f64]) -> Option<Self> {
        let mean = series_math::series::mean(values)?;
        let std = series_math::series::population_std_dev(values)?;
        Some(Self { mean, std })
    }
}

/// Cross-fold aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub mae: MetricSummary,
    pub rmse: MetricSummary,
    pub r2: MetricSummary,
    /// Over folds where MAPE was defined
    pub mape: Option<MetricSummary>,
    pub mape_excluded: usize,
    pub directional_accuracy: Option<MetricSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold: usize,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub train_end: DateTime<Utc>,
    pub validation_start: DateTime<Utc>,
    pub validation_end: DateTime<Utc>,
    pub metrics: ForecastMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeight {
    pub feature: String,
    pub weight: f64,
}

/// Outcome of cross-validating one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub folds: Vec<FoldResult>,
    pub aggregate: AggregateMetrics,
    /// Averaged over folds and renormalized, heaviest first; `None` when the
    /// backend has no notion of importance
    pub feature_importance: Option<Vec<FeatureWeight>>,
    /// Standard deviation of all validation residuals pooled together
    pub residual_std: f64,
}

impl EvaluationResult {
    pub fn performance(&self) -> PerformanceSummary {
        PerformanceSummary::of(&self.aggregate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Low,
    Medium,
    High,
}

/// Headline reading of the cross-validation metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Mean R² clamped to `[0, 1]`, discounted by its spread across folds
    pub model_confidence: f64,
    pub prediction_reliability: Grade,
    /// From mean MAPE when any fold defined it, else the mirror of reliability
    pub risk_level: Grade,
    pub recommendation: String,
}

impl PerformanceSummary {
    const HIGH_CONFIDENCE: f64 = 0.75;
    const MEDIUM_CONFIDENCE: f64 = 0.5;
    /// Mean MAPE, in percent, below which risk is low / medium
    const LOW_RISK_MAPE: f64 = 5.0;
    const MEDIUM_RISK_MAPE: f64 = 15.0;

    pub fn of(aggregate: &AggregateMetrics) -> Self {
        let unit = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        let r2 = aggregate.r2;
        let model_confidence = unit(r2.mean) * (1.0 - unit(r2.std));

        let prediction_reliability = if model_confidence >= Self::HIGH_CONFIDENCE {
            Grade::High
        } else if model_confidence >= Self::MEDIUM_CONFIDENCE {
            Grade::Medium
        } else {
            Grade::Low
        };
        let risk_level = match aggregate.mape {
            Some(mape) if mape.mean.is_finite() => {
                if mape.mean < Self::LOW_RISK_MAPE {
                    Grade::Low
                } else if mape.mean < Self::MEDIUM_RISK_MAPE {
                    Grade::Medium
                } else {
                    Grade::High
                }
            }
            _ => match prediction_reliability {
                Grade::High => Grade::Low,
                Grade::Medium => Grade::Medium,
                Grade::Low => Grade::High,
            },
        };
        let recommendation = match (prediction_reliability, risk_level) {
            (Grade::High, Grade::Low) => "suitable for planning",
            (Grade::Low, _) | (_, Grade::High) => {
                "indicative only; add history or revisit the features"
            }
            _ => "usable with its confidence bands",
        };

        Self {
            model_confidence,
            prediction_reliability,
            risk_level,
            recommendation: recommendation.to_string(),
        }
    }
}

/// Runs a backend through every fold
#[derive(Debug, Clone)]
pub struct CrossValidator {
    folds: usize,
    cancel: Option<CancellationToken>,
}

impl CrossValidator {
    pub fn new(folds: usize) -> Self {
        Self {
            folds,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }

    pub fn evaluate(
        &self,
        backend: &Backend,
        matrix: &FeatureMatrix,
        seed: u64,
    ) -> Result<EvaluationResult> {
        let plan = plan_folds(matrix.len(), self.folds)?;
        let algorithm = backend.algorithm();

        let mut folds = Vec::with_capacity(plan.len());
        let mut residuals = Vec::new();
        let mut importances: Vec<Option<Vec<f64>>> = Vec::with_capacity(plan.len());
        for fold in &plan {
            self.check_cancelled()?;

            let train = matrix.slice(fold.train.clone());
            let validation = matrix.slice(fold.validation.clone());
            let fitted = backend.fit(&train, seed)?;

            let covariates: Vec<Vec<f64>> = (0..validation.len())
                .map(|i| validation.covariates(i).to_vec())
                .collect();
            let ctx = ForecastContext {
                history: &train,
                timestamps: &validation.timestamps,
                covariates: &covariates,
            };
            let predicted = fitted.predict_horizon(&ctx)?;
            let metrics = evaluate_forecast(
                &validation.target,
                &predicted,
                train.target.last().copied(),
            )?;
            debug!("{} fold {}: {}", algorithm, fold.index, metrics);

            residuals.extend(validation.target.iter().zip(&predicted).map(|(a, p)| a - p));
            importances.push(fitted.feature_importance());
            folds.push(FoldResult {
                fold: fold.index,
                train_rows: train.len(),
                validation_rows: validation.len(),
                train_end: train.timestamps[train.len() - 1],
                validation_start: validation.timestamps[0],
                validation_end: validation.timestamps[validation.len() - 1],
                metrics,
            });
        }
        self.check_cancelled()?;

        Ok(EvaluationResult {
            aggregate: aggregate(&folds)?,
            feature_importance: average_importance(&importances, &matrix.feature_names),
            residual_std: residual_std(&residuals),
            folds,
        })
    }
}

fn aggregate(folds: &[FoldResult]) -> Result<AggregateMetrics> {
    let collect = |f: fn(&ForecastMetrics) -> f64| -> Vec<f64> {
        folds.iter().map(|r| f(&r.metrics)).collect()
    };
    let summary = |values: Vec<f64>| {
        MetricSummary::of(&values)
            .ok_or_else(|| ForecastError::Internal("no folds to aggregate".to_string()))
    };
    let mape: Vec<f64> = folds.iter().filter_map(|r| r.metrics.mape).collect();
    let direction: Vec<f64> = folds
        .iter()
        .filter_map(|r| r.metrics.directional_accuracy)
        .collect();

    Ok(AggregateMetrics {
        mae: summary(collect(|m| m.mae))?,
        rmse: summary(collect(|m| m.rmse))?,
        r2: summary(collect(|m| m.r2))?,
        mape: MetricSummary::of(&mape),
        mape_excluded: folds.iter().map(|r| r.metrics.mape_excluded).sum(),
        directional_accuracy: MetricSummary::of(&direction),
    })
}

/// Mean importance per feature across folds, renormalized to sum to 1.
///
/// Present only when every fold reported importance.
pub fn average_importance(
    per_fold: &[Option<Vec<f64>>],
    names: &[String],
) -> Option<Vec<FeatureWeight>> {
    if per_fold.is_empty() {
        return None;
    }
    let mut totals = vec![0.0; names.len()];
    for weights in per_fold {
        for (total, w) in totals.iter_mut().zip(weights.as_ref()?) {
            *total += w;
        }
    }
    Some(ranked_weights(
        crate::models::normalize_importance(totals),
        names,
    ))
}

/// Pair weights with feature names, heaviest first (ties by name)
pub fn ranked_weights(weights: Vec<f64>, names: &[String]) -> Vec<FeatureWeight> {
    let mut ranked: Vec<FeatureWeight> = names
        .iter()
        .zip(weights)
        .map(|(feature, weight)| FeatureWeight {
            feature: feature.clone(),
            weight,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then_with(|| a.feature.cmp(&b.feature))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureOptions;
    use crate::models::test_support::matrix;
    use crate::models::Algorithm;
    use crate::request::Hyperparameters;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_splits_match_expanding_window() {
        let folds = expanding_window_splits(12, 3);
        assert_eq!(
            folds,
            vec![
                Fold { index: 0, train: 0..3, validation: 3..6 },
                Fold { index: 1, train: 0..6, validation: 6..9 },
                Fold { index: 2, train: 0..9, validation: 9..12 },
            ]
        );
    }

    #[test]
    fn test_fold_count_is_reduced_for_short_series() {
        let folds = plan_folds(10, 5).unwrap();
        assert_eq!(folds.len(), 2);
        assert!(folds[0].train.len() >= MIN_TRAIN_ROWS);

        match plan_folds(4, 5) {
            Err(ForecastError::InsufficientData { available, .. }) => assert_eq!(available, 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_required_rows() {
        let config = EngineConfig::default();
        assert_eq!(required_rows(&config, 3), 10);
        assert_eq!(required_rows(&config, 30), 60);
    }

    #[test]
    fn test_linear_cross_validation_on_exact_line() {
        let m = matrix(50, |i| 2.0 * i as f64 + 1.0, FeatureOptions::default());
        let backend = Backend::configure(Algorithm::Linear, &Hyperparameters::new()).unwrap();
        let result = CrossValidator::new(5).evaluate(&backend, &m, 0).unwrap();
        assert_eq!(result.folds.len(), 5);
        assert_abs_diff_eq!(result.aggregate.rmse.mean, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.aggregate.r2.mean, 1.0, epsilon = 1e-6);
        let importance = result.feature_importance.unwrap();
        assert_eq!(importance[0].feature, "x");
        assert_abs_diff_eq!(importance[0].weight, 1.0);
        for fold in &result.folds {
            assert!(fold.train_end < fold.validation_start);
        }
    }

    #[test]
    fn test_backend_without_importance_reports_none() {
        let m = matrix(40, |i| i as f64, FeatureOptions::default());
        let backend = Backend::configure(Algorithm::Decomposition, &Hyperparameters::new()).unwrap();
        let result = CrossValidator::new(3).evaluate(&backend, &m, 0).unwrap();
        assert_eq!(result.feature_importance, None);
    }

    #[test]
    fn test_cancelled_before_first_fold() {
        let m = matrix(40, |i| i as f64, FeatureOptions::default());
        let backend = Backend::configure(Algorithm::Linear, &Hyperparameters::new()).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = CrossValidator::new(3)
            .with_cancellation(token)
            .evaluate(&backend, &m, 0)
            .unwrap_err();
        assert!(matches!(err, ForecastError::Cancelled));
    }

    fn aggregate(r2: (f64, f64), mape: Option<f64>) -> AggregateMetrics {
        let flat = MetricSummary { mean: 1.0, std: 0.0 };
        AggregateMetrics {
            mae: flat,
            rmse: flat,
            r2: MetricSummary {
                mean: r2.0,
                std: r2.1,
            },
            mape: mape.map(|mean| MetricSummary { mean, std: 0.0 }),
            mape_excluded: 0,
            directional_accuracy: None,
        }
    }

    #[test]
    fn test_consistent_accurate_folds_grade_high() {
        let summary = PerformanceSummary::of(&aggregate((0.98, 0.01), Some(2.0)));
        assert_abs_diff_eq!(summary.model_confidence, 0.98 * 0.99, epsilon = 1e-12);
        assert_eq!(summary.prediction_reliability, Grade::High);
        assert_eq!(summary.risk_level, Grade::Low);
        assert_eq!(summary.recommendation, "suitable for planning");
    }

    #[test]
    fn test_inconsistent_folds_lower_confidence() {
        let summary = PerformanceSummary::of(&aggregate((0.8, 0.1), Some(10.0)));
        assert_abs_diff_eq!(summary.model_confidence, 0.72, epsilon = 1e-12);
        assert_eq!(summary.prediction_reliability, Grade::Medium);
        assert_eq!(summary.risk_level, Grade::Medium);

        let unstable = PerformanceSummary::of(&aggregate((0.9, 0.5), None));
        assert_eq!(unstable.prediction_reliability, Grade::Low);
        // no MAPE: risk mirrors reliability
        assert_eq!(unstable.risk_level, Grade::High);
    }

    #[test]
    fn test_negative_or_undefined_r2_means_no_confidence() {
        for r2 in [(-3.0, 0.2), (f64::NAN, 0.0)] {
            let summary = PerformanceSummary::of(&aggregate(r2, Some(1.0)));
            assert_eq!(summary.model_confidence, 0.0);
            assert_eq!(summary.prediction_reliability, Grade::Low);
            assert!(summary.recommendation.starts_with("indicative"));
        }
    }

    #[test]
    fn test_average_importance() {
        let names = vec!["a".to_string(), "b".to_string()];
        let avg = average_importance(&[Some(vec![1.0, 0.0]), Some(vec![0.5, 0.5])], &names).unwrap();
        assert_eq!(avg[0].feature, "a");
        assert_abs_diff_eq!(avg[0].weight, 0.75);
        assert_abs_diff_eq!(avg[1].weight, 0.25);
        assert_eq!(average_importance(&[Some(vec![1.0, 0.0]), None], &names), None);
    }
}
