//! Training Orchestrator
//!
//! `train` validates the request, builds features, cross-validates the
//! requested backend (or every backend for `auto`), refits the winner on all
//! rows and packages the forecast and diagnostics. In `auto` mode a backend
//! that fails is excluded, during cross-validation or the final fit, and the
//! next-ranked candidate takes its place. Any other failure aborts the run
//! with a single error.

use crate::anomaly::AnomalyRecord;
use crate::artifact::{ArtifactReference, ArtifactStore, ModelArtifact};
use crate::config::EngineConfig;
use crate::data::{forecast_timestamps, DataRecord, Frequency};
use crate::error::{ForecastError, Result};
use crate::features::{FeatureBuilder, FeatureMatrix};
use crate::forecast::{FittedPoint, ForecastResult, ForecastRun, ForecastStatistics};
use crate::models::{Algorithm, Backend};
use crate::request::{Hyperparameters, TrainingRequest, ValidatedRequest};
use crate::technical::TechnicalDescriptors;
use crate::trend::TrendDescriptor;
use crate::validation::{
    required_rows, CancellationToken, CrossValidator, EvaluationResult, MetricSummary,
    PerformanceSummary,
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Evaluated,
    /// Excluded after a backend failure
    Failed,
    /// Not evaluated because required future covariates were not supplied
    Skipped,
}

/// One backend's showing in the comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub algorithm: Algorithm,
    pub status: CandidateStatus,
    pub rmse: Option<MetricSummary>,
    pub mae: Option<MetricSummary>,
    pub r2: Option<MetricSummary>,
    pub reason: Option<String>,
}

impl CandidateSummary {
    fn evaluated(algorithm: Algorithm, result: &EvaluationResult) -> Self {
        Self {
            algorithm,
            status: CandidateStatus::Evaluated,
            rmse: Some(result.aggregate.rmse),
            mae: Some(result.aggregate.mae),
            r2: Some(result.aggregate.r2),
            reason: None,
        }
    }

    fn excluded(algorithm: Algorithm, status: CandidateStatus, reason: String) -> Self {
        Self {
            algorithm,
            status,
            rmse: None,
            mae: None,
            r2: None,
            reason: Some(reason),
        }
    }
}

/// Shape of the data the run actually trained on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSummary {
    pub rows_received: usize,
    pub rows_used: usize,
    pub duplicates_removed: usize,
    pub dropped_rows: usize,
    pub warmup_rows: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Result of one training run, handed to the caller for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub algorithm: Algorithm,
    /// `auto` or the backend the caller named
    pub requested_algorithm: String,
    /// Parameters in effect for the selected backend, defaults included
    pub hyperparameters: Hyperparameters,
    pub target_column: String,
    pub features_used: Vec<String>,
    pub evaluation: EvaluationResult,
    /// Confidence, reliability and risk read off the selected backend's folds
    pub performance: PerformanceSummary,
    pub candidates: Vec<CandidateSummary>,
    pub forecast: ForecastResult,
    pub anomalies: Vec<AnomalyRecord>,
    pub trend: TrendDescriptor,
    pub technical: TechnicalDescriptors,
    pub statistics: ForecastStatistics,
    pub fitted_history: Vec<FittedPoint>,
    pub frequency: Frequency,
    pub data: DataSummary,
    pub training_duration_secs: f64,
    pub artifact: ArtifactReference,
}

/// Lowest mean RMSE, then lowest mean MAE, then the simpler backend
pub fn compare_candidates(
    a: (Algorithm, &EvaluationResult),
    b: (Algorithm, &EvaluationResult),
) -> Ordering {
    a.1.aggregate
        .rmse
        .mean
        .total_cmp(&b.1.aggregate.rmse.mean)
        .then_with(|| a.1.aggregate.mae.mean.total_cmp(&b.1.aggregate.mae.mean))
        .then_with(|| a.0.complexity_rank().cmp(&b.0.complexity_rank()))
}

/// Runs training jobs against one configuration
#[derive(Clone)]
pub struct TrainingEngine {
    config: EngineConfig,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl std::fmt::Debug for TrainingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingEngine")
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl TrainingEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: None,
        })
    }

    /// Persist each run's final model to `store`
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn train(
        &self,
        request: &TrainingRequest,
        records: &[DataRecord],
    ) -> Result<TrainingOutcome> {
        self.train_with_cancellation(request, records, &CancellationToken::new())
    }

    /// Like [`train`](Self::train), giving up with
    /// [`ForecastError::Cancelled`] at the next fold boundary once `token`
    /// is cancelled
    pub fn train_with_cancellation(
        &self,
        request: &TrainingRequest,
        records: &[DataRecord],
        token: &CancellationToken,
    ) -> Result<TrainingOutcome> {
        let started = Instant::now();
        let request = request.validate(&self.config)?;
        info!(
            "Training '{}' on {} records: algorithm {}, horizon {}",
            request.target_column,
            records.len(),
            request.choice,
            request.horizon
        );

        let matrix = FeatureBuilder::new(request.feature_options.clone()).build(
            records,
            &request.target_column,
            &request.feature_columns,
        )?;
        let required = required_rows(&self.config, request.horizon);
        if matrix.len() < required {
            return Err(ForecastError::InsufficientData {
                required,
                available: matrix.len(),
            });
        }
        let (start, end) = match (matrix.timestamps.first(), matrix.last_timestamp()) {
            (Some(start), Some(end)) => (*start, end),
            _ => {
                return Err(ForecastError::InsufficientData {
                    required,
                    available: 0,
                })
            }
        };

        let frequency = Frequency::infer(&matrix.timestamps);
        let timestamps =
            forecast_timestamps(end, request.forecast_start, request.horizon, &frequency)?;

        let (candidates, mut summaries) = self.eligible_candidates(&request)?;
        let covariates = if request.missing_covariates().is_empty() {
            request.covariate_rows()?
        } else {
            // only backends that ignore covariates remain
            vec![Vec::new(); request.horizon]
        };

        let mut selection = self.evaluate_candidates(&request, &candidates, &matrix, token)?;
        summaries.append(&mut selection.summaries);
        summaries.sort_by_key(|s| s.algorithm.complexity_rank());
        selection.summaries = summaries;

        let (backend, evaluation, output) =
            selection.refit_in_rank_order(request.choice.is_auto(), |backend| {
                token.check()?;
                let mut run = ForecastRun::new(&self.config, &matrix);
                run.train(backend, request.seed)?;
                run.forecast(&timestamps, &covariates)?;
                run.diagnose()?;
                run.finish()
            })?;
        let summaries = selection.summaries;

        let artifact = ModelArtifact {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            engine_version: crate::VERSION.to_string(),
            algorithm: backend.algorithm(),
            hyperparameters: backend.params(),
            layout: matrix.layout.clone(),
            frequency: frequency.clone(),
            last_timestamp: end,
            target_history: matrix.target_history(),
            model: output.model,
        };
        let path = match &self.store {
            Some(store) => store.save(&artifact)?,
            None => None,
        };

        let diagnostics = output.diagnostics;
        let outcome = TrainingOutcome {
            algorithm: backend.algorithm(),
            requested_algorithm: request.choice.to_string(),
            hyperparameters: backend.params(),
            target_column: request.target_column.clone(),
            features_used: matrix.feature_names.clone(),
            performance: evaluation.performance(),
            evaluation,
            candidates: summaries,
            forecast: output.forecast,
            anomalies: diagnostics.anomalies,
            trend: diagnostics.trend,
            technical: diagnostics.technical,
            statistics: diagnostics.statistics,
            fitted_history: diagnostics.fitted_history,
            frequency,
            data: DataSummary {
                rows_received: records.len(),
                rows_used: matrix.len(),
                duplicates_removed: matrix.duplicates_removed,
                dropped_rows: matrix.dropped_rows,
                warmup_rows: matrix.warmup_rows,
                start,
                end,
            },
            training_duration_secs: started.elapsed().as_secs_f64(),
            artifact: ArtifactReference {
                id: artifact.id.to_string(),
                path: path.map(|p| p.display().to_string()),
            },
        };
        info!(
            "Training finished in {:.2}s with {}",
            outcome.training_duration_secs, outcome.algorithm
        );
        Ok(outcome)
    }

    /// Backends that can run with the covariates supplied.
    ///
    /// A named backend that needs missing covariates fails the run; in
    /// `auto` mode it is skipped instead.
    fn eligible_candidates(
        &self,
        request: &ValidatedRequest,
    ) -> Result<(Vec<Backend>, Vec<CandidateSummary>)> {
        let missing = request.missing_covariates();
        let mut backends = Vec::new();
        let mut skipped = Vec::new();
        for algorithm in request.choice.candidates() {
            if algorithm.uses_covariates() && !missing.is_empty() {
                if !request.choice.is_auto() {
                    return Err(ForecastError::MissingCovariates { columns: missing });
                }
                warn!(
                    "Skipping {}: no future values for {}",
                    algorithm,
                    missing.join(", ")
                );
                skipped.push(CandidateSummary::excluded(
                    algorithm,
                    CandidateStatus::Skipped,
                    format!("missing future covariates: {}", missing.join(", ")),
                ));
                continue;
            }
            backends.push(Backend::configure(algorithm, &request.hyperparameters)?);
        }
        Ok((backends, skipped))
    }

    fn evaluate_candidates(
        &self,
        request: &ValidatedRequest,
        backends: &[Backend],
        matrix: &FeatureMatrix,
        token: &CancellationToken,
    ) -> Result<Selection> {
        let validator =
            CrossValidator::new(self.config.engine.default_folds).with_cancellation(token.clone());
        let evaluate = |backend: &Backend| {
            let result = validator.evaluate(backend, matrix, request.seed);
            if let Ok(evaluation) = &result {
                info!(
                    "Candidate {}: RMSE {:.4} ± {:.4}, MAE {:.4} over {} folds",
                    backend.algorithm(),
                    evaluation.aggregate.rmse.mean,
                    evaluation.aggregate.rmse.std,
                    evaluation.aggregate.mae.mean,
                    evaluation.folds.len()
                );
            }
            (backend.clone(), result)
        };

        let results: Vec<(Backend, Result<EvaluationResult>)> =
            if request.choice.is_auto() && self.config.engine.parallel_auto {
                backends.par_iter().map(evaluate).collect()
            } else {
                backends.iter().map(evaluate).collect()
            };

        Selection::from_results(results, request.choice.is_auto())
    }
}

/// Cross-validated candidates, best first, with the summary of every backend
/// considered so far
#[derive(Debug)]
struct Selection {
    ranked: Vec<(Backend, EvaluationResult)>,
    summaries: Vec<CandidateSummary>,
    failures: Vec<(String, String)>,
}

impl Selection {
    /// In `auto` mode a backend failure only excludes that backend; the run
    /// fails once nothing is left. Any other error, or any error for a named
    /// backend, fails the run.
    fn from_results(
        results: Vec<(Backend, Result<EvaluationResult>)>,
        auto: bool,
    ) -> Result<Self> {
        let mut ranked = Vec::new();
        let mut summaries = Vec::new();
        let mut failures = Vec::new();
        for (backend, result) in results {
            match result {
                Ok(evaluation) => {
                    summaries.push(CandidateSummary::evaluated(
                        backend.algorithm(),
                        &evaluation,
                    ));
                    ranked.push((backend, evaluation));
                }
                Err(e) if auto && e.is_backend_failure() => {
                    warn!("Excluding {}: {}", backend.algorithm(), e);
                    failures.push((backend.algorithm().id().to_string(), e.to_string()));
                    summaries.push(CandidateSummary::excluded(
                        backend.algorithm(),
                        CandidateStatus::Failed,
                        e.to_string(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        if ranked.is_empty() {
            return Err(ForecastError::AllBackendsFailed { failures });
        }
        ranked.sort_by(|a, b| {
            compare_candidates((a.0.algorithm(), &a.1), (b.0.algorithm(), &b.1))
        });
        Ok(Self {
            ranked,
            summaries,
            failures,
        })
    }

    /// Refits candidates best first until one succeeds. In `auto` mode a
    /// backend failure during the refit marks that candidate failed and moves
    /// on to the runner-up.
    fn refit_in_rank_order<T, F>(
        &mut self,
        auto: bool,
        mut refit: F,
    ) -> Result<(Backend, EvaluationResult, T)>
    where
        F: FnMut(&Backend) -> Result<T>,
    {
        for (backend, evaluation) in std::mem::take(&mut self.ranked) {
            let algorithm = backend.algorithm();
            info!(
                "Selected {} (RMSE {:.4} ± {:.4})",
                algorithm, evaluation.aggregate.rmse.mean, evaluation.aggregate.rmse.std
            );
            match refit(&backend) {
                Ok(output) => return Ok((backend, evaluation, output)),
                Err(e) if auto && e.is_backend_failure() => {
                    warn!(
                        "Final fit of {} failed, trying the next candidate: {}",
                        algorithm, e
                    );
                    let reason = format!("final fit failed: {}", e);
                    self.failures.push((algorithm.id().to_string(), reason.clone()));
                    let summary = self.summaries.iter_mut().find(|s| s.algorithm == algorithm);
                    if let Some(summary) = summary {
                        summary.status = CandidateStatus::Failed;
                        summary.reason = Some(reason);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(ForecastError::AllBackendsFailed {
            failures: std::mem::take(&mut self.failures),
        })
    }
}
