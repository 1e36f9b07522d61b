//! Forecast Generator
//!
//! A run moves strictly through `Built -> Trained -> Forecasted ->
//! Diagnosed -> Done`; calling a step out of order is an internal error.

use crate::anomaly::{AnomalyDetector, AnomalyRecord};
use crate::config::EngineConfig;
use crate::error::{ForecastError, Result};
use crate::features::FeatureMatrix;
use crate::models::{Backend, FittedForecastModel, FittedModel, ForecastContext, Uncertainty};
use crate::technical::{describe_technical, TechnicalDescriptors};
use crate::trend::{describe_trend, TrendDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Bounds of the primary confidence band
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBand {
    pub level: f64,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl ConfidenceBand {
    pub fn width(&self, step: usize) -> f64 {
        self.upper[step] - self.lower[step]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub points: Vec<ForecastPoint>,
    /// Level of the band stored on each point
    pub confidence_level: f64,
    /// Every configured level, primary first
    pub bands: Vec<ConfidenceBand>,
    /// Additive components, for backends that decompose the series
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<BTreeMap<String, Vec<f64>>>,
}

impl ForecastResult {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.points.iter().map(|p| p.timestamp).collect()
    }
}

/// Band for each level around `values`.
///
/// Inverted bounds are reordered with a warning. A band that is wider at the
/// first step than at the last (beyond `tolerance`, relative) means the
/// backend's variance model is inverted and is reported as an internal error.
pub fn confidence_bands(
    values: &[f64],
    uncertainty: &Uncertainty,
    levels: &[f64],
    tolerance: f64,
) -> Result<Vec<ConfidenceBand>> {
    if uncertainty.horizon() < values.len() {
        return Err(ForecastError::Internal(format!(
            "uncertainty covers {} steps, forecast has {}",
            uncertainty.horizon(),
            values.len()
        )));
    }

    let mut bands = Vec::with_capacity(levels.len());
    for &level in levels {
        let mut lower = Vec::with_capacity(values.len());
        let mut upper = Vec::with_capacity(values.len());
        for (step, &value) in values.iter().enumerate() {
            let (below, above) = uncertainty.offsets(level, step)?;
            let (mut lo, mut hi) = (value - below, value + above);
            if !(lo.is_finite() && hi.is_finite()) {
                return Err(ForecastError::Internal(format!(
                    "non-finite {} band at step {}",
                    level,
                    step + 1
                )));
            }
            if lo > hi {
                warn!(
                    "Reordering inverted {} band at step {}: {} > {}",
                    level,
                    step + 1,
                    lo,
                    hi
                );
                std::mem::swap(&mut lo, &mut hi);
            }
            lower.push(lo.min(value));
            upper.push(hi.max(value));
        }

        let band = ConfidenceBand {
            level,
            lower,
            upper,
        };
        for step in 1..values.len() {
            let (previous, current) = (band.width(step - 1), band.width(step));
            if previous > current + tolerance * current.abs().max(1.0) {
                return Err(ForecastError::Internal(format!(
                    "{} band narrows with horizon: width {} at step {}, {} at step {}",
                    level,
                    previous,
                    step,
                    current,
                    step + 1
                )));
            }
        }
        bands.push(band);
    }
    Ok(bands)
}

/// Summary of the forecast values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastStatistics {
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
}

impl ForecastStatistics {
    pub fn of(values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            return Err(ForecastError::Internal(
                "statistics of an empty forecast".to_string(),
            ));
        }
        let mut data = Data::new(values.to_vec());
        Ok(Self {
            mean: values.iter().mean(),
            std: values.iter().population_std_dev(),
            min: Statistics::min(values.iter()),
            max: Statistics::max(values.iter()),
            median: data.median(),
            p25: data.lower_quartile(),
            p75: data.upper_quartile(),
        })
    }
}

/// In-sample fit of the final model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPoint {
    pub timestamp: DateTime<Utc>,
    pub actual: f64,
    pub fitted: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub anomalies: Vec<AnomalyRecord>,
    pub trend: TrendDescriptor,
    pub technical: TechnicalDescriptors,
    pub statistics: ForecastStatistics,
    pub fitted_history: Vec<FittedPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Built,
    Trained,
    Forecasted,
    Diagnosed,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Built => "built",
            Stage::Trained => "trained",
            Stage::Forecasted => "forecasted",
            Stage::Diagnosed => "diagnosed",
            Stage::Done => "done",
        };
        write!(f, "{}", label)
    }
}

/// Products of a completed run
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub model: FittedModel,
    pub forecast: ForecastResult,
    pub diagnostics: Diagnostics,
}

/// One pass from a feature matrix to a diagnosed forecast
#[derive(Debug)]
pub struct ForecastRun<'a> {
    config: &'a EngineConfig,
    history: &'a FeatureMatrix,
    stage: Stage,
    model: Option<FittedModel>,
    forecast: Option<ForecastResult>,
    diagnostics: Option<Diagnostics>,
}

impl<'a> ForecastRun<'a> {
    pub fn new(config: &'a EngineConfig, history: &'a FeatureMatrix) -> Self {
        Self {
            config,
            history,
            stage: Stage::Built,
            model: None,
            forecast: None,
            diagnostics: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, from: Stage, to: Stage) -> Result<()> {
        if self.stage != from {
            return Err(ForecastError::Internal(format!(
                "cannot move to {} from {}, expected {}",
                to, self.stage, from
            )));
        }
        debug!("Forecast run {} -> {}", from, to);
        self.stage = to;
        Ok(())
    }

    fn missing(&self, what: &str) -> ForecastError {
        ForecastError::Internal(format!("{} missing at stage {}", what, self.stage))
    }

    /// Fit the backend on the whole history
    pub fn train(&mut self, backend: &Backend, seed: u64) -> Result<&FittedModel> {
        self.advance(Stage::Built, Stage::Trained)?;
        let model = backend.fit(self.history, seed)?;
        info!("Trained {} on {} rows", model.algorithm(), self.history.len());
        Ok(self.model.insert(model))
    }

    /// Point forecasts and confidence bands for `timestamps`
    pub fn forecast(
        &mut self,
        timestamps: &[DateTime<Utc>],
        covariates: &[Vec<f64>],
    ) -> Result<&ForecastResult> {
        self.advance(Stage::Trained, Stage::Forecasted)?;
        let model = self.model.as_ref().ok_or_else(|| self.missing("model"))?;

        let ctx = ForecastContext {
            history: self.history,
            timestamps,
            covariates,
        };
        let values = model.predict_horizon(&ctx)?;
        if values.len() != timestamps.len() {
            return Err(ForecastError::Internal(format!(
                "{} produced {} values for {} steps",
                model.algorithm(),
                values.len(),
                timestamps.len()
            )));
        }
        let uncertainty = model.estimate_uncertainty(values.len())?;
        let settings = &self.config.forecast;
        let bands = confidence_bands(
            &values,
            &uncertainty,
            &settings.confidence_levels,
            settings.width_tolerance,
        )?;
        let primary = bands
            .first()
            .ok_or_else(|| ForecastError::Config("no confidence levels".to_string()))?;

        let points = timestamps
            .iter()
            .zip(&values)
            .enumerate()
            .map(|(i, (timestamp, value))| ForecastPoint {
                timestamp: *timestamp,
                value: *value,
                lower: primary.lower[i],
                upper: primary.upper[i],
            })
            .collect();
        let result = ForecastResult {
            points,
            confidence_level: primary.level,
            components: model.components(timestamps),
            bands,
        };
        info!(
            "Forecast {} steps with {} ({}% band)",
            result.len(),
            model.algorithm(),
            result.confidence_level * 100.0
        );
        Ok(self.forecast.insert(result))
    }

    /// Anomalies, trend, technical descriptors, statistics and the
    /// in-sample fit
    pub fn diagnose(&mut self) -> Result<&Diagnostics> {
        self.advance(Stage::Forecasted, Stage::Diagnosed)?;
        let model = self.model.as_ref().ok_or_else(|| self.missing("model"))?;
        let forecast = self.forecast.as_ref().ok_or_else(|| self.missing("forecast"))?;
        let history = self.history;
        let values = forecast.values();
        let timestamps = forecast.timestamps();

        let fitted = model.fitted_values(history)?;
        let detector = AnomalyDetector::from_settings(&self.config.anomaly)?;
        let mut anomalies =
            detector.residual_anomalies(&history.timestamps, &history.target, &fitted)?;
        anomalies.extend(detector.forecast_anomalies(&history.target, &timestamps, &values)?);
        if !anomalies.is_empty() {
            info!("Flagged {} anomalies", anomalies.len());
        }

        let target_history = history.target_history();
        let diagnostics = Diagnostics {
            anomalies,
            trend: describe_trend(&history.target, &values, self.config.trend.sideways_band)?,
            technical: describe_technical(&self.config.technical, &target_history, &values)?,
            statistics: ForecastStatistics::of(&values)?,
            fitted_history: history
                .timestamps
                .iter()
                .zip(&history.target)
                .zip(&fitted)
                .map(|((timestamp, actual), fitted)| FittedPoint {
                    timestamp: *timestamp,
                    actual: *actual,
                    fitted: *fitted,
                })
                .collect(),
        };
        debug!("Trend {}", diagnostics.trend.direction);
        Ok(self.diagnostics.insert(diagnostics))
    }

    pub fn finish(mut self) -> Result<RunOutput> {
        self.advance(Stage::Diagnosed, Stage::Done)?;
        let model = self.model.take().ok_or_else(|| self.missing("model"))?;
        let forecast = self.forecast.take().ok_or_else(|| self.missing("forecast"))?;
        let diagnostics = self
            .diagnostics
            .take()
            .ok_or_else(|| self.missing("diagnostics"))?;
        Ok(RunOutput {
            model,
            forecast,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureOptions;
    use crate::models::test_support::matrix;
    use crate::models::Algorithm;
    use crate::request::Hyperparameters;
    use approx::assert_abs_diff_eq;
    use chrono::Duration;

    fn future(m: &FeatureMatrix, horizon: usize) -> (Vec<DateTime<Utc>>, Vec<Vec<f64>>) {
        let last = m.last_timestamp().unwrap();
        let n = m.len() as f64;
        (
            (1..=horizon as i64).map(|d| last + Duration::days(d)).collect(),
            (0..horizon).map(|i| vec![n + i as f64]).collect(),
        )
    }

    #[test]
    fn test_gaussian_bands_widen() {
        let uncertainty = Uncertainty::gaussian_sqrt_steps(1.0, 4);
        let bands = confidence_bands(&[0.0; 4], &uncertainty, &[0.95, 0.8], 1e-9).unwrap();
        assert_eq!(bands.len(), 2);
        assert_abs_diff_eq!(bands[0].upper[0], 1.959964, epsilon = 1e-5);
        assert_abs_diff_eq!(bands[0].width(3), 2.0 * bands[0].width(0), epsilon = 1e-9);
        assert!(bands[1].width(0) < bands[0].width(0));
    }

    #[test]
    fn test_narrowing_band_is_internal_error() {
        let uncertainty = Uncertainty::Gaussian {
            std_dev: vec![2.0, 1.0],
        };
        let err = confidence_bands(&[0.0, 0.0], &uncertainty, &[0.95], 1e-9).unwrap_err();
        assert!(matches!(err, ForecastError::Internal(_)));
    }

    #[test]
    fn test_band_narrowing_mid_horizon_is_internal_error() {
        // first and last widths grow, but step 3 is narrower than step 2
        let uncertainty = Uncertainty::Gaussian {
            std_dev: vec![1.0, 3.0, 2.0, 4.0],
        };
        match confidence_bands(&[0.0; 4], &uncertainty, &[0.8], 1e-9) {
            Err(ForecastError::Internal(message)) => assert!(message.contains("step 3")),
            other => panic!("expected internal error, got {:?}", other),
        }
    }

    #[test]
    fn test_statistics() {
        let stats = ForecastStatistics::of(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_abs_diff_eq!(stats.mean, 3.0);
        assert_abs_diff_eq!(stats.std, 2.0f64.sqrt());
        assert_abs_diff_eq!(stats.min, 1.0);
        assert_abs_diff_eq!(stats.max, 5.0);
        assert_abs_diff_eq!(stats.median, 3.0);
        assert!(stats.p25 < stats.median && stats.median < stats.p75);
    }

    #[test]
    fn test_run_walks_every_stage() {
        let m = matrix(40, |i| 3.0 * i as f64 + 1.0, FeatureOptions::default());
        let config = EngineConfig::default();
        let backend = Backend::configure(Algorithm::Linear, &Hyperparameters::new()).unwrap();
        let (timestamps, covariates) = future(&m, 5);

        let mut run = ForecastRun::new(&config, &m);
        assert_eq!(run.stage(), Stage::Built);
        run.train(&backend, 7).unwrap();
        let forecast = run.forecast(&timestamps, &covariates).unwrap();
        assert_eq!(forecast.len(), 5);
        for (i, point) in forecast.points.iter().enumerate() {
            assert_abs_diff_eq!(point.value, 3.0 * (40 + i) as f64 + 1.0, epsilon = 1e-6);
            assert!(point.lower <= point.value && point.value <= point.upper);
        }
        run.diagnose().unwrap();
        assert_eq!(run.stage(), Stage::Diagnosed);
        let out = run.finish().unwrap();
        assert!(out.diagnostics.anomalies.is_empty());
        assert_eq!(out.diagnostics.fitted_history.len(), 40);
        assert_eq!(out.diagnostics.trend.direction, crate::trend::TrendDirection::Upward);
    }

    #[test]
    fn test_out_of_order_steps_fail() {
        let m = matrix(20, |i| i as f64, FeatureOptions::default());
        let config = EngineConfig::default();
        let (timestamps, covariates) = future(&m, 2);
        let mut run = ForecastRun::new(&config, &m);
        assert!(run.forecast(&timestamps, &covariates).is_err());

        let mut run = ForecastRun::new(&config, &m);
        assert!(run.diagnose().is_err());

        let backend = Backend::configure(Algorithm::Linear, &Hyperparameters::new()).unwrap();
        let mut run = ForecastRun::new(&config, &m);
        run.train(&backend, 0).unwrap();
        assert!(run.train(&backend, 0).is_err());
    }
}
