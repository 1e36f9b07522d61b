//! Engine configuration.
//!
//! Every field has a default so an empty TOML document is a valid
//! configuration; `validate` rejects values the engine cannot run with.

use crate::error::{ForecastError, Result};
use crate::features::FeatureOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub forecast: ForecastSettings,
    #[serde(default)]
    pub anomaly: AnomalySettings,
    #[serde(default)]
    pub trend: TrendSettings,
    #[serde(default)]
    pub technical: TechnicalSettings,
    /// Engineered features applied when a request does not specify its own
    #[serde(default)]
    pub features: FeatureOptions,
}

/// Run-level limits and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Largest horizon a request may ask for
    #[serde(default = "default_max_horizon")]
    pub max_horizon: usize,
    /// Cross-validation folds before automatic reduction
    #[serde(default = "default_folds")]
    pub default_folds: usize,
    /// Absolute floor on usable rows; the effective minimum is
    /// `max(min_training_rows, 2 * horizon)`
    #[serde(default = "default_min_training_rows")]
    pub min_training_rows: usize,
    /// Seed used when the request does not carry one
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Evaluate `auto` candidates concurrently
    #[serde(default = "default_true")]
    pub parallel_auto: bool,
}

fn default_max_horizon() -> usize {
    365
}
fn default_folds() -> usize {
    5
}
fn default_min_training_rows() -> usize {
    10
}
fn default_seed() -> u64 {
    42
}
fn default_true() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_horizon: default_max_horizon(),
            default_folds: default_folds(),
            min_training_rows: default_min_training_rows(),
            seed: default_seed(),
            parallel_auto: true,
        }
    }
}

/// Confidence band settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSettings {
    /// Band levels; the first one is attached to each forecast point
    #[serde(default = "default_confidence_levels")]
    pub confidence_levels: Vec<f64>,
    /// Relative slack allowed when checking that bands do not narrow
    #[serde(default = "default_width_tolerance")]
    pub width_tolerance: f64,
}

fn default_confidence_levels() -> Vec<f64> {
    vec![0.95, 0.80]
}
fn default_width_tolerance() -> f64 {
    1e-9
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            confidence_levels: default_confidence_levels(),
            width_tolerance: default_width_tolerance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalySettings {
    /// `|z|` above which a point is reported
    #[serde(default = "default_anomaly_threshold")]
    pub threshold: f64,
    /// Window of the rolling local trend
    #[serde(default = "default_anomaly_window")]
    pub window: usize,
}

fn default_anomaly_threshold() -> f64 {
    3.0
}
fn default_anomaly_window() -> usize {
    7
}

impl Default for AnomalySettings {
    fn default() -> Self {
        Self {
            threshold: default_anomaly_threshold(),
            window: default_anomaly_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSettings {
    /// Fraction of the value range treated as "sideways"
    #[serde(default = "default_sideways_band")]
    pub sideways_band: f64,
}

fn default_sideways_band() -> f64 {
    0.02
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self {
            sideways_band: default_sideways_band(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalSettings {
    /// Trailing history points prepended to the forecast
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,
    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,
    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,
    #[serde(default = "default_bollinger_period")]
    pub bollinger_period: usize,
    #[serde(default = "default_bollinger_std_dev")]
    pub bollinger_std_dev: f64,
    #[serde(default = "default_moving_average_periods")]
    pub moving_average_periods: Vec<usize>,
}

fn default_history_window() -> usize {
    60
}
fn default_rsi_period() -> usize {
    14
}
fn default_macd_fast() -> usize {
    12
}
fn default_macd_slow() -> usize {
    26
}
fn default_macd_signal() -> usize {
    9
}
fn default_bollinger_period() -> usize {
    20
}
fn default_bollinger_std_dev() -> f64 {
    2.0
}
fn default_moving_average_periods() -> Vec<usize> {
    vec![5, 10, 20]
}

impl Default for TechnicalSettings {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            rsi_period: default_rsi_period(),
            macd_fast: default_macd_fast(),
            macd_slow: default_macd_slow(),
            macd_signal: default_macd_signal(),
            bollinger_period: default_bollinger_period(),
            bollinger_std_dev: default_bollinger_std_dev(),
            moving_average_periods: default_moving_average_periods(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let e = &self.engine;
        if e.max_horizon == 0 {
            return Err(ForecastError::Config(
                "engine.max_horizon must be positive".to_string(),
            ));
        }
        if e.default_folds < 2 {
            return Err(ForecastError::Config(
                "engine.default_folds must be at least 2".to_string(),
            ));
        }
        if e.min_training_rows < 3 {
            return Err(ForecastError::Config(
                "engine.min_training_rows must be at least 3".to_string(),
            ));
        }

        let f = &self.forecast;
        if f.confidence_levels.is_empty() {
            return Err(ForecastError::Config(
                "forecast.confidence_levels must not be empty".to_string(),
            ));
        }
        if let Some(level) = f
            .confidence_levels
            .iter()
            .find(|l| !(l.is_finite() && **l > 0.0 && **l < 1.0))
        {
            return Err(ForecastError::Config(format!(
                "forecast.confidence_levels entries must be in (0, 1), got {}",
                level
            )));
        }
        if !(f.width_tolerance.is_finite() && f.width_tolerance >= 0.0) {
            return Err(ForecastError::Config(
                "forecast.width_tolerance must be non-negative".to_string(),
            ));
        }

        if !(self.anomaly.threshold.is_finite() && self.anomaly.threshold > 0.0) {
            return Err(ForecastError::Config(
                "anomaly.threshold must be positive".to_string(),
            ));
        }
        if self.anomaly.window == 0 {
            return Err(ForecastError::Config(
                "anomaly.window must be positive".to_string(),
            ));
        }
        if !(self.trend.sideways_band.is_finite() && self.trend.sideways_band >= 0.0) {
            return Err(ForecastError::Config(
                "trend.sideways_band must be non-negative".to_string(),
            ));
        }

        let t = &self.technical;
        if t.macd_fast >= t.macd_slow {
            return Err(ForecastError::Config(
                "technical.macd_fast must be smaller than technical.macd_slow".to_string(),
            ));
        }
        if t.rsi_period == 0
            || t.macd_signal == 0
            || t.bollinger_period == 0
            || t.moving_average_periods.contains(&0)
        {
            return Err(ForecastError::Config(
                "technical indicator periods must be positive".to_string(),
            ));
        }
        if !(t.bollinger_std_dev.is_finite() && t.bollinger_std_dev > 0.0) {
            return Err(ForecastError::Config(
                "technical.bollinger_std_dev must be positive".to_string(),
            ));
        }

        self.features
            .validate()
            .map_err(|e| ForecastError::Config(e.to_string()))
    }
}
