//! Training requests and their validation

use crate::config::EngineConfig;
use crate::data::parse_timestamp;
use crate::error::{ForecastError, Result};
use crate::features::FeatureOptions;
use crate::models::{Algorithm, Backend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Largest float that still represents every integer below it exactly
const MAX_EXACT_FLOAT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A scalar hyperparameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => write!(f, "null"),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// Backend-specific overrides, keyed by parameter name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hyperparameters(BTreeMap<String, ParamValue>);

impl Hyperparameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ParamValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    fn invalid(key: &str, value: &ParamValue, expected: &str) -> ForecastError {
        ForecastError::validation(
            format!("hyperparameters.{}", key),
            format!("expected {}, got {}", expected, value),
        )
    }

    /// Positive integer parameter
    pub fn positive_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.optional_positive_usize(key)? {
            Some(v) => Ok(v),
            None => Ok(default),
        }
    }

    /// Positive integer parameter where `null` or absence means "unset"
    pub fn optional_positive_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.get(key) {
            None | Some(ParamValue::Null) => Ok(None),
            Some(ParamValue::Int(i)) if *i > 0 => usize::try_from(*i)
                .map(Some)
                .map_err(|_| Self::invalid(key, &ParamValue::Int(*i), "an integer within range")),
            Some(ParamValue::Float(x))
                if x.is_finite()
                    && *x >= 1.0
                    && *x <= MAX_EXACT_FLOAT_INTEGER
                    && x.fract() == 0.0 =>
            {
                Ok(Some(*x as usize))
            }
            Some(other) => Err(Self::invalid(key, other, "a positive integer")),
        }
    }

    /// Non-negative finite number
    pub fn non_negative_f64(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            None | Some(ParamValue::Null) => Ok(default),
            Some(ParamValue::Int(i)) if *i >= 0 => Ok(*i as f64),
            Some(ParamValue::Float(x)) if x.is_finite() && *x >= 0.0 => Ok(*x),
            Some(other) => Err(Self::invalid(key, other, "a non-negative number")),
        }
    }

    /// Strictly positive finite number
    pub fn positive_f64(&self, key: &str, default: f64) -> Result<f64> {
        let value = self.non_negative_f64(key, default)?;
        if value > 0.0 {
            Ok(value)
        } else {
            Err(Self::invalid(key, &ParamValue::Float(value), "a positive number"))
        }
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None | Some(ParamValue::Null) => Ok(default),
            Some(ParamValue::Bool(b)) => Ok(*b),
            Some(other) => Err(Self::invalid(key, other, "a boolean")),
        }
    }
}

/// Either one named backend or automatic selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmChoice {
    Auto,
    Specific(Algorithm),
}

impl AlgorithmChoice {
    /// Backends to evaluate for this choice
    pub fn candidates(&self) -> Vec<Algorithm> {
        match self {
            AlgorithmChoice::Auto => Algorithm::ALL.to_vec(),
            AlgorithmChoice::Specific(algorithm) => vec![*algorithm],
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, AlgorithmChoice::Auto)
    }
}

impl FromStr for AlgorithmChoice {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AlgorithmChoice::Auto),
            other => other.parse::<Algorithm>().map(AlgorithmChoice::Specific),
        }
    }
}

impl fmt::Display for AlgorithmChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmChoice::Auto => write!(f, "auto"),
            AlgorithmChoice::Specific(algorithm) => write!(f, "{}", algorithm),
        }
    }
}

impl Serialize for AlgorithmChoice {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn default_algorithm() -> String {
    "auto".to_string()
}

fn default_horizon() -> i64 {
    30
}

/// One training job as submitted by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRequest {
    #[serde(default, alias = "datasetId")]
    pub dataset_id: Option<String>,
    #[serde(alias = "targetVariable", alias = "target")]
    pub target_column: String,
    #[serde(default, alias = "features")]
    pub feature_columns: Vec<String>,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_horizon")]
    pub horizon: i64,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default, alias = "forecastStartDate")]
    pub forecast_start: Option<String>,
    /// Values of each feature column for the forecast horizon
    #[serde(default, alias = "futureCovariates")]
    pub future_covariates: BTreeMap<String, Vec<f64>>,
    /// Overrides the configured engineered features
    #[serde(default, alias = "featureOptions")]
    pub feature_options: Option<FeatureOptions>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl TrainingRequest {
    pub fn new(
        target_column: impl Into<String>,
        feature_columns: Vec<String>,
        algorithm: impl Into<String>,
        horizon: i64,
    ) -> Self {
        Self {
            dataset_id: None,
            target_column: target_column.into(),
            feature_columns,
            algorithm: algorithm.into(),
            horizon,
            hyperparameters: Hyperparameters::default(),
            forecast_start: None,
            future_covariates: BTreeMap::new(),
            feature_options: None,
            seed: None,
        }
    }

    pub fn with_covariate(mut self, column: impl Into<String>, values: Vec<f64>) -> Self {
        self.future_covariates.insert(column.into(), values);
        self
    }

    pub fn with_hyperparameters(mut self, hyperparameters: Hyperparameters) -> Self {
        self.hyperparameters = hyperparameters;
        self
    }

    pub fn with_feature_options(mut self, options: FeatureOptions) -> Self {
        self.feature_options = Some(options);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check the request against the engine limits before any work is done.
    ///
    /// Every failure is a [`ForecastError::Validation`] naming the field.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidatedRequest> {
        if self.target_column.trim().is_empty() {
            return Err(ForecastError::validation(
                "target_column",
                "target column must not be empty",
            ));
        }
        if self.feature_columns.is_empty() {
            return Err(ForecastError::validation(
                "feature_columns",
                "at least one feature column is required",
            ));
        }
        let mut seen = BTreeSet::new();
        for feature in &self.feature_columns {
            if feature.trim().is_empty() {
                return Err(ForecastError::validation(
                    "feature_columns",
                    "feature column names must not be empty",
                ));
            }
            if feature == &self.target_column {
                return Err(ForecastError::validation(
                    "feature_columns",
                    format!("target column '{}' cannot also be a feature", feature),
                ));
            }
            if !seen.insert(feature.as_str()) {
                return Err(ForecastError::validation(
                    "feature_columns",
                    format!("feature column '{}' is listed twice", feature),
                ));
            }
        }

        let max = config.engine.max_horizon;
        if self.horizon < 1 || self.horizon as u64 > max as u64 {
            return Err(ForecastError::validation(
                "horizon",
                format!("horizon must be between 1 and {}, got {}", max, self.horizon),
            ));
        }
        let horizon = self.horizon as usize;

        let choice: AlgorithmChoice = self.algorithm.parse()?;

        let forecast_start = match &self.forecast_start {
            None => None,
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| {
                ForecastError::validation(
                    "forecast_start",
                    format!("cannot parse forecast start date '{}'", raw),
                )
            })?),
        };

        for (column, values) in &self.future_covariates {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(ForecastError::validation(
                    "future_covariates",
                    format!("values for '{}' must be finite", column),
                ));
            }
        }

        let feature_options = self
            .feature_options
            .clone()
            .unwrap_or_else(|| config.features.clone());
        feature_options.validate()?;

        for algorithm in choice.candidates() {
            Backend::configure(algorithm, &self.hyperparameters)?;
        }

        Ok(ValidatedRequest {
            target_column: self.target_column.clone(),
            feature_columns: self.feature_columns.clone(),
            choice,
            horizon,
            hyperparameters: self.hyperparameters.clone(),
            forecast_start,
            future_covariates: self.future_covariates.clone(),
            feature_options,
            seed: self.seed.unwrap_or(config.engine.seed),
        })
    }
}

/// A request whose fields have been checked and parsed
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub target_column: String,
    pub feature_columns: Vec<String>,
    pub choice: AlgorithmChoice,
    pub horizon: usize,
    pub hyperparameters: Hyperparameters,
    pub forecast_start: Option<DateTime<Utc>>,
    pub future_covariates: BTreeMap<String, Vec<f64>>,
    pub feature_options: FeatureOptions,
    pub seed: u64,
}

impl ValidatedRequest {
    /// Feature columns with fewer than `horizon` supplied future values
    pub fn missing_covariates(&self) -> Vec<String> {
        self.feature_columns
            .iter()
            .filter(|c| {
                self.future_covariates
                    .get(c.as_str())
                    .map_or(true, |values| values.len() < self.horizon)
            })
            .cloned()
            .collect()
    }

    /// Future covariate rows, one per forecast step, in feature column order
    pub fn covariate_rows(&self) -> Result<Vec<Vec<f64>>> {
        let missing = self.missing_covariates();
        if !missing.is_empty() {
            return Err(ForecastError::MissingCovariates { columns: missing });
        }
        Ok((0..self.horizon)
            .map(|step| {
                self.feature_columns
                    .iter()
                    .filter_map(|c| self.future_covariates.get(c).map(|v| v[step]))
                    .collect()
            })
            .collect())
    }
}
