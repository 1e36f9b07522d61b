//! Error types for the forecast_engine crate

use series_math::IndicatorError;
use thiserror::Error;

/// Every way a training run can fail.
///
/// A run surfaces exactly one of these; nothing is retried inside the engine.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// A requested column is absent, or the date column cannot be parsed
    #[error("Schema error in column '{column}': {message}")]
    Schema { column: String, message: String },

    /// A value could not be coerced to a number
    #[error("Data type error in column '{column}' at row {row}: {message}")]
    DataType {
        column: String,
        row: usize,
        message: String,
    },

    /// Not enough rows for the folds or the horizon
    #[error("Insufficient data: at least {required} rows are required, got {available}")]
    InsufficientData { required: usize, available: usize },

    /// A backend needs future covariate values the caller did not supply
    #[error("Missing future covariates: {}", .columns.join(", "))]
    MissingCovariates { columns: Vec<String> },

    /// The request itself is malformed
    #[error("Validation error in field '{field}': {message}")]
    Validation { field: String, message: String },

    /// Numerical failure while fitting a backend
    #[error("Backend '{backend}' failed to fit: {message}")]
    BackendFit { backend: String, message: String },

    /// Numerical failure while predicting with a fitted backend
    #[error("Backend '{backend}' failed to predict: {message}")]
    BackendPredict { backend: String, message: String },

    /// Every candidate failed in `auto` mode
    #[error("All candidate backends failed: {}", join_failures(.failures))]
    AllBackendsFailed { failures: Vec<(String, String)> },

    /// An engine invariant was violated (a defect, never user input)
    #[error("Internal error: {0}")]
    Internal(String),

    /// The caller abandoned the run
    #[error("Training run was cancelled")]
    Cancelled,

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from IO operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from JSON (de)serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error parsing a TOML configuration
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Result type with our custom error
pub type Result<T> = std::result::Result<T, ForecastError>;

impl ForecastError {
    pub fn schema(column: impl Into<String>, message: impl Into<String>) -> Self {
        ForecastError::Schema {
            column: column.into(),
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ForecastError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn fit(backend: impl Into<String>, message: impl Into<String>) -> Self {
        ForecastError::BackendFit {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn predict(backend: impl Into<String>, message: impl Into<String>) -> Self {
        ForecastError::BackendPredict {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable tag for the error category
    pub fn kind(&self) -> &'static str {
        match self {
            ForecastError::Schema { .. } => "schema_error",
            ForecastError::DataType { .. } => "data_type_error",
            ForecastError::InsufficientData { .. } => "insufficient_data",
            ForecastError::MissingCovariates { .. } => "missing_covariates",
            ForecastError::Validation { .. } => "validation_error",
            ForecastError::BackendFit { .. } => "backend_fit_error",
            ForecastError::BackendPredict { .. } => "backend_predict_error",
            ForecastError::AllBackendsFailed { .. } => "all_backends_failed",
            ForecastError::Internal(_) => "internal_error",
            ForecastError::Cancelled => "cancelled",
            ForecastError::Config(_) | ForecastError::ConfigParse(_) => "config_error",
            ForecastError::Io(_) => "io_error",
            ForecastError::Serialization(_) => "serialization_error",
        }
    }

    /// HTTP status the web tier is expected to map this error to
    pub fn http_status(&self) -> u16 {
        match self {
            ForecastError::Schema { .. }
            | ForecastError::DataType { .. }
            | ForecastError::InsufficientData { .. }
            | ForecastError::MissingCovariates { .. }
            | ForecastError::Validation { .. } => 400,
            _ => 500,
        }
    }

    /// Whether this error belongs to one backend rather than to the run.
    ///
    /// In `auto` mode such failures exclude the backend instead of aborting.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            ForecastError::BackendFit { .. } | ForecastError::BackendPredict { .. }
        )
    }
}

fn join_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(backend, message)| format!("{}: {}", backend, message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<IndicatorError> for ForecastError {
    fn from(err: IndicatorError) -> Self {
        ForecastError::Internal(format!("indicator calculation failed: {}", err))
    }
}
