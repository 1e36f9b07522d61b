//! # Forecast Engine
//!
//! Model training and inference for multivariate time series: fit a model to
//! historical records, forecast a horizon with confidence bands, score the
//! model with expanding-window cross-validation and derive anomaly, trend and
//! technical-indicator diagnostics from the result.
//!
//! ## Features
//!
//! - Feature building from loosely typed records (date parsing, ordering,
//!   forward fill, optional lag / rolling / calendar features)
//! - Four backends behind one contract: linear regression, random forest,
//!   a lookback neural regressor and a trend + Fourier seasonality model
//! - `auto` selection by cross-validated RMSE, evaluated in parallel
//! - Confidence bands for any number of levels
//! - z-score anomalies, trend descriptors and RSI / MACD / Bollinger / moving
//!   averages over recent history plus the forecast
//!
//! ## Quick Start
//!
//! ```rust
//! use forecast_engine::{DataRecord, EngineConfig, TrainingEngine, TrainingRequest};
//!
//! # fn main() -> forecast_engine::Result<()> {
//! let records: Vec<DataRecord> = (1..=28)
//!     .map(|day| {
//!         DataRecord::new()
//!             .with("date", format!("2024-02-{:02}", day))
//!             .with("x", day as f64)
//!             .with("sales", 2.0 * day as f64 + 50.0)
//!     })
//!     .collect();
//!
//! let request = TrainingRequest::new("sales", vec!["x".to_string()], "linear", 3)
//!     .with_covariate("x", vec![29.0, 30.0, 31.0]);
//!
//! let engine = TrainingEngine::new(EngineConfig::default())?;
//! let outcome = engine.train(&request, &records)?;
//! assert_eq!(outcome.forecast.len(), 3);
//! # Ok(())
//! # }
//! ```

pub mod anomaly;
pub mod artifact;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod forecast;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod request;
pub mod technical;
pub mod trend;
pub mod validation;

// Re-export commonly used types
pub use crate::artifact::{ArtifactStore, FileArtifactStore, ModelArtifact};
pub use crate::config::EngineConfig;
pub use crate::data::{DataRecord, FieldValue};
pub use crate::error::{ForecastError, Result};
pub use crate::features::{FeatureBuilder, FeatureMatrix, FeatureOptions};
pub use crate::forecast::ForecastResult;
pub use crate::models::{Algorithm, FittedForecastModel, ForecastModel};
pub use crate::orchestrator::{TrainingEngine, TrainingOutcome};
pub use crate::request::{Hyperparameters, ParamValue, TrainingRequest};
pub use crate::validation::CancellationToken;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
