//! # Forecast Engine Workspace
//!
//! Umbrella crate over the workspace members:
//!
//! - [`series_math`]: streaming technical indicators and series statistics
//! - [`forecast_engine`]: model training, cross-validation and forecasting
//!
//! ## Example
//!
//! ```
//! use forecast_engine_workspace::series_math::series::mean;
//!
//! assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
//! assert_eq!(forecast_engine_workspace::forecast_engine::NAME, "forecast_engine");
//! ```

pub use forecast_engine;
pub use series_math;

#[cfg(test)]
mod tests {
    use forecast_engine::models::Algorithm;

    #[test]
    fn test_members_are_reachable() {
        assert_eq!(Algorithm::ALL.len(), 4);
        assert_eq!(series_math::series::mean(&[2.0, 4.0]), Some(3.0));
    }
}
