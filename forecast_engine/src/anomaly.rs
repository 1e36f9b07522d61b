//! z-score anomaly detection.
//!
//! Anomalies are reported, never removed: the forecast is computed from the
//! data as given.

use crate::config::AnomalySettings;
use crate::error::{ForecastError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use series_math::series::{mean, population_std_dev, rolling_median, z_scores};
use std::fmt;

/// Spread below this fraction of the series scale counts as no spread
const FLAT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySource {
    /// Historical point far from the fitted model
    Residual,
    /// Forecast point far from its rolling local trend
    Forecast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyCategory {
    Spike,
    Dip,
}

impl fmt::Display for AnomalyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyCategory::Spike => write!(f, "spike"),
            AnomalyCategory::Dip => write!(f, "dip"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    /// Position within the series the record comes from
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Fitted value or local trend the point was compared against
    pub expected: f64,
    pub z_score: f64,
    pub category: AnomalyCategory,
    pub source: AnomalySource,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyDetector {
    threshold: f64,
    window: usize,
}

impl AnomalyDetector {
    pub fn new(threshold: f64, window: usize) -> Result<Self> {
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(ForecastError::Config(format!(
                "anomaly threshold must be positive, got {}",
                threshold
            )));
        }
        if window == 0 {
            return Err(ForecastError::Config(
                "anomaly window must be at least 1".to_string(),
            ));
        }
        Ok(Self { threshold, window })
    }

    pub fn from_settings(settings: &AnomalySettings) -> Result<Self> {
        Self::new(settings.threshold, settings.window)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Historical points whose residual `actual - fitted` has `|z|` above
    /// the threshold
    pub fn residual_anomalies(
        &self,
        timestamps: &[DateTime<Utc>],
        actual: &[f64],
        fitted: &[f64],
    ) -> Result<Vec<AnomalyRecord>> {
        check_lengths(timestamps.len(), actual.len(), fitted.len())?;
        if actual.is_empty() {
            return Ok(Vec::new());
        }
        let residuals: Vec<f64> = actual.iter().zip(fitted).map(|(a, f)| a - f).collect();
        let spread = population_std_dev(&residuals).unwrap_or(0.0);
        if spread <= FLAT_TOLERANCE * scale_of(actual) {
            return Ok(Vec::new());
        }
        let scores = z_scores(&residuals)?;

        Ok(self.flag(
            scores.into_iter().enumerate().map(|(i, z)| (i, z, actual[i], fitted[i])),
            timestamps,
            AnomalySource::Residual,
        ))
    }

    /// Forecast points whose deviation from the centered rolling median of
    /// `history ++ forecast` is extreme relative to the deviations seen in
    /// the history.
    pub fn forecast_anomalies(
        &self,
        history: &[f64],
        timestamps: &[DateTime<Utc>],
        forecast: &[f64],
    ) -> Result<Vec<AnomalyRecord>> {
        check_lengths(timestamps.len(), forecast.len(), forecast.len())?;
        if history.len() < 2 || forecast.is_empty() {
            return Ok(Vec::new());
        }
        let mut series = history.to_vec();
        series.extend_from_slice(forecast);
        let local = rolling_median(&series, self.window)?;
        let deviations: Vec<f64> = series.iter().zip(&local).map(|(v, m)| v - m).collect();

        let (reference, ahead) = deviations.split_at(history.len());
        let (center, spread) = match (mean(reference), population_std_dev(reference)) {
            (Some(c), Some(s)) => (c, s),
            _ => return Ok(Vec::new()),
        };
        if spread <= FLAT_TOLERANCE * scale_of(&series) {
            return Ok(Vec::new());
        }

        let offset = history.len();
        Ok(self.flag(
            ahead.iter().enumerate().map(|(i, d)| {
                (i, (d - center) / spread, forecast[i], local[offset + i])
            }),
            timestamps,
            AnomalySource::Forecast,
        ))
    }

    fn flag<I>(
        &self,
        scored: I,
        timestamps: &[DateTime<Utc>],
        source: AnomalySource,
    ) -> Vec<AnomalyRecord>
    where
        I: Iterator<Item = (usize, f64, f64, f64)>,
    {
        scored
            .filter(|(_, z, _, _)| z.abs() > self.threshold)
            .map(|(index, z_score, value, expected)| AnomalyRecord {
                index,
                timestamp: timestamps[index],
                value,
                expected,
                z_score,
                category: if z_score > 0.0 {
                    AnomalyCategory::Spike
                } else {
                    AnomalyCategory::Dip
                },
                source,
            })
            .collect()
    }
}

fn scale_of(values: &[f64]) -> f64 {
    values.iter().fold(1.0f64, |acc, v| acc.max(v.abs()))
}

fn check_lengths(timestamps: usize, values: usize, reference: usize) -> Result<()> {
    if timestamps != values || values != reference {
        return Err(ForecastError::Internal(format!(
            "anomaly input lengths differ: {} timestamps, {} values, {} references",
            timestamps, values, reference
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn days(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        (0..n).map(|i| start + Duration::days(i as i64)).collect()
    }

    fn wiggle(i: usize) -> f64 {
        // deterministic small noise in [-0.5, 0.5]
        ((i * 7919) % 11) as f64 / 10.0 - 0.5
    }

    #[test]
    fn test_single_residual_outlier_is_flagged() {
        let n = 60;
        let fitted: Vec<f64> = (0..n).map(|i| 10.0 + i as f64).collect();
        let mut actual: Vec<f64> = fitted.iter().enumerate().map(|(i, f)| f + wiggle(i)).collect();
        actual[30] += 25.0;

        let detector = AnomalyDetector::new(3.0, 7).unwrap();
        let found = detector.residual_anomalies(&days(n), &actual, &fitted).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].index, 30);
        assert_eq!(found[0].category, AnomalyCategory::Spike);
        assert_eq!(found[0].source, AnomalySource::Residual);
        assert!(found[0].z_score > 3.0);
    }

    #[test]
    fn test_exact_fit_has_no_anomalies() {
        let values: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let detector = AnomalyDetector::new(3.0, 7).unwrap();
        assert!(detector
            .residual_anomalies(&days(20), &values, &values)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_smooth_forecast_is_quiet() {
        let history: Vec<f64> = (0..40).map(|i| 0.05 * i as f64 + wiggle(i)).collect();
        let forecast: Vec<f64> = (40..55).map(|i| 0.05 * i as f64).collect();
        let detector = AnomalyDetector::new(3.0, 7).unwrap();
        let found = detector
            .forecast_anomalies(&history, &days(forecast.len()), &forecast)
            .unwrap();
        assert!(found.is_empty(), "{:?}", found);
    }

    #[test]
    fn test_forecast_dip_is_flagged() {
        let history: Vec<f64> = (0..40).map(|i| 0.05 * i as f64 + wiggle(i)).collect();
        let mut forecast: Vec<f64> = (40..55).map(|i| 0.05 * i as f64).collect();
        forecast[7] -= 40.0;
        let detector = AnomalyDetector::new(3.0, 7).unwrap();
        let found = detector
            .forecast_anomalies(&history, &days(forecast.len()), &forecast)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].index, 7);
        assert_eq!(found[0].category, AnomalyCategory::Dip);
    }

    #[test]
    fn test_rejects_bad_settings() {
        assert!(AnomalyDetector::new(0.0, 7).is_err());
        assert!(AnomalyDetector::new(3.0, 0).is_err());
    }
}
