//! Feature Builder: raw records to a model-ready, time-ordered matrix

use crate::data::{order_records, DataRecord};
use crate::error::{ForecastError, Result};
use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info};

/// Calendar features derived from the timestamp, in column order
pub const CALENDAR_FEATURES: [&str; 6] = [
    "dayofweek",
    "month",
    "year",
    "dayofyear",
    "weekofyear",
    "is_weekend",
];

/// Engineered features added on top of the caller's covariates.
///
/// Lag and rolling features are computed from target values strictly before
/// the row they belong to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureOptions {
    /// Target lags, e.g. `[1, 7, 14]`
    #[serde(default)]
    pub lags: Vec<usize>,
    /// Trailing windows for rolling mean and rolling standard deviation
    #[serde(default)]
    pub rolling_windows: Vec<usize>,
    /// Add the calendar features
    #[serde(default)]
    pub calendar: bool,
}

impl FeatureOptions {
    pub fn validate(&self) -> Result<()> {
        if self.lags.contains(&0) {
            return Err(ForecastError::validation(
                "feature_options.lags",
                "lags must be at least 1",
            ));
        }
        if self.rolling_windows.iter().any(|w| *w < 2) {
            return Err(ForecastError::validation(
                "feature_options.rolling_windows",
                "rolling windows must be at least 2",
            ));
        }
        Ok(())
    }

    /// Number of leading rows for which the engineered features are undefined
    pub fn warmup(&self) -> usize {
        let lag = self.lags.iter().copied().max().unwrap_or(0);
        let window = self.rolling_windows.iter().copied().max().unwrap_or(0);
        lag.max(window)
    }

    pub fn is_empty(&self) -> bool {
        self.lags.is_empty() && self.rolling_windows.is_empty() && !self.calendar
    }
}

/// How a feature row is assembled for one timestamp.
///
/// Shared by the builder and by forecasting, so future rows are laid out
/// exactly like training rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLayout {
    pub target: String,
    /// Caller-supplied columns, which must be provided for future steps
    pub covariates: Vec<String>,
    pub options: FeatureOptions,
}

impl FeatureLayout {
    pub fn names(&self) -> Vec<String> {
        let mut names = self.covariates.clone();
        for lag in &self.options.lags {
            names.push(format!("{}_lag_{}", self.target, lag));
        }
        for window in &self.options.rolling_windows {
            names.push(format!("{}_rolling_mean_{}", self.target, window));
            names.push(format!("{}_rolling_std_{}", self.target, window));
        }
        if self.options.calendar {
            names.extend(CALENDAR_FEATURES.iter().map(|s| s.to_string()));
        }
        names
    }

    pub fn width(&self) -> usize {
        self.covariates.len()
            + self.options.lags.len()
            + 2 * self.options.rolling_windows.len()
            + if self.options.calendar {
                CALENDAR_FEATURES.len()
            } else {
                0
            }
    }

    /// Feature row for `timestamp`, given covariates at that timestamp and
    /// every target value before it.
    ///
    /// `None` while `history` is too short for the lag and rolling features.
    pub fn row(
        &self,
        timestamp: DateTime<Utc>,
        covariates: &[f64],
        history: &[f64],
    ) -> Option<Vec<f64>> {
        let n = history.len();
        if n < self.options.warmup() {
            return None;
        }

        let mut row = Vec::with_capacity(self.width());
        row.extend_from_slice(covariates);
        for &lag in &self.options.lags {
            row.push(history[n - lag]);
        }
        for &window in &self.options.rolling_windows {
            let slice = &history[n - window..];
            let mean = slice.iter().sum::<f64>() / window as f64;
            let var =
                slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
            row.push(mean);
            row.push(var.sqrt());
        }
        if self.options.calendar {
            row.extend(calendar_values(timestamp));
        }
        Some(row)
    }
}

fn calendar_values(ts: DateTime<Utc>) -> [f64; 6] {
    let weekday = ts.weekday();
    let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
    [
        weekday.num_days_from_monday() as f64,
        ts.month() as f64,
        ts.year() as f64,
        ts.ordinal() as f64,
        ts.iso_week().week() as f64,
        if weekend { 1.0 } else { 0.0 },
    ]
}

/// Time-ordered feature rows aligned 1:1 with the target vector.
///
/// Holds no missing values. The first `layout.covariates.len()` entries of
/// every row are the caller's covariates.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub layout: FeatureLayout,
    pub feature_names: Vec<String>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub rows: Vec<Vec<f64>>,
    pub target: Vec<f64>,
    /// Target values preceding the first row (warm-up rows, or earlier
    /// rows of a slice), needed to extend lag features
    pub prefix_target: Vec<f64>,
    pub duplicates_removed: usize,
    pub dropped_rows: usize,
    pub warmup_rows: usize,
}

impl FeatureMatrix {
    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn covariates(&self, row: usize) -> &[f64] {
        &self.rows[row][..self.layout.covariates.len()]
    }

    /// Every known target value up to the end of this matrix
    pub fn target_history(&self) -> Vec<f64> {
        let mut history = self.prefix_target.clone();
        history.extend_from_slice(&self.target);
        history
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }

    /// Contiguous sub-range of rows; earlier targets move into the prefix
    pub fn slice(&self, range: Range<usize>) -> FeatureMatrix {
        let mut prefix_target = self.prefix_target.clone();
        prefix_target.extend_from_slice(&self.target[..range.start]);
        FeatureMatrix {
            layout: self.layout.clone(),
            feature_names: self.feature_names.clone(),
            timestamps: self.timestamps[range.clone()].to_vec(),
            rows: self.rows[range.clone()].to_vec(),
            target: self.target[range].to_vec(),
            prefix_target,
            duplicates_removed: self.duplicates_removed,
            dropped_rows: self.dropped_rows,
            warmup_rows: self.warmup_rows,
        }
    }

    /// Column-major view of one feature
    pub fn column(&self, index: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r[index]).collect()
    }
}

/// Builds a [`FeatureMatrix`] from raw records
#[derive(Debug, Clone, Default)]
pub struct FeatureBuilder {
    options: FeatureOptions,
}

impl FeatureBuilder {
    pub fn new(options: FeatureOptions) -> Self {
        Self { options }
    }

    /// Validate columns, parse and sort by date, coerce to numbers, fill
    /// missing values and derive the engineered features.
    pub fn build(
        &self,
        records: &[DataRecord],
        target: &str,
        features: &[String],
    ) -> Result<FeatureMatrix> {
        self.options.validate()?;
        if features.iter().any(|f| f == target) {
            return Err(ForecastError::validation(
                "feature_columns",
                format!("target column '{}' cannot also be a feature", target),
            ));
        }
        if records.is_empty() {
            return Err(ForecastError::InsufficientData {
                required: 1,
                available: 0,
            });
        }

        let columns: Vec<&str> = std::iter::once(target)
            .chain(features.iter().map(String::as_str))
            .collect();
        for column in &columns {
            if let Some(row) = records.iter().position(|r| !r.contains(column)) {
                return Err(ForecastError::schema(
                    *column,
                    format!("column is missing from record {}", row),
                ));
            }
        }

        let ordered = order_records(records)?;

        // columns[0] is the target, the rest are covariates
        let mut values: Vec<Vec<Option<f64>>> = Vec::with_capacity(ordered.rows.len());
        for (_, index, record) in &ordered.rows {
            let mut row = Vec::with_capacity(columns.len());
            for column in &columns {
                let cell = record.get(column).ok_or_else(|| {
                    ForecastError::schema(*column, format!("column is missing from record {}", index))
                })?;
                let value = cell.as_number().map_err(|message| ForecastError::DataType {
                    column: column.to_string(),
                    row: *index,
                    message,
                })?;
                row.push(value);
            }
            values.push(row);
        }

        // forward fill, then drop leading rows that still have gaps
        let mut last: Vec<Option<f64>> = vec![None; columns.len()];
        let mut filled: Vec<(usize, Vec<f64>)> = Vec::with_capacity(values.len());
        for (i, row) in values.into_iter().enumerate() {
            for (slot, value) in last.iter_mut().zip(row) {
                if value.is_some() {
                    *slot = value;
                }
            }
            if last.iter().all(Option::is_some) {
                filled.push((i, last.iter().flatten().copied().collect()));
            }
        }
        let dropped_rows = ordered.rows.len() - filled.len();
        if dropped_rows > 0 {
            debug!("Dropped {} leading rows with missing values", dropped_rows);
        }

        let layout = FeatureLayout {
            target: target.to_string(),
            covariates: features.to_vec(),
            options: self.options.clone(),
        };
        let feature_names = layout.names();

        let full_target: Vec<f64> = filled.iter().map(|(_, v)| v[0]).collect();
        let mut timestamps = Vec::with_capacity(filled.len());
        let mut rows = Vec::with_capacity(filled.len());
        let mut target_values = Vec::with_capacity(filled.len());
        let mut warmup_rows = 0;
        for (pos, (i, row_values)) in filled.iter().enumerate() {
            let ts = ordered.rows[*i].0;
            match layout.row(ts, &row_values[1..], &full_target[..pos]) {
                Some(row) => {
                    timestamps.push(ts);
                    rows.push(row);
                    target_values.push(row_values[0]);
                }
                None => warmup_rows += 1,
            }
        }

        info!(
            "Built feature matrix: {} rows x {} features ({} duplicates, {} dropped, {} warm-up)",
            target_values.len(),
            feature_names.len(),
            ordered.duplicates_removed,
            dropped_rows,
            warmup_rows
        );

        Ok(FeatureMatrix {
            layout,
            feature_names,
            timestamps,
            rows,
            target: target_values,
            prefix_target: full_target[..warmup_rows].to_vec(),
            duplicates_removed: ordered.duplicates_removed,
            dropped_rows,
            warmup_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FieldValue;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn records(n: usize) -> Vec<DataRecord> {
        (0..n)
            .map(|i| {
                DataRecord::new()
                    .with("date", format!("2024-01-{:02}", i + 1))
                    .with("y", (i * 10) as f64)
                    .with("x", i as f64)
            })
            .collect()
    }

    #[test]
    fn test_lags_and_rolling_use_only_past_values() {
        let options = FeatureOptions {
            lags: vec![1, 2],
            rolling_windows: vec![3],
            calendar: false,
        };
        let m = FeatureBuilder::new(options)
            .build(&records(6), "y", &["x".to_string()])
            .unwrap();

        assert_eq!(
            m.feature_names,
            vec!["x", "y_lag_1", "y_lag_2", "y_rolling_mean_3", "y_rolling_std_3"]
        );
        assert_eq!(m.warmup_rows, 3);
        assert_eq!(m.len(), 3);
        assert_eq!(m.prefix_target, vec![0.0, 10.0, 20.0]);
        // row for y = 30: lags 20, 10; window [0, 10, 20]
        assert_eq!(m.target[0], 30.0);
        assert_eq!(&m.rows[0][..4], &[3.0, 20.0, 10.0, 10.0]);
        assert_abs_diff_eq!(m.rows[0][4], 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_calendar_features() {
        let options = FeatureOptions {
            calendar: true,
            ..Default::default()
        };
        let m = FeatureBuilder::new(options)
            .build(&records(7), "y", &[])
            .unwrap();
        // 2024-01-06 is a Saturday
        let sat = &m.rows[5];
        assert_eq!(sat, &vec![5.0, 1.0, 2024.0, 6.0, 1.0, 1.0]);
        assert_eq!(m.rows[0][5], 0.0);
    }

    #[test]
    fn test_null_values_forward_fill_and_leading_drop() {
        let records = vec![
            DataRecord::new().with("date", "2024-01-01").with("y", 1.0).with("x", FieldValue::Null),
            DataRecord::new().with("date", "2024-01-02").with("y", 2.0).with("x", 5.0),
            DataRecord::new().with("date", "2024-01-03").with("y", FieldValue::Null).with("x", 6.0),
        ];
        let m = FeatureBuilder::default()
            .build(&records, "y", &["x".to_string()])
            .unwrap();
        assert_eq!(m.dropped_rows, 1);
        assert_eq!(m.target, vec![2.0, 2.0]);
        assert_eq!(m.rows, vec![vec![5.0], vec![6.0]]);
    }

    #[test]
    fn test_rejects_target_as_feature() {
        let err = FeatureBuilder::default()
            .build(&records(3), "y", &["y".to_string()])
            .unwrap_err();
        assert!(matches!(err, ForecastError::Validation { ref field, .. } if field == "feature_columns"));
    }

    #[test]
    fn test_missing_column_is_schema_error() {
        let err = FeatureBuilder::default()
            .build(&records(3), "y", &["price".to_string()])
            .unwrap_err();
        match err {
            ForecastError::Schema { column, .. } => assert_eq!(column, "price"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_value_reports_input_row() {
        let mut data = records(4);
        data.reverse();
        data[2].insert("x", "n/a");
        let err = FeatureBuilder::default()
            .build(&data, "y", &["x".to_string()])
            .unwrap_err();
        match err {
            ForecastError::DataType { column, row, .. } => {
                assert_eq!(column, "x");
                assert_eq!(row, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_slice_carries_target_prefix() {
        let options = FeatureOptions {
            lags: vec![1],
            ..Default::default()
        };
        let m = FeatureBuilder::new(options)
            .build(&records(5), "y", &[])
            .unwrap();
        let tail = m.slice(2..4);
        assert_eq!(tail.target, vec![30.0, 40.0]);
        assert_eq!(tail.prefix_target, vec![0.0, 10.0, 20.0]);
        assert_eq!(tail.target_history(), vec![0.0, 10.0, 20.0, 30.0, 40.0]);
    }

}
