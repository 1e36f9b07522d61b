//! Raw time series input: records, timestamps and sampling frequency

use crate::error::{ForecastError, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Column names recognised as the time axis, matched case-insensitively
pub const DATE_COLUMN_NAMES: [&str; 2] = ["date", "timestamp"];

/// One cell of an input record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value.
    ///
    /// `Ok(None)` for an explicit null, `Err` with a description when the
    /// value cannot be read as a number.
    pub fn as_number(&self) -> std::result::Result<Option<f64>, String> {
        match self {
            FieldValue::Null => Ok(None),
            FieldValue::Number(v) if v.is_finite() => Ok(Some(*v)),
            FieldValue::Number(v) => Err(format!("non-finite value {}", v)),
            FieldValue::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
            FieldValue::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                match trimmed.parse::<f64>() {
                    Ok(v) if v.is_finite() => Ok(Some(v)),
                    _ => Err(format!("cannot convert '{}' to a number", s)),
                }
            }
        }
    }

    /// Timestamp view of the value, if it is a recognised date string
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

/// One row of a dataset: a date field plus arbitrary named columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl DataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// Parse a date or date-time string.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` and
/// `YYYY-MM-DD`; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Find the date column of a dataset, preferring `date` over `timestamp`
pub fn find_date_column(records: &[DataRecord]) -> Result<String> {
    let first = records
        .first()
        .ok_or_else(|| ForecastError::schema("date", "dataset has no records"))?;
    for wanted in DATE_COLUMN_NAMES {
        if let Some(name) = first.columns().find(|c| c.eq_ignore_ascii_case(wanted)) {
            return Ok(name.to_string());
        }
    }
    Err(ForecastError::schema(
        "date",
        "no 'date' or 'timestamp' column found",
    ))
}

/// Records in ascending time order with duplicate timestamps removed
#[derive(Debug, Clone)]
pub struct OrderedRecords<'a> {
    pub date_column: String,
    /// `(timestamp, index in the caller's input, record)`
    pub rows: Vec<(DateTime<Utc>, usize, &'a DataRecord)>,
    pub duplicates_removed: usize,
}

impl OrderedRecords<'_> {
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.rows.iter().map(|(ts, _, _)| *ts).collect()
    }
}

/// Parse every record's date and sort ascending.
///
/// The sort is stable, so among rows sharing a timestamp the one that came
/// first in the input is kept.
pub fn order_records(records: &[DataRecord]) -> Result<OrderedRecords<'_>> {
    let date_column = find_date_column(records)?;

    let mut rows = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let value = record.get(&date_column).ok_or_else(|| {
            ForecastError::schema(&date_column, format!("missing in row {}", index))
        })?;
        let ts = value.as_timestamp().ok_or_else(|| {
            ForecastError::schema(
                &date_column,
                format!("unparseable date {:?} in row {}", value, index),
            )
        })?;
        rows.push((ts, index, record));
    }

    rows.sort_by_key(|(ts, _, _)| *ts);
    let before = rows.len();
    rows.dedup_by_key(|(ts, _, _)| *ts);
    let duplicates_removed = before - rows.len();
    if duplicates_removed > 0 {
        warn!(
            "Dropped {} rows with duplicate timestamps, keeping the first occurrence",
            duplicates_removed
        );
    }

    Ok(OrderedRecords {
        date_column,
        rows,
        duplicates_removed,
    })
}

/// Sampling interval of a series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frequency {
    pub seconds: i64,
    pub label: String,
}

impl Frequency {
    pub fn from_seconds(seconds: i64) -> Self {
        let label = match seconds {
            60 => "minutely".to_string(),
            3_600 => "hourly".to_string(),
            86_400 => "daily".to_string(),
            604_800 => "weekly".to_string(),
            s => format!("{}s", s),
        };
        Self { seconds, label }
    }

    pub fn daily() -> Self {
        Self::from_seconds(86_400)
    }

    /// Most frequent gap between consecutive timestamps.
    ///
    /// Ties go to the smaller gap. When no gap repeats the median gap is
    /// used instead; fewer than two timestamps default to daily.
    pub fn infer(timestamps: &[DateTime<Utc>]) -> Self {
        let mut gaps: Vec<i64> = timestamps
            .windows(2)
            .map(|w| (w[1] - w[0]).num_seconds())
            .filter(|g| *g > 0)
            .collect();
        if gaps.is_empty() {
            return Self::daily();
        }

        let mut counts: HashMap<i64, usize> = HashMap::new();
        for gap in &gaps {
            *counts.entry(*gap).or_insert(0) += 1;
        }
        let (mode, mode_count) = counts
            .iter()
            .map(|(gap, count)| (*gap, *count))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .unwrap_or((86_400, 0));

        if mode_count > 1 || gaps.len() == 1 {
            return Self::from_seconds(mode);
        }
        gaps.sort_unstable();
        Self::from_seconds(gaps[(gaps.len() - 1) / 2])
    }

    pub fn step(&self) -> Duration {
        Duration::seconds(self.seconds)
    }
}

/// Timestamps of the forecast horizon.
///
/// Without an explicit start the first step is one interval after `last`;
/// an explicit start must lie strictly after `last`.
pub fn forecast_timestamps(
    last: DateTime<Utc>,
    start: Option<DateTime<Utc>>,
    horizon: usize,
    frequency: &Frequency,
) -> Result<Vec<DateTime<Utc>>> {
    let step = frequency.step();
    let first = match start {
        Some(start) if start <= last => {
            return Err(ForecastError::validation(
                "forecast_start",
                format!(
                    "forecast start {} is not after the last observation {}",
                    start, last
                ),
            ))
        }
        Some(start) => start,
        None => last + step,
    };

    let mut timestamps = Vec::with_capacity(horizon);
    let mut current = first;
    for _ in 0..horizon {
        timestamps.push(current);
        current += step;
    }
    Ok(timestamps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    #[rstest]
    #[case("2024-01-05", day(5))]
    #[case("2024-01-05 00:00:00", day(5))]
    #[case("2024-01-05T00:00:00", day(5))]
    #[case("2024-01-05T02:00:00+02:00", day(5))]
    fn test_parse_timestamp_formats(#[case] raw: &str, #[case] expected: DateTime<Utc>) {
        assert_eq!(parse_timestamp(raw), Some(expected));
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert_eq!(parse_timestamp("05/01/2024"), None);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_field_value_coercion() {
        assert_eq!(FieldValue::Number(1.5).as_number(), Ok(Some(1.5)));
        assert_eq!(FieldValue::from(" 2.5 ").as_number(), Ok(Some(2.5)));
        assert_eq!(FieldValue::Bool(true).as_number(), Ok(Some(1.0)));
        assert_eq!(FieldValue::Null.as_number(), Ok(None));
        assert!(FieldValue::from("abc").as_number().is_err());
    }

    #[test]
    fn test_record_deserializes_from_json() {
        let record: DataRecord =
            serde_json::from_str(r#"{"Date": "2024-01-01", "sales": 10, "note": null}"#).unwrap();
        assert_eq!(record.get("sales"), Some(&FieldValue::Number(10.0)));
        assert_eq!(record.get("note"), Some(&FieldValue::Null));
        assert_eq!(find_date_column(&[record]).unwrap(), "Date");
    }

    #[test]
    fn test_order_records_sorts_and_keeps_first_duplicate() {
        let records = vec![
            DataRecord::new().with("date", "2024-01-03").with("y", 3.0),
            DataRecord::new().with("date", "2024-01-01").with("y", 1.0),
            DataRecord::new().with("date", "2024-01-03").with("y", 99.0),
            DataRecord::new().with("date", "2024-01-02").with("y", 2.0),
        ];
        let ordered = order_records(&records).unwrap();
        assert_eq!(ordered.duplicates_removed, 1);
        let indices: Vec<usize> = ordered.rows.iter().map(|(_, i, _)| *i).collect();
        assert_eq!(indices, vec![1, 3, 0]);
        assert_eq!(ordered.timestamps(), vec![day(1), day(2), day(3)]);
    }

    #[test]
    fn test_unparseable_date_is_schema_error() {
        let records = vec![DataRecord::new().with("date", "not a date").with("y", 1.0)];
        match order_records(&records) {
            Err(ForecastError::Schema { column, .. }) => assert_eq!(column, "date"),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_frequency_inference() {
        let daily: Vec<_> = (1..=5).map(day).collect();
        assert_eq!(Frequency::infer(&daily).label, "daily");

        // one missing day does not change the mode
        let gappy = vec![day(1), day(2), day(3), day(5), day(6)];
        assert_eq!(Frequency::infer(&gappy).seconds, 86_400);

        // tie between 1 and 2 days goes to the smaller gap
        let tied = vec![day(1), day(2), day(4), day(5), day(7)];
        assert_eq!(Frequency::infer(&tied).seconds, 86_400);

        // all gaps distinct: median
        let distinct = vec![day(1), day(2), day(4), day(7)];
        assert_eq!(Frequency::infer(&distinct).seconds, 2 * 86_400);

        assert_eq!(Frequency::infer(&[day(1)]), Frequency::daily());
        assert_eq!(Frequency::from_seconds(7_200).label, "7200s");
    }

    #[test]
    fn test_forecast_timestamps() {
        let ts = forecast_timestamps(day(10), None, 3, &Frequency::daily()).unwrap();
        assert_eq!(ts, vec![day(11), day(12), day(13)]);

        let ts = forecast_timestamps(day(10), Some(day(15)), 2, &Frequency::daily()).unwrap();
        assert_eq!(ts, vec![day(15), day(16)]);

        assert!(matches!(
            forecast_timestamps(day(10), Some(day(10)), 2, &Frequency::daily()),
            Err(ForecastError::Validation { .. })
        ));
    }
}
