use chrono::{Duration, TimeZone, Utc};
use forecast_engine::data::{forecast_timestamps, Frequency};
use forecast_engine::{
    DataRecord, EngineConfig, FeatureBuilder, FeatureOptions, FieldValue, ForecastError,
};
use pretty_assertions::assert_eq;
use std::io::Write;
use tempfile::NamedTempFile;

fn shuffled_records() -> Vec<DataRecord> {
    vec![
        DataRecord::new().with("Date", "2024-03-03").with("y", 3.0).with("x", 30.0),
        DataRecord::new().with("Date", "2024-03-01").with("y", 1.0).with("x", 10.0),
        DataRecord::new().with("Date", "2024-03-02").with("y", "2").with("x", 20.0),
        DataRecord::new().with("Date", "2024-03-02").with("y", 99.0).with("x", 99.0),
        DataRecord::new().with("Date", "2024-03-04").with("y", 4.0).with("x", FieldValue::Null),
    ]
}

#[test]
fn test_records_are_sorted_deduplicated_and_filled() {
    let m = FeatureBuilder::default()
        .build(&shuffled_records(), "y", &["x".to_string()])
        .unwrap();

    assert_eq!(m.target, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(m.duplicates_removed, 1);
    // x on 2024-03-04 is carried forward from the day before
    assert_eq!(m.rows[3], vec![30.0]);
    assert!(m.timestamps.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_missing_feature_names_the_column() {
    let err = FeatureBuilder::default()
        .build(&shuffled_records(), "y", &["price".to_string()])
        .unwrap_err();
    match err {
        ForecastError::Schema { column, .. } => assert_eq!(column, "price"),
        other => panic!("expected a schema error, got {:?}", other),
    }
}

#[test]
fn test_text_that_is_not_a_number() {
    let mut records = shuffled_records();
    records[0].insert("x", "n/a");
    let err = FeatureBuilder::default()
        .build(&records, "y", &["x".to_string()])
        .unwrap_err();
    assert!(matches!(err, ForecastError::DataType { ref column, row: 0, .. } if column == "x"));
}

#[test]
fn test_unparseable_date() {
    let records = vec![DataRecord::new().with("date", "yesterday").with("y", 1.0)];
    let err = FeatureBuilder::new(FeatureOptions::default())
        .build(&records, "y", &[])
        .unwrap_err();
    assert_eq!(err.kind(), "schema_error");
}

#[test]
fn test_frequency_and_horizon_timestamps() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let hourly: Vec<_> = (0..10).map(|i| start + Duration::hours(i)).collect();
    let frequency = Frequency::infer(&hourly);
    assert_eq!(frequency.label, "hourly");

    let future = forecast_timestamps(hourly[9], None, 3, &frequency).unwrap();
    assert_eq!(future[0], hourly[9] + Duration::hours(1));
    assert_eq!(future[2] - future[0], Duration::hours(2));

    let err = forecast_timestamps(hourly[9], Some(hourly[5]), 3, &frequency).unwrap_err();
    assert!(matches!(err, ForecastError::Validation { ref field, .. } if field == "forecast_start"));
}

#[test]
fn test_config_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[engine]").unwrap();
    writeln!(file, "max_horizon = 90").unwrap();
    writeln!(file, "default_folds = 3").unwrap();
    writeln!(file, "[forecast]").unwrap();
    writeln!(file, "confidence_levels = [0.8, 0.95]").unwrap();

    let config = EngineConfig::from_file(file.path()).unwrap();
    assert_eq!(config.engine.max_horizon, 90);
    assert_eq!(config.engine.default_folds, 3);
    assert_eq!(config.forecast.confidence_levels, vec![0.8, 0.95]);
    // untouched sections keep their defaults
    assert_eq!(config.anomaly.threshold, 3.0);
}

#[test]
fn test_config_rejects_bad_levels() {
    let err = EngineConfig::from_toml_str("[forecast]\nconfidence_levels = [1.5]").unwrap_err();
    assert!(matches!(err, ForecastError::Config(_)));
}
