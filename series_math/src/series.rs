//! Whole-slice helpers: run an indicator over a series and basic statistics

use crate::{Indicator, IndicatorError, Result};

/// Feed every value through `indicator`, collecting the reading after each
/// observation (`None` while the indicator warms up).
pub fn run<I: Indicator>(mut indicator: I, values: &[f64]) -> Result<Vec<Option<I::Output>>> {
    let mut out = Vec::with_capacity(values.len());
    for &value in values {
        indicator.update(value)?;
        match indicator.value() {
            Ok(reading) => out.push(Some(reading)),
            Err(IndicatorError::InsufficientData(_)) => out.push(None),
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Feed every value and return only the final reading, if warmed up
pub fn last<I: Indicator>(mut indicator: I, values: &[f64]) -> Result<Option<I::Output>> {
    for &value in values {
        indicator.update(value)?;
    }
    match indicator.value() {
        Ok(reading) => Ok(Some(reading)),
        Err(IndicatorError::InsufficientData(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Arithmetic mean, `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (divides by `n`), `None` for an empty slice
pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Standard scores against the slice's own mean and population std-dev.
///
/// A series with zero spread has no outliers, so every score is 0.
pub fn z_scores(values: &[f64]) -> Result<Vec<f64>> {
    let (m, sd) = match (mean(values), population_std_dev(values)) {
        (Some(m), Some(sd)) => (m, sd),
        _ => {
            return Err(IndicatorError::InsufficientData(
                "z-scores need at least one value".to_string(),
            ))
        }
    };
    if sd == 0.0 {
        return Ok(vec![0.0; values.len()]);
    }
    Ok(values.iter().map(|v| (v - m) / sd).collect())
}

/// Centered rolling median over `2 * (window / 2) + 1` points.
///
/// Near the edges the window shrinks symmetrically, so a straight line is
/// its own rolling median.
pub fn rolling_median(values: &[f64], window: usize) -> Result<Vec<f64>> {
    if window == 0 {
        return Err(IndicatorError::InvalidInput(
            "Rolling median window must be greater than zero".to_string(),
        ));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(IndicatorError::InvalidInput(
            "Rolling median input contains non-finite values".to_string(),
        ));
    }

    let half = window / 2;
    let n = values.len();
    let mut out = Vec::with_capacity(n);
    let mut scratch = Vec::with_capacity(2 * half + 1);
    for i in 0..n {
        let radius = half.min(i).min(n - 1 - i);
        let start = i - radius;
        let end = i + radius + 1;
        scratch.clear();
        scratch.extend_from_slice(&values[start..end]);
        scratch.sort_by(f64::total_cmp);
        out.push(scratch[radius]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moving_averages::SimpleMovingAverage;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_run_marks_warmup() {
        let out = run(SimpleMovingAverage::new(3).unwrap(), &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(out, vec![None, None, Some(2.0), Some(3.0)]);
    }

    #[test]
    fn test_last_without_enough_data() {
        let out = last(SimpleMovingAverage::new(5).unwrap(), &[1.0, 2.0]).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn test_z_scores() {
        let z = z_scores(&[1.0, 2.0, 3.0]).unwrap();
        let sd = (2.0f64 / 3.0).sqrt();
        assert_abs_diff_eq!(z[0], -1.0 / sd, epsilon = 1e-12);
        assert_abs_diff_eq!(z[1], 0.0, epsilon = 1e-12);

        assert_eq!(z_scores(&[4.0, 4.0]).unwrap(), vec![0.0, 0.0]);
        assert!(z_scores(&[]).is_err());
    }

    #[test]
    fn test_rolling_median_ignores_single_spike() {
        let values = [1.0, 2.0, 3.0, 100.0, 5.0, 6.0, 7.0];
        let med = rolling_median(&values, 3).unwrap();
        assert_eq!(med.len(), values.len());
        assert_abs_diff_eq!(med[3], 5.0);
        assert_abs_diff_eq!(med[0], 1.0);
        assert_abs_diff_eq!(med[6], 7.0);
    }

    #[test]
    fn test_rolling_median_of_line_is_the_line() {
        let values: Vec<f64> = (0..10).map(|i| 3.0 * i as f64 - 4.0).collect();
        assert_eq!(rolling_median(&values, 5).unwrap(), values);
    }
}
