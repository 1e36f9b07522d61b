//! Technical descriptors over recent history followed by the forecast.
//!
//! Read-only diagnostics: nothing here feeds back into a model.

use crate::config::TechnicalSettings;
use crate::error::{ForecastError, Result};
use serde::{Deserialize, Serialize};
use series_math::moving_averages::{ExponentialMovingAverage, SimpleMovingAverage};
use series_math::oscillators::{Macd, MacdOutput, RelativeStrengthIndex};
use series_math::series::last;
use series_math::volatility::{BollingerBands, BollingerOutput};
use series_math::IndicatorError;

const OVERBOUGHT: f64 = 70.0;
const OVERSOLD: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsiZone {
    Overbought,
    Oversold,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiReading {
    pub value: f64,
    pub zone: RsiZone,
}

impl RsiReading {
    fn new(value: f64) -> Self {
        let zone = if value >= OVERBOUGHT {
            RsiZone::Overbought
        } else if value <= OVERSOLD {
            RsiZone::Oversold
        } else {
            RsiZone::Neutral
        };
        Self { value, zone }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovingAverageReading {
    pub period: usize,
    pub sma: Option<f64>,
    pub ema: Option<f64>,
}

/// Final indicator readings; each is `None` when the combined series is
/// shorter than the indicator's warm-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalDescriptors {
    pub rsi: Option<RsiReading>,
    pub macd: Option<MacdOutput>,
    pub bollinger: Option<BollingerOutput>,
    pub moving_averages: Vec<MovingAverageReading>,
    /// History points included before the forecast
    pub history_points: usize,
    pub forecast_points: usize,
}

fn settings_error(e: IndicatorError) -> ForecastError {
    ForecastError::Config(format!("technical settings: {}", e))
}

/// Compute the descriptors over the last `history_window` history values
/// followed by the forecast
pub fn describe_technical(
    settings: &TechnicalSettings,
    history: &[f64],
    forecast: &[f64],
) -> Result<TechnicalDescriptors> {
    let tail = &history[history.len().saturating_sub(settings.history_window)..];
    let mut series = Vec::with_capacity(tail.len() + forecast.len());
    series.extend_from_slice(tail);
    series.extend_from_slice(forecast);

    let rsi = last(
        RelativeStrengthIndex::new(settings.rsi_period).map_err(settings_error)?,
        &series,
    )?
    .map(RsiReading::new);
    let macd = last(
        Macd::new(settings.macd_fast, settings.macd_slow, settings.macd_signal)
            .map_err(settings_error)?,
        &series,
    )?;
    let bollinger = last(
        BollingerBands::new(settings.bollinger_period, settings.bollinger_std_dev)
            .map_err(settings_error)?,
        &series,
    )?;

    let moving_averages = settings
        .moving_average_periods
        .iter()
        .map(|&period| {
            Ok(MovingAverageReading {
                period,
                sma: last(
                    SimpleMovingAverage::new(period).map_err(settings_error)?,
                    &series,
                )?,
                ema: last(
                    ExponentialMovingAverage::new(period).map_err(settings_error)?,
                    &series,
                )?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TechnicalDescriptors {
        rsi,
        macd,
        bollinger,
        moving_averages,
        history_points: tail.len(),
        forecast_points: forecast.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_rising_series_is_overbought() {
        let history: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let forecast: Vec<f64> = (100..110).map(|i| i as f64).collect();
        let out = describe_technical(&TechnicalSettings::default(), &history, &forecast).unwrap();

        assert_eq!(out.history_points, 60);
        assert_eq!(out.forecast_points, 10);
        assert_eq!(out.rsi.unwrap().zone, RsiZone::Overbought);
        assert!(out.macd.unwrap().macd > 0.0);
        let sma5 = out.moving_averages[0];
        assert_eq!(sma5.period, 5);
        assert_abs_diff_eq!(sma5.sma.unwrap(), 107.0);
        let bands = out.bollinger.unwrap();
        assert!(bands.lower < bands.middle && bands.middle < bands.upper);
    }

    #[test]
    fn test_short_series_leaves_readings_empty() {
        let out = describe_technical(&TechnicalSettings::default(), &[1.0, 2.0], &[3.0]).unwrap();
        assert_eq!(out.rsi, None);
        assert_eq!(out.macd, None);
        assert_eq!(out.bollinger, None);
        assert_eq!(out.moving_averages[0].sma, None);
    }

    #[test]
    fn test_invalid_periods_are_config_errors() {
        let settings = TechnicalSettings {
            macd_fast: 30,
            ..TechnicalSettings::default()
        };
        let err = describe_technical(&settings, &[1.0; 40], &[1.0]).unwrap_err();
        assert!(matches!(err, ForecastError::Config(_)));
    }
}
