//! Lookback-window neural regressor, served under the `lstm` id
//!
//! This is a feed-forward network, not a recurrent one: a single tanh hidden
//! layer (a one-hidden-layer MLP) reads the standardized trailing target
//! window together with the current feature row and predicts the next
//! standardized target. No cell or hidden state is carried between steps.
//! Trained full-batch with Adam. At forecast time each prediction is appended
//! to the window for the next step.

use super::{
    residual_std, roll_forward, Algorithm, FittedForecastModel, ForecastContext, ForecastModel,
    Standardizer, Uncertainty,
};
use crate::error::{ForecastError, Result};
use crate::features::FeatureMatrix;
use crate::request::{Hyperparameters, ParamValue};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceModel {
    pub lookback: usize,
    pub hidden_units: usize,
    pub epochs: usize,
    pub learning_rate: f64,
}

impl Default for SequenceModel {
    fn default() -> Self {
        Self {
            lookback: 7,
            hidden_units: 16,
            epochs: 300,
            learning_rate: 0.01,
        }
    }
}

impl SequenceModel {
    pub fn from_params(params: &Hyperparameters) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            lookback: params.positive_usize("lookback", d.lookback)?,
            hidden_units: params.positive_usize("hidden_units", d.hidden_units)?,
            epochs: params.positive_usize("epochs", d.epochs)?,
            learning_rate: params.positive_f64("learning_rate", d.learning_rate)?,
        })
    }
}

/// Trailing `lookback` values of `history`, left-padded with its first
/// value (or `fill` when empty)
fn window(history: &[f64], lookback: usize, fill: f64) -> Vec<f64> {
    let start = history.len().saturating_sub(lookback);
    let tail = &history[start..];
    let pad = tail.first().copied().unwrap_or(fill);
    let mut out = vec![pad; lookback - tail.len()];
    out.extend_from_slice(tail);
    out
}

/// Parameters of the network, flattened as `[w1 (hidden x inputs), b1, w2, b2]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Network {
    inputs: usize,
    hidden: usize,
    params: Vec<f64>,
}

impl Network {
    fn new(inputs: usize, hidden: usize, rng: &mut StdRng) -> Result<Self> {
        let scale = (1.0 / inputs.max(1) as f64).sqrt();
        let normal = Normal::new(0.0, scale)
            .map_err(|e| ForecastError::fit(Algorithm::Sequence.id(), e.to_string()))?;
        let mut params = vec![0.0; hidden * inputs + 2 * hidden + 1];
        for w in params[..hidden * inputs].iter_mut() {
            *w = normal.sample(rng);
        }
        let w2 = hidden * inputs + hidden;
        let out_normal = Normal::new(0.0, (1.0 / hidden as f64).sqrt())
            .map_err(|e| ForecastError::fit(Algorithm::Sequence.id(), e.to_string()))?;
        for w in params[w2..w2 + hidden].iter_mut() {
            *w = out_normal.sample(rng);
        }
        Ok(Self {
            inputs,
            hidden,
            params,
        })
    }

    fn b1_offset(&self) -> usize {
        self.hidden * self.inputs
    }

    fn w2_offset(&self) -> usize {
        self.b1_offset() + self.hidden
    }

    fn b2_offset(&self) -> usize {
        self.w2_offset() + self.hidden
    }

    /// Hidden activations and output
    fn forward(&self, x: &[f64]) -> (Vec<f64>, f64) {
        let (b1, w2) = (self.b1_offset(), self.w2_offset());
        let hidden: Vec<f64> = (0..self.hidden)
            .map(|h| {
                let weights = &self.params[h * self.inputs..(h + 1) * self.inputs];
                let z = self.params[b1 + h] + weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>();
                z.tanh()
            })
            .collect();
        let out = self.params[self.b2_offset()]
            + hidden
                .iter()
                .enumerate()
                .map(|(h, a)| self.params[w2 + h] * a)
                .sum::<f64>();
        (hidden, out)
    }

    /// Mean squared error and its gradient over a batch
    fn loss_and_gradient(&self, inputs: &[Vec<f64>], targets: &[f64]) -> (f64, Vec<f64>) {
        let n = inputs.len() as f64;
        let (b1, w2, b2) = (self.b1_offset(), self.w2_offset(), self.b2_offset());
        let mut grad = vec![0.0; self.params.len()];
        let mut loss = 0.0;
        for (x, y) in inputs.iter().zip(targets) {
            let (hidden, out) = self.forward(x);
            let err = out - y;
            loss += err * err / n;
            let d_out = 2.0 * err / n;
            grad[b2] += d_out;
            for (h, a) in hidden.iter().enumerate() {
                grad[w2 + h] += d_out * a;
                let d_hidden = d_out * self.params[w2 + h] * (1.0 - a * a);
                grad[b1 + h] += d_hidden;
                for (i, v) in x.iter().enumerate() {
                    grad[h * self.inputs + i] += d_hidden * v;
                }
            }
        }
        (loss, grad)
    }
}

struct Adam {
    learning_rate: f64,
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

impl Adam {
    const BETA1: f64 = 0.9;
    const BETA2: f64 = 0.999;
    const EPSILON: f64 = 1e-8;

    fn new(size: usize, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            m: vec![0.0; size],
            v: vec![0.0; size],
            t: 0,
        }
    }

    fn step(&mut self, params: &mut [f64], grad: &[f64]) {
        self.t += 1;
        let c1 = 1.0 - Self::BETA1.powi(self.t);
        let c2 = 1.0 - Self::BETA2.powi(self.t);
        for (((p, g), m), v) in params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            *m = Self::BETA1 * *m + (1.0 - Self::BETA1) * g;
            *v = Self::BETA2 * *v + (1.0 - Self::BETA2) * g * g;
            *p -= self.learning_rate * (*m / c1) / ((*v / c2).sqrt() + Self::EPSILON);
        }
    }
}

impl ForecastModel for SequenceModel {
    type Fitted = FittedSequence;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Sequence
    }

    fn params(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("lookback", ParamValue::Int(self.lookback as i64))
            .with("hidden_units", ParamValue::Int(self.hidden_units as i64))
            .with("epochs", ParamValue::Int(self.epochs as i64))
            .with("learning_rate", ParamValue::Float(self.learning_rate))
    }

    fn fit(&self, matrix: &FeatureMatrix, seed: u64) -> Result<FittedSequence> {
        let n = matrix.len();
        if n < 2 {
            return Err(ForecastError::fit(
                Algorithm::Sequence.id(),
                format!("need at least 2 rows, got {}", n),
            ));
        }

        let history = matrix.target_history();
        let target_mean = history.iter().sum::<f64>() / history.len() as f64;
        let target_scale = match residual_std(&history) {
            s if s > 1e-12 => s,
            _ => 1.0,
        };
        let scaler = Standardizer::fit(&matrix.rows, matrix.n_features());

        let mut fitted = FittedSequence {
            lookback: self.lookback,
            target_mean,
            target_scale,
            scaler,
            network: Network::new(
                self.lookback + matrix.n_features(),
                self.hidden_units,
                &mut StdRng::seed_from_u64(seed),
            )?,
            residual_std: 0.0,
        };

        let offset = matrix.prefix_target.len();
        let inputs: Vec<Vec<f64>> = (0..n)
            .map(|i| fitted.input(&matrix.rows[i], &history[..offset + i]))
            .collect();
        let targets: Vec<f64> = matrix
            .target
            .iter()
            .map(|y| (y - target_mean) / target_scale)
            .collect();

        let mut adam = Adam::new(fitted.network.params.len(), self.learning_rate);
        let mut loss = f64::NAN;
        for _ in 0..self.epochs {
            let (l, grad) = fitted.network.loss_and_gradient(&inputs, &targets);
            if !l.is_finite() {
                return Err(ForecastError::fit(
                    Algorithm::Sequence.id(),
                    "training diverged",
                ));
            }
            loss = l;
            adam.step(&mut fitted.network.params, &grad);
        }

        let residuals: Vec<f64> = inputs
            .iter()
            .zip(&matrix.target)
            .map(|(x, y)| y - fitted.output(x))
            .collect();
        fitted.residual_std = residual_std(&residuals);
        if !fitted.residual_std.is_finite() {
            return Err(ForecastError::fit(
                Algorithm::Sequence.id(),
                "non-finite residuals",
            ));
        }
        debug!(
            "lstm fit: {} samples, {} epochs, final loss {:.6}",
            n, self.epochs, loss
        );
        Ok(fitted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedSequence {
    lookback: usize,
    target_mean: f64,
    target_scale: f64,
    scaler: Standardizer,
    network: Network,
    pub residual_std: f64,
}

impl FittedSequence {
    /// Network input for the row following `history`
    fn input(&self, row: &[f64], history: &[f64]) -> Vec<f64> {
        let scaled: Vec<f64> = history
            .iter()
            .map(|v| (v - self.target_mean) / self.target_scale)
            .collect();
        let mut x = window(&scaled, self.lookback, 0.0);
        x.extend(self.scaler.transform(row));
        x
    }

    fn output(&self, input: &[f64]) -> f64 {
        let (_, out) = self.network.forward(input);
        self.target_mean + out * self.target_scale
    }

    pub fn predict_next(&self, row: &[f64], history: &[f64]) -> f64 {
        self.output(&self.input(row, history))
    }
}

impl FittedForecastModel for FittedSequence {
    fn predict_horizon(&self, ctx: &ForecastContext<'_>) -> Result<Vec<f64>> {
        roll_forward(ctx, Algorithm::Sequence, |row, history| {
            Ok(self.predict_next(row, history))
        })
    }

    /// One-step-ahead predictions from the observed history
    fn fitted_values(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
        let history = matrix.target_history();
        let offset = matrix.prefix_target.len();
        Ok((0..matrix.len())
            .map(|i| self.predict_next(&matrix.rows[i], &history[..offset + i]))
            .collect())
    }

    fn estimate_uncertainty(&self, horizon: usize) -> Result<Uncertainty> {
        Ok(Uncertainty::gaussian_sqrt_steps(self.residual_std, horizon))
    }

    fn feature_importance(&self) -> Option<Vec<f64>> {
        None
    }
}
