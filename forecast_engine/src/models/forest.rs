//! Bagged regression trees (random forest)
//!
//! Trees are grown independently on bootstrap samples, each from its own
//! `StdRng` seeded with `seed + tree index`, so the ensemble is identical
//! however rayon schedules the work.

use super::{
    normalize_importance, quantile_sorted, roll_forward, sqrt_steps, Algorithm,
    FittedForecastModel, ForecastContext, ForecastModel, Uncertainty,
};
use crate::error::{ForecastError, Result};
use crate::features::FeatureMatrix;
use crate::request::{Hyperparameters, ParamValue};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ForestModel {
    pub n_estimators: usize,
    /// `None` grows trees until the leaf constraints stop them
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features tried per split; `None` tries all of them
    pub max_features: Option<usize>,
}

impl Default for ForestModel {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
        }
    }
}

impl ForestModel {
    pub fn from_params(params: &Hyperparameters) -> Result<Self> {
        let defaults = Self::default();
        let model = Self {
            n_estimators: params.positive_usize("n_estimators", defaults.n_estimators)?,
            max_depth: params.optional_positive_usize("max_depth")?,
            min_samples_split: params
                .positive_usize("min_samples_split", defaults.min_samples_split)?,
            min_samples_leaf: params.positive_usize("min_samples_leaf", defaults.min_samples_leaf)?,
            max_features: params.optional_positive_usize("max_features")?,
        };
        if model.min_samples_split < 2 {
            return Err(ForecastError::validation(
                "hyperparameters.min_samples_split",
                "must be at least 2",
            ));
        }
        Ok(model)
    }
}

fn optional_param(value: Option<usize>) -> ParamValue {
    value.map_or(ParamValue::Null, |v| ParamValue::Int(v as i64))
}

impl ForecastModel for ForestModel {
    type Fitted = FittedForest;

    fn algorithm(&self) -> Algorithm {
        Algorithm::Ensemble
    }

    fn params(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("n_estimators", ParamValue::Int(self.n_estimators as i64))
            .with("max_depth", optional_param(self.max_depth))
            .with("min_samples_split", ParamValue::Int(self.min_samples_split as i64))
            .with("min_samples_leaf", ParamValue::Int(self.min_samples_leaf as i64))
            .with("max_features", optional_param(self.max_features))
    }

    fn fit(&self, matrix: &FeatureMatrix, seed: u64) -> Result<FittedForest> {
        let n = matrix.len();
        if n < 2 {
            return Err(ForecastError::fit(
                Algorithm::Ensemble.id(),
                format!("need at least 2 rows, got {}", n),
            ));
        }
        let p = matrix.n_features();

        let grown: Vec<(Tree, Vec<bool>, Vec<f64>)> = (0..self.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                let mut in_bag = vec![false; n];
                let bootstrap: Vec<usize> = (0..n)
                    .map(|_| {
                        let i = rng.gen_range(0..n);
                        in_bag[i] = true;
                        i
                    })
                    .collect();
                let mut importance = vec![0.0; p];
                let mut grower = TreeGrower {
                    config: self,
                    rows: &matrix.rows,
                    target: &matrix.target,
                    n_features: p,
                    rng: &mut rng,
                    importance: &mut importance,
                    nodes: Vec::new(),
                };
                grower.grow(bootstrap, 0);
                let tree = Tree {
                    nodes: grower.nodes,
                };
                (tree, in_bag, normalize_importance(importance))
            })
            .collect();

        let mut importance = vec![0.0; p];
        for (_, _, tree_importance) in &grown {
            for (total, w) in importance.iter_mut().zip(tree_importance) {
                *total += w;
            }
        }

        // out-of-bag residuals: each row predicted only by trees that never saw it
        let mut oob_residuals = Vec::new();
        for i in 0..n {
            let (sum, count) = grown
                .iter()
                .filter(|(_, in_bag, _)| !in_bag[i])
                .fold((0.0, 0usize), |(s, c), (tree, _, _)| {
                    (s + tree.predict(&matrix.rows[i]), c + 1)
                });
            if count > 0 {
                oob_residuals.push(matrix.target[i] - sum / count as f64);
            }
        }

        let trees: Vec<Tree> = grown.into_iter().map(|(tree, _, _)| tree).collect();
        let mut fitted = FittedForest {
            trees,
            importance: normalize_importance(importance),
            residuals: Vec::new(),
        };
        if oob_residuals.len() < 2 {
            debug!("random_forest: too few out-of-bag rows, using in-sample residuals");
            oob_residuals = matrix
                .rows
                .iter()
                .zip(&matrix.target)
                .map(|(row, y)| y - fitted.predict_row(row))
                .collect();
        }
        if oob_residuals.iter().any(|r| !r.is_finite()) {
            return Err(ForecastError::fit(
                Algorithm::Ensemble.id(),
                "non-finite residuals",
            ));
        }
        oob_residuals.sort_by(f64::total_cmp);
        fitted.residuals = oob_residuals;

        debug!(
            "random_forest fit: {} trees on {} rows, median residual {:.4}",
            fitted.trees.len(),
            n,
            quantile_sorted(&fitted.residuals, 0.5)
        );
        Ok(fitted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Flat node arena; node 0 is the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], index: usize) -> usize {
            match &nodes[index] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => {
                    1 + walk(nodes, *left).max(walk(nodes, *right))
                }
            }
        }
        walk(&self.nodes, 0)
    }
}

struct TreeGrower<'a> {
    config: &'a ForestModel,
    rows: &'a [Vec<f64>],
    target: &'a [f64],
    n_features: usize,
    rng: &'a mut StdRng,
    importance: &'a mut Vec<f64>,
    nodes: Vec<Node>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

impl TreeGrower<'_> {
    /// Grow the subtree over `samples` and return its node index
    fn grow(&mut self, samples: Vec<usize>, depth: usize) -> usize {
        let index = self.nodes.len();
        let n = samples.len() as f64;
        let mean = samples.iter().map(|&i| self.target[i]).sum::<f64>() / n;
        self.nodes.push(Node::Leaf { value: mean });

        let depth_reached = self.config.max_depth.map_or(false, |d| depth >= d);
        if depth_reached || samples.len() < self.config.min_samples_split {
            return index;
        }

        if let Some(split) = self.best_split(&samples) {
            self.importance[split.feature] += split.gain;
            let left = self.grow(split.left, depth + 1);
            let right = self.grow(split.right, depth + 1);
            self.nodes[index] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };
        }
        index
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        match self.config.max_features {
            Some(m) if m < self.n_features => {
                let mut picked = sample(&mut *self.rng, self.n_features, m).into_vec();
                picked.sort_unstable();
                picked
            }
            _ => (0..self.n_features).collect(),
        }
    }

    /// Variance-reduction split; `None` when no split improves the node
    fn best_split(&mut self, samples: &[usize]) -> Option<BestSplit> {
        let min_leaf = self.config.min_samples_leaf;
        let n = samples.len();
        if n < 2 * min_leaf {
            return None;
        }
        let total: f64 = samples.iter().map(|&i| self.target[i]).sum();
        let total_sq: f64 = samples.iter().map(|&i| self.target[i].powi(2)).sum();
        let parent_sse = total_sq - total * total / n as f64;
        if parent_sse <= 1e-12 {
            return None;
        }

        let mut best: Option<(usize, f64, f64)> = None;
        let mut order = samples.to_vec();
        for feature in self.candidate_features() {
            order.sort_by(|&a, &b| self.rows[a][feature].total_cmp(&self.rows[b][feature]));
            let mut left_sum = 0.0;
            let mut left_sq = 0.0;
            for k in 0..n - 1 {
                let y = self.target[order[k]];
                left_sum += y;
                left_sq += y * y;
                let left_n = k + 1;
                let right_n = n - left_n;
                let here = self.rows[order[k]][feature];
                let next = self.rows[order[k + 1]][feature];
                if left_n < min_leaf || right_n < min_leaf || here == next {
                    continue;
                }
                let right_sum = total - left_sum;
                let right_sq = total_sq - left_sq;
                let sse = (left_sq - left_sum * left_sum / left_n as f64)
                    + (right_sq - right_sum * right_sum / right_n as f64);
                let gain = parent_sse - sse;
                if gain > 1e-12 && best.map_or(true, |(_, _, g)| gain > g) {
                    best = Some((feature, (here + next) / 2.0, gain));
                }
            }
        }

        let (feature, threshold, gain) = best?;
        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .partition(|&&i| self.rows[i][feature] <= threshold);
        Some(BestSplit {
            feature,
            threshold,
            gain,
            left,
            right,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedForest {
    trees: Vec<Tree>,
    importance: Vec<f64>,
    /// Sorted out-of-bag residuals
    residuals: Vec<f64>,
}

impl FittedForest {
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        self.trees.iter().map(|t| t.predict(row)).sum::<f64>() / self.trees.len() as f64
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }
}

impl FittedForecastModel for FittedForest {
    fn predict_horizon(&self, ctx: &ForecastContext<'_>) -> Result<Vec<f64>> {
        roll_forward(ctx, Algorithm::Ensemble, |row, _| Ok(self.predict_row(row)))
    }

    fn fitted_values(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
        Ok(matrix.rows.iter().map(|r| self.predict_row(r)).collect())
    }

    fn estimate_uncertainty(&self, horizon: usize) -> Result<Uncertainty> {
        Ok(Uncertainty::Empirical {
            residuals: self.residuals.clone(),
            scale: sqrt_steps(horizon),
        })
    }

    fn feature_importance(&self) -> Option<Vec<f64>> {
        Some(self.importance.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureOptions;
    use crate::models::test_support::matrix;
    use approx::assert_abs_diff_eq;

    fn small_forest() -> ForestModel {
        ForestModel {
            n_estimators: 12,
            ..Default::default()
        }
    }

    #[test]
    fn test_same_seed_same_forest() {
        let m = matrix(40, |i| ((i % 7) as f64).sin() * 10.0 + i as f64, FeatureOptions::default());
        let a = small_forest().fit(&m, 7).unwrap();
        let b = small_forest().fit(&m, 7).unwrap();
        assert_eq!(a, b);
        let c = small_forest().fit(&m, 8).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_learns_step_function() {
        let m = matrix(40, |i| if i < 20 { 0.0 } else { 10.0 }, FeatureOptions::default());
        let fitted = small_forest().fit(&m, 1).unwrap();
        assert_abs_diff_eq!(fitted.predict_row(&[5.0]), 0.0, epsilon = 1.5);
        assert_abs_diff_eq!(fitted.predict_row(&[35.0]), 10.0, epsilon = 1.5);
    }

    #[test]
    fn test_importance_prefers_informative_feature() {
        let options = FeatureOptions {
            calendar: true,
            ..Default::default()
        };
        let m = matrix(60, |i| 5.0 * i as f64, options);
        let fitted = small_forest().fit(&m, 3).unwrap();
        let importance = fitted.feature_importance().unwrap();
        assert_abs_diff_eq!(importance.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(importance.iter().all(|w| *w >= 0.0));
        let year = m.feature_names.iter().position(|n| n == "year").unwrap();
        assert_eq!(importance[year], 0.0);
    }

    #[test]
    fn test_max_depth_limits_trees() {
        let m = matrix(50, |i| (i * i) as f64, FeatureOptions::default());
        let model = ForestModel {
            n_estimators: 4,
            max_depth: Some(2),
            ..Default::default()
        };
        let fitted = model.fit(&m, 0).unwrap();
        assert!(fitted.trees().iter().all(|t| t.depth() <= 2));
    }

    #[test]
    fn test_constant_target_gives_all_zero_importance() {
        let m = matrix(20, |_| 4.0, FeatureOptions::default());
        let fitted = small_forest().fit(&m, 0).unwrap();
        assert_eq!(fitted.feature_importance(), Some(vec![0.0]));
        assert_abs_diff_eq!(fitted.predict_row(&[3.0]), 4.0);
    }

    #[test]
    fn test_rejects_bad_params() {
        let params = Hyperparameters::new().with("min_samples_split", ParamValue::Int(1));
        assert!(ForestModel::from_params(&params).is_err());
        let params = Hyperparameters::new().with("max_depth", ParamValue::Null);
        assert_eq!(ForestModel::from_params(&params).unwrap().max_depth, None);
    }
}
