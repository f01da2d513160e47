//! Bagged decision-tree ensemble over `linfa-trees`.
//!
//! Each tree is fit on a seeded bootstrap sample; the random-forest variant
//! also restricts every tree to a random subset of columns. Positive-class
//! probability is the fraction of trees voting for class 1.

use std::fmt;
use std::str::FromStr;

use linfa::prelude::*;
use linfa_trees::DecisionTree;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierAlgorithm {
    RandomForest,
    BaggedTrees,
}

impl ClassifierAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RandomForest => "random_forest",
            Self::BaggedTrees => "bagged_trees",
        }
    }
}

impl FromStr for ClassifierAlgorithm {
    type Err = ForestError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "random_forest" | "rf" => Ok(Self::RandomForest),
            "bagged_trees" | "bagging" => Ok(Self::BaggedTrees),
            other => Err(ForestError::InvalidParams(format!(
                "unknown classifier algorithm `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForestError {
    #[error("invalid forest params: {0}")]
    InvalidParams(String),
    #[error("cannot fit on an empty dataset")]
    EmptyDataset,
    #[error("decision tree fit failed: {0}")]
    Tree(String),
    #[error("expected {expected} feature columns, got {actual}")]
    Width { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub algorithm: ClassifierAlgorithm,
    pub n_trees: usize,
    pub max_depth: Option<usize>,
    pub min_weight_split: f32,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            algorithm: ClassifierAlgorithm::RandomForest,
            n_trees: 50,
            max_depth: Some(8),
            min_weight_split: 2.0,
            seed: 42,
        }
    }
}

impl ForestParams {
    pub fn for_algorithm(algorithm: ClassifierAlgorithm) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ForestError> {
        if self.n_trees == 0 || self.n_trees > 1_000 {
            return Err(ForestError::InvalidParams(
                "n_trees must be in 1..=1000".to_string(),
            ));
        }
        if self.max_depth == Some(0) {
            return Err(ForestError::InvalidParams(
                "max_depth must be > 0 when set".to_string(),
            ));
        }
        if !(self.min_weight_split >= 1.0) {
            return Err(ForestError::InvalidParams(
                "min_weight_split must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct Member {
    columns: Vec<usize>,
    tree: DecisionTree<f64, usize>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ForestClassifier {
    params: ForestParams,
    n_features: usize,
    members: Vec<Member>,
}

impl fmt::Debug for ForestClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForestClassifier")
            .field("params", &self.params)
            .field("n_features", &self.n_features)
            .field("trees", &self.members.len())
            .finish()
    }
}

impl ForestClassifier {
    pub fn fit(
        records: &Array2<f64>,
        labels: &Array1<usize>,
        params: &ForestParams,
    ) -> Result<Self, ForestError> {
        params.validate()?;
        let (n_rows, n_features) = records.dim();
        if n_rows == 0 || n_features == 0 {
            return Err(ForestError::EmptyDataset);
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let subspace = match params.algorithm {
            ClassifierAlgorithm::RandomForest => {
                ((n_features as f64).sqrt().ceil() as usize).clamp(1, n_features)
            }
            ClassifierAlgorithm::BaggedTrees => n_features,
        };

        let mut members = Vec::with_capacity(params.n_trees);
        for _ in 0..params.n_trees {
            let rows: Vec<usize> = (0..n_rows).map(|_| rng.gen_range(0..n_rows)).collect();
            let mut columns = if subspace == n_features {
                (0..n_features).collect::<Vec<_>>()
            } else {
                rand::seq::index::sample(&mut rng, n_features, subspace).into_vec()
            };
            columns.sort_unstable();

            let sample = records.select(Axis(0), &rows).select(Axis(1), &columns);
            let targets = labels.select(Axis(0), &rows);
            let dataset = Dataset::new(sample, targets);

            let tree = DecisionTree::params()
                .max_depth(params.max_depth)
                .min_weight_split(params.min_weight_split)
                .fit(&dataset)
                .map_err(|e| ForestError::Tree(e.to_string()))?;
            members.push(Member { columns, tree });
        }

        Ok(Self {
            params: params.clone(),
            n_features,
            members,
        })
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Fraction of trees voting for the positive class, per row.
    pub fn predict_proba(&self, records: &Array2<f64>) -> Result<Array1<f64>, ForestError> {
        if records.ncols() != self.n_features {
            return Err(ForestError::Width {
                expected: self.n_features,
                actual: records.ncols(),
            });
        }
        let mut votes = Array1::<f64>::zeros(records.nrows());
        for member in &self.members {
            let view = records.select(Axis(1), &member.columns);
            let predicted: Array1<usize> = member.tree.predict(&view);
            for (vote, class) in votes.iter_mut().zip(predicted.iter()) {
                if *class == 1 {
                    *vote += 1.0;
                }
            }
        }
        let n_trees = self.members.len().max(1) as f64;
        Ok(votes.mapv(|v| v / n_trees))
    }

    /// Mean impurity-decrease importance across trees, normalized to sum 1.
    pub fn feature_importance(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.n_features];
        for member in &self.members {
            for (local, importance) in member.tree.feature_importance().into_iter().enumerate() {
                if let Some(&global) = member.columns.get(local) {
                    if importance.is_finite() {
                        totals[global] += importance;
                    }
                }
            }
        }
        let sum: f64 = totals.iter().sum();
        if sum > 0.0 {
            totals.iter_mut().for_each(|v| *v /= sum);
        }
        totals
    }
}
