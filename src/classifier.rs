//! Probability classifiers for purchase and churn prediction.
//!
//! Both wrappers share one implementation and differ only in their
//! [`ClassifierProfile`]: which feature set they accept and where the
//! confidence buckets sit.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::ArtifactStore;
use crate::evaluation::{
    auc_roc, classification_metrics, stratified_folds, stratified_split, ClassificationMetrics,
    DEFAULT_TEST_FRACTION,
};
use crate::forest::{ClassifierAlgorithm, ForestClassifier, ForestParams};
use crate::model::{
    require_rows, ModelError, ModelInfo, ModelKind, ModelSlot, ModelWrapper, Optimization, Trial,
};
use crate::scaler::StandardScaler;
use crate::table::{assert_schema_compatible, FeatureSet, MlFrame};

pub const MIN_TRAINING_ROWS: usize = 100;
pub const KEY_FACTOR_MIN_Z: f64 = 0.5;
pub const MAX_KEY_FACTORS: usize = 5;
const TOP_IMPORTANCES: usize = 10;
const CV_FOLDS: usize = 3;
const DECISION_THRESHOLD: f64 = 0.5;

/// What distinguishes the purchase and churn wrappers.
pub trait ClassifierProfile: Send + Sync + 'static {
    const KIND: ModelKind;
    const FEATURE_SET: FeatureSet;
    /// Probability strictly above which a prediction is `high` confidence.
    const HIGH: f64;
    /// Probability strictly above which a prediction is `medium` confidence.
    const MEDIUM: f64;
}

#[derive(Debug, Clone, Copy)]
pub struct PurchaseProfile;

impl ClassifierProfile for PurchaseProfile {
    const KIND: ModelKind = ModelKind::PurchasePrediction;
    const FEATURE_SET: FeatureSet = FeatureSet::PurchasePrediction;
    const HIGH: f64 = 0.8;
    const MEDIUM: f64 = 0.5;
}

#[derive(Debug, Clone, Copy)]
pub struct ChurnProfile;

impl ClassifierProfile for ChurnProfile {
    const KIND: ModelKind = ModelKind::ChurnPrediction;
    const FEATURE_SET: FeatureSet = FeatureSet::ChurnPrediction;
    const HIGH: f64 = 0.6;
    const MEDIUM: f64 = 0.3;
}

pub type PurchasePredictionModel = ClassifierModel<PurchaseProfile>;
pub type ChurnPredictionModel = ClassifierModel<ChurnProfile>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn bucket(probability: f64, high: f64, medium: f64) -> Self {
        if probability > high {
            Self::High
        } else if probability > medium {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AboveAverage,
    BelowAverage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFactor {
    pub feature: String,
    /// Model-input value (after the ML-ready transform).
    pub value: f64,
    pub z_score: f64,
    pub direction: Direction,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierEvaluation {
    pub model_version: String,
    pub algorithm: ClassifierAlgorithm,
    pub train_size: usize,
    pub test_size: usize,
    pub positive_rate: f64,
    pub metrics: ClassificationMetrics,
    pub top_features: Vec<FeatureImportance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierPrediction {
    pub user_id: i64,
    pub probability: f64,
    pub confidence: Confidence,
    pub key_factors: Vec<KeyFactor>,
    pub model_version: String,
}

/// Everything persisted for one trained classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedClassifier {
    pub info: ModelInfo,
    pub scaler: StandardScaler,
    pub forest: ForestClassifier,
    /// Per-column importance aligned with `info.schema.columns`.
    pub importance: Vec<f64>,
    pub evaluation: ClassifierEvaluation,
}

impl FittedClassifier {
    pub fn ranked_importance(&self) -> Vec<FeatureImportance> {
        rank_importance(&self.info.feature_names(), &self.importance)
    }
}

pub struct ClassifierModel<P: ClassifierProfile> {
    slot: ModelSlot<FittedClassifier>,
    artifacts: ArtifactStore,
    min_rows: usize,
    _profile: PhantomData<fn() -> P>,
}

impl<P: ClassifierProfile> ClassifierModel<P> {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self {
            slot: ModelSlot::default(),
            artifacts,
            min_rows: MIN_TRAINING_ROWS,
            _profile: PhantomData,
        }
    }

    /// Lowers the training row floor; used by small fixtures.
    pub fn with_min_rows(mut self, min_rows: usize) -> Self {
        self.min_rows = min_rows;
        self
    }

    pub fn min_rows(&self) -> usize {
        self.min_rows
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn evaluation(&self) -> Option<ClassifierEvaluation> {
        self.snapshot().map(|f| f.evaluation.clone())
    }

    pub fn feature_importance(&self) -> Option<Vec<FeatureImportance>> {
        self.snapshot().map(|f| f.ranked_importance())
    }

    pub fn params(&self) -> Option<ForestParams> {
        self.snapshot().map(|f| f.forest.params().clone())
    }

    fn snapshot(&self) -> Option<Arc<FittedClassifier>> {
        self.slot.snapshot().ok().flatten()
    }

    fn check_training_frame<'a>(&self, frame: &'a MlFrame) -> Result<&'a Array1<usize>, ModelError> {
        if frame.schema.feature_set != P::FEATURE_SET {
            return Err(ModelError::InvalidParams(format!(
                "{} model expects {} features, got {}",
                P::KIND,
                P::FEATURE_SET.as_str(),
                frame.schema.feature_set.as_str()
            )));
        }
        require_rows(frame, self.min_rows)?;
        let labels = frame.labels.as_ref().ok_or(ModelError::MissingLabels)?;
        let positives = labels.iter().filter(|l| **l == 1).count();
        if positives == 0 || positives == labels.len() {
            return Err(ModelError::Training(format!(
                "training labels contain a single class ({positives} positive of {})",
                labels.len()
            )));
        }
        Ok(labels)
    }
}

impl<P: ClassifierProfile> ModelWrapper for ClassifierModel<P> {
    type Params = ForestParams;
    type Algorithm = ClassifierAlgorithm;
    type Fitted = FittedClassifier;
    type Evaluation = ClassifierEvaluation;
    type Prediction = ClassifierPrediction;

    fn kind(&self) -> ModelKind {
        P::KIND
    }

    fn fit(
        &self,
        frame: &MlFrame,
        params: &ForestParams,
    ) -> Result<(FittedClassifier, ClassifierEvaluation), ModelError> {
        params.validate()?;
        let labels = self.check_training_frame(frame)?;

        let split = stratified_split(labels, DEFAULT_TEST_FRACTION, params.seed);
        let train_x = frame.records.select(Axis(0), &split.train);
        let train_y = labels.select(Axis(0), &split.train);
        let test_x = frame.records.select(Axis(0), &split.test);
        let test_y = labels.select(Axis(0), &split.test);

        let scaler = StandardScaler::fit(&train_x);
        let forest = ForestClassifier::fit(&scaler.transform(&train_x), &train_y, params)?;
        let probabilities = forest.predict_proba(&scaler.transform(&test_x))?;
        let metrics = classification_metrics(&test_y, &probabilities, DECISION_THRESHOLD);

        let info = ModelInfo::new(P::KIND, frame.schema.clone(), frame.nrows());
        let importance = forest.feature_importance();
        let mut top_features = rank_importance(&info.feature_names(), &importance);
        top_features.truncate(TOP_IMPORTANCES);

        let evaluation = ClassifierEvaluation {
            model_version: info.version.clone(),
            algorithm: params.algorithm,
            train_size: split.train.len(),
            test_size: split.test.len(),
            positive_rate: labels.iter().filter(|l| **l == 1).count() as f64
                / labels.len() as f64,
            metrics,
            top_features,
        };
        info!(
            component = "classifier",
            event = "model.train.finish",
            model = P::KIND.as_str(),
            version = %info.version,
            rows = frame.nrows(),
            accuracy = evaluation.metrics.accuracy,
            auc_roc = evaluation.metrics.auc_roc
        );

        Ok((
            FittedClassifier {
                info,
                scaler,
                forest,
                importance,
                evaluation: evaluation.clone(),
            },
            evaluation,
        ))
    }

    fn publish(&self, fitted: Arc<FittedClassifier>) -> Result<(), ModelError> {
        info!(
            component = "classifier",
            event = "model.publish",
            model = P::KIND.as_str(),
            version = %fitted.info.version
        );
        self.slot.publish(fitted)
    }

    fn predict(&self, frame: &MlFrame) -> Result<Vec<ClassifierPrediction>, ModelError> {
        let fitted = self.snapshot().ok_or(ModelError::NotTrained(P::KIND))?;
        assert_schema_compatible(&fitted.info.schema, &frame.schema)?;

        let scaled = fitted.scaler.transform(&frame.records);
        let probabilities = fitted.forest.predict_proba(&scaled)?;
        let names = fitted.info.feature_names();

        let predictions = probabilities
            .iter()
            .enumerate()
            .map(|(row, probability)| ClassifierPrediction {
                user_id: frame.user_ids[row],
                probability: *probability,
                confidence: Confidence::bucket(*probability, P::HIGH, P::MEDIUM),
                key_factors: key_factors(
                    &names,
                    frame.records.row(row).as_slice().unwrap_or(&[]),
                    scaled.row(row).as_slice().unwrap_or(&[]),
                    &fitted.importance,
                ),
                model_version: fitted.info.version.clone(),
            })
            .collect::<Vec<_>>();
        debug!(
            component = "classifier",
            event = "model.predict",
            model = P::KIND.as_str(),
            rows = predictions.len()
        );
        Ok(predictions)
    }

    fn save_fitted(&self, fitted: &FittedClassifier) -> Result<PathBuf, ModelError> {
        self.artifacts.save(P::KIND, fitted)
    }

    fn save_model(&self) -> Result<PathBuf, ModelError> {
        let fitted = self.snapshot().ok_or(ModelError::NotTrained(P::KIND))?;
        self.save_fitted(&fitted)
    }

    fn load_model(&self) -> Result<(), ModelError> {
        let fitted: FittedClassifier = self.artifacts.load(P::KIND)?;
        if fitted.info.kind != P::KIND {
            return Err(ModelError::persistence(
                self.artifacts.path(P::KIND),
                format!("bundle holds a {} model", fitted.info.kind),
            ));
        }
        if fitted.importance.len() != fitted.info.schema.width()
            || fitted.forest.n_features() != fitted.info.schema.width()
        {
            return Err(ModelError::persistence(
                self.artifacts.path(P::KIND),
                "bundle width disagrees with its schema",
            ));
        }
        self.publish(Arc::new(fitted))
    }

    /// Grid search scored by mean AUC over stratified folds; the winner is
    /// refit on the full frame.
    fn optimize_hyperparameters(
        &self,
        frame: &MlFrame,
        algorithm: ClassifierAlgorithm,
    ) -> Result<Optimization<ForestParams, FittedClassifier>, ModelError> {
        let labels = self.check_training_frame(frame)?;
        let base = ForestParams::for_algorithm(algorithm);
        let folds = stratified_folds(labels, CV_FOLDS, base.seed);

        let mut trials = Vec::new();
        for n_trees in [25, 50] {
            for max_depth in [Some(4), Some(8), None] {
                for min_weight_split in [2.0, 8.0] {
                    let params = ForestParams {
                        n_trees,
                        max_depth,
                        min_weight_split,
                        ..base.clone()
                    };
                    let mut scores = Vec::with_capacity(folds.len());
                    for fold in &folds {
                        let train_x = frame.records.select(Axis(0), &fold.train);
                        let train_y = labels.select(Axis(0), &fold.train);
                        let test_x = frame.records.select(Axis(0), &fold.test);
                        let test_y = labels.select(Axis(0), &fold.test);
                        let scaler = StandardScaler::fit(&train_x);
                        let forest =
                            ForestClassifier::fit(&scaler.transform(&train_x), &train_y, &params)?;
                        let proba = forest.predict_proba(&scaler.transform(&test_x))?;
                        scores.push(auc_roc(&test_y, &proba));
                    }
                    let score = scores.iter().sum::<f64>() / scores.len().max(1) as f64;
                    debug!(
                        component = "classifier",
                        event = "model.optimize.trial",
                        model = P::KIND.as_str(),
                        n_trees,
                        max_depth = ?max_depth,
                        min_weight_split,
                        score
                    );
                    trials.push(Trial { params, score });
                }
            }
        }

        let best = trials
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .cloned()
            .ok_or_else(|| ModelError::Training("empty parameter grid".to_string()))?;
        let (best_model, _) = self.fit(frame, &best.params)?;
        info!(
            component = "classifier",
            event = "model.optimize.finish",
            model = P::KIND.as_str(),
            algorithm = algorithm.as_str(),
            best_score = best.score,
            trials = trials.len()
        );

        Ok(Optimization {
            best_params: best.params,
            best_score: best.score,
            trials,
            best_model,
        })
    }

    fn evaluation_of(&self, fitted: &FittedClassifier) -> ClassifierEvaluation {
        fitted.evaluation.clone()
    }

    fn info(&self) -> Option<ModelInfo> {
        self.snapshot().map(|f| f.info.clone())
    }
}

fn rank_importance(names: &[&str], importance: &[f64]) -> Vec<FeatureImportance> {
    let mut ranked: Vec<FeatureImportance> = names
        .iter()
        .zip(importance.iter())
        .map(|(name, importance)| FeatureImportance {
            feature: (*name).to_string(),
            importance: *importance,
        })
        .collect();
    ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    ranked
}

/// Features that sit far from the training mean and matter to the model,
/// ranked by `|z| * importance`.
pub fn key_factors(names: &[&str], raw: &[f64], scaled: &[f64], importance: &[f64]) -> Vec<KeyFactor> {
    let mut factors: Vec<(f64, KeyFactor)> = names
        .iter()
        .enumerate()
        .filter_map(|(i, name)| {
            let z = *scaled.get(i)?;
            let weight = *importance.get(i)?;
            if z.abs() < KEY_FACTOR_MIN_Z || weight <= 0.0 {
                return None;
            }
            Some((
                z.abs() * weight,
                KeyFactor {
                    feature: (*name).to_string(),
                    value: raw.get(i).copied().unwrap_or(0.0),
                    z_score: z,
                    direction: if z >= 0.0 {
                        Direction::AboveAverage
                    } else {
                        Direction::BelowAverage
                    },
                    importance: weight,
                },
            ))
        })
        .collect();
    factors.sort_by(|a, b| b.0.total_cmp(&a.0));
    factors
        .into_iter()
        .take(MAX_KEY_FACTORS)
        .map(|(_, factor)| factor)
        .collect()
}
