//! The capability shared by the segmentation, purchase and churn wrappers.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{FeatureError, FeatureExtractor};
use crate::forest::ForestError;
use crate::table::{FeatureRecord, FeatureSchema, FeatureTable, MlFrame, SchemaMismatch, TableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Segmentation,
    PurchasePrediction,
    ChurnPrediction,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::Segmentation,
        ModelKind::PurchasePrediction,
        ModelKind::ChurnPrediction,
    ];

    /// Artifact base name.
    pub fn artifact_name(self) -> &'static str {
        match self {
            Self::Segmentation => "user_segmentation",
            Self::PurchasePrediction => "purchase_prediction",
            Self::ChurnPrediction => "churn_prediction",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::PurchasePrediction => "purchase_prediction",
            Self::ChurnPrediction => "churn_prediction",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "segmentation" | "user_segmentation" => Ok(Self::Segmentation),
            "purchase" | "purchase_prediction" => Ok(Self::PurchasePrediction),
            "churn" | "churn_prediction" => Ok(Self::ChurnPrediction),
            other => Err(ModelError::InvalidParams(format!(
                "unknown model type `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no persisted {kind} model at {path}")]
    NotFound { kind: ModelKind, path: PathBuf },
    #[error("{0} model is not trained")]
    NotTrained(ModelKind),
    #[error("user {0} not found")]
    UserNotFound(i64),
    #[error("insufficient data: {required} rows required, got {actual}")]
    InsufficientData { required: usize, actual: usize },
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),
    #[error("model persistence failed at {path}: {detail}")]
    Persistence { path: PathBuf, detail: String },
    #[error("training failed: {0}")]
    Training(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("training frame has no labels")]
    MissingLabels,
    #[error("feature table error: {0}")]
    Table(#[from] TableError),
    #[error("feature extraction error: {0}")]
    Feature(#[from] FeatureError),
    #[error("model state lock poisoned")]
    LockPoisoned,
}

impl ModelError {
    /// Both "nothing persisted" and "nothing trained" mean the caller should
    /// run a training flow.
    pub fn needs_training(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::NotTrained(_))
    }

    pub fn persistence(path: impl Into<PathBuf>, detail: impl fmt::Display) -> Self {
        Self::Persistence {
            path: path.into(),
            detail: detail.to_string(),
        }
    }
}

impl From<ForestError> for ModelError {
    fn from(err: ForestError) -> Self {
        match err {
            ForestError::InvalidParams(msg) => Self::InvalidParams(msg),
            other => Self::Training(other.to_string()),
        }
    }
}

/// Holds the currently published fitted model. Readers clone the `Arc` and
/// keep using their snapshot while a retrain publishes a replacement.
pub struct ModelSlot<T> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T> Default for ModelSlot<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }
}

impl<T> ModelSlot<T> {
    pub fn snapshot(&self) -> Result<Option<Arc<T>>, ModelError> {
        let guard = self.inner.read().map_err(|_| ModelError::LockPoisoned)?;
        Ok(guard.clone())
    }

    pub fn publish(&self, fitted: Arc<T>) -> Result<(), ModelError> {
        let mut guard = self.inner.write().map_err(|_| ModelError::LockPoisoned)?;
        *guard = Some(fitted);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().map(|g| g.is_some()).unwrap_or(false)
    }
}

/// Metadata every persisted bundle carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub kind: ModelKind,
    pub version: String,
    pub trained_at: DateTime<Utc>,
    pub training_rows: usize,
    pub schema: FeatureSchema,
}

impl ModelInfo {
    pub fn new(kind: ModelKind, schema: FeatureSchema, training_rows: usize) -> Self {
        let trained_at = Utc::now();
        Self {
            version: model_version(kind, &schema, trained_at),
            kind,
            trained_at,
            training_rows,
            schema,
        }
    }

    pub fn feature_names(&self) -> Vec<&str> {
        self.schema.column_names()
    }
}

/// `<kind>-<YYYYMMDDTHHMMSS>-<fingerprint prefix>`
pub fn model_version(kind: ModelKind, schema: &FeatureSchema, at: DateTime<Utc>) -> String {
    let short = schema.fingerprint.get(..8).unwrap_or(&schema.fingerprint);
    format!("{}-{}-{}", kind.as_str(), at.format("%Y%m%dT%H%M%S"), short)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial<P> {
    pub params: P,
    pub score: f64,
}

/// Result of a hyperparameter search.
#[derive(Debug, Clone)]
pub struct Optimization<P, F> {
    pub best_params: P,
    pub best_score: f64,
    pub trials: Vec<Trial<P>>,
    pub best_model: F,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSummary<P> {
    pub best_params: P,
    pub best_score: f64,
    pub trials: Vec<Trial<P>>,
}

impl<P: Clone, F> Optimization<P, F> {
    pub fn summary(&self) -> OptimizationSummary<P> {
        OptimizationSummary {
            best_params: self.best_params.clone(),
            best_score: self.best_score,
            trials: self.trials.clone(),
        }
    }
}

/// Train, persist, load, predict and tune one model family.
///
/// `fit` never touches the published model; `train` fits and then publishes.
/// The scheduler uses the split to persist a candidate before publishing it.
pub trait ModelWrapper: Send + Sync {
    type Params: Clone + Default + Send + Serialize;
    type Algorithm: Copy + Send;
    type Fitted: Send + Sync;
    type Evaluation: Clone + Send + Serialize;
    type Prediction: Send + Serialize;

    fn kind(&self) -> ModelKind;

    fn fit(
        &self,
        frame: &MlFrame,
        params: &Self::Params,
    ) -> Result<(Self::Fitted, Self::Evaluation), ModelError>;

    fn publish(&self, fitted: Arc<Self::Fitted>) -> Result<(), ModelError>;

    fn train(&self, frame: &MlFrame, params: &Self::Params) -> Result<Self::Evaluation, ModelError> {
        let (fitted, evaluation) = self.fit(frame, params)?;
        self.publish(Arc::new(fitted))?;
        Ok(evaluation)
    }

    /// Fits, persists the result, then publishes it. A failed save leaves the
    /// currently published model in place.
    fn train_and_save(
        &self,
        frame: &MlFrame,
        params: &Self::Params,
    ) -> Result<(Self::Evaluation, PathBuf), ModelError> {
        let (fitted, evaluation) = self.fit(frame, params)?;
        let path = self.save_fitted(&fitted)?;
        self.publish(Arc::new(fitted))?;
        Ok((evaluation, path))
    }

    fn predict(&self, frame: &MlFrame) -> Result<Vec<Self::Prediction>, ModelError>;

    fn save_fitted(&self, fitted: &Self::Fitted) -> Result<PathBuf, ModelError>;

    /// Persists the published model.
    fn save_model(&self) -> Result<PathBuf, ModelError>;

    /// Loads the persisted artifact and publishes it.
    fn load_model(&self) -> Result<(), ModelError>;

    fn optimize_hyperparameters(
        &self,
        frame: &MlFrame,
        algorithm: Self::Algorithm,
    ) -> Result<Optimization<Self::Params, Self::Fitted>, ModelError>;

    /// Held-out evaluation recorded when `fitted` was trained.
    fn evaluation_of(&self, fitted: &Self::Fitted) -> Self::Evaluation;

    fn info(&self) -> Option<ModelInfo>;

    fn is_trained(&self) -> bool {
        self.info().is_some()
    }
}

/// Fails with `InsufficientData` below `required` rows.
pub fn require_rows(frame: &MlFrame, required: usize) -> Result<(), ModelError> {
    if frame.nrows() < required {
        return Err(ModelError::InsufficientData {
            required,
            actual: frame.nrows(),
        });
    }
    Ok(())
}

/// Predictions for the users that could be extracted, plus the ones that
/// could not.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPrediction<T> {
    pub predictions: Vec<T>,
    pub skipped: Vec<i64>,
}

/// Drops repeated ids, keeping first-seen order.
pub fn dedupe_user_ids(user_ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(user_ids.len());
    user_ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Extract, transform and predict a single user.
pub fn predict_user<M, E>(
    model: &M,
    extractor: &E,
    user_id: i64,
    prediction_date: Option<DateTime<Utc>>,
) -> Result<M::Prediction, ModelError>
where
    M: ModelWrapper + ?Sized,
    E: FeatureExtractor + ?Sized,
{
    let record = extractor
        .extract(user_id, prediction_date)?
        .ok_or(ModelError::UserNotFound(user_id))?;
    let frame = FeatureTable::from_records(std::slice::from_ref(&record)).to_ml_ready()?;
    model
        .predict(&frame)?
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Training("model returned no prediction".to_string()))
}

/// One prediction per distinct user id. Users that do not exist or fail
/// extraction are listed in `skipped` instead of failing the batch.
pub fn predict_users<M, E>(
    model: &M,
    extractor: &E,
    user_ids: &[i64],
    prediction_date: Option<DateTime<Utc>>,
) -> Result<BatchPrediction<M::Prediction>, ModelError>
where
    M: ModelWrapper + ?Sized,
    E: FeatureExtractor + ?Sized,
{
    let ids = dedupe_user_ids(user_ids);
    let records = extractor.extract_batch(&ids, prediction_date);
    let extracted: HashSet<i64> = records.iter().map(|r| r.user_id()).collect();
    let skipped = ids
        .iter()
        .copied()
        .filter(|id| !extracted.contains(id))
        .collect();
    if records.is_empty() {
        return Ok(BatchPrediction {
            predictions: Vec::new(),
            skipped,
        });
    }
    let frame = FeatureTable::from_records(&records).to_ml_ready()?;
    Ok(BatchPrediction {
        predictions: model.predict(&frame)?,
        skipped,
    })
}
