//! K-means user segmentation over `UserFeatures`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use linfa::prelude::*;
use linfa_clustering::{KMeans, KMeansInit};
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::ArtifactStore;
use crate::evaluation::{
    calinski_harabasz_score, cluster_sizes, euclidean, inertia, sampled_silhouette_score,
    SILHOUETTE_SAMPLE_SIZE,
};
use crate::features::FeatureExtractor;
use crate::model::{
    predict_user, require_rows, ModelError, ModelInfo, ModelKind, ModelSlot, ModelWrapper,
    Optimization, Trial,
};
use crate::scaler::StandardScaler;
use crate::table::{assert_schema_compatible, FeatureSet, MlFrame, LOG1P_COLUMNS};

pub const MIN_CLUSTERS: usize = 2;
pub const MAX_CLUSTERS: usize = 20;
pub const MIN_OPTIMIZATION_ROWS: usize = 10;
const OPTIMIZATION_CLUSTERS: std::ops::RangeInclusive<usize> = 3..=8;

/// Columns summarized per segment, when present in the frame.
const PROFILE_COLUMNS: [&str; 7] = [
    "total_events",
    "unique_days_active",
    "purchase_count",
    "total_spent",
    "has_username",
    "weekend_activity_ratio",
    "days_since_last_activity",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationAlgorithm {
    KmeansPlusPlus,
    Random,
}

impl SegmentationAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KmeansPlusPlus => "kmeans_plus_plus",
            Self::Random => "random",
        }
    }

    fn init(self) -> KMeansInit<f64> {
        match self {
            Self::KmeansPlusPlus => KMeansInit::KMeansPlusPlus,
            Self::Random => KMeansInit::Random,
        }
    }
}

impl fmt::Display for SegmentationAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentationAlgorithm {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "kmeans" | "k-means" | "kmeans++" | "k-means++" | "kmeans_plus_plus" => {
                Ok(Self::KmeansPlusPlus)
            }
            "random" | "kmeans_random" => Ok(Self::Random),
            other => Err(ModelError::InvalidParams(format!(
                "unknown segmentation algorithm `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationParams {
    pub n_clusters: usize,
    pub algorithm: SegmentationAlgorithm,
    pub max_iterations: u64,
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            n_clusters: 5,
            algorithm: SegmentationAlgorithm::KmeansPlusPlus,
            max_iterations: 300,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

impl SegmentationParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        if !(MIN_CLUSTERS..=MAX_CLUSTERS).contains(&self.n_clusters) {
            return Err(ModelError::InvalidParams(format!(
                "n_clusters must be in {MIN_CLUSTERS}..={MAX_CLUSTERS}, got {}",
                self.n_clusters
            )));
        }
        if self.max_iterations == 0 {
            return Err(ModelError::InvalidParams(
                "max_iterations must be > 0".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(ModelError::InvalidParams(
                "tolerance must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Archetype label for a cluster id. Ids are ordered by ascending centroid
/// sum, so low ids are the least engaged users.
pub fn segment_name(segment_id: usize) -> String {
    match segment_id {
        0 => "Dormant users".to_string(),
        1 => "New users".to_string(),
        2 => "Window shoppers".to_string(),
        3 => "Active buyers".to_string(),
        4 => "VIP customers".to_string(),
        n => format!("Segment {n}"),
    }
}

pub fn segment_description(segment_id: usize) -> &'static str {
    match segment_id {
        0 => "Little or no recent activity",
        1 => "Recently registered with a short history",
        2 => "Browse and add to cart but rarely buy",
        3 => "Regular activity with repeat purchases",
        4 => "Highest engagement and spend",
        _ => "Additional cluster",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentProfile {
    pub segment_id: usize,
    pub name: String,
    pub description: String,
    pub size: usize,
    pub percentage: f64,
    /// Mean raw value per profile column.
    pub characteristics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationEvaluation {
    pub model_version: String,
    pub n_clusters: usize,
    pub algorithm: SegmentationAlgorithm,
    pub training_rows: usize,
    pub silhouette_score: f64,
    pub calinski_harabasz_score: f64,
    pub inertia: f64,
    pub cluster_sizes: Vec<usize>,
    pub segments: Vec<SegmentProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentAssignment {
    pub user_id: i64,
    pub segment_id: usize,
    pub segment_name: String,
    /// Distance to the assigned centroid in scaled feature space.
    pub distance: f64,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentShare {
    pub segment_id: usize,
    pub segment_name: String,
    pub count: usize,
    pub percentage: f64,
}

/// Per-segment counts over a set of assignments, ordered by segment id.
pub fn segment_distribution(assignments: &[SegmentAssignment]) -> Vec<SegmentShare> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for a in assignments {
        *counts.entry(a.segment_id).or_default() += 1;
    }
    let total = assignments.len().max(1) as f64;
    counts
        .into_iter()
        .map(|(segment_id, count)| SegmentShare {
            segment_id,
            segment_name: segment_name(segment_id),
            count,
            percentage: count as f64 / total * 100.0,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedSegmentation {
    pub info: ModelInfo,
    pub params: SegmentationParams,
    pub scaler: StandardScaler,
    /// Scaled-space centroids, row `i` is segment `i`.
    pub centroids: Array2<f64>,
    pub evaluation: SegmentationEvaluation,
}

impl FittedSegmentation {
    fn nearest(&self, row: ArrayView1<f64>) -> (usize, f64) {
        nearest_centroid(&self.centroids, row)
    }
}

fn nearest_centroid(centroids: &Array2<f64>, row: ArrayView1<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (idx, centroid) in centroids.outer_iter().enumerate() {
        let distance = euclidean(row, centroid);
        if distance < best.1 {
            best = (idx, distance);
        }
    }
    best
}

pub struct SegmentationModel {
    slot: ModelSlot<FittedSegmentation>,
    artifacts: ArtifactStore,
}

impl SegmentationModel {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self {
            slot: ModelSlot::default(),
            artifacts,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn evaluation(&self) -> Option<SegmentationEvaluation> {
        self.snapshot().map(|f| f.evaluation.clone())
    }

    pub fn get_user_segment<E>(
        &self,
        extractor: &E,
        user_id: i64,
        prediction_date: Option<DateTime<Utc>>,
    ) -> Result<SegmentAssignment, ModelError>
    where
        E: FeatureExtractor + ?Sized,
    {
        predict_user(self, extractor, user_id, prediction_date)
    }

    fn snapshot(&self) -> Option<Arc<FittedSegmentation>> {
        self.slot.snapshot().ok().flatten()
    }
}

impl ModelWrapper for SegmentationModel {
    type Params = SegmentationParams;
    type Algorithm = SegmentationAlgorithm;
    type Fitted = FittedSegmentation;
    type Evaluation = SegmentationEvaluation;
    type Prediction = SegmentAssignment;

    fn kind(&self) -> ModelKind {
        ModelKind::Segmentation
    }

    fn fit(
        &self,
        frame: &MlFrame,
        params: &SegmentationParams,
    ) -> Result<(FittedSegmentation, SegmentationEvaluation), ModelError> {
        params.validate()?;
        if frame.schema.feature_set != FeatureSet::User {
            return Err(ModelError::InvalidParams(format!(
                "segmentation expects user features, got {}",
                frame.schema.feature_set.as_str()
            )));
        }
        require_rows(frame, params.n_clusters)?;

        let scaler = StandardScaler::fit(&frame.records);
        let scaled = scaler.transform(&frame.records);
        let dataset = Dataset::new(scaled.clone(), Array1::<usize>::zeros(scaled.nrows()));
        let kmeans = KMeans::params_with(
            params.n_clusters,
            StdRng::seed_from_u64(params.seed),
            L2Dist,
        )
        .max_n_iterations(params.max_iterations)
        .tolerance(params.tolerance)
        .init_method(params.algorithm.init())
        .fit(&dataset)
        .map_err(|e| ModelError::Training(e.to_string()))?;

        // stable ids: order clusters by ascending centroid sum
        let raw = kmeans.centroids();
        let mut order: Vec<usize> = (0..raw.nrows()).collect();
        order.sort_by(|a, b| raw.row(*a).sum().total_cmp(&raw.row(*b).sum()));
        let centroids = raw.select(Axis(0), &order);

        let labels: Array1<usize> = scaled
            .outer_iter()
            .map(|row| nearest_centroid(&centroids, row).0)
            .collect();
        let sizes = cluster_sizes(&labels, params.n_clusters);
        let info = ModelInfo::new(ModelKind::Segmentation, frame.schema.clone(), frame.nrows());

        let evaluation = SegmentationEvaluation {
            model_version: info.version.clone(),
            n_clusters: params.n_clusters,
            algorithm: params.algorithm,
            training_rows: frame.nrows(),
            silhouette_score: sampled_silhouette_score(
                &scaled,
                &labels,
                params.n_clusters,
                SILHOUETTE_SAMPLE_SIZE,
                params.seed,
            ),
            calinski_harabasz_score: calinski_harabasz_score(&scaled, &labels, &centroids),
            inertia: inertia(&scaled, &labels, &centroids),
            segments: segment_profiles(frame, &labels, &sizes),
            cluster_sizes: sizes,
        };
        info!(
            component = "segmentation",
            event = "model.train.finish",
            model = ModelKind::Segmentation.as_str(),
            version = %info.version,
            rows = frame.nrows(),
            n_clusters = params.n_clusters,
            silhouette = evaluation.silhouette_score
        );

        Ok((
            FittedSegmentation {
                info,
                params: params.clone(),
                scaler,
                centroids,
                evaluation: evaluation.clone(),
            },
            evaluation,
        ))
    }

    fn publish(&self, fitted: Arc<FittedSegmentation>) -> Result<(), ModelError> {
        info!(
            component = "segmentation",
            event = "model.publish",
            model = ModelKind::Segmentation.as_str(),
            version = %fitted.info.version
        );
        self.slot.publish(fitted)
    }

    fn predict(&self, frame: &MlFrame) -> Result<Vec<SegmentAssignment>, ModelError> {
        let fitted = self
            .snapshot()
            .ok_or(ModelError::NotTrained(ModelKind::Segmentation))?;
        assert_schema_compatible(&fitted.info.schema, &frame.schema)?;

        let scaled = fitted.scaler.transform(&frame.records);
        let assignments: Vec<SegmentAssignment> = scaled
            .outer_iter()
            .zip(frame.user_ids.iter())
            .map(|(row, user_id)| {
                let (segment_id, distance) = fitted.nearest(row);
                SegmentAssignment {
                    user_id: *user_id,
                    segment_id,
                    segment_name: segment_name(segment_id),
                    distance,
                    model_version: fitted.info.version.clone(),
                }
            })
            .collect();
        debug!(
            component = "segmentation",
            event = "model.predict",
            rows = assignments.len()
        );
        Ok(assignments)
    }

    fn save_fitted(&self, fitted: &FittedSegmentation) -> Result<PathBuf, ModelError> {
        self.artifacts.save(ModelKind::Segmentation, fitted)
    }

    fn save_model(&self) -> Result<PathBuf, ModelError> {
        let fitted = self
            .snapshot()
            .ok_or(ModelError::NotTrained(ModelKind::Segmentation))?;
        self.save_fitted(&fitted)
    }

    fn load_model(&self) -> Result<(), ModelError> {
        let fitted: FittedSegmentation = self.artifacts.load(ModelKind::Segmentation)?;
        if fitted.info.kind != ModelKind::Segmentation
            || fitted.centroids.ncols() != fitted.info.schema.width()
            || fitted.scaler.width() != fitted.info.schema.width()
        {
            return Err(ModelError::persistence(
                self.artifacts.path(ModelKind::Segmentation),
                "bundle does not hold a consistent segmentation model",
            ));
        }
        self.publish(Arc::new(fitted))
    }

    /// Tries 3..=8 clusters with the given init and keeps the best silhouette.
    fn optimize_hyperparameters(
        &self,
        frame: &MlFrame,
        algorithm: SegmentationAlgorithm,
    ) -> Result<Optimization<SegmentationParams, FittedSegmentation>, ModelError> {
        require_rows(frame, MIN_OPTIMIZATION_ROWS)?;

        let mut trials = Vec::new();
        let mut best: Option<(f64, FittedSegmentation)> = None;
        for n_clusters in OPTIMIZATION_CLUSTERS.filter(|n| *n < frame.nrows()) {
            let params = SegmentationParams {
                n_clusters,
                algorithm,
                ..SegmentationParams::default()
            };
            let (fitted, evaluation) = self.fit(frame, &params)?;
            let score = evaluation.silhouette_score;
            trials.push(Trial { params, score });
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, fitted));
            }
        }

        let (best_score, best_model) = best
            .ok_or_else(|| ModelError::Training("no cluster count could be tried".to_string()))?;
        info!(
            component = "segmentation",
            event = "model.optimize.finish",
            algorithm = algorithm.as_str(),
            best_n_clusters = best_model.params.n_clusters,
            best_score,
            trials = trials.len()
        );
        Ok(Optimization {
            best_params: best_model.params.clone(),
            best_score,
            trials,
            best_model,
        })
    }

    fn evaluation_of(&self, fitted: &FittedSegmentation) -> SegmentationEvaluation {
        fitted.evaluation.clone()
    }

    fn info(&self) -> Option<ModelInfo> {
        self.snapshot().map(|f| f.info.clone())
    }
}

fn segment_profiles(frame: &MlFrame, labels: &Array1<usize>, sizes: &[usize]) -> Vec<SegmentProfile> {
    let total = frame.nrows().max(1) as f64;
    let columns: Vec<(&str, usize)> = PROFILE_COLUMNS
        .iter()
        .filter_map(|name| frame.column_index(name).map(|idx| (*name, idx)))
        .collect();

    sizes
        .iter()
        .enumerate()
        .map(|(segment_id, size)| {
            let rows: Vec<usize> = labels
                .iter()
                .enumerate()
                .filter(|(_, l)| **l == segment_id)
                .map(|(i, _)| i)
                .collect();
            let characteristics = columns
                .iter()
                .map(|(name, idx)| {
                    let log_scaled = LOG1P_COLUMNS.contains(name);
                    let sum: f64 = rows
                        .iter()
                        .map(|r| {
                            let v = frame.records[[*r, *idx]];
                            if log_scaled {
                                v.exp_m1()
                            } else {
                                v
                            }
                        })
                        .sum();
                    let mean = if rows.is_empty() { 0.0 } else { sum / rows.len() as f64 };
                    ((*name).to_string(), mean)
                })
                .collect();
            SegmentProfile {
                segment_id,
                name: segment_name(segment_id),
                description: segment_description(segment_id).to_string(),
                size: *size,
                percentage: *size as f64 / total * 100.0,
                characteristics,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three well separated blobs over user-feature column names.
    fn blobs(per_blob: usize) -> MlFrame {
        let columns = vec!["total_events".to_string(), "unique_days_active".to_string()];
        let centers = [(0.0, 0.0), (5.0, 5.0), (10.0, 0.0)];
        let n = per_blob * centers.len();
        let records = Array2::from_shape_fn((n, 2), |(i, j)| {
            let (cx, cy) = centers[i / per_blob];
            let jitter = (i % per_blob) as f64 * 0.01;
            if j == 0 {
                cx + jitter
            } else {
                cy - jitter
            }
        });
        MlFrame::new(FeatureSet::User, columns, records, (0..n as i64).collect(), None)
            .expect("valid frame")
    }

    fn params(n_clusters: usize) -> SegmentationParams {
        SegmentationParams {
            n_clusters,
            ..SegmentationParams::default()
        }
    }

    #[test]
    fn names_cover_archetypes_then_fall_back() {
        assert_eq!(segment_name(0), "Dormant users");
        assert_eq!(segment_name(4), "VIP customers");
        assert_eq!(segment_name(7), "Segment 7");
    }

    #[test]
    fn fits_separated_blobs_with_ordered_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = SegmentationModel::new(ArtifactStore::new(dir.path()));
        let frame = blobs(10);
        let evaluation = model.train(&frame, &params(3)).expect("trains");

        assert_eq!(evaluation.cluster_sizes, vec![10, 10, 10]);
        assert!(evaluation.silhouette_score > 0.8);

        let assignments = model.predict(&frame).expect("predicts");
        // the blob nearest the origin has the smallest centroid sum
        assert_eq!(assignments[0].segment_id, 0);
        assert_eq!(assignments[0].segment_name, "Dormant users");
        let shares = segment_distribution(&assignments);
        assert_eq!(shares.len(), 3);
        assert!((shares[0].percentage - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range_cluster_counts_and_small_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = SegmentationModel::new(ArtifactStore::new(dir.path()));
        assert!(matches!(
            model.train(&blobs(2), &params(1)),
            Err(ModelError::InvalidParams(_))
        ));
        assert!(matches!(
            model.train(&blobs(1), &params(5)),
            Err(ModelError::InsufficientData {
                required: 5,
                actual: 3
            })
        ));
        assert!(matches!(
            model.optimize_hyperparameters(&blobs(3), SegmentationAlgorithm::KmeansPlusPlus),
            Err(ModelError::InsufficientData { required: 10, .. })
        ));
    }

    #[test]
    fn optimization_picks_the_natural_cluster_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = SegmentationModel::new(ArtifactStore::new(dir.path()));
        let result = model
            .optimize_hyperparameters(&blobs(10), SegmentationAlgorithm::KmeansPlusPlus)
            .expect("optimizes");
        assert_eq!(result.best_params.n_clusters, 3);
        assert_eq!(result.trials.len(), 6);
        assert!(!model.is_trained());
    }

    #[test]
    fn predict_before_training_needs_training() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = SegmentationModel::new(ArtifactStore::new(dir.path()));
        let err = model.predict(&blobs(2)).expect_err("untrained");
        assert!(err.needs_training());
    }
}
