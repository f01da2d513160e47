//! HTTP routes for training, prediction and the two schedulers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::churn_features::ChurnFeatureExtractor;
use crate::classifier::{
    ChurnProfile, ClassifierEvaluation, ClassifierModel, ClassifierPrediction, ClassifierProfile,
    FeatureImportance, PurchaseProfile,
};
use crate::config::{
    PredictionUpdaterConfig, PredictionUpdaterConfigUpdate, RetrainingConfig,
    RetrainingConfigUpdate, RetrainingConfigs,
};
use crate::features::{FeatureError, FeatureExtractor, LabelledExtractor, PREDICTION_HORIZON_DAYS};
use crate::forest::{ClassifierAlgorithm, ForestParams};
use crate::model::{
    dedupe_user_ids, predict_user, predict_users, BatchPrediction, ModelError, ModelInfo,
    ModelKind, ModelWrapper, OptimizationSummary,
};
use crate::prediction_updater::{PredictionUpdater, UpdateReport, UpdaterStatus};
use crate::purchase_features::PurchaseFeatureExtractor;
use crate::retraining::{RetrainReport, RetrainingScheduler, RetrainingStatus};
use crate::segmentation::{
    segment_name, SegmentAssignment, SegmentationAlgorithm, SegmentationEvaluation,
    SegmentationParams,
};
use crate::services::{ExtractorSet, ModelSet};
use crate::store::PredictionStats;
use crate::table::{FeatureTable, MlFrame};
use crate::worker::SchedulerError;

pub const MAX_BATCH_USERS: usize = 1000;
const DEFAULT_DAYS_BACK: i64 = 30;
const DEFAULT_SEGMENT_PAGE: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub models: ModelSet,
    pub extractors: ExtractorSet,
    pub retraining: Arc<RetrainingScheduler>,
    pub updater: Arc<PredictionUpdater>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("{0}")]
    BadRequest(String),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<FeatureError> for ApiError {
    fn from(err: FeatureError) -> Self {
        Self::Model(err.into())
    }
}

fn model_status(err: &ModelError) -> StatusCode {
    match err {
        ModelError::NotFound { .. } | ModelError::NotTrained(_) | ModelError::UserNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ModelError::InsufficientData { .. }
        | ModelError::InvalidParams(_)
        | ModelError::MissingLabels
        | ModelError::Feature(FeatureError::InvalidRange(_)) => StatusCode::BAD_REQUEST,
        ModelError::SchemaMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Model(err) | Self::Scheduler(SchedulerError::Model(err)) => model_status(err),
            Self::Scheduler(SchedulerError::Config(_)) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Scheduler(_) | Self::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(
                component = "api",
                event = "http.error",
                status = status.as_u16(),
                error = %self
            );
        }
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        success: true,
        data,
    }))
}

/// Runs blocking model or store work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(get_health))
        .route("/health", get(get_health))
        .nest("/api/segmentation", segmentation_routes())
        .nest(
            "/api/purchase-prediction",
            classifier_routes::<PurchaseProfile>(),
        )
        .nest("/api/churn-prediction", classifier_routes::<ChurnProfile>())
        .nest("/api/retraining", retraining_routes())
        .nest("/api/prediction-updater", updater_routes())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    service: &'static str,
    models: Vec<ModelLoaded>,
    retraining_running: bool,
    prediction_updater_running: bool,
}

#[derive(Debug, Serialize)]
struct ModelLoaded {
    model_type: ModelKind,
    loaded: bool,
}

async fn get_health(State(state): State<AppState>) -> ApiResult<Health> {
    ok(Health {
        status: "ok",
        service: "ml_server",
        models: ModelKind::ALL
            .into_iter()
            .map(|kind| ModelLoaded {
                model_type: kind,
                loaded: state.models.is_loaded(kind),
            })
            .collect(),
        retraining_running: state.retraining.is_running(),
        prediction_updater_running: state.updater.is_running(),
    })
}

fn segmentation_routes() -> Router<AppState> {
    Router::new()
        .route("/train", post(train_segmentation))
        .route("/segments", get(get_segments))
        .route("/users/{user_id}/segment", get(get_user_segment))
        .route("/users/segment/{segment_id}", get(get_segment_users))
        .route("/optimize", post(optimize_segmentation))
        .route("/stats", get(get_segmentation_stats))
}

#[derive(Debug, Default, Deserialize)]
struct SegmentationTrainQuery {
    n_clusters: Option<usize>,
    algorithm: Option<String>,
    limit: Option<usize>,
}

fn parse_segmentation_algorithm(raw: Option<&str>) -> Result<SegmentationAlgorithm, ApiError> {
    match raw {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(SegmentationAlgorithm::KmeansPlusPlus),
    }
}

fn user_frame(state: &AppState, limit: Option<usize>) -> Result<MlFrame, ApiError> {
    let records = state.extractors.user.extract_all(limit, None)?;
    Ok(FeatureTable::from_records(&records)
        .to_ml_ready()
        .map_err(ModelError::from)?)
}

async fn train_segmentation(
    State(state): State<AppState>,
    Query(query): Query<SegmentationTrainQuery>,
) -> ApiResult<SegmentationEvaluation> {
    let params = SegmentationParams {
        n_clusters: query.n_clusters.unwrap_or(SegmentationParams::default().n_clusters),
        algorithm: parse_segmentation_algorithm(query.algorithm.as_deref())?,
        ..SegmentationParams::default()
    };
    params.validate()?;
    info!(
        component = "api",
        event = "http.train.request",
        model = "segmentation",
        n_clusters = params.n_clusters,
        algorithm = params.algorithm.as_str()
    );

    let evaluation = blocking(move || {
        let frame = user_frame(&state, query.limit)?;
        let (evaluation, _) = state
            .retraining
            .run_exclusive(|| state.models.segmentation.train_and_save(&frame, &params))??;
        Ok(evaluation)
    })
    .await?;
    ok(evaluation)
}

async fn get_segments(State(state): State<AppState>) -> ApiResult<SegmentationEvaluation> {
    let evaluation = state
        .models
        .segmentation
        .evaluation()
        .ok_or(ModelError::NotTrained(ModelKind::Segmentation))?;
    ok(evaluation)
}

async fn get_user_segment(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> ApiResult<SegmentAssignment> {
    let assignment = blocking(move || {
        Ok(state
            .models
            .segmentation
            .get_user_segment(state.extractors.user.as_ref(), user_id, None)?)
    })
    .await?;
    ok(assignment)
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SegmentUsers {
    segment_id: usize,
    segment_name: String,
    total: usize,
    users: Vec<SegmentAssignment>,
}

async fn get_segment_users(
    State(state): State<AppState>,
    Path(segment_id): Path<usize>,
    Query(page): Query<PageQuery>,
) -> ApiResult<SegmentUsers> {
    let limit = page
        .limit
        .unwrap_or(DEFAULT_SEGMENT_PAGE)
        .min(MAX_BATCH_USERS);
    let offset = page.offset.unwrap_or(0);
    let n_clusters = state
        .models
        .segmentation
        .evaluation()
        .ok_or(ModelError::NotTrained(ModelKind::Segmentation))?
        .n_clusters;
    if segment_id >= n_clusters {
        return Err(ApiError::BadRequest(format!(
            "segment_id must be below {n_clusters}, got {segment_id}"
        )));
    }

    let members = blocking(move || {
        let frame = user_frame(&state, None)?;
        let members: Vec<SegmentAssignment> = state
            .models
            .segmentation
            .predict(&frame)?
            .into_iter()
            .filter(|a| a.segment_id == segment_id)
            .collect();
        Ok(members)
    })
    .await?;

    ok(SegmentUsers {
        segment_id,
        segment_name: segment_name(segment_id),
        total: members.len(),
        users: members.into_iter().skip(offset).take(limit).collect(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct OptimizeQuery {
    algorithm: Option<String>,
    days_back: Option<i64>,
    limit: Option<usize>,
}

async fn optimize_segmentation(
    State(state): State<AppState>,
    Query(query): Query<OptimizeQuery>,
) -> ApiResult<OptimizationSummary<SegmentationParams>> {
    let algorithm = parse_segmentation_algorithm(query.algorithm.as_deref())?;
    let summary = blocking(move || {
        let frame = user_frame(&state, query.limit)?;
        let optimization = state
            .models
            .segmentation
            .optimize_hyperparameters(&frame, algorithm)?;
        Ok(optimization.summary())
    })
    .await?;
    ok(summary)
}

#[derive(Debug, Serialize)]
struct SegmentationStats {
    model: ModelInfo,
    evaluation: SegmentationEvaluation,
}

async fn get_segmentation_stats(State(state): State<AppState>) -> ApiResult<SegmentationStats> {
    let segmentation = &state.models.segmentation;
    let not_trained = || ModelError::NotTrained(ModelKind::Segmentation);
    ok(SegmentationStats {
        model: segmentation.info().ok_or_else(not_trained)?,
        evaluation: segmentation.evaluation().ok_or_else(not_trained)?,
    })
}

/// Wires a classifier profile to its model and extractor in [`AppState`].
trait ClassifierRoutes: ClassifierProfile {
    type Extractor: LabelledExtractor + 'static;

    /// Whether stats include the cached prediction table.
    const CACHED_PREDICTIONS: bool;

    fn model(state: &AppState) -> &Arc<ClassifierModel<Self>>
    where
        Self: Sized;

    fn extractor(state: &AppState) -> &Arc<Self::Extractor>;
}

impl ClassifierRoutes for PurchaseProfile {
    type Extractor = PurchaseFeatureExtractor;
    const CACHED_PREDICTIONS: bool = true;

    fn model(state: &AppState) -> &Arc<ClassifierModel<Self>> {
        &state.models.purchase
    }

    fn extractor(state: &AppState) -> &Arc<PurchaseFeatureExtractor> {
        &state.extractors.purchase
    }
}

impl ClassifierRoutes for ChurnProfile {
    type Extractor = ChurnFeatureExtractor;
    const CACHED_PREDICTIONS: bool = false;

    fn model(state: &AppState) -> &Arc<ClassifierModel<Self>> {
        &state.models.churn
    }

    fn extractor(state: &AppState) -> &Arc<ChurnFeatureExtractor> {
        &state.extractors.churn
    }
}

fn classifier_routes<P: ClassifierRoutes>() -> Router<AppState> {
    Router::new()
        .route("/train", post(train_classifier::<P>))
        .route("/predict/batch", post(predict_batch::<P>))
        .route("/predict/{user_id}", post(predict_one::<P>))
        .route("/model/info", get(get_classifier_info::<P>))
        .route("/optimize", post(optimize_classifier::<P>))
        .route("/stats", get(get_classifier_stats::<P>))
}

fn parse_classifier_algorithm(raw: Option<&str>) -> Result<ClassifierAlgorithm, ApiError> {
    match raw {
        Some(raw) => Ok(raw.parse().map_err(ModelError::from)?),
        None => Ok(ClassifierAlgorithm::RandomForest),
    }
}

/// Labelled samples over `days_back` days ending one horizon ago, so every
/// sample's outcome window is already observed.
fn training_frame<P: ClassifierRoutes>(
    state: &AppState,
    days_back: Option<i64>,
    limit: Option<usize>,
) -> Result<MlFrame, ApiError> {
    let days_back = days_back.unwrap_or(DEFAULT_DAYS_BACK);
    if !(1..=365).contains(&days_back) {
        return Err(ApiError::BadRequest(format!(
            "days_back must be in 1..=365, got {days_back}"
        )));
    }
    let end = Utc::now() - Duration::days(PREDICTION_HORIZON_DAYS);
    let start = end - Duration::days(days_back);
    let samples = P::extractor(state).extract_training_data(start, end, limit)?;
    Ok(FeatureTable::from_samples(&samples)
        .to_ml_ready()
        .map_err(ModelError::from)?)
}

async fn train_classifier<P: ClassifierRoutes>(
    State(state): State<AppState>,
    Query(query): Query<OptimizeQuery>,
) -> ApiResult<ClassifierEvaluation> {
    let algorithm = parse_classifier_algorithm(query.algorithm.as_deref())?;
    info!(
        component = "api",
        event = "http.train.request",
        model = P::KIND.as_str(),
        algorithm = algorithm.as_str()
    );
    let evaluation = blocking(move || {
        let frame = training_frame::<P>(&state, query.days_back, query.limit)?;
        let model = P::model(&state);
        let params = ForestParams::for_algorithm(algorithm);
        let (evaluation, _) = state
            .retraining
            .run_exclusive(|| model.train_and_save(&frame, &params))??;
        Ok(evaluation)
    })
    .await?;
    ok(evaluation)
}

#[derive(Debug, Default, Deserialize)]
struct PredictQuery {
    prediction_date: Option<DateTime<Utc>>,
}

async fn predict_one<P: ClassifierRoutes>(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<PredictQuery>,
) -> ApiResult<ClassifierPrediction> {
    let prediction = blocking(move || {
        Ok(predict_user(
            P::model(&state).as_ref(),
            P::extractor(&state).as_ref(),
            user_id,
            query.prediction_date,
        )?)
    })
    .await?;
    ok(prediction)
}

#[derive(Debug, Deserialize)]
pub struct BatchPredictRequest {
    pub user_ids: Vec<i64>,
    pub prediction_date: Option<DateTime<Utc>>,
}

async fn predict_batch<P: ClassifierRoutes>(
    State(state): State<AppState>,
    Json(request): Json<BatchPredictRequest>,
) -> ApiResult<BatchPrediction<ClassifierPrediction>> {
    let user_ids = dedupe_user_ids(&request.user_ids);
    if user_ids.is_empty() {
        return Err(ApiError::BadRequest("user_ids must not be empty".to_string()));
    }
    if user_ids.len() > MAX_BATCH_USERS {
        return Err(ApiError::BadRequest(format!(
            "at most {MAX_BATCH_USERS} distinct user ids per request, got {}",
            user_ids.len()
        )));
    }
    info!(
        component = "api",
        event = "http.predict.request",
        model = P::KIND.as_str(),
        requested = request.user_ids.len(),
        distinct = user_ids.len()
    );
    let batch = blocking(move || {
        Ok(predict_users(
            P::model(&state).as_ref(),
            P::extractor(&state).as_ref(),
            &user_ids,
            request.prediction_date,
        )?)
    })
    .await?;
    ok(batch)
}

#[derive(Debug, Serialize)]
struct ClassifierInfo {
    model: ModelInfo,
    params: Option<ForestParams>,
    evaluation: Option<ClassifierEvaluation>,
    feature_importance: Vec<FeatureImportance>,
}

async fn get_classifier_info<P: ClassifierRoutes>(
    State(state): State<AppState>,
) -> ApiResult<ClassifierInfo> {
    let model = P::model(&state);
    ok(ClassifierInfo {
        model: model.info().ok_or(ModelError::NotTrained(P::KIND))?,
        params: model.params(),
        evaluation: model.evaluation(),
        feature_importance: model.feature_importance().unwrap_or_default(),
    })
}

async fn optimize_classifier<P: ClassifierRoutes>(
    State(state): State<AppState>,
    Query(query): Query<OptimizeQuery>,
) -> ApiResult<OptimizationSummary<ForestParams>> {
    let algorithm = parse_classifier_algorithm(query.algorithm.as_deref())?;
    let summary = blocking(move || {
        let frame = training_frame::<P>(&state, query.days_back, query.limit)?;
        let optimization = P::model(&state).optimize_hyperparameters(&frame, algorithm)?;
        Ok(optimization.summary())
    })
    .await?;
    ok(summary)
}

#[derive(Debug, Serialize)]
struct ClassifierStats {
    model: Option<ModelInfo>,
    evaluation: Option<ClassifierEvaluation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    predictions: Option<PredictionStats>,
}

async fn get_classifier_stats<P: ClassifierRoutes>(
    State(state): State<AppState>,
) -> ApiResult<ClassifierStats> {
    let predictions = if P::CACHED_PREDICTIONS {
        let updater = Arc::clone(&state.updater);
        Some(blocking(move || Ok(updater.get_prediction_stats()?)).await?)
    } else {
        None
    };
    let model = P::model(&state);
    ok(ClassifierStats {
        model: model.info(),
        evaluation: model.evaluation(),
        predictions,
    })
}

fn retraining_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_retraining_status))
        .route("/trigger", post(trigger_retraining))
        .route(
            "/config",
            get(get_retraining_config).put(put_retraining_config),
        )
        .route("/start", post(start_retraining))
        .route("/stop", post(stop_retraining))
        .route("/metrics", get(get_retraining_metrics))
}

#[derive(Debug, Default, Deserialize)]
struct ModelTypeQuery {
    model_type: Option<String>,
}

fn parse_model_type(raw: Option<&str>) -> Result<ModelKind, ApiError> {
    match raw {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(ModelKind::Segmentation),
    }
}

async fn get_retraining_status(
    State(state): State<AppState>,
) -> ApiResult<RetrainingStatus> {
    ok(state.retraining.get_retraining_status()?)
}

async fn trigger_retraining(
    State(state): State<AppState>,
    Query(query): Query<ModelTypeQuery>,
) -> ApiResult<RetrainReport> {
    let kind = parse_model_type(query.model_type.as_deref())?;
    info!(
        component = "api",
        event = "http.retraining.trigger",
        model = kind.as_str()
    );
    let scheduler = Arc::clone(&state.retraining);
    let report = blocking(move || Ok(scheduler.trigger_retraining(kind))).await?;
    ok(report)
}

async fn get_retraining_config(
    State(state): State<AppState>,
) -> ApiResult<RetrainingConfigs> {
    ok(state.retraining.retraining_configs()?)
}

async fn put_retraining_config(
    State(state): State<AppState>,
    Query(query): Query<ModelTypeQuery>,
    Json(update): Json<RetrainingConfigUpdate>,
) -> ApiResult<RetrainingConfig> {
    let kind = parse_model_type(query.model_type.as_deref())?;
    ok(state.retraining.update_retraining_config(kind, &update)?)
}

#[derive(Debug, Serialize)]
struct Transition {
    changed: bool,
    is_running: bool,
}

async fn start_retraining(State(state): State<AppState>) -> ApiResult<Transition> {
    let changed = state.retraining.start()?;
    ok(Transition {
        changed,
        is_running: state.retraining.is_running(),
    })
}

async fn stop_retraining(State(state): State<AppState>) -> ApiResult<Transition> {
    let changed = state.retraining.stop().await?;
    ok(Transition {
        changed,
        is_running: state.retraining.is_running(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn get_retraining_metrics(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<serde_json::Value>> {
    let limit = query.limit.unwrap_or(20).min(MAX_BATCH_USERS);
    let scheduler = Arc::clone(&state.retraining);
    ok(blocking(move || Ok(scheduler.recent_metrics(limit)?)).await?)
}

fn updater_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_updater_status))
        .route("/trigger", post(trigger_update))
        .route("/config", put(put_updater_config))
}

async fn get_updater_status(
    State(state): State<AppState>,
) -> ApiResult<UpdaterStatus> {
    ok(state.updater.status()?)
}

async fn trigger_update(
    State(state): State<AppState>,
) -> ApiResult<UpdateReport> {
    let updater = Arc::clone(&state.updater);
    ok(blocking(move || Ok(updater.trigger_update())).await?)
}

async fn put_updater_config(
    State(state): State<AppState>,
    Json(update): Json<PredictionUpdaterConfigUpdate>,
) -> ApiResult<PredictionUpdaterConfig> {
    ok(state.updater.update_config(&update)?)
}
