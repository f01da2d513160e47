//! Customer analytics ML services.
//!
//! - feature extraction from user and event history with time-windowed
//!   aggregates
//! - segmentation, purchase and churn models behind one `ModelWrapper` trait
//! - retraining and prediction-refresh schedulers
//! - the axum HTTP surface served by the `ml_server` binary

mod api;
mod artifact;
mod churn_features;
mod classifier;
mod config;
mod evaluation;
mod events;
mod features;
mod forest;
mod metrics_log;
mod model;
mod observability;
mod prediction_updater;
mod purchase_features;
mod retraining;
mod scaler;
mod schedule;
mod segmentation;
mod services;
mod store;
mod table;
mod user_features;
mod window;
mod worker;

pub use api::{api_router, ApiError, AppState, BatchPredictRequest, Envelope, MAX_BATCH_USERS};
pub use artifact::ArtifactStore;
pub use churn_features::{ChurnFeatureExtractor, ChurnPredictionFeatures};
pub use classifier::{
    key_factors, ChurnPredictionModel, ChurnProfile, ClassifierEvaluation, ClassifierModel,
    ClassifierPrediction, ClassifierProfile, Confidence, Direction, FeatureImportance,
    FittedClassifier, KeyFactor, PurchasePredictionModel, PurchaseProfile, KEY_FACTOR_MIN_Z,
    MAX_KEY_FACTORS, MIN_TRAINING_ROWS,
};
pub use config::{
    ConfigError, PredictionUpdaterConfig, PredictionUpdaterConfigUpdate, RetrainingConfig,
    RetrainingConfigUpdate, RetrainingConfigs, ServiceConfig,
};
pub use evaluation::{
    auc_roc, calinski_harabasz_score, classification_metrics, sampled_silhouette_score,
    silhouette_score, stratified_split, ClassificationMetrics, Split, SILHOUETTE_SAMPLE_SIZE,
};
pub use events::{Event, EventType, PurchaseAmount, User};
pub use features::{
    FeatureError, FeatureExtractor, LabelledExtractor, TrainingSample, UserHistory,
    PREDICTION_HORIZON_DAYS,
};
pub use forest::{ClassifierAlgorithm, ForestClassifier, ForestError, ForestParams};
pub use metrics_log::{MetricsLog, PREDICTION_UPDATE, RETRAINING_METRICS};
pub use model::{
    dedupe_user_ids, model_version, predict_user, predict_users, BatchPrediction, ModelError,
    ModelInfo, ModelKind, ModelSlot, ModelWrapper, Optimization, OptimizationSummary, Trial,
};
pub use observability::{
    init_logging, log_app_bind, log_app_shutdown, log_app_start, log_scheduler_state,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError, SchedulerState,
};
pub use prediction_updater::{
    PredictionJobs, PredictionUpdater, UpdateOutcome, UpdateReport, UpdaterStatus,
};
pub use purchase_features::{PurchaseFeatureExtractor, PurchasePredictionFeatures};
pub use retraining::{
    ModelStatus, RetrainOutcome, RetrainReport, RetrainTrigger, RetrainingJobs,
    RetrainingScheduler, RetrainingStatus,
};
pub use scaler::StandardScaler;
pub use schedule::{
    parse_time, parse_timezone, parse_weekday, Schedule, ScheduleError, ScheduleKind,
};
pub use segmentation::{
    segment_description, segment_distribution, segment_name, FittedSegmentation,
    SegmentAssignment, SegmentProfile, SegmentShare, SegmentationAlgorithm,
    SegmentationEvaluation, SegmentationModel, SegmentationParams, MAX_CLUSTERS, MIN_CLUSTERS,
};
pub use services::{ExtractorSet, ModelSet};
pub use store::{
    EventStore, MetricsStore, PredictionRecord, PredictionStats, SqliteStore, StoreError,
};
pub use table::{
    assert_schema_compatible, build_feature_schema, Cell, FeatureColumn, FeatureDType,
    FeatureRecord, FeatureSchema, FeatureSet, FeatureTable, MlFrame, SchemaMismatch, TableError,
    FEATURE_SCHEMA_VERSION, LANGUAGE_VOCABULARY, RECENCY_CAP_DAYS, RECENCY_SENTINEL_DAYS,
};
pub use user_features::{UserFeatureExtractor, UserFeatures};
pub use worker::{plan, JobSource, ScheduledWorker, SchedulerError};
