//! Periodic model retraining.
//!
//! Every enabled model kind is a job on a [`ScheduledWorker`]. A run extracts
//! fresh training data, checks it covers enough users, optionally backs up the
//! current artifact, optimizes or fits with defaults, persists the candidate
//! and only then publishes it. A run that fails after writing its candidate
//! puts back the backup it took; earlier failures leave everything in place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::artifact::ArtifactStore;
use crate::config::{RetrainingConfig, RetrainingConfigUpdate, RetrainingConfigs};
use crate::features::{FeatureExtractor, LabelledExtractor, PREDICTION_HORIZON_DAYS};
use crate::forest::ClassifierAlgorithm;
use crate::metrics_log::{MetricsLog, RETRAINING_METRICS};
use crate::model::{ModelError, ModelKind, ModelWrapper};
use crate::schedule::Schedule;
use crate::segmentation::SegmentationAlgorithm;
use crate::services::{ExtractorSet, ModelSet};
use crate::table::{FeatureTable, MlFrame};
use crate::worker::{plan, JobSource, ScheduledWorker, SchedulerError};

const COMPONENT: &str = "retraining";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrainOutcome {
    Completed {
        model_version: String,
        evaluation: Value,
    },
    Skipped {
        required: usize,
        available: usize,
    },
    Failed {
        error: String,
        restored_backup: bool,
    },
}

/// One line of the retraining metrics log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrainReport {
    pub model_type: ModelKind,
    pub trigger: RetrainTrigger,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: RetrainOutcome,
}

impl RetrainReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RetrainOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub model_type: ModelKind,
    pub loaded: bool,
    pub version: Option<String>,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrainingStatus {
    pub is_running: bool,
    pub next_retraining: Option<DateTime<Utc>>,
    pub config: RetrainingConfigs,
    pub model_status: Vec<ModelStatus>,
}

/// The retraining job bodies plus the live config they read.
pub struct RetrainingJobs {
    models: ModelSet,
    extractors: ExtractorSet,
    artifacts: ArtifactStore,
    metrics: MetricsLog,
    timezone: Tz,
    configs: RwLock<RetrainingConfigs>,
    job_lock: Mutex<()>,
}

enum RunError {
    Skipped {
        required: usize,
        available: usize,
    },
    /// Nothing on disk or in memory changed.
    Failed(ModelError),
    /// The candidate artifact was written but never published.
    Unpublished {
        error: ModelError,
        backup: Option<PathBuf>,
    },
}

impl From<ModelError> for RunError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InsufficientData { required, actual } => Self::Skipped {
                required,
                available: actual,
            },
            other => Self::Failed(other),
        }
    }
}

impl RetrainingJobs {
    pub fn new(
        models: ModelSet,
        extractors: ExtractorSet,
        artifacts: ArtifactStore,
        metrics: MetricsLog,
        timezone: Tz,
        configs: RetrainingConfigs,
    ) -> Self {
        Self {
            models,
            extractors,
            artifacts,
            metrics,
            timezone,
            configs: RwLock::new(configs),
            job_lock: Mutex::new(()),
        }
    }

    pub fn configs(&self) -> Result<RetrainingConfigs, SchedulerError> {
        self.configs
            .read()
            .map(|c| c.clone())
            .map_err(|_| SchedulerError::LockPoisoned)
    }

    fn config(&self, kind: ModelKind) -> Result<RetrainingConfig, SchedulerError> {
        self.configs
            .read()
            .map(|c| c.get(kind).clone())
            .map_err(|_| SchedulerError::LockPoisoned)
    }

    /// Merges `update` into the config for `kind`. The live config is left
    /// untouched when the merged result does not validate.
    pub fn update_config(
        &self,
        kind: ModelKind,
        update: &RetrainingConfigUpdate,
    ) -> Result<RetrainingConfig, SchedulerError> {
        let mut configs = self
            .configs
            .write()
            .map_err(|_| SchedulerError::LockPoisoned)?;
        let next = configs.get(kind).merged(update)?;
        *configs.get_mut(kind) = next.clone();
        info!(
            component = COMPONENT,
            event = "retraining.config.updated",
            model = kind.as_str(),
            enabled = next.enabled,
            schedule = next.schedule.as_str()
        );
        Ok(next)
    }

    /// Runs `f` while holding the job lock, so it never overlaps a retrain.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> Result<R, SchedulerError> {
        let _guard = self
            .job_lock
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned)?;
        Ok(f())
    }

    /// Runs one retraining job to completion and appends its report to the
    /// metrics log. Concurrent calls run one after the other.
    pub fn retrain(&self, kind: ModelKind, trigger: RetrainTrigger) -> RetrainReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            component = COMPONENT,
            event = "retraining.job.start",
            model = kind.as_str(),
            trigger = ?trigger
        );

        let outcome = match self.job_lock.lock() {
            Ok(_guard) => self.run_locked(kind),
            Err(_) => RetrainOutcome::Failed {
                error: SchedulerError::LockPoisoned.to_string(),
                restored_backup: false,
            },
        };

        let report = RetrainReport {
            model_type: kind,
            trigger,
            started_at,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome,
        };
        match &report.outcome {
            RetrainOutcome::Completed { model_version, .. } => info!(
                component = COMPONENT,
                event = "retraining.job.finish",
                model = kind.as_str(),
                model_version = %model_version,
                duration_ms = report.duration_ms
            ),
            RetrainOutcome::Skipped {
                required,
                available,
            } => warn!(
                component = COMPONENT,
                event = "retraining.job.skipped",
                model = kind.as_str(),
                required,
                available
            ),
            RetrainOutcome::Failed {
                error,
                restored_backup,
            } => error!(
                component = COMPONENT,
                event = "retraining.job.failed",
                model = kind.as_str(),
                error = %error,
                restored_backup
            ),
        }
        if let Err(err) = self.metrics.append(RETRAINING_METRICS, &report) {
            warn!(
                component = COMPONENT,
                event = "retraining.metrics.write_failed",
                error = %err
            );
        }
        report
    }

    fn run_locked(&self, kind: ModelKind) -> RetrainOutcome {
        let config = match self.config(kind) {
            Ok(config) => config,
            Err(err) => {
                return RetrainOutcome::Failed {
                    error: err.to_string(),
                    restored_backup: false,
                }
            }
        };

        let result = match kind {
            ModelKind::Segmentation => self.retrain_segmentation(&config),
            ModelKind::PurchasePrediction => self.retrain_classifier(
                self.models.purchase.as_ref(),
                self.extractors.purchase.as_ref(),
                &config,
            ),
            ModelKind::ChurnPrediction => self.retrain_classifier(
                self.models.churn.as_ref(),
                self.extractors.churn.as_ref(),
                &config,
            ),
        };

        match result {
            Ok((model_version, evaluation)) => RetrainOutcome::Completed {
                model_version,
                evaluation,
            },
            Err(RunError::Skipped {
                required,
                available,
            }) => RetrainOutcome::Skipped {
                required,
                available,
            },
            Err(RunError::Failed(err)) => RetrainOutcome::Failed {
                error: err.to_string(),
                restored_backup: false,
            },
            Err(RunError::Unpublished { error, backup }) => {
                let restored_backup = backup.is_some_and(|path| self.restore(kind, &path));
                RetrainOutcome::Failed {
                    error: error.to_string(),
                    restored_backup,
                }
            }
        }
    }

    fn retrain_segmentation(&self, config: &RetrainingConfig) -> Result<(String, Value), RunError> {
        let records = self
            .extractors
            .user
            .extract_all(None, None)
            .map_err(ModelError::from)?;
        let frame = FeatureTable::from_records(&records)
            .to_ml_ready()
            .map_err(ModelError::from)?;
        require_users(&frame, config.min_users_for_retraining)?;
        self.fit_and_publish(
            self.models.segmentation.as_ref(),
            &frame,
            config,
            SegmentationAlgorithm::KmeansPlusPlus,
        )
    }

    /// Labels need a full horizon after each sample, so the window ends one
    /// horizon before now.
    fn retrain_classifier<M, E>(
        &self,
        model: &M,
        extractor: &E,
        config: &RetrainingConfig,
    ) -> Result<(String, Value), RunError>
    where
        M: ModelWrapper<Algorithm = ClassifierAlgorithm>,
        E: LabelledExtractor,
    {
        let end = Utc::now() - Duration::days(PREDICTION_HORIZON_DAYS);
        let start = end - Duration::days(config.training_window_days);
        let samples = extractor
            .extract_training_data(start, end, None)
            .map_err(ModelError::from)?;
        let frame = FeatureTable::from_samples(&samples)
            .to_ml_ready()
            .map_err(ModelError::from)?;
        require_users(&frame, config.min_users_for_retraining)?;
        self.fit_and_publish(model, &frame, config, ClassifierAlgorithm::RandomForest)
    }

    fn fit_and_publish<M: ModelWrapper>(
        &self,
        model: &M,
        frame: &MlFrame,
        config: &RetrainingConfig,
        algorithm: M::Algorithm,
    ) -> Result<(String, Value), RunError> {
        let kind = model.kind();
        let backup = if config.backup_previous_model {
            self.artifacts.backup(kind, Utc::now())?
        } else {
            None
        };

        let fitted = if config.auto_optimize_params {
            let optimization = model.optimize_hyperparameters(frame, algorithm)?;
            info!(
                component = COMPONENT,
                event = "retraining.optimized",
                model = kind.as_str(),
                best_score = optimization.best_score,
                trials = optimization.trials.len()
            );
            optimization.best_model
        } else {
            model.fit(frame, &M::Params::default())?.0
        };

        let evaluation = serde_json::to_value(model.evaluation_of(&fitted)).unwrap_or_default();
        // the save is an atomic rename, so a failed save leaves the old artifact
        model.save_fitted(&fitted)?;
        if let Err(error) = model.publish(Arc::new(fitted)) {
            return Err(RunError::Unpublished { error, backup });
        }

        let version = model.info().map(|i| i.version).unwrap_or_default();
        Ok((version, evaluation))
    }

    /// Best effort: puts `backup` back and reloads it.
    fn restore(&self, kind: ModelKind, backup: &Path) -> bool {
        if let Err(err) = self.artifacts.restore_backup(kind, backup) {
            error!(
                component = COMPONENT,
                event = "retraining.restore.failed",
                model = kind.as_str(),
                error = %err
            );
            return false;
        }
        match self.models.load(kind) {
            Ok(()) => {
                info!(
                    component = COMPONENT,
                    event = "retraining.restore.ok",
                    model = kind.as_str(),
                    backup = %backup.display()
                );
                true
            }
            Err(err) => {
                error!(
                    component = COMPONENT,
                    event = "retraining.restore.load_failed",
                    model = kind.as_str(),
                    error = %err
                );
                false
            }
        }
    }
}

fn require_users(frame: &MlFrame, required: usize) -> Result<(), RunError> {
    let available = frame.user_ids.iter().collect::<HashSet<_>>().len();
    if available < required {
        return Err(RunError::Skipped {
            required,
            available,
        });
    }
    Ok(())
}

impl JobSource for RetrainingJobs {
    type Job = ModelKind;

    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }

    fn jobs(&self) -> Vec<(ModelKind, Schedule)> {
        let Ok(configs) = self.configs() else {
            error!(
                component = COMPONENT,
                event = "retraining.config.poisoned"
            );
            return Vec::new();
        };
        ModelKind::ALL
            .into_iter()
            .filter(|kind| configs.get(*kind).enabled)
            .filter_map(|kind| match configs.get(kind).schedule() {
                Ok(schedule) => Some((kind, schedule)),
                Err(err) => {
                    warn!(
                        component = COMPONENT,
                        event = "retraining.schedule.invalid",
                        model = kind.as_str(),
                        error = %err
                    );
                    None
                }
            })
            .collect()
    }

    fn run(&self, job: ModelKind) {
        self.retrain(job, RetrainTrigger::Scheduled);
    }
}

pub struct RetrainingScheduler {
    jobs: Arc<RetrainingJobs>,
    worker: ScheduledWorker<RetrainingJobs>,
}

impl RetrainingScheduler {
    pub fn new(jobs: RetrainingJobs) -> Self {
        let jobs = Arc::new(jobs);
        Self {
            worker: ScheduledWorker::new(Arc::clone(&jobs)),
            jobs,
        }
    }

    pub fn start(&self) -> Result<bool, SchedulerError> {
        self.worker.start()
    }

    pub async fn stop(&self) -> Result<bool, SchedulerError> {
        self.worker.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn active_loops(&self) -> usize {
        self.worker.active_loops()
    }

    /// Blocking; call from a blocking context.
    pub fn retrain_segmentation_model(&self) -> RetrainReport {
        self.trigger_retraining(ModelKind::Segmentation)
    }

    /// Runs the job for `kind` now, outside the schedule. Blocking.
    pub fn trigger_retraining(&self, kind: ModelKind) -> RetrainReport {
        self.jobs.retrain(kind, RetrainTrigger::Manual)
    }

    /// Blocking. Manual training goes through here so it is serialized with
    /// scheduled and triggered retrains.
    pub fn run_exclusive<R>(&self, f: impl FnOnce() -> R) -> Result<R, SchedulerError> {
        self.jobs.exclusive(f)
    }

    /// Merges the update and rebuilds the whole job plan.
    pub fn update_retraining_config(
        &self,
        kind: ModelKind,
        update: &RetrainingConfigUpdate,
    ) -> Result<RetrainingConfig, SchedulerError> {
        let next = self.jobs.update_config(kind, update)?;
        self.worker.reschedule();
        Ok(next)
    }

    pub fn retraining_configs(&self) -> Result<RetrainingConfigs, SchedulerError> {
        self.jobs.configs()
    }

    pub fn get_retraining_status(&self) -> Result<RetrainingStatus, SchedulerError> {
        let config = self.jobs.configs()?;
        let now = Utc::now();
        let upcoming = plan(self.jobs.as_ref(), now);
        let model_status = ModelKind::ALL
            .into_iter()
            .map(|kind| {
                let info = self.jobs.models.info(kind);
                ModelStatus {
                    model_type: kind,
                    loaded: info.is_some(),
                    version: info.map(|i| i.version),
                    enabled: config.get(kind).enabled,
                    next_run: upcoming.iter().find(|(k, _)| *k == kind).map(|(_, at)| *at),
                }
            })
            .collect();
        Ok(RetrainingStatus {
            is_running: self.worker.is_running(),
            next_retraining: upcoming.iter().map(|(_, at)| *at).min(),
            config,
            model_status,
        })
    }

    pub fn recent_metrics(&self, limit: usize) -> Result<Vec<Value>, SchedulerError> {
        Ok(self.jobs.metrics.recent(RETRAINING_METRICS, limit)?)
    }
}
