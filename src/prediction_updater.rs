//! Periodic refresh of cached purchase probabilities.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::classifier::PurchasePredictionModel;
use crate::config::{PredictionUpdaterConfig, PredictionUpdaterConfigUpdate};
use crate::metrics_log::{MetricsLog, PREDICTION_UPDATE};
use crate::model::{predict_users, ModelWrapper};
use crate::purchase_features::PurchaseFeatureExtractor;
use crate::schedule::Schedule;
use crate::store::{MetricsStore, PredictionRecord, PredictionStats};
use crate::worker::{JobSource, ScheduledWorker, SchedulerError};

const COMPONENT: &str = "prediction_updater";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Completed {
        model_version: String,
        users_selected: usize,
        users_updated: usize,
        users_skipped: usize,
        failed_batches: usize,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: UpdateOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdaterStatus {
    pub is_running: bool,
    pub next_update: Option<DateTime<Utc>>,
    pub model_loaded: bool,
    pub config: PredictionUpdaterConfig,
    pub last_update: Option<UpdateReport>,
}

pub struct PredictionJobs {
    model: Arc<PurchasePredictionModel>,
    extractor: Arc<PurchaseFeatureExtractor>,
    store: Arc<dyn MetricsStore>,
    metrics: MetricsLog,
    timezone: Tz,
    config: RwLock<PredictionUpdaterConfig>,
    last_update: Mutex<Option<UpdateReport>>,
    job_lock: Mutex<()>,
}

impl PredictionJobs {
    pub fn new(
        model: Arc<PurchasePredictionModel>,
        extractor: Arc<PurchaseFeatureExtractor>,
        store: Arc<dyn MetricsStore>,
        metrics: MetricsLog,
        timezone: Tz,
        config: PredictionUpdaterConfig,
    ) -> Self {
        Self {
            model,
            extractor,
            store,
            metrics,
            timezone,
            config: RwLock::new(config),
            last_update: Mutex::new(None),
            job_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> Result<PredictionUpdaterConfig, SchedulerError> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| SchedulerError::LockPoisoned)
    }

    pub fn update_config(
        &self,
        update: &PredictionUpdaterConfigUpdate,
    ) -> Result<PredictionUpdaterConfig, SchedulerError> {
        let mut config = self
            .config
            .write()
            .map_err(|_| SchedulerError::LockPoisoned)?;
        let next = config.merged(update)?;
        *config = next.clone();
        info!(
            component = COMPONENT,
            event = "prediction_update.config.updated",
            enabled = next.enabled,
            schedule = next.schedule.as_str(),
            batch_size = next.batch_size
        );
        Ok(next)
    }

    pub fn last_update(&self) -> Option<UpdateReport> {
        self.last_update.lock().ok().and_then(|r| r.clone())
    }

    /// One full update pass. Batch failures are logged and counted; the pass
    /// continues with the next batch.
    pub fn update(&self) -> UpdateReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = match self.job_lock.lock() {
            Ok(_guard) => self.run_locked(started_at),
            Err(_) => UpdateOutcome::Failed {
                error: SchedulerError::LockPoisoned.to_string(),
            },
        };
        let report = UpdateReport {
            started_at,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome,
        };

        match &report.outcome {
            UpdateOutcome::Completed {
                users_updated,
                users_selected,
                failed_batches,
                ..
            } => info!(
                component = COMPONENT,
                event = "prediction_update.finish",
                users_selected,
                users_updated,
                failed_batches,
                duration_ms = report.duration_ms
            ),
            UpdateOutcome::Skipped { reason } => warn!(
                component = COMPONENT,
                event = "prediction_update.skipped",
                reason = %reason
            ),
            UpdateOutcome::Failed { error } => error!(
                component = COMPONENT,
                event = "prediction_update.failed",
                error = %error
            ),
        }
        if let Err(err) = self.metrics.append(PREDICTION_UPDATE, &report) {
            warn!(
                component = COMPONENT,
                event = "prediction_update.metrics.write_failed",
                error = %err
            );
        }
        if let Ok(mut last) = self.last_update.lock() {
            *last = Some(report.clone());
        }
        report
    }

    fn run_locked(&self, now: DateTime<Utc>) -> UpdateOutcome {
        let config = match self.config() {
            Ok(config) => config,
            Err(err) => {
                return UpdateOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };

        if !self.model.is_trained() {
            match self.model.load_model() {
                Ok(()) => {}
                Err(err) if err.needs_training() => {
                    return UpdateOutcome::Skipped {
                        reason: format!("purchase model needs training: {err}"),
                    }
                }
                Err(err) => {
                    return UpdateOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            }
        }
        let model_version = self.model.info().map(|i| i.version).unwrap_or_default();

        let stale_before = now - Duration::days(config.update_threshold_days);
        let active_since = now - Duration::days(config.active_window_days);
        let user_ids = match self.store.users_needing_prediction_update(
            stale_before,
            active_since,
            config.max_users_per_update,
        ) {
            Ok(ids) => ids,
            Err(err) => {
                return UpdateOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };
        info!(
            component = COMPONENT,
            event = "prediction_update.start",
            users = user_ids.len(),
            batch_size = config.batch_size
        );

        let mut users_updated = 0;
        let mut users_skipped = 0;
        let mut failed_batches = 0;
        for (batch, chunk) in user_ids.chunks(config.batch_size).enumerate() {
            match self.update_batch(chunk, now) {
                Ok((updated, skipped)) => {
                    users_updated += updated;
                    users_skipped += skipped;
                }
                Err(err) => {
                    failed_batches += 1;
                    users_skipped += chunk.len();
                    error!(
                        component = COMPONENT,
                        event = "prediction_update.batch_failed",
                        batch,
                        users = chunk.len(),
                        error = %err
                    );
                }
            }
        }

        UpdateOutcome::Completed {
            model_version,
            users_selected: user_ids.len(),
            users_updated,
            users_skipped,
            failed_batches,
        }
    }

    fn update_batch(
        &self,
        user_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), SchedulerError> {
        let batch = predict_users(
            self.model.as_ref(),
            self.extractor.as_ref(),
            user_ids,
            Some(now),
        )?;
        let rows: Vec<PredictionRecord> = batch
            .predictions
            .iter()
            .map(|p| PredictionRecord {
                user_id: p.user_id,
                purchase_probability_30d: p.probability,
                updated_at: now,
            })
            .collect();
        let updated = self.store.upsert_purchase_probabilities(&rows)?;
        Ok((updated, batch.skipped.len()))
    }
}

impl JobSource for PredictionJobs {
    type Job = ();

    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }

    fn jobs(&self) -> Vec<((), Schedule)> {
        let config = match self.config() {
            Ok(config) if config.enabled => config,
            Ok(_) => return Vec::new(),
            Err(err) => {
                error!(
                    component = COMPONENT,
                    event = "prediction_update.config.poisoned",
                    error = %err
                );
                return Vec::new();
            }
        };
        match config.schedule() {
            Ok(schedule) => vec![((), schedule)],
            Err(err) => {
                warn!(
                    component = COMPONENT,
                    event = "prediction_update.schedule.invalid",
                    error = %err
                );
                Vec::new()
            }
        }
    }

    fn run(&self, _job: ()) {
        self.update();
    }
}

pub struct PredictionUpdater {
    jobs: Arc<PredictionJobs>,
    worker: ScheduledWorker<PredictionJobs>,
}

impl PredictionUpdater {
    pub fn new(jobs: PredictionJobs) -> Self {
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

    /// Runs an update pass now. Blocking.
    pub fn trigger_update(&self) -> UpdateReport {
        self.jobs.update()
    }

    pub fn update_config(
        &self,
        update: &PredictionUpdaterConfigUpdate,
    ) -> Result<PredictionUpdaterConfig, SchedulerError> {
        let next = self.jobs.update_config(update)?;
        self.worker.reschedule();
        Ok(next)
    }

    pub fn status(&self) -> Result<UpdaterStatus, SchedulerError> {
        Ok(UpdaterStatus {
            is_running: self.worker.is_running(),
            next_update: self.worker.next_run(),
            model_loaded: self.jobs.model.is_trained(),
            config: self.jobs.config()?,
            last_update: self.jobs.last_update(),
        })
    }

    pub fn get_prediction_stats(&self) -> Result<PredictionStats, SchedulerError> {
        Ok(self.jobs.store.prediction_stats()?)
    }
}
