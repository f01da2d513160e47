//! Service and scheduler configuration.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ModelKind;
use crate::observability::parse_bool;
use crate::schedule::{parse_timezone, Schedule, ScheduleError, ScheduleKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl ToString, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub model_dir: PathBuf,
    pub metrics_dir: PathBuf,
    pub timezone: Tz,
    pub start_schedulers: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            database_path: PathBuf::from("customer_analyzer.db"),
            model_dir: PathBuf::from("models"),
            metrics_dir: PathBuf::from("metrics"),
            timezone: Tz::UTC,
            start_schedulers: false,
        }
    }
}

impl ServiceConfig {
    /// Reads `CA_*` variables over the defaults. Unset or blank variables keep
    /// the default; malformed ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = non_empty_var("CA_BIND_ADDR") {
            config.bind_addr = raw
                .parse()
                .map_err(|e| ConfigError::invalid("CA_BIND_ADDR", &raw, e))?;
        }
        if let Some(raw) = non_empty_var("CA_DATABASE_PATH") {
            config.database_path = PathBuf::from(raw);
        }
        if let Some(raw) = non_empty_var("CA_MODEL_DIR") {
            config.model_dir = PathBuf::from(raw);
        }
        if let Some(raw) = non_empty_var("CA_METRICS_DIR") {
            config.metrics_dir = PathBuf::from(raw);
        }
        if let Some(raw) = non_empty_var("CA_TIMEZONE") {
            config.timezone = parse_timezone(&raw)?;
        }
        if let Some(raw) = non_empty_var("CA_START_SCHEDULERS") {
            config.start_schedulers = parse_bool(&raw).ok_or_else(|| {
                ConfigError::invalid("CA_START_SCHEDULERS", &raw, "expected a boolean")
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_dir == self.metrics_dir {
            return Err(ConfigError::invalid(
                "CA_METRICS_DIR",
                self.metrics_dir.display(),
                "must differ from CA_MODEL_DIR",
            ));
        }
        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrainingConfig {
    pub enabled: bool,
    pub schedule: ScheduleKind,
    /// `HH:MM` in the service timezone.
    pub time: String,
    pub day_of_week: String,
    pub day_of_month: u32,
    pub custom_interval_minutes: u32,
    pub min_users_for_retraining: usize,
    pub auto_optimize_params: bool,
    pub backup_previous_model: bool,
    /// Classifier jobs only: days of labelled samples per retrain.
    pub training_window_days: i64,
}

impl RetrainingConfig {
    pub fn for_kind(kind: ModelKind) -> Self {
        let base = Self {
            enabled: true,
            schedule: ScheduleKind::Daily,
            time: "02:00".to_string(),
            day_of_week: "sunday".to_string(),
            day_of_month: 1,
            custom_interval_minutes: 1440,
            min_users_for_retraining: 100,
            auto_optimize_params: true,
            backup_previous_model: true,
            training_window_days: 30,
        };
        match kind {
            ModelKind::Segmentation => base,
            ModelKind::PurchasePrediction => Self {
                enabled: false,
                schedule: ScheduleKind::Weekly,
                time: "03:00".to_string(),
                ..base
            },
            ModelKind::ChurnPrediction => Self {
                enabled: false,
                schedule: ScheduleKind::Weekly,
                time: "04:00".to_string(),
                ..base
            },
        }
    }

    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Ok(Schedule::from_parts(
            self.schedule,
            &self.time,
            &self.day_of_week,
            self.day_of_month,
            self.custom_interval_minutes,
        )?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule == ScheduleKind::Hourly {
            return Err(ConfigError::invalid(
                "schedule",
                self.schedule.as_str(),
                "retraining supports daily, weekly, monthly or custom",
            ));
        }
        self.schedule()?;
        if self.min_users_for_retraining == 0 {
            return Err(ConfigError::invalid(
                "min_users_for_retraining",
                self.min_users_for_retraining,
                "must be > 0",
            ));
        }
        if !(1..=365).contains(&self.training_window_days) {
            return Err(ConfigError::invalid(
                "training_window_days",
                self.training_window_days,
                "must be in 1..=365",
            ));
        }
        Ok(())
    }

    /// Merges `update` into a copy and validates the result.
    pub fn merged(&self, update: &RetrainingConfigUpdate) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = update.enabled {
            next.enabled = v;
        }
        if let Some(v) = update.schedule {
            next.schedule = v;
        }
        if let Some(v) = &update.time {
            next.time = v.clone();
        }
        if let Some(v) = &update.day_of_week {
            next.day_of_week = v.clone();
        }
        if let Some(v) = update.day_of_month {
            next.day_of_month = v;
        }
        if let Some(v) = update.custom_interval_minutes {
            next.custom_interval_minutes = v;
        }
        if let Some(v) = update.min_users_for_retraining {
            next.min_users_for_retraining = v;
        }
        if let Some(v) = update.auto_optimize_params {
            next.auto_optimize_params = v;
        }
        if let Some(v) = update.backup_previous_model {
            next.backup_previous_model = v;
        }
        if let Some(v) = update.training_window_days {
            next.training_window_days = v;
        }
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrainingConfigUpdate {
    pub enabled: Option<bool>,
    pub schedule: Option<ScheduleKind>,
    pub time: Option<String>,
    pub day_of_week: Option<String>,
    pub day_of_month: Option<u32>,
    pub custom_interval_minutes: Option<u32>,
    pub min_users_for_retraining: Option<usize>,
    pub auto_optimize_params: Option<bool>,
    pub backup_previous_model: Option<bool>,
    pub training_window_days: Option<i64>,
}

/// One retraining config per model kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrainingConfigs {
    pub segmentation: RetrainingConfig,
    pub purchase_prediction: RetrainingConfig,
    pub churn_prediction: RetrainingConfig,
}

impl Default for RetrainingConfigs {
    fn default() -> Self {
        Self {
            segmentation: RetrainingConfig::for_kind(ModelKind::Segmentation),
            purchase_prediction: RetrainingConfig::for_kind(ModelKind::PurchasePrediction),
            churn_prediction: RetrainingConfig::for_kind(ModelKind::ChurnPrediction),
        }
    }
}

impl RetrainingConfigs {
    pub fn get(&self, kind: ModelKind) -> &RetrainingConfig {
        match kind {
            ModelKind::Segmentation => &self.segmentation,
            ModelKind::PurchasePrediction => &self.purchase_prediction,
            ModelKind::ChurnPrediction => &self.churn_prediction,
        }
    }

    pub fn get_mut(&mut self, kind: ModelKind) -> &mut RetrainingConfig {
        match kind {
            ModelKind::Segmentation => &mut self.segmentation,
            ModelKind::PurchasePrediction => &mut self.purchase_prediction,
            ModelKind::ChurnPrediction => &mut self.churn_prediction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionUpdaterConfig {
    pub enabled: bool,
    pub schedule: ScheduleKind,
    pub time: String,
    pub day_of_week: String,
    pub batch_size: usize,
    pub update_threshold_days: i64,
    pub max_users_per_update: usize,
    pub active_window_days: i64,
}

impl Default for PredictionUpdaterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: ScheduleKind::Daily,
            time: "03:00".to_string(),
            day_of_week: "monday".to_string(),
            batch_size: 1000,
            update_threshold_days: 1,
            max_users_per_update: 10_000,
            active_window_days: 30,
        }
    }
}

impl PredictionUpdaterConfig {
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Ok(Schedule::from_parts(
            self.schedule,
            &self.time,
            &self.day_of_week,
            1,
            60,
        )?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.schedule,
            ScheduleKind::Hourly | ScheduleKind::Daily | ScheduleKind::Weekly
        ) {
            return Err(ConfigError::invalid(
                "schedule",
                self.schedule.as_str(),
                "prediction updates support hourly, daily or weekly",
            ));
        }
        self.schedule()?;
        if self.batch_size == 0 || self.max_users_per_update == 0 {
            return Err(ConfigError::invalid(
                "batch_size",
                self.batch_size,
                "batch_size and max_users_per_update must be > 0",
            ));
        }
        if self.update_threshold_days < 0 || self.active_window_days <= 0 {
            return Err(ConfigError::invalid(
                "update_threshold_days",
                self.update_threshold_days,
                "thresholds must be non-negative and the active window positive",
            ));
        }
        Ok(())
    }

    pub fn merged(&self, update: &PredictionUpdaterConfigUpdate) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = update.enabled {
            next.enabled = v;
        }
        if let Some(v) = update.schedule {
            next.schedule = v;
        }
        if let Some(v) = &update.time {
            next.time = v.clone();
        }
        if let Some(v) = &update.day_of_week {
            next.day_of_week = v.clone();
        }
        if let Some(v) = update.batch_size {
            next.batch_size = v;
        }
        if let Some(v) = update.update_threshold_days {
            next.update_threshold_days = v;
        }
        if let Some(v) = update.max_users_per_update {
            next.max_users_per_update = v;
        }
        if let Some(v) = update.active_window_days {
            next.active_window_days = v;
        }
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictionUpdaterConfigUpdate {
    pub enabled: Option<bool>,
    pub schedule: Option<ScheduleKind>,
    pub time: Option<String>,
    pub day_of_week: Option<String>,
    pub batch_size: Option<usize>,
    pub update_threshold_days: Option<i64>,
    pub max_users_per_update: Option<usize>,
    pub active_window_days: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();
        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        let output = f();
        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        output
    }

    const SERVICE_VARS: [&str; 6] = [
        "CA_BIND_ADDR",
        "CA_DATABASE_PATH",
        "CA_MODEL_DIR",
        "CA_METRICS_DIR",
        "CA_TIMEZONE",
        "CA_START_SCHEDULERS",
    ];

    #[test]
    fn service_defaults_when_env_missing() {
        let unset: Vec<(&str, Option<&str>)> = SERVICE_VARS.iter().map(|k| (*k, None)).collect();
        let cfg = with_env_vars(&unset, ServiceConfig::from_env).expect("defaults are valid");
        assert_eq!(cfg, ServiceConfig::default());
    }

    #[test]
    fn service_reads_overrides() {
        let cfg = with_env_vars(
            &[
                ("CA_BIND_ADDR", Some("0.0.0.0:9100")),
                ("CA_DATABASE_PATH", Some("/tmp/ca.db")),
                ("CA_MODEL_DIR", Some("/tmp/models")),
                ("CA_METRICS_DIR", Some("/tmp/metrics")),
                ("CA_TIMEZONE", Some("Europe/Moscow")),
                ("CA_START_SCHEDULERS", Some("yes")),
            ],
            ServiceConfig::from_env,
        )
        .expect("overrides are valid");
        assert_eq!(cfg.bind_addr.port(), 9100);
        assert_eq!(cfg.timezone, chrono_tz::Europe::Moscow);
        assert!(cfg.start_schedulers);
    }

    #[test]
    fn service_rejects_malformed_values() {
        let err = with_env_vars(
            &[
                ("CA_BIND_ADDR", Some("not-an-addr")),
                ("CA_TIMEZONE", None),
                ("CA_START_SCHEDULERS", None),
            ],
            ServiceConfig::from_env,
        )
        .expect_err("bad address");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CA_BIND_ADDR",
                ..
            }
        ));

        let err = with_env_vars(
            &[("CA_BIND_ADDR", None), ("CA_TIMEZONE", Some("Mars/Olympus"))],
            ServiceConfig::from_env,
        )
        .expect_err("bad timezone");
        assert!(matches!(
            err,
            ConfigError::Schedule(ScheduleError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn retraining_defaults_per_kind() {
        let configs = RetrainingConfigs::default();
        assert!(configs.segmentation.enabled);
        assert_eq!(configs.segmentation.schedule, ScheduleKind::Daily);
        assert!(!configs.get(ModelKind::ChurnPrediction).enabled);
        assert_eq!(configs.get(ModelKind::ChurnPrediction).time, "04:00");
        for kind in ModelKind::ALL {
            configs.get(kind).validate().expect("defaults validate");
        }
    }

    #[test]
    fn merge_applies_only_given_fields_and_validates() {
        let base = RetrainingConfig::for_kind(ModelKind::Segmentation);
        let merged = base
            .merged(&RetrainingConfigUpdate {
                schedule: Some(ScheduleKind::Weekly),
                day_of_week: Some("1".to_string()),
                ..RetrainingConfigUpdate::default()
            })
            .expect("valid update");
        assert_eq!(merged.schedule, ScheduleKind::Weekly);
        assert_eq!(merged.time, base.time);
        assert!(matches!(merged.schedule(), Ok(Schedule::Weekly { .. })));

        let err = base
            .merged(&RetrainingConfigUpdate {
                time: Some("7pm".to_string()),
                ..RetrainingConfigUpdate::default()
            })
            .expect_err("bad time");
        assert!(matches!(err, ConfigError::Schedule(_)));
    }

    #[test]
    fn updater_rejects_monthly_and_zero_batches() {
        let base = PredictionUpdaterConfig::default();
        base.validate().expect("defaults validate");
        assert!(base
            .merged(&PredictionUpdaterConfigUpdate {
                schedule: Some(ScheduleKind::Monthly),
                ..PredictionUpdaterConfigUpdate::default()
            })
            .is_err());
        assert!(base
            .merged(&PredictionUpdaterConfigUpdate {
                batch_size: Some(0),
                ..PredictionUpdaterConfigUpdate::default()
            })
            .is_err());
    }
}
