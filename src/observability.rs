//! Logging for the ml_server process.
//!
//! `CA_LOG_LEVEL` takes any `EnvFilter` directive string, `CA_LOG_FORMAT` is
//! `json` or `pretty` and `CA_LOG_TARGET` toggles the target field. Values
//! that do not parse keep the defaults. Every event carries a `component`
//! and a dotted `event` name; the helpers here emit the process lifecycle
//! ones.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const COMPONENT: &str = "ml_server";
const FALLBACK_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: FALLBACK_LEVEL.to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Builds the config from `lookup`, which maps a `CA_LOG_*` key to its
    /// raw value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            level: lookup("CA_LOG_LEVEL")
                .map(|raw| raw.trim().to_string())
                .filter(|level| !level.is_empty())
                .unwrap_or(defaults.level),
            format: lookup("CA_LOG_FORMAT")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.format),
            include_target: lookup("CA_LOG_TARGET")
                .and_then(|raw| parse_bool(&raw))
                .unwrap_or(defaults.include_target),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    LoggingConfig::from_lookup(|key| env::var(key).ok())
}

/// The filter for `level`, and whether it had to fall back to `info`.
fn level_filter(level: &str) -> (EnvFilter, bool) {
    match EnvFilter::try_new(level) {
        Ok(filter) => (filter, false),
        Err(_) => (EnvFilter::new(FALLBACK_LEVEL), true),
    }
}

/// Installs the global subscriber. An unparsable level is reported once the
/// subscriber is up.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let (env_filter, fell_back) = level_filter(&config.level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    if fell_back {
        warn!(
            component = COMPONENT,
            event = "logging.level.invalid",
            requested = %config.level,
            using = FALLBACK_LEVEL
        );
    }
    Ok(())
}

pub fn log_app_start(config: &LoggingConfig) {
    info!(
        component = COMPONENT,
        event = "app.start",
        log_level = %config.level,
        log_format = config.format.as_str(),
        include_target = config.include_target
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = COMPONENT,
        event = "app.bind",
        bind_addr = %bound_addr,
        health = "/health",
        api = "/api"
    );
}

/// The listener stopped accepting; schedulers are stopped next.
pub fn log_app_shutdown(signal: &str) {
    info!(component = COMPONENT, event = "app.shutdown", signal);
}

/// One line per scheduler state transition.
pub fn log_scheduler_state(scheduler: &str, state: SchedulerState, next_run: Option<DateTime<Utc>>) {
    if state == SchedulerState::AlreadyRunning {
        warn!(
            component = scheduler,
            event = "scheduler.state",
            state = state.as_str()
        );
        return;
    }
    match next_run {
        Some(next_run) => info!(
            component = scheduler,
            event = "scheduler.state",
            state = state.as_str(),
            next_run = %next_run.to_rfc3339()
        ),
        None => info!(
            component = scheduler,
            event = "scheduler.state",
            state = state.as_str()
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Started,
    AlreadyRunning,
    Stopped,
    Aborted,
    Rescheduled,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AlreadyRunning => "already_running",
            Self::Stopped => "stopped",
            Self::Aborted => "aborted",
            Self::Rescheduled => "rescheduled",
        }
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> LoggingConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        LoggingConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(config_from(&[]), LoggingConfig::default());
        assert_eq!(config_from(&[("CA_LOG_LEVEL", "   ")]).level, "info");
    }

    #[test]
    fn parses_json_and_level_and_target() {
        let cfg = config_from(&[
            ("CA_LOG_LEVEL", " debug,customer_analyzer=trace "),
            ("CA_LOG_FORMAT", "JSON"),
            ("CA_LOG_TARGET", "off"),
        ]);

        assert_eq!(cfg.level, "debug,customer_analyzer=trace");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn invalid_format_or_target_falls_back_to_defaults() {
        let cfg = config_from(&[
            ("CA_LOG_LEVEL", "trace"),
            ("CA_LOG_FORMAT", "yaml"),
            ("CA_LOG_TARGET", "maybe"),
        ]);

        assert_eq!(cfg.level, "trace");
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert!(cfg.include_target);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn unparsable_level_falls_back_to_info() {
        assert!(!level_filter("warn,customer_analyzer::retraining=debug").1);
        assert!(level_filter("customer_analyzer=verbose").1);
    }
}
