use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use customer_analyzer::{
    api_router, log_app_bind, log_app_shutdown, log_app_start, log_scheduler_state, AppState,
    ArtifactStore, EventStore, ExtractorSet, LoggingConfig, MetricsLog, MetricsStore, ModelKind,
    ModelSet, PredictionJobs, PredictionUpdater, PredictionUpdaterConfig, RetrainingConfigs,
    RetrainingJobs, RetrainingScheduler, SchedulerState, SqliteStore,
};
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

struct Fixture {
    _dir: tempfile::TempDir,
    models: ModelSet,
    retraining: Arc<RetrainingScheduler>,
    state: AppState,
}

/// An empty store: every model is untrained and every retrain is skipped.
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store should open"));
    store.init_schema().expect("schema should apply");
    let events: Arc<dyn EventStore> = store.clone();
    let predictions: Arc<dyn MetricsStore> = store;

    let artifacts = ArtifactStore::new(dir.path().join("models"));
    let models = ModelSet::new(&artifacts);
    let extractors = ExtractorSet::new(events);
    let metrics = MetricsLog::new(dir.path().join("metrics"));
    let updater = Arc::new(PredictionUpdater::new(PredictionJobs::new(
        Arc::clone(&models.purchase),
        Arc::clone(&extractors.purchase),
        predictions,
        metrics.clone(),
        Tz::UTC,
        PredictionUpdaterConfig::default(),
    )));
    let retraining = Arc::new(RetrainingScheduler::new(RetrainingJobs::new(
        models.clone(),
        extractors.clone(),
        artifacts,
        metrics,
        Tz::UTC,
        RetrainingConfigs::default(),
    )));
    let state = AppState {
        models: models.clone(),
        extractors,
        retraining: Arc::clone(&retraining),
        updater,
    };
    Fixture {
        _dir: dir,
        models,
        retraining,
        state,
    }
}

#[test]
fn server_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start(&cfg);
        log_app_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));
        log_scheduler_state(
            "retraining",
            SchedulerState::Started,
            Some(Utc.with_ymd_and_hms(2025, 5, 1, 2, 0, 0).unwrap()),
        );
        log_scheduler_state("retraining", SchedulerState::AlreadyRunning, None);
        log_app_shutdown("ctrl_c");
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
    assert!(logs.contains("\"log_format\":\"pretty\""));
    assert!(logs.contains("\"event\":\"app.shutdown\""));
    assert!(logs.contains("\"event\":\"scheduler.state\""));
    assert!(logs.contains("\"state\":\"started\""));
    assert!(logs.contains("\"state\":\"already_running\""));
    assert!(logs.contains("\"next_run\":\"2025-05-01T02:00:00+00:00\""));
}

#[test]
fn startup_load_reports_models_that_need_training() {
    let fx = fixture();
    let logs = capture_logs(Level::INFO, || {
        let loaded = fx.models.load_persisted().expect("missing artifacts are not fatal");
        assert!(loaded.is_empty());
    });

    assert_eq!(logs.matches("\"event\":\"model.needs_training\"").count(), 3);
}

#[test]
fn skipped_retrain_logs_start_and_skip() {
    let fx = fixture();
    let logs = capture_logs(Level::INFO, || {
        let report = fx.retraining.trigger_retraining(ModelKind::Segmentation);
        assert!(!report.is_completed());
    });

    assert!(logs.contains("\"event\":\"retraining.job.start\""));
    assert!(logs.contains("\"event\":\"retraining.job.skipped\""));
    assert!(logs.contains("\"model\":\"segmentation\""));
}

#[test]
fn train_route_emits_http_train_event() {
    let fx = fixture();
    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let app = api_router(fx.state.clone());
            let response = app
                .oneshot(
                    Request::builder()
                        .method(Method::POST)
                        .uri("/api/segmentation/train?n_clusters=4")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("train request should complete");

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        });
    });

    assert!(logs.contains("\"event\":\"http.train.request\""));
    assert!(logs.contains("\"n_clusters\":4"));
}
