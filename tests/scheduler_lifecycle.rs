use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use customer_analyzer::{
    ArtifactStore, EventStore, ExtractorSet, MetricsLog, MetricsStore, ModelKind, ModelSet,
    PredictionJobs, PredictionUpdater, PredictionUpdaterConfig, RetrainingConfigUpdate,
    RetrainingConfigs, RetrainingJobs, RetrainingScheduler, ScheduleKind, SchedulerError,
    SqliteStore,
};

struct Services {
    retraining: RetrainingScheduler,
    updater: PredictionUpdater,
}

fn services(dir: &Path) -> Services {
    let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store should open"));
    store.init_schema().expect("schema should apply");
    let events: Arc<dyn EventStore> = store.clone();
    let predictions: Arc<dyn MetricsStore> = store;

    let artifacts = ArtifactStore::new(dir.join("models"));
    let models = ModelSet::new(&artifacts);
    let extractors = ExtractorSet::new(events);
    let metrics = MetricsLog::new(dir.join("metrics"));

    let updater = PredictionUpdater::new(PredictionJobs::new(
        Arc::clone(&models.purchase),
        Arc::clone(&extractors.purchase),
        predictions,
        metrics.clone(),
        Tz::UTC,
        PredictionUpdaterConfig::default(),
    ));
    let retraining = RetrainingScheduler::new(RetrainingJobs::new(
        models,
        extractors,
        artifacts,
        metrics,
        Tz::UTC,
        RetrainingConfigs::default(),
    ));
    Services {
        retraining,
        updater,
    }
}

#[tokio::test]
async fn starting_twice_keeps_a_single_loop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let svc = services(dir.path());

    assert!(svc.retraining.start().expect("first start"));
    assert!(!svc.retraining.start().expect("second start is a no-op"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(svc.retraining.active_loops(), 1);
    assert!(svc.retraining.is_running());

    assert!(svc.retraining.stop().await.expect("stop"));
    assert_eq!(svc.retraining.active_loops(), 0);
    assert!(!svc.retraining.is_running());
    assert!(!svc.retraining.stop().await.expect("second stop is a no-op"));
}

#[tokio::test]
async fn updater_can_restart_after_stop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let svc = services(dir.path());

    assert!(svc.updater.start().expect("start"));
    assert!(svc.updater.stop().await.expect("stop"));
    assert!(!svc.updater.is_running());

    assert!(svc.updater.start().expect("restart"));
    assert!(svc.updater.is_running());
    assert!(svc.updater.stop().await.expect("stop again"));
}

#[tokio::test]
async fn config_updates_reshape_the_plan_while_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let svc = services(dir.path());
    svc.retraining.start().expect("start");

    let before = svc.retraining.get_retraining_status().expect("status");
    assert!(before.is_running);
    assert!(before.next_retraining.is_some());

    for kind in ModelKind::ALL {
        let disable = RetrainingConfigUpdate {
            enabled: Some(false),
            ..Default::default()
        };
        svc.retraining
            .update_retraining_config(kind, &disable)
            .expect("disable");
    }
    let after = svc.retraining.get_retraining_status().expect("status");
    assert_eq!(after.next_retraining, None);
    assert!(after.model_status.iter().all(|m| !m.enabled && m.next_run.is_none()));

    let bad = RetrainingConfigUpdate {
        schedule: Some(ScheduleKind::Weekly),
        day_of_week: Some("someday".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        svc.retraining
            .update_retraining_config(ModelKind::ChurnPrediction, &bad),
        Err(SchedulerError::Config(_))
    ));

    svc.retraining.stop().await.expect("stop");
}
