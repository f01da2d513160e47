use std::sync::Arc;

use customer_analyzer::{
    api_router, init_logging, log_app_bind, log_app_shutdown, log_app_start,
    logging_config_from_env, AppState, ArtifactStore, EventStore, ExtractorSet, MetricsLog,
    MetricsStore, ModelSet, PredictionJobs, PredictionUpdater, PredictionUpdaterConfig,
    RetrainingConfigs, RetrainingJobs, RetrainingScheduler, ServiceConfig, SqliteStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let config = ServiceConfig::from_env()?;

    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    store.init_schema()?;
    let events: Arc<dyn EventStore> = store.clone();
    let metrics_store: Arc<dyn MetricsStore> = store;

    let artifacts = ArtifactStore::new(&config.model_dir);
    let models = ModelSet::new(&artifacts);
    models.load_persisted()?;
    let extractors = ExtractorSet::new(events);
    let metrics = MetricsLog::new(&config.metrics_dir);

    let retraining = Arc::new(RetrainingScheduler::new(RetrainingJobs::new(
        models.clone(),
        extractors.clone(),
        artifacts,
        metrics.clone(),
        config.timezone,
        RetrainingConfigs::default(),
    )));
    let updater = Arc::new(PredictionUpdater::new(PredictionJobs::new(
        Arc::clone(&models.purchase),
        Arc::clone(&extractors.purchase),
        metrics_store,
        metrics,
        config.timezone,
        PredictionUpdaterConfig::default(),
    )));
    if config.start_schedulers {
        retraining.start()?;
        updater.start()?;
    }

    let app = api_router(AppState {
        models,
        extractors,
        retraining: Arc::clone(&retraining),
        updater: Arc::clone(&updater),
    });
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log_app_shutdown("ctrl_c");
        })
        .await?;

    retraining.stop().await?;
    updater.stop().await?;
    Ok(())
}
