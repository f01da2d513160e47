use std::path::Path;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use chrono_tz::Tz;
use customer_analyzer::{
    api_router, AppState, ArtifactStore, Event, EventStore, EventType, ExtractorSet, MetricsLog,
    MetricsStore, ModelSet, PredictionJobs, PredictionUpdater, PredictionUpdaterConfig,
    RetrainingConfigs, RetrainingJobs, RetrainingScheduler, SqliteStore, User, MAX_BATCH_USERS,
};
use serde_json::{json, Value};
use tower::util::ServiceExt;

/// `users` users whose activity grows with their id, all within the last
/// three weeks.
fn app(dir: &Path, users: i64) -> Router {
    let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store should open"));
    store.init_schema().expect("schema should apply");
    let now = Utc::now();
    for user_id in 1..=users {
        store
            .insert_user(&User::new(user_id, 7000 + user_id, now - Duration::days(60)))
            .expect("user insert should succeed");
        let events: Vec<Event> = (0..user_id * 4)
            .map(|i| {
                let at = now - Duration::days(21) + Duration::hours(i * 3);
                if i % 5 == 4 {
                    Event::new(user_id, EventType::Purchase, at)
                        .with_properties(json!({ "amount": 25 * user_id }))
                } else {
                    Event::new(user_id, EventType::View, at)
                }
            })
            .collect();
        store
            .insert_events(&events)
            .expect("event insert should succeed");
    }
    let events: Arc<dyn EventStore> = store.clone();
    let predictions: Arc<dyn MetricsStore> = store;

    let artifacts = ArtifactStore::new(dir.join("models"));
    let models = ModelSet::new(&artifacts);
    let extractors = ExtractorSet::new(events);
    let metrics = MetricsLog::new(dir.join("metrics"));
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

    api_router(AppState {
        models,
        extractors,
        retraining,
        updater,
    })
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .expect("request should build");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_reports_models_and_schedulers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(dir.path(), 2);

    let (status, body) = send(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["models"].as_array().map(Vec::len), Some(3));
    assert_eq!(body["data"]["models"][0]["loaded"], false);
    assert_eq!(body["data"]["retraining_running"], false);
}

#[tokio::test]
async fn untrained_predictions_return_not_found_envelopes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(dir.path(), 2);

    let (status, body) = send(&app, Method::POST, "/api/purchase-prediction/predict/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert!(body["error"]
        .as_str()
        .is_some_and(|e| e.contains("not trained")));

    let (status, _) = send(&app, Method::GET, "/api/churn-prediction/model/info", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, Method::GET, "/api/segmentation/segments", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn batch_prediction_validates_user_id_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(dir.path(), 2);

    let too_many: Vec<i64> = (1..=MAX_BATCH_USERS as i64 + 1).collect();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/purchase-prediction/predict/batch",
        Some(json!({ "user_ids": too_many })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/churn-prediction/predict/batch",
        Some(json!({ "user_ids": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // duplicates collapse before the limit applies
    let repeated = vec![1_i64; MAX_BATCH_USERS + 50];
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/purchase-prediction/predict/batch",
        Some(json!({ "user_ids": repeated })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retraining_config_updates_are_validated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(dir.path(), 2);

    let (status, body) = send(
        &app,
        Method::PUT,
        "/api/retraining/config?model_type=churn",
        Some(json!({
            "enabled": true,
            "schedule": "custom",
            "custom_interval_minutes": 90
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], true);
    assert_eq!(body["data"]["custom_interval_minutes"], 90);

    let (status, body) = send(&app, Method::GET, "/api/retraining/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["churn_prediction"]["schedule"], "custom");
    assert_eq!(body["data"]["segmentation"]["schedule"], "daily");

    let (status, body) = send(
        &app,
        Method::PUT,
        "/api/retraining/config?model_type=segmentation",
        Some(json!({ "schedule": "hourly" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = send(
        &app,
        Method::PUT,
        "/api/retraining/config?model_type=weather",
        Some(json!({ "enabled": false })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn trained_segmentation_serves_user_lookups() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app(dir.path(), 12);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/segmentation/train?n_clusters=3",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["n_clusters"], 3);
    assert_eq!(body["data"]["training_rows"], 12);

    let (status, body) = send(&app, Method::GET, "/api/segmentation/users/5/segment", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user_id"], 5);
    assert!(body["data"]["segment_id"].as_u64().is_some_and(|id| id < 3));

    let (status, _) = send(&app, Method::GET, "/api/segmentation/users/404/segment", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::GET,
        "/api/segmentation/users/segment/0?limit=2",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["users"].as_array().is_some_and(|u| u.len() <= 2));

    let (status, _) = send(&app, Method::GET, "/api/segmentation/users/segment/9", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn failed_save_does_not_publish_the_trained_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    // a plain file where the model directory should be makes every save fail
    std::fs::write(dir.path().join("models"), b"").expect("blocker file");
    let app = app(dir.path(), 12);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/segmentation/train?n_clusters=3",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{body}");
    assert_eq!(body["success"], false);

    let (status, _) = send(&app, Method::GET, "/api/segmentation/segments", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["models"][0]["loaded"], false);
}
