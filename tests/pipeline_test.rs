use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;

use forest_dispatch::alerts::{AlertQueryService, QueryError};
use forest_dispatch::config::{self, Config, DatasetConfig};
use forest_dispatch::db;
use forest_dispatch::delivery::{DeliveryService, PublishError};
use forest_dispatch::geostore::{AreaSummary, GeostorePath, GeostoreService, ResolutionError};
use forest_dispatch::model::{
    AlertRecord, AlertWindow, DeliveryResource, LocationSpec, NotificationPayload, Subscription,
    SubscriptionParams,
};
use forest_dispatch::pipeline::{EventMode, Pipeline};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

#[derive(Default)]
struct StubGeostore {
    areas: HashMap<String, AreaSummary>,
    failing_areas: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl StubGeostore {
    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl GeostoreService for StubGeostore {
    async fn area(&self, area_id: &str) -> Result<AreaSummary, ResolutionError> {
        self.calls.lock().await.push(format!("area/{area_id}"));
        if self.failing_areas.contains(area_id) {
            return Err(ResolutionError::Status {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        self.areas
            .get(area_id)
            .cloned()
            .ok_or(ResolutionError::Malformed)
    }

    async fn geostore_id(&self, path: &GeostorePath) -> Result<String, ResolutionError> {
        self.calls.lock().await.push(path.endpoint());
        Ok(format!("geo-for-{}", path.endpoint()))
    }
}

#[derive(Default)]
struct StubAlerts {
    responses: Mutex<VecDeque<Result<Vec<AlertRecord>, QueryError>>>,
}

impl StubAlerts {
    fn with_responses(responses: Vec<Result<Vec<AlertRecord>, QueryError>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
        }
    }
}

#[async_trait]
impl AlertQueryService for StubAlerts {
    async fn query(
        &self,
        _ds: &DatasetConfig,
        _window: &AlertWindow,
        _location: &LocationSpec,
        _geostore_id: &str,
    ) -> Result<Vec<AlertRecord>, QueryError> {
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Default)]
struct RecordingDelivery {
    responses: Mutex<VecDeque<Result<(), PublishError>>>,
    published: Mutex<Vec<NotificationPayload>>,
}

impl RecordingDelivery {
    fn with_responses(responses: Vec<Result<(), PublishError>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
            ..Default::default()
        }
    }

    async fn published(&self) -> Vec<NotificationPayload> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl DeliveryService for RecordingDelivery {
    async fn publish(&self, payload: &NotificationPayload) -> Result<(), PublishError> {
        self.published.lock().await.push(payload.clone());
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or(Ok(()))
    }
}

fn subscription(id: &str, params: serde_json::Value, datasets: &[&str]) -> Subscription {
    Subscription {
        id: id.into(),
        user_id: "user-1".into(),
        name: Some(format!("{id} area")),
        confirmed: true,
        language: Some("en".into()),
        resource: DeliveryResource::email(format!("{id}@example.org")),
        params: serde_json::from_value::<SubscriptionParams>(params).unwrap(),
        datasets: datasets.iter().map(|s| s.to_string()).collect(),
        created_at: Utc::now(),
    }
}

fn glad_rows() -> Vec<AlertRecord> {
    vec![
        AlertRecord::from_value(json!({
            "alert__count": 50, "alert_area__ha": 5.0,
            "wdpa_protected_area__iucn_cat": "II"
        }))
        .unwrap(),
        AlertRecord::from_value(json!({ "alert__count": 50, "alert_area__ha": 5.0 })).unwrap(),
    ]
}

const GLAD_EVENT: &str =
    r#"{"layer_slug":"glad-alerts","begin_date":"2026-08-01","end_date":"2026-08-07"}"#;

struct Harness {
    pool: sqlx::SqlitePool,
    geostore: Arc<StubGeostore>,
    delivery: Arc<RecordingDelivery>,
    pipeline: Pipeline,
}

async fn harness(cfg: Config, geostore: StubGeostore, alerts: StubAlerts, delivery: RecordingDelivery) -> Harness {
    let pool = setup_pool().await;
    let geostore = Arc::new(geostore);
    let delivery = Arc::new(delivery);
    let pipeline = Pipeline::new(
        pool.clone(),
        geostore.clone(),
        Arc::new(alerts),
        delivery.clone(),
        Arc::new(cfg),
    );
    Harness {
        pool,
        geostore,
        delivery,
        pipeline,
    }
}

#[tokio::test]
async fn glad_event_notifies_and_advances_cursor() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::with_responses(vec![Ok(glad_rows())]),
        RecordingDelivery::default(),
    )
    .await;

    let sub = subscription("sub-1", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &sub).await.unwrap();

    let report = h.pipeline.handle_message(GLAD_EVENT).await.unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.notified, 1);
    assert!(report.failures.is_empty());

    // Explicit geostore ids resolve without any network call.
    assert!(h.geostore.calls().await.is_empty());

    let published = h.delivery.published().await;
    assert_eq!(published.len(), 1);
    let payload = &published[0];
    assert_eq!(payload.template, "forest-change-notification-en");
    assert_eq!(payload.recipients[0].address.email, "sub-1@example.org");
    assert_eq!(payload.data["formatted_alert_count"], json!("100"));
    assert_eq!(
        payload.data["formatted_priority_areas"]["protected_areas"],
        json!("50")
    );
    assert_eq!(payload.data["formatted_priority_areas"]["other"], json!("50"));

    let cursor = db::cursor(&h.pool, "sub-1", "glad-alerts").await.unwrap().unwrap();
    assert!(cursor.last_sent.is_some());
    assert_eq!(cursor.historical.len(), 1);
    assert_eq!(cursor.historical[0].value, 100.0);
}

#[tokio::test]
async fn failing_subscription_does_not_block_siblings() {
    let mut geostore = StubGeostore::default();
    geostore.failing_areas.insert("area-bad".into());
    let h = harness(
        test_config(),
        geostore,
        StubAlerts::with_responses(vec![Ok(glad_rows())]),
        RecordingDelivery::default(),
    )
    .await;

    // created_at ordering makes sub-a run first and fail first.
    let sub_a = subscription("sub-a", json!({ "area": "area-bad" }), &["glad-alerts"]);
    let sub_b = subscription("sub-b", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &sub_a).await.unwrap();
    db::insert_subscription(&h.pool, &sub_b).await.unwrap();

    let report = h.pipeline.handle_message(GLAD_EVENT).await.unwrap();
    assert_eq!(report.matched, 2);
    assert_eq!(report.notified, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "sub-a");

    let published = h.delivery.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].recipients[0].address.email, "sub-b@example.org");

    assert!(db::cursor(&h.pool, "sub-a", "glad-alerts").await.unwrap().is_none());
    assert!(db::cursor(&h.pool, "sub-b", "glad-alerts").await.unwrap().is_some());
}

#[tokio::test]
async fn redelivered_event_notifies_again() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::with_responses(vec![Ok(glad_rows()), Ok(glad_rows())]),
        RecordingDelivery::default(),
    )
    .await;

    let sub = subscription("sub-1", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &sub).await.unwrap();

    h.pipeline.handle_message(GLAD_EVENT).await.unwrap();
    let report = h.pipeline.handle_message(GLAD_EVENT).await.unwrap();
    assert_eq!(report.notified, 1);

    // At-least-once: the second delivery of the same window notifies again.
    assert_eq!(h.delivery.published().await.len(), 2);
    let cursor = db::cursor(&h.pool, "sub-1", "glad-alerts").await.unwrap().unwrap();
    assert_eq!(cursor.historical.len(), 2);
}

#[tokio::test]
async fn delivery_failure_leaves_cursor_untouched() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::with_responses(vec![Ok(glad_rows())]),
        RecordingDelivery::with_responses(vec![Err(PublishError::Status {
            status: 500,
            body: "mail dispatcher down".into(),
        })]),
    )
    .await;

    let sub = subscription("sub-1", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &sub).await.unwrap();

    let report = h.pipeline.handle_message(GLAD_EVENT).await.unwrap();
    assert_eq!(report.notified, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(db::cursor(&h.pool, "sub-1", "glad-alerts").await.unwrap().is_none());
}

#[tokio::test]
async fn query_failure_skips_subscription() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::with_responses(vec![Err(QueryError::Status {
            status: 503,
            body: "unavailable".into(),
        })]),
        RecordingDelivery::default(),
    )
    .await;

    let sub = subscription("sub-1", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &sub).await.unwrap();

    let report = h.pipeline.handle_message(GLAD_EVENT).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(h.delivery.published().await.is_empty());
    assert!(db::cursor(&h.pool, "sub-1", "glad-alerts").await.unwrap().is_none());
}

#[tokio::test]
async fn zero_alerts_sends_nothing() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::with_responses(vec![Ok(Vec::new())]),
        RecordingDelivery::default(),
    )
    .await;

    let sub = subscription("sub-1", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &sub).await.unwrap();

    let report = h.pipeline.handle_message(GLAD_EVENT).await.unwrap();
    assert_eq!(report.empty_windows, 1);
    assert_eq!(report.notified, 0);
    assert!(h.delivery.published().await.is_empty());
    assert!(db::cursor(&h.pool, "sub-1", "glad-alerts").await.unwrap().is_none());
}

#[tokio::test]
async fn malformed_event_is_fatal() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::default(),
        RecordingDelivery::default(),
    )
    .await;
    assert!(h.pipeline.handle_message("{ not json").await.is_err());
    assert!(h.delivery.published().await.is_empty());
}

#[tokio::test]
async fn unconfirmed_subscriptions_are_not_matched() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::with_responses(vec![Ok(glad_rows())]),
        RecordingDelivery::default(),
    )
    .await;

    let mut sub = subscription("sub-1", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    sub.confirmed = false;
    db::insert_subscription(&h.pool, &sub).await.unwrap();

    let report = h.pipeline.handle_message(GLAD_EVENT).await.unwrap();
    assert_eq!(report.matched, 0);
    assert!(h.delivery.published().await.is_empty());
}

#[tokio::test]
async fn unknown_layer_slug_is_ignored() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::default(),
        RecordingDelivery::default(),
    )
    .await;
    let report = h
        .pipeline
        .handle_message(r#"{"layer_slug":"nope","begin_date":"2026-08-01","end_date":"2026-08-07"}"#)
        .await
        .unwrap();
    assert_eq!(report.matched, 0);
}

#[tokio::test]
async fn test_event_overrides_recipient_and_skips_cursor() {
    let mut cfg = test_config();
    cfg.app.stats_recipient = Some("ops@example.org".into());
    let h = harness(
        cfg,
        StubGeostore::default(),
        StubAlerts::with_responses(vec![Ok(glad_rows())]),
        RecordingDelivery::default(),
    )
    .await;

    let sub = subscription("sub-1", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &sub).await.unwrap();

    let event = r#"{"layer_slug":"glad-alerts","begin_date":"2026-08-01","end_date":"2026-08-07",
        "isTest":true,"email":"tester@example.org","type":"EMAIL"}"#;
    let report = h.pipeline.handle_message(event).await.unwrap();
    assert_eq!(report.notified, 1);

    // Override recipient, no cursor movement, and no stats for test runs.
    let published = h.delivery.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].recipients[0].address.email, "tester@example.org");
    assert!(db::cursor(&h.pool, "sub-1", "glad-alerts").await.unwrap().is_none());
}

#[tokio::test]
async fn sub_id_override_runs_one_unconfirmed_subscription() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::with_responses(vec![Ok(glad_rows())]),
        RecordingDelivery::default(),
    )
    .await;

    let mut sub = subscription("sub-draft", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    sub.confirmed = false;
    db::insert_subscription(&h.pool, &sub).await.unwrap();
    let other = subscription("sub-other", json!({ "geostore": "geo-8" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &other).await.unwrap();

    let event = r#"{"layer_slug":"glad-alerts","begin_date":"2026-08-01","end_date":"2026-08-07",
        "subId":"sub-draft"}"#;
    let report = h.pipeline.handle_message(event).await.unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.notified, 1);

    let published = h.delivery.published().await;
    assert_eq!(published[0].recipients[0].address.email, "sub-draft@example.org");
    assert!(db::cursor(&h.pool, "sub-draft", "glad-alerts").await.unwrap().is_none());
}

#[tokio::test]
async fn stats_payload_follows_a_real_event() {
    let mut cfg = test_config();
    cfg.app.stats_recipient = Some("ops@example.org".into());
    let h = harness(
        cfg,
        StubGeostore::default(),
        StubAlerts::with_responses(vec![Ok(glad_rows())]),
        RecordingDelivery::default(),
    )
    .await;

    let sub = subscription("sub-1", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &sub).await.unwrap();

    h.pipeline.handle_message(GLAD_EVENT).await.unwrap();

    let published = h.delivery.published().await;
    assert_eq!(published.len(), 2);
    let stats = &published[1];
    assert_eq!(stats.template, "dispatch-stats-en");
    assert_eq!(stats.recipients[0].address.email, "ops@example.org");
    assert_eq!(stats.data["matched"], json!(1));
    assert_eq!(stats.data["notified"], json!(1));
    assert_eq!(stats.data["failed"], json!(0));
}

#[tokio::test]
async fn reconciliation_event_reports_live_datasets() {
    let h = harness(
        test_config(),
        StubGeostore::default(),
        StubAlerts::default(),
        RecordingDelivery::default(),
    )
    .await;

    let sub = subscription("sub-1", json!({ "geostore": "geo-9" }), &["glad-alerts"]);
    db::insert_subscription(&h.pool, &sub).await.unwrap();
    // A dataset nobody configured never shows up in the reconciliation.
    let stray = subscription("sub-2", json!({ "geostore": "geo-8" }), &["retired-layer"]);
    db::insert_subscription(&h.pool, &stray).await.unwrap();

    let event = r#"{"layer_slug":"dataset","begin_date":"2026-08-01","end_date":"2026-08-07"}"#;
    let report = h.pipeline.handle_message(event).await.unwrap();
    assert_eq!(
        report.mode,
        EventMode::Reconciliation {
            datasets: vec!["glad-alerts".into()]
        }
    );
    assert!(h.delivery.published().await.is_empty());
}
