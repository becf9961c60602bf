//! Queue consumer: turns one "dataset updated" event into zero or more
//! delivered notifications, one isolated attempt per matched subscription.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::alerts::{AlertQueryService, QueryError};
use crate::classify;
use crate::config::Config;
use crate::db::{self, Pool};
use crate::delivery::{DeliveryService, PublishError};
use crate::geostore::{self, GeostoreService, ResolutionError};
use crate::model::{
    EmailAddress, EmailRecipient, InboundEvent, NotificationPayload, Subscription,
    RECONCILIATION_SLUG,
};
use crate::payload;

/// Fatal for the whole event; the message is discarded.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("subscription store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Terminal for one subscription's iteration; siblings continue.
#[derive(Debug, Error)]
pub enum FailureKind {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("cursor update failed: {0}")]
    Store(String),
}

impl FailureKind {
    pub fn kind_str(&self) -> &'static str {
        match self {
            FailureKind::Resolution(_) => "resolution",
            FailureKind::Query(_) => "query",
            FailureKind::Publish(_) => "publish",
            FailureKind::Store(_) => "store",
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Notified { alerts: u64 },
    NoAlerts,
}

#[derive(Debug, PartialEq)]
pub enum EventMode {
    Alerts,
    Reconciliation { datasets: Vec<String> },
}

/// What one event amounted to. Also feeds the best-effort stats payload.
#[derive(Debug)]
pub struct EventReport {
    pub layer_slug: String,
    pub mode: EventMode,
    pub matched: usize,
    pub notified: usize,
    pub empty_windows: usize,
    pub failures: Vec<(String, FailureKind)>,
}

impl EventReport {
    fn new(layer_slug: &str) -> Self {
        Self {
            layer_slug: layer_slug.to_string(),
            mode: EventMode::Alerts,
            matched: 0,
            notified: 0,
            empty_windows: 0,
            failures: Vec::new(),
        }
    }
}

/// The orchestrator. External collaborators are injected so tests can
/// substitute recording fakes and so startup owns every connection.
pub struct Pipeline {
    pool: Pool,
    geostore: Arc<dyn GeostoreService>,
    alerts: Arc<dyn AlertQueryService>,
    delivery: Arc<dyn DeliveryService>,
    config: Arc<Config>,
}

impl Pipeline {
    pub fn new(
        pool: Pool,
        geostore: Arc<dyn GeostoreService>,
        alerts: Arc<dyn AlertQueryService>,
        delivery: Arc<dyn DeliveryService>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            pool,
            geostore,
            alerts,
            delivery,
            config,
        }
    }

    /// Process one raw channel message to completion. Unparseable JSON is
    /// fatal for the event; per-subscription failures are collected and
    /// never abort the loop.
    #[instrument(skip_all)]
    pub async fn handle_message(&self, raw: &str) -> Result<EventReport, EventError> {
        let event = InboundEvent::parse(raw)?;

        if event.layer_slug == RECONCILIATION_SLUG {
            return Ok(self.reconcile().await?);
        }

        let mut report = EventReport::new(&event.layer_slug);
        let Some(ds) = self.config.dataset(&event.layer_slug) else {
            warn!(layer = %event.layer_slug, "event for unconfigured dataset; ignoring");
            return Ok(report);
        };

        let event_id = Uuid::new_v4();
        let subscriptions = self.matching_subscriptions(&event).await?;
        report.matched = subscriptions.len();
        info!(
            event = %event_id,
            layer = %event.layer_slug,
            matched = report.matched,
            begin = %event.begin_date,
            end = %event.end_date,
            "processing dataset update"
        );

        for sub in &subscriptions {
            match self.process_subscription(ds, &event, sub).await {
                Ok(Outcome::Notified { alerts }) => {
                    info!(subscription = %sub.id, alerts, "notification published");
                    report.notified += 1;
                }
                Ok(Outcome::NoAlerts) => {
                    info!(subscription = %sub.id, "no alerts in window");
                    report.empty_windows += 1;
                }
                Err(kind) => {
                    warn!(subscription = %sub.id, error = %kind, "subscription skipped");
                    report.failures.push((sub.id.clone(), kind));
                }
            }
        }

        if !event.is_override() {
            self.publish_stats(&report).await;
        }
        Ok(report)
    }

    async fn matching_subscriptions(
        &self,
        event: &InboundEvent,
    ) -> Result<Vec<Subscription>, EventError> {
        if let Some(sub_id) = &event.sub_id {
            // Test override: run exactly this subscription, confirmed or not.
            let sub = db::subscription_by_id(&self.pool, sub_id).await?;
            if sub.is_none() {
                warn!(subscription = %sub_id, "override subscription not found");
            }
            return Ok(sub.into_iter().collect());
        }
        Ok(db::confirmed_for_dataset(&self.pool, &event.layer_slug).await?)
    }

    /// One subscription, start to finish: resolve, query, classify, build,
    /// publish, advance the cursor. Each `?` is terminal for this
    /// subscription only.
    async fn process_subscription(
        &self,
        ds: &crate::config::DatasetConfig,
        event: &InboundEvent,
        sub: &Subscription,
    ) -> Result<Outcome, FailureKind> {
        let location = sub
            .location()
            .ok_or(FailureKind::Resolution(ResolutionError::EmptyLocation))?;
        let geostore_id = geostore::resolve(self.geostore.as_ref(), &location).await?;

        let window = event.window();
        let records = self
            .alerts
            .query(ds, &window, &location, &geostore_id)
            .await?;
        if records.is_empty() {
            return Ok(Outcome::NoAlerts);
        }

        let aggregate = classify::classify(&records, &ds.fields);
        let language = payload::normalize_language(
            event
                .language
                .as_deref()
                .or(sub.language.as_deref())
                .or(Some(self.config.app.default_language.as_str())),
        );
        let recipient = event
            .recipient_override()
            .unwrap_or_else(|| sub.resource.clone());
        if !recipient.is_valid() {
            return Err(FailureKind::Publish(PublishError::Invalid(format!(
                "unusable delivery resource: {}",
                recipient.target
            ))));
        }

        let document = payload::build(
            ds,
            &self.config.links,
            &self.config.app.sender,
            sub,
            &recipient,
            language,
            &aggregate,
            &window,
            &geostore_id,
        );
        self.delivery.publish(&document).await?;

        // Not transactional with the publish above: a crash in between
        // re-notifies on the next event (at-least-once). Test overrides
        // leave real cursors untouched.
        if !event.is_override() {
            db::advance_cursor(
                &self.pool,
                &sub.id,
                &ds.slug,
                Utc::now(),
                aggregate.total_count() as f64,
            )
            .await
            .map_err(|err| FailureKind::Store(err.to_string()))?;
        }

        Ok(Outcome::Notified {
            alerts: aggregate.total_count(),
        })
    }

    /// Secondary mode for the generic "dataset changed" event: report which
    /// subscribed datasets are live so the (external) scheduler can re-seed
    /// its per-dataset triggers.
    async fn reconcile(&self) -> Result<EventReport, EventError> {
        let mut report = EventReport::new(RECONCILIATION_SLUG);
        let subscribed = db::distinct_dataset_slugs(&self.pool).await?;
        let datasets: Vec<String> = subscribed
            .into_iter()
            .filter(|slug| self.config.dataset(slug).is_some())
            .collect();
        for slug in &datasets {
            info!(dataset = %slug, "dataset flagged for reconciliation");
        }
        report.mode = EventMode::Reconciliation { datasets };
        Ok(report)
    }

    /// Best-effort delivery statistics; never gates event completion.
    async fn publish_stats(&self, report: &EventReport) {
        let Some(recipient) = &self.config.app.stats_recipient else {
            return;
        };
        if report.matched == 0 {
            return;
        }

        let mut kinds = Map::new();
        for (_, failure) in &report.failures {
            let entry = kinds.entry(failure.kind_str()).or_insert(json!(0));
            *entry = json!(entry.as_u64().unwrap_or(0) + 1);
        }

        let mut data = Map::new();
        data.insert("layer_slug".into(), json!(report.layer_slug));
        data.insert("matched".into(), json!(report.matched));
        data.insert("notified".into(), json!(report.notified));
        data.insert("empty_windows".into(), json!(report.empty_windows));
        data.insert("failed".into(), json!(report.failures.len()));
        data.insert("failure_kinds".into(), serde_json::Value::Object(kinds));

        let stats = NotificationPayload {
            template: "dispatch-stats-en".into(),
            sender: self.config.app.sender.clone(),
            recipients: vec![EmailRecipient {
                address: EmailAddress {
                    email: recipient.clone(),
                },
            }],
            webhook: None,
            data,
        };
        if let Err(err) = self.delivery.publish(&stats).await {
            warn!(?err, "failed to publish dispatch stats");
        }
    }
}
