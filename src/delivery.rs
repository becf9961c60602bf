//! Hands finished payloads to the delivery side: the mail dispatcher for
//! email recipients, the subscriber's own endpoint for webhooks.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::model::NotificationPayload;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("delivery request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("delivery endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid delivery payload: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn publish(&self, payload: &NotificationPayload) -> Result<(), PublishError>;
}

#[derive(Clone)]
pub struct DeliveryClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for DeliveryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DeliveryClient {
    pub fn new(base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("forest-dispatch/0.1")
            .build()
            .expect("reqwest client");
        Self { http, base_url }
    }

    async fn post_json(&self, url: Url, body: &Value) -> Result<(), PublishError> {
        debug!(%url, "publishing notification");
        let res = self.http.post(url).json(body).send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(PublishError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryService for DeliveryClient {
    async fn publish(&self, payload: &NotificationPayload) -> Result<(), PublishError> {
        // Webhook subscriptions receive the data document directly; email
        // payloads are enqueued with the dispatcher.
        if let Some(webhook) = &payload.webhook {
            let url = Url::parse(webhook)
                .map_err(|_| PublishError::Invalid(format!("invalid webhook url: {webhook}")))?;
            return self.post_json(url, &Value::Object(payload.data.clone())).await;
        }

        let url = self
            .base_url
            .join("v1/notifications")
            .map_err(|err| PublishError::Invalid(err.to_string()))?;
        let body = serde_json::to_value(payload)
            .map_err(|err| PublishError::Invalid(err.to_string()))?;
        self.post_json(url, &body).await
    }
}
