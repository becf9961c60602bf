//! Builds and issues the parameterized alerts query for one subscription.

use async_trait::async_trait;
use chrono::Datelike;
use reqwest::{Client, Url};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::config::DatasetConfig;
use crate::model::{AlertRecord, AlertWindow, LocationSpec};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("alerts request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("alerts API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed alerts response: {0}")]
    Malformed(String),
}

/// Fully-planned query: which physical dataset, the substituted SQL, and
/// whether the geostore id travels as a query parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub dataset_id: String,
    pub sql: String,
    pub geostore: Option<String>,
}

/// Substitute the window placeholders. Some backing datasets bucket by
/// Julian day rather than calendar date, so both forms are always offered.
pub fn build_sql(template: &str, window: &AlertWindow) -> String {
    template
        .replace("{{begin}}", &window.begin.format("%Y-%m-%d").to_string())
        .replace("{{end}}", &window.end.format("%Y-%m-%d").to_string())
        .replace("{{julianDayBegin}}", &window.begin.ordinal().to_string())
        .replace("{{yearBegin}}", &window.begin.year().to_string())
        .replace("{{julianDayEnd}}", &window.end.ordinal().to_string())
        .replace("{{yearEnd}}", &window.end.year().to_string())
}

/// Render a filter value: numeric values stay bare, everything else is
/// quoted with embedded quotes doubled.
fn sql_literal(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// Choose the physical dataset and filters for a location. Mirrors the
/// resolution precedence: admin and WDPA subscriptions use their
/// specialized datasets when configured, everything else (and every
/// unspecialized family) falls back to the generic geostore dataset.
pub fn plan(
    ds: &DatasetConfig,
    window: &AlertWindow,
    location: &LocationSpec,
    geostore_id: &str,
) -> QueryPlan {
    let mut sql = build_sql(&ds.sql, window);
    match location {
        LocationSpec::Admin(admin) if ds.datasets.admin.is_some() => {
            sql.push_str(&format!(
                " AND {} = {}",
                ds.filters.iso,
                sql_literal(&admin.country)
            ));
            if let Some(region) = &admin.region {
                sql.push_str(&format!(" AND {} = {}", ds.filters.adm1, sql_literal(region)));
                if let Some(subregion) = &admin.subregion {
                    sql.push_str(&format!(
                        " AND {} = {}",
                        ds.filters.adm2,
                        sql_literal(subregion)
                    ));
                }
            }
            QueryPlan {
                dataset_id: ds.datasets.admin.clone().unwrap(),
                sql,
                geostore: None,
            }
        }
        LocationSpec::ProtectedArea(wdpa) if ds.datasets.wdpa.is_some() => {
            sql.push_str(&format!(" AND {} = {wdpa}", ds.filters.wdpa));
            QueryPlan {
                dataset_id: ds.datasets.wdpa.clone().unwrap(),
                sql,
                geostore: None,
            }
        }
        _ => QueryPlan {
            dataset_id: ds.datasets.geostore.clone(),
            sql,
            geostore: Some(geostore_id.to_string()),
        },
    }
}

#[async_trait]
pub trait AlertQueryService: Send + Sync {
    async fn query(
        &self,
        ds: &DatasetConfig,
        window: &AlertWindow,
        location: &LocationSpec,
        geostore_id: &str,
    ) -> Result<Vec<AlertRecord>, QueryError>;
}

#[derive(Clone)]
pub struct AlertQueryClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for AlertQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertQueryClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AlertQueryClient {
    pub fn new(base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("forest-dispatch/0.1")
            .build()
            .expect("reqwest client");
        Self { http, base_url }
    }
}

#[async_trait]
impl AlertQueryService for AlertQueryClient {
    async fn query(
        &self,
        ds: &DatasetConfig,
        window: &AlertWindow,
        location: &LocationSpec,
        geostore_id: &str,
    ) -> Result<Vec<AlertRecord>, QueryError> {
        let plan = plan(ds, window, location, geostore_id);
        let url = self
            .base_url
            .join(&format!("dataset/{}/latest/query", plan.dataset_id))
            .map_err(|err| QueryError::Malformed(err.to_string()))?;

        let mut request = self.http.get(url).query(&[("sql", plan.sql.as_str())]);
        if let Some(geostore) = &plan.geostore {
            request = request.query(&[("geostore", geostore.as_str())]);
        }

        debug!(dataset = %plan.dataset_id, "querying alerts");
        let res = request.send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(QueryError::Status { status, body });
        }

        let body: Value = res
            .json()
            .await
            .map_err(|err| QueryError::Malformed(err.to_string()))?;
        let rows = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| QueryError::Malformed("response has no data array".into()))?;
        Ok(rows
            .iter()
            .cloned()
            .filter_map(AlertRecord::from_value)
            .collect())
    }
}
