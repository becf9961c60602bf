//! Resolves a subscription's area of interest to a concrete geostore id.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::model::{AdminArea, LocationSpec};

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("geostore request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("geostore returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("geostore response carried no id")]
    Malformed,
    #[error("subscription has no resolvable location")]
    EmptyLocation,
}

/// A resolvable path into the geostore API. Built from a `LocationSpec`
/// (or from a saved area's fallback fields) and turned into an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum GeostorePath {
    Use { name: String, id: i64 },
    Wdpa(i64),
    Admin(AdminArea),
}

impl GeostorePath {
    pub fn endpoint(&self) -> String {
        match self {
            GeostorePath::Use { name, id } => format!("geostore/use/{name}/{id}"),
            GeostorePath::Wdpa(id) => format!("geostore/wdpa/{id}"),
            GeostorePath::Admin(admin) => {
                let mut path = format!("geostore/admin/{}", admin.country);
                if let Some(region) = &admin.region {
                    path.push('/');
                    path.push_str(region);
                    if let Some(subregion) = &admin.subregion {
                        path.push('/');
                        path.push_str(subregion);
                    }
                }
                path
            }
        }
    }
}

/// What the area collaborator knows about a saved area. An area may carry
/// its own geostore id; otherwise one is derived from its other fields.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AreaSummary {
    #[serde(default)]
    pub geostore: Option<String>,
    #[serde(default)]
    pub iso: Option<AdminArea>,
    #[serde(default)]
    pub wdpaid: Option<i64>,
    #[serde(default, rename = "use")]
    pub use_name: Option<String>,
    #[serde(default, rename = "useid")]
    pub use_id: Option<i64>,
}

impl AreaSummary {
    /// Fallback path for an area without its own geostore, same precedence
    /// as subscriptions: ISO admin > WDPA > named use.
    pub fn fallback_path(&self) -> Option<GeostorePath> {
        if let Some(iso) = &self.iso {
            if !iso.country.trim().is_empty() {
                return Some(GeostorePath::Admin(iso.clone()));
            }
        }
        if let Some(wdpa) = self.wdpaid.filter(|id| *id > 0) {
            return Some(GeostorePath::Wdpa(wdpa));
        }
        match (&self.use_name, self.use_id) {
            (Some(name), Some(id)) if !name.trim().is_empty() => Some(GeostorePath::Use {
                name: name.clone(),
                id,
            }),
            _ => None,
        }
    }
}

#[async_trait]
pub trait GeostoreService: Send + Sync {
    async fn area(&self, area_id: &str) -> Result<AreaSummary, ResolutionError>;

    async fn geostore_id(&self, path: &GeostorePath) -> Result<String, ResolutionError>;
}

/// Resolve a location spec to a geostore id. An explicit geostore id is
/// used verbatim with no network call; a saved area prefers its own
/// geostore and falls back to a derived path; everything else is a direct
/// path lookup.
pub async fn resolve(
    service: &dyn GeostoreService,
    spec: &LocationSpec,
) -> Result<String, ResolutionError> {
    match spec {
        LocationSpec::Geostore(id) => Ok(id.clone()),
        LocationSpec::SavedArea(area_id) => {
            let area = service.area(area_id).await?;
            if let Some(id) = area.geostore.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
                return Ok(id.to_string());
            }
            let path = area.fallback_path().ok_or(ResolutionError::EmptyLocation)?;
            service.geostore_id(&path).await
        }
        LocationSpec::Admin(admin) => {
            service.geostore_id(&GeostorePath::Admin(admin.clone())).await
        }
        LocationSpec::ProtectedArea(id) => service.geostore_id(&GeostorePath::Wdpa(*id)).await,
        LocationSpec::Use { name, id } => {
            service
                .geostore_id(&GeostorePath::Use {
                    name: name.clone(),
                    id: *id,
                })
                .await
        }
    }
}

#[derive(Clone)]
pub struct GeostoreClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for GeostoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeostoreClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct GeostoreResponse {
    id: String,
}

#[derive(Deserialize)]
struct AreaResponse {
    data: AreaData,
}

#[derive(Deserialize)]
struct AreaData {
    attributes: AreaSummary,
}

impl GeostoreClient {
    pub fn new(base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("forest-dispatch/0.1")
            .build()
            .expect("reqwest client");
        Self { http, base_url }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<T, ResolutionError> {
        let url = self
            .base_url
            .join(endpoint)
            .map_err(|_| ResolutionError::Malformed)?;
        debug!(%url, "resolving spatial reference");
        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(ResolutionError::Status { status, body });
        }
        res.json::<T>().await.map_err(|_| ResolutionError::Malformed)
    }
}

#[async_trait]
impl GeostoreService for GeostoreClient {
    async fn area(&self, area_id: &str) -> Result<AreaSummary, ResolutionError> {
        let res: AreaResponse = self.get_json(&format!("v2/area/{area_id}")).await?;
        Ok(res.data.attributes)
    }

    async fn geostore_id(&self, path: &GeostorePath) -> Result<String, ResolutionError> {
        let res: GeostoreResponse = self.get_json(&path.endpoint()).await?;
        if res.id.trim().is_empty() {
            return Err(ResolutionError::Malformed);
        }
        Ok(res.id)
    }
}
