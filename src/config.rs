//! Configuration loader and validator for the alert dispatch service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::AlertFamily;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub channel: Channel,
    pub geostore: Service,
    pub alerts: Service,
    pub delivery: Service,
    pub links: Links,
    pub datasets: Vec<DatasetConfig>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    pub sender: String,
    pub default_language: String,
    #[serde(default)]
    pub stats_recipient: Option<String>,
}

/// Pub/sub channel the dispatcher subscribes to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub url: String,
    pub events: String,
    pub reconnect_seconds: u64,
}

/// One external HTTP collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub base_url: String,
}

/// Bases for the links embedded in notification payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Links {
    pub site_base: String,
    pub api_base: String,
}

/// Everything the pipeline needs to know about one subscribable dataset:
/// which physical datasets back each location scope, the query template,
/// and where this family hides its classification attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetConfig {
    pub slug: String,
    pub family: AlertFamily,
    pub template_prefix: String,
    pub datasets: DatasetIds,
    pub sql: String,
    pub fields: FieldBindings,
    #[serde(default)]
    pub filters: FilterColumns,
    #[serde(default)]
    pub download_csv: Option<String>,
    #[serde(default)]
    pub download_json: Option<String>,
}

/// Physical dataset ids per location scope. `geostore` is the generic
/// fallback; admin and WDPA specializations are optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetIds {
    pub geostore: String,
    #[serde(default)]
    pub admin: Option<String>,
    #[serde(default)]
    pub wdpa: Option<String>,
}

/// Attribute names this family uses for counts, areas and classification
/// flags. Families expose the same semantic flags under different column
/// names, so these are configuration rather than code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldBindings {
    pub count: String,
    pub area: String,
    pub protected_areas: String,
    pub plantations: String,
    pub peat: String,
    pub primary_forest: String,
    pub intact_forest: String,
}

/// Filter columns appended to the WHERE clause for admin/WDPA scopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterColumns {
    #[serde(default = "default_iso_col")]
    pub iso: String,
    #[serde(default = "default_adm1_col")]
    pub adm1: String,
    #[serde(default = "default_adm2_col")]
    pub adm2: String,
    #[serde(default = "default_wdpa_col")]
    pub wdpa: String,
}

fn default_iso_col() -> String {
    "iso".into()
}
fn default_adm1_col() -> String {
    "adm1".into()
}
fn default_adm2_col() -> String {
    "adm2".into()
}
fn default_wdpa_col() -> String {
    "wdpa_protected_area__id".into()
}

impl Default for FilterColumns {
    fn default() -> Self {
        Self {
            iso: default_iso_col(),
            adm1: default_adm1_col(),
            adm2: default_adm2_col(),
            wdpa: default_wdpa_col(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Dataset configuration for an event's layer slug.
    pub fn dataset(&self, slug: &str) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| d.slug == slug)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sender.trim().is_empty() {
        return Err(invalid("app.sender must be non-empty"));
    }
    if cfg.app.default_language.trim().is_empty() {
        return Err(invalid("app.default_language must be non-empty"));
    }

    if !cfg.channel.url.starts_with("ws://") && !cfg.channel.url.starts_with("wss://") {
        return Err(invalid("channel.url must be a ws:// or wss:// URL"));
    }
    if cfg.channel.events.trim().is_empty() {
        return Err(invalid("channel.events must be non-empty"));
    }
    if cfg.channel.reconnect_seconds == 0 {
        return Err(invalid("channel.reconnect_seconds must be > 0"));
    }

    for (name, service) in [
        ("geostore", &cfg.geostore),
        ("alerts", &cfg.alerts),
        ("delivery", &cfg.delivery),
    ] {
        if !service.base_url.starts_with("http://") && !service.base_url.starts_with("https://") {
            return Err(invalid(format!("{name}.base_url must be an http(s) URL")));
        }
    }

    if cfg.links.site_base.trim().is_empty() || cfg.links.api_base.trim().is_empty() {
        return Err(invalid("links.site_base and links.api_base must be non-empty"));
    }

    if cfg.datasets.is_empty() {
        return Err(invalid("at least one dataset must be configured"));
    }
    for ds in &cfg.datasets {
        if ds.slug.trim().is_empty() {
            return Err(invalid("datasets[].slug must be non-empty"));
        }
        if ds.template_prefix.trim().is_empty() {
            return Err(invalid(format!("dataset '{}': template_prefix must be non-empty", ds.slug)));
        }
        if ds.datasets.geostore.trim().is_empty() {
            return Err(invalid(format!("dataset '{}': datasets.geostore must be non-empty", ds.slug)));
        }
        if !ds.sql.contains("{{begin}}") && !ds.sql.contains("{{julianDayBegin}}") {
            return Err(invalid(format!("dataset '{}': sql must reference the begin date", ds.slug)));
        }
        if !ds.sql.contains("{{end}}") && !ds.sql.contains("{{julianDayEnd}}") {
            return Err(invalid(format!("dataset '{}': sql must reference the end date", ds.slug)));
        }
        let f = &ds.fields;
        for (field, value) in [
            ("count", &f.count),
            ("area", &f.area),
            ("protected_areas", &f.protected_areas),
            ("plantations", &f.plantations),
            ("peat", &f.peat),
            ("primary_forest", &f.primary_forest),
            ("intact_forest", &f.intact_forest),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("dataset '{}': fields.{field} must be non-empty", ds.slug)));
            }
        }
        if cfg.datasets.iter().filter(|d| d.slug == ds.slug).count() > 1 {
            return Err(invalid(format!("dataset slug '{}' is configured twice", ds.slug)));
        }
    }

    Ok(())
}

/// Example YAML configuration, kept in sync with `config.yaml`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sender: "forest-alerts"
  default_language: "en"
  stats_recipient:

channel:
  url: "ws://localhost:4001/channel"
  events: "dataset-updated"
  reconnect_seconds: 5

geostore:
  base_url: "https://api.example.org/"

alerts:
  base_url: "https://data-api.example.org/"

delivery:
  base_url: "https://mail-dispatch.example.org/"

links:
  site_base: "https://www.example.org"
  api_base: "https://api.example.org"

datasets:
  - slug: "glad-alerts"
    family: "glad"
    template_prefix: "forest-change-notification"
    datasets:
      geostore: "umd-glad-landsat-alerts"
      admin: "gadm-glad-adm-summary"
      wdpa: "wdpa-glad-summary"
    sql: >-
      SELECT * FROM data
      WHERE ((alert__year = {{yearBegin}} AND alert__julian_day >= {{julianDayBegin}})
         OR (alert__year = {{yearEnd}} AND alert__julian_day <= {{julianDayEnd}})
         OR (alert__year > {{yearBegin}} AND alert__year < {{yearEnd}}))
    fields:
      count: "alert__count"
      area: "alert_area__ha"
      protected_areas: "wdpa_protected_area__iucn_cat"
      plantations: "gfw_plantation__type"
      peat: "is__peatland"
      primary_forest: "is__umd_regional_primary_forest_2001"
      intact_forest: "is__ifl_intact_forest_landscape_2016"
    filters:
      iso: "iso"
      adm1: "adm1"
      adm2: "adm2"
      wdpa: "wdpa_protected_area__id"
    download_csv: "https://data-api.example.org/glad/download?geostore={{geostore}}&begin={{begin}}&end={{end}}&format=csv"
    download_json: "https://data-api.example.org/glad/download?geostore={{geostore}}&begin={{begin}}&end={{end}}&format=json"

  - slug: "viirs-active-fires"
    family: "viirs"
    template_prefix: "fire-alert-notification"
    datasets:
      geostore: "nasa-viirs-fire-alerts"
      admin: "gadm-viirs-adm-summary"
    sql: >-
      SELECT * FROM data
      WHERE alert__date >= '{{begin}}' AND alert__date <= '{{end}}'
    fields:
      count: "alert__count"
      area: "alert_area__ha"
      protected_areas: "wdpa_protected_area__iucn_cat"
      plantations: "is__gfw_plantation"
      peat: "is__peatland"
      primary_forest: "is__regional_primary_forest"
      intact_forest: "is__intact_forest_landscapes_2016"

  - slug: "monthly-summary"
    family: "summary"
    template_prefix: "monthly-summary-notification"
    datasets:
      geostore: "umd-loss-monthly-summary"
    sql: >-
      SELECT * FROM data
      WHERE alert_date >= '{{begin}}' AND alert_date <= '{{end}}'
    fields:
      count: "alert_count"
      area: "area_ha"
      protected_areas: "iucn_cat"
      plantations: "plantation_type"
      peat: "peat"
      primary_forest: "primary_forest"
      intact_forest: "intact_forest_landscape"
"#
}
