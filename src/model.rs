use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Dataset family an inbound event belongs to. Determines the backing
/// datasets, the attribute schema and the notification template family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertFamily {
    Glad,
    Viirs,
    Summary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceKind {
    #[serde(rename = "EMAIL")]
    Email,
    #[serde(rename = "URL")]
    Url,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Email => "EMAIL",
            ResourceKind::Url => "URL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "EMAIL" => Some(ResourceKind::Email),
            "URL" => Some(ResourceKind::Url),
            _ => None,
        }
    }
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// Where a subscription's notifications go: a mailbox or a webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryResource {
    pub kind: ResourceKind,
    pub target: String,
}

impl DeliveryResource {
    pub fn email(address: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Email,
            target: address.into(),
        }
    }

    pub fn webhook(url: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Url,
            target: url.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.kind {
            ResourceKind::Email => EMAIL_RE.is_match(&self.target),
            ResourceKind::Url => {
                self.target.starts_with("http://") || self.target.starts_with("https://")
            }
        }
    }
}

/// ISO admin reference; `subregion` is only meaningful under a `region`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminArea {
    pub country: String,
    pub region: Option<String>,
    pub subregion: Option<String>,
}

/// The duck-typed `params` object carried by legacy subscription rows.
/// Any mix of fields may be present; `LocationSpec::from_params` applies
/// the documented precedence exactly once at read time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionParams {
    #[serde(default)]
    pub geostore: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub iso: Option<IsoParams>,
    #[serde(default)]
    pub wdpaid: Option<i64>,
    #[serde(default, rename = "use")]
    pub use_name: Option<String>,
    #[serde(default, rename = "useid")]
    pub use_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IsoParams {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub subregion: Option<String>,
}

/// A subscription's area of interest, reduced to exactly one variant.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationSpec {
    Geostore(String),
    SavedArea(String),
    Admin(AdminArea),
    ProtectedArea(i64),
    Use { name: String, id: i64 },
}

fn nonempty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

impl LocationSpec {
    /// Collapse legacy params into one variant. Precedence, first match
    /// wins: geostore > saved area > ISO admin > WDPA > named use. Stale
    /// lower-precedence fields on the same row are ignored.
    pub fn from_params(params: &SubscriptionParams) -> Option<Self> {
        if let Some(id) = nonempty(&params.geostore) {
            return Some(LocationSpec::Geostore(id));
        }
        if let Some(id) = nonempty(&params.area) {
            return Some(LocationSpec::SavedArea(id));
        }
        if let Some(iso) = &params.iso {
            if let Some(country) = nonempty(&iso.country) {
                let region = nonempty(&iso.region);
                let subregion = if region.is_some() {
                    nonempty(&iso.subregion)
                } else {
                    None
                };
                return Some(LocationSpec::Admin(AdminArea {
                    country,
                    region,
                    subregion,
                }));
            }
        }
        if let Some(wdpa) = params.wdpaid.filter(|id| *id > 0) {
            return Some(LocationSpec::ProtectedArea(wdpa));
        }
        if let (Some(name), Some(id)) = (nonempty(&params.use_name), params.use_id) {
            return Some(LocationSpec::Use { name, id });
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub confirmed: bool,
    pub language: Option<String>,
    pub resource: DeliveryResource,
    pub params: SubscriptionParams,
    pub datasets: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn location(&self) -> Option<LocationSpec> {
        LocationSpec::from_params(&self.params)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("your area of interest")
    }
}

/// Per-subscription, per-dataset incremental state.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetCursor {
    pub dataset_slug: String,
    pub last_sent: Option<DateTime<Utc>>,
    pub historical: Vec<CursorPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorPoint {
    pub date: DateTime<Utc>,
    pub value: f64,
}

/// Slug of the generic "a dataset definition changed" event, which runs
/// the reconciliation mode instead of the alert path.
pub const RECONCILIATION_SLUG: &str = "dataset";

/// One message from the events channel. Not persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub layer_slug: String,
    #[serde(deserialize_with = "de_event_date")]
    pub begin_date: NaiveDate,
    #[serde(deserialize_with = "de_event_date")]
    pub end_date: NaiveDate,
    #[serde(default, rename = "isTest")]
    pub is_test: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "type")]
    pub resource_type: Option<String>,
    #[serde(default, rename = "subId")]
    pub sub_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl InboundEvent {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn window(&self) -> AlertWindow {
        AlertWindow {
            begin: self.begin_date,
            end: self.end_date,
        }
    }

    /// Recipient forced by the event's test-override fields, if any.
    pub fn recipient_override(&self) -> Option<DeliveryResource> {
        match self.resource_type.as_deref() {
            Some("EMAIL") => self.email.clone().map(DeliveryResource::email),
            Some("URL") => self.url.clone().map(DeliveryResource::webhook),
            _ => self
                .url
                .clone()
                .map(DeliveryResource::webhook)
                .or_else(|| self.email.clone().map(DeliveryResource::email)),
        }
    }

    /// Any override field makes this a test run: matching may be bypassed
    /// and cursors are never advanced.
    pub fn is_override(&self) -> bool {
        self.is_test || self.sub_id.is_some() || self.email.is_some() || self.url.is_some()
    }
}

/// Events carry either plain dates or full timestamps; either way only the
/// calendar date matters downstream.
fn de_event_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_event_date(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_event_date(raw: &str) -> Result<NaiveDate, String> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .map_err(|err| format!("unparseable date '{raw}': {err}"))
}

/// Inclusive date window an event covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertWindow {
    pub begin: NaiveDate,
    pub end: NaiveDate,
}

impl AlertWindow {
    pub fn days(&self) -> i64 {
        (self.end - self.begin).num_days() + 1
    }
}

/// One row of an alerts query response. Attribute names vary per dataset
/// family, so the row stays an open map and callers read configured fields.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord(pub Map<String, Value>);

impl AlertRecord {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(AlertRecord(map)),
            _ => None,
        }
    }

    /// Alert count for this row; a row without the configured count column
    /// stands for a single alert.
    pub fn count(&self, field: &str) -> u64 {
        match self.0.get(field) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f.round().max(0.0) as u64))
                .unwrap_or(1),
            _ => 1,
        }
    }

    pub fn area_ha(&self, field: &str) -> f64 {
        match self.0.get(field) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Boolean-ish classification flag. Backing datasets encode these as
    /// true booleans, 0/1 integers or "true"/"t" strings.
    pub fn flag(&self, field: &str) -> bool {
        match self.0.get(field) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Some(Value::String(s)) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "t" | "yes" | "1"
            ),
            _ => false,
        }
    }

    /// Categorical classification attribute, e.g. an IUCN category or a
    /// plantation type. Present means non-null and non-empty.
    pub fn label(&self, field: &str) -> Option<String> {
        match self.0.get(field) {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_owned())
                }
            }
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmailAddress {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmailRecipient {
    pub address: EmailAddress,
}

/// The document handed to the delivery collaborator.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NotificationPayload {
    pub template: String,
    pub sender: String,
    pub recipients: Vec<EmailRecipient>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    pub data: Map<String, Value>,
}
