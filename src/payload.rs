//! Assembles the language- and family-specific notification document.
//! Pure given its inputs; every external fact arrives as an argument.

use serde_json::{json, Map, Value};

use crate::classify::{PriorityAggregate, PriorityBucket};
use crate::config::{DatasetConfig, Links};
use crate::humanize::compact;
use crate::model::{
    AlertFamily, AlertWindow, DeliveryResource, EmailAddress, EmailRecipient, NotificationPayload,
    ResourceKind, Subscription,
};

const LANGUAGES: [&str; 6] = ["en", "es", "fr", "pt", "zh", "id"];
const DATE_FMT: &str = "%Y-%m-%d";

/// Normalize a requested language to a supported template language,
/// falling back to English. `pt_BR`-style tags reduce to their prefix.
pub fn normalize_language(requested: Option<&str>) -> &'static str {
    let lowered = requested.unwrap_or("en").trim().to_ascii_lowercase();
    let prefix = lowered.split(['-', '_']).next().unwrap_or("en");
    LANGUAGES.iter().find(|l| **l == prefix).copied().unwrap_or("en")
}

pub fn template_id(prefix: &str, language: &str) -> String {
    format!("{prefix}-{language}")
}

/// Locale-formatted calendar date for the notification body.
pub fn locale_date(language: &str, date: chrono::NaiveDate) -> String {
    let pattern = match language {
        "en" => "%m/%d/%Y",
        "zh" => "%Y-%m-%d",
        _ => "%d/%m/%Y",
    };
    date.format(pattern).to_string()
}

fn frequency_label(window: &AlertWindow) -> &'static str {
    match window.days() {
        i64::MIN..=1 => "daily",
        2..=7 => "weekly",
        8..=31 => "monthly",
        _ => "periodic",
    }
}

/// Fill a download/link template with the concrete geostore and window.
fn substitute_link(template: &str, geostore_id: &str, window: &AlertWindow) -> String {
    template
        .replace("{{geostore}}", geostore_id)
        .replace("{{begin}}", &window.begin.format(DATE_FMT).to_string())
        .replace("{{end}}", &window.end.format(DATE_FMT).to_string())
}

pub fn build(
    ds: &DatasetConfig,
    links: &Links,
    sender: &str,
    subscription: &Subscription,
    recipient: &DeliveryResource,
    language: &str,
    aggregate: &PriorityAggregate,
    window: &AlertWindow,
    geostore_id: &str,
) -> NotificationPayload {
    let begin = window.begin.format(DATE_FMT).to_string();
    let end = window.end.format(DATE_FMT).to_string();
    let map_link = format!(
        "{}/map/aoi?geostore={}&begin={}&end={}&lang={}",
        links.site_base, geostore_id, begin, end, language
    );

    let mut data = Map::new();
    data.insert("layer_slug".into(), json!(ds.slug));
    data.insert("alert_name".into(), json!(subscription.display_name()));
    data.insert("alert_link".into(), json!(map_link));
    data.insert(
        "unsubscribe_url".into(),
        json!(format!(
            "{}/v1/subscriptions/{}/unsubscribe?redirect=true&lang={}",
            links.api_base, subscription.id, language
        )),
    );
    data.insert(
        "subscriptions_url".into(),
        json!(format!("{}/my-forest/subscriptions?lang={}", links.site_base, language)),
    );

    data.insert("alert_date_begin".into(), json!(begin));
    data.insert("alert_date_end".into(), json!(end));
    data.insert(
        "formatted_alert_date_begin".into(),
        json!(locale_date(language, window.begin)),
    );
    data.insert(
        "formatted_alert_date_end".into(),
        json!(locale_date(language, window.end)),
    );

    data.insert("alert_count".into(), json!(aggregate.total_count()));
    data.insert(
        "formatted_alert_count".into(),
        json!(compact(aggregate.total_count() as f64)),
    );
    data.insert("alert_area_ha".into(), json!(aggregate.total_area_ha()));

    let mut raw_buckets = Map::new();
    let mut formatted_buckets = Map::new();
    let mut bucket_links = Map::new();
    for bucket in PriorityBucket::ALL {
        let totals = aggregate.bucket(bucket);
        raw_buckets.insert(bucket.as_str().into(), json!(totals.count));
        formatted_buckets.insert(bucket.as_str().into(), json!(compact(totals.count as f64)));
        bucket_links.insert(
            bucket.as_str().into(),
            json!(format!("{map_link}&category={}", bucket.as_str())),
        );
    }
    data.insert("priority_areas".into(), Value::Object(raw_buckets));
    data.insert("formatted_priority_areas".into(), Value::Object(formatted_buckets));
    data.insert("priority_area_links".into(), Value::Object(bucket_links));

    match ds.family {
        AlertFamily::Glad => {
            data.insert("frequency".into(), json!(frequency_label(window)));
            let mut downloads = Map::new();
            if let Some(csv) = &ds.download_csv {
                downloads.insert("csv".into(), json!(substitute_link(csv, geostore_id, window)));
            }
            if let Some(js) = &ds.download_json {
                downloads.insert("json".into(), json!(substitute_link(js, geostore_id, window)));
            }
            data.insert("download_urls".into(), Value::Object(downloads));
        }
        AlertFamily::Viirs => {
            data.insert("frequency".into(), json!(frequency_label(window)));
        }
        AlertFamily::Summary => {
            data.insert("alert_day_count".into(), json!(window.days()));
            data.insert(
                "alert_day_range".into(),
                json!(format!(
                    "{} to {}",
                    locale_date(language, window.begin),
                    locale_date(language, window.end)
                )),
            );
        }
    }

    let (recipients, webhook) = match recipient.kind {
        ResourceKind::Email => (
            vec![EmailRecipient {
                address: EmailAddress {
                    email: recipient.target.clone(),
                },
            }],
            None,
        ),
        ResourceKind::Url => (Vec::new(), Some(recipient.target.clone())),
    };

    NotificationPayload {
        template: template_id(&ds.template_prefix, language),
        sender: sender.to_string(),
        recipients,
        webhook,
        data,
    }
}
