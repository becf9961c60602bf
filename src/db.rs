use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{instrument, warn};

use crate::model::{
    CursorPoint, DatasetCursor, DeliveryResource, ResourceKind, Subscription, SubscriptionParams,
};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, make sure the parent directory exists.
/// In-memory URLs and other schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Fixture/seed helper: real subscription writes belong to the external
/// subscription API.
#[instrument(skip_all)]
pub async fn insert_subscription(pool: &Pool, sub: &Subscription) -> Result<()> {
    let params = serde_json::to_string(&sub.params)?;
    sqlx::query(
        "INSERT INTO subscriptions
            (id, user_id, name, confirmed, language, resource_kind, resource_target, params, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&sub.id)
    .bind(&sub.user_id)
    .bind(&sub.name)
    .bind(sub.confirmed as i64)
    .bind(&sub.language)
    .bind(sub.resource.kind.as_str())
    .bind(&sub.resource.target)
    .bind(params)
    .bind(sub.created_at)
    .execute(pool)
    .await?;

    for slug in &sub.datasets {
        sqlx::query(
            "INSERT INTO subscription_datasets (subscription_id, dataset_slug) VALUES (?, ?)",
        )
        .bind(&sub.id)
        .bind(slug)
        .execute(pool)
        .await?;
    }
    Ok(())
}

fn map_subscription(row: &SqliteRow, datasets: Vec<String>) -> Result<Subscription> {
    let id: String = row.get("id");
    let kind_raw: String = row.get("resource_kind");
    let kind = ResourceKind::parse(&kind_raw)
        .ok_or_else(|| anyhow!("subscription {id}: unknown resource kind '{kind_raw}'"))?;

    let params_raw: String = row.get("params");
    let params: SubscriptionParams = match serde_json::from_str(&params_raw) {
        Ok(p) => p,
        Err(err) => {
            // Legacy rows sometimes carry junk params; an empty spec just
            // fails resolution for that one subscription later.
            warn!(subscription = %id, ?err, "unreadable subscription params");
            SubscriptionParams::default()
        }
    };

    Ok(Subscription {
        user_id: row.get("user_id"),
        name: row.get("name"),
        confirmed: row.get::<i64, _>("confirmed") != 0,
        language: row.get("language"),
        resource: DeliveryResource {
            kind,
            target: row.get("resource_target"),
        },
        params,
        datasets,
        created_at: row.get("created_at"),
        id,
    })
}

async fn datasets_for(pool: &Pool, sub_id: &str) -> Result<Vec<String>> {
    let slugs = sqlx::query_scalar::<_, String>(
        "SELECT dataset_slug FROM subscription_datasets WHERE subscription_id = ? ORDER BY dataset_slug",
    )
    .bind(sub_id)
    .fetch_all(pool)
    .await?;
    Ok(slugs)
}

/// Confirmed subscriptions referencing a dataset slug, ordered by creation.
#[instrument(skip_all)]
pub async fn confirmed_for_dataset(pool: &Pool, slug: &str) -> Result<Vec<Subscription>> {
    let rows = sqlx::query(
        "SELECT s.* FROM subscriptions s
         JOIN subscription_datasets d ON d.subscription_id = s.id
         WHERE d.dataset_slug = ? AND s.confirmed = 1
         ORDER BY s.created_at, s.id",
    )
    .bind(slug)
    .fetch_all(pool)
    .await?;

    let mut subs = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.get("id");
        let datasets = datasets_for(pool, &id).await?;
        subs.push(map_subscription(row, datasets)?);
    }
    Ok(subs)
}

#[instrument(skip_all)]
pub async fn subscription_by_id(pool: &Pool, id: &str) -> Result<Option<Subscription>> {
    let row = sqlx::query("SELECT * FROM subscriptions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            let datasets = datasets_for(pool, id).await?;
            Ok(Some(map_subscription(&row, datasets)?))
        }
        None => Ok(None),
    }
}

#[instrument(skip_all)]
pub async fn cursor(pool: &Pool, sub_id: &str, slug: &str) -> Result<Option<DatasetCursor>> {
    let row = sqlx::query(
        "SELECT last_sent, historical FROM dataset_cursors
         WHERE subscription_id = ? AND dataset_slug = ?",
    )
    .bind(sub_id)
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let historical_raw: String = row.get("historical");
    let historical: Vec<CursorPoint> = serde_json::from_str(&historical_raw).unwrap_or_default();
    Ok(Some(DatasetCursor {
        dataset_slug: slug.to_string(),
        last_sent: row.get("last_sent"),
        historical,
    }))
}

/// Record a successful notification: bump `last_sent` and append to the
/// historical series. Runs after publish, never before, so a crash between
/// the two re-notifies rather than losing a window.
#[instrument(skip_all)]
pub async fn advance_cursor(
    pool: &Pool,
    sub_id: &str,
    slug: &str,
    sent_at: DateTime<Utc>,
    value: f64,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let existing: Option<String> = sqlx::query_scalar(
        "SELECT historical FROM dataset_cursors
         WHERE subscription_id = ? AND dataset_slug = ?",
    )
    .bind(sub_id)
    .bind(slug)
    .fetch_optional(&mut *tx)
    .await?;

    let mut historical: Vec<CursorPoint> = existing
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    historical.push(CursorPoint {
        date: sent_at,
        value,
    });
    let historical_raw = serde_json::to_string(&historical)?;

    if existing.is_some() {
        sqlx::query(
            "UPDATE dataset_cursors SET last_sent = ?, historical = ?
             WHERE subscription_id = ? AND dataset_slug = ?",
        )
        .bind(sent_at)
        .bind(historical_raw)
        .bind(sub_id)
        .bind(slug)
        .execute(&mut *tx)
        .await?;
    } else {
        sqlx::query(
            "INSERT INTO dataset_cursors (subscription_id, dataset_slug, last_sent, historical)
             VALUES (?, ?, ?, ?)",
        )
        .bind(sub_id)
        .bind(slug)
        .bind(sent_at)
        .bind(historical_raw)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Dataset slugs referenced by any confirmed subscription. Input to the
/// reconciliation mode.
#[instrument(skip_all)]
pub async fn distinct_dataset_slugs(pool: &Pool) -> Result<Vec<String>> {
    let slugs = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT d.dataset_slug FROM subscription_datasets d
         JOIN subscriptions s ON s.id = d.subscription_id
         WHERE s.confirmed = 1
         ORDER BY d.dataset_slug",
    )
    .fetch_all(pool)
    .await?;
    Ok(slugs)
}
