use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use forest_dispatch::alerts::AlertQueryClient;
use forest_dispatch::delivery::DeliveryClient;
use forest_dispatch::geostore::GeostoreClient;
use forest_dispatch::pipeline::Pipeline;
use forest_dispatch::{channel, config, db};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/dispatch.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let geostore = GeostoreClient::new(
        Url::parse(&cfg.geostore.base_url).context("invalid geostore.base_url")?,
    );
    let alerts = AlertQueryClient::new(
        Url::parse(&cfg.alerts.base_url).context("invalid alerts.base_url")?,
    );
    let delivery = DeliveryClient::new(
        Url::parse(&cfg.delivery.base_url).context("invalid delivery.base_url")?,
    );

    let cfg = Arc::new(cfg);
    let pipeline = Arc::new(Pipeline::new(
        pool,
        Arc::new(geostore),
        Arc::new(alerts),
        Arc::new(delivery),
        cfg.clone(),
    ));

    info!("starting dispatch consumer");
    let reconnect = Duration::from_secs(cfg.channel.reconnect_seconds);
    loop {
        let pipeline = pipeline.clone();
        let result = channel::subscribe(&cfg.channel.url, &cfg.channel.events, |raw| {
            let pipeline = pipeline.clone();
            async move {
                match pipeline.handle_message(&raw).await {
                    Ok(report) => info!(
                        layer = %report.layer_slug,
                        matched = report.matched,
                        notified = report.notified,
                        failed = report.failures.len(),
                        "event processed"
                    ),
                    Err(err) => error!(?err, "event discarded"),
                }
            }
        })
        .await;

        match result {
            Ok(()) => warn!("channel closed; reconnecting"),
            Err(err) => error!(?err, "channel error; reconnecting"),
        }
        tokio::time::sleep(reconnect).await;
    }
}
