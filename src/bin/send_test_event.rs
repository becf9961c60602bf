//! Publish a hand-built "dataset updated" event to the channel, marked as
//! a test so no cursors move. Useful for checking templates end to end.

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;

use forest_dispatch::{channel, config};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Dataset slug to trigger, e.g. glad-alerts
    #[arg(long)]
    slug: String,

    /// Window begin date (YYYY-MM-DD)
    #[arg(long)]
    begin: String,

    /// Window end date (YYYY-MM-DD)
    #[arg(long)]
    end: String,

    /// Send the resulting notification to this address instead
    #[arg(long)]
    email: Option<String>,

    /// Run only this subscription id
    #[arg(long)]
    sub_id: Option<String>,

    /// Force a template language
    #[arg(long)]
    language: Option<String>,
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

    let mut event = json!({
        "layer_slug": args.slug,
        "begin_date": args.begin,
        "end_date": args.end,
        "isTest": true,
    });
    if let Some(email) = args.email {
        event["email"] = json!(email);
        event["type"] = json!("EMAIL");
    }
    if let Some(sub_id) = args.sub_id {
        event["subId"] = json!(sub_id);
    }
    if let Some(language) = args.language {
        event["language"] = json!(language);
    }

    channel::publish_once(&cfg.channel.url, &cfg.channel.events, &event).await?;
    println!("published test event to '{}'", cfg.channel.events);
    Ok(())
}
