//! WebSocket pub/sub channel. The channel offers no acknowledgement or
//! redelivery; a dropped connection loses whatever was in flight.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::future::Future;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

/// Subscribe and hand every text frame to `handler`, one at a time. A
/// message is fully processed before the next frame is read, so events are
/// never handled concurrently. Returns when the peer closes or errors.
pub async fn subscribe<F, Fut>(url: &str, channel: &str, handler: F) -> Result<()>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let (stream, _) = connect_async(url)
        .await
        .context("failed to connect to channel")?;
    let (mut write, mut read) = stream.split();

    let subscribe_frame = json!({ "action": "subscribe", "channel": channel }).to_string();
    write
        .send(Message::Text(subscribe_frame))
        .await
        .context("failed to subscribe")?;
    info!(channel, "subscribed to events channel");

    while let Some(frame) = read.next().await {
        match frame.context("channel stream error")? {
            Message::Text(text) => {
                debug!(bytes = text.len(), "received event frame");
                handler(text).await;
            }
            Message::Ping(data) => {
                write
                    .send(Message::Pong(data))
                    .await
                    .context("failed to answer ping")?;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Publish a single message to a channel and disconnect. Used by the
/// operator utility to inject hand-built events.
pub async fn publish_once(url: &str, channel: &str, data: &serde_json::Value) -> Result<()> {
    let (stream, _) = connect_async(url)
        .await
        .context("failed to connect to channel")?;
    let (mut write, _) = stream.split();
    let frame = json!({ "action": "publish", "channel": channel, "data": data }).to_string();
    write
        .send(Message::Text(frame))
        .await
        .context("failed to publish")?;
    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
