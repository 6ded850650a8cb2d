//! NotifyHub demo
//!
//! Sends one notification to a webhook endpoint and prints the receipt.
//!
//! ## Environment
//!
//! - `NOTIFYHUB_WEBHOOK_URL` (required): destination webhook URL
//! - `NOTIFYHUB_SIGNING_SECRET` (optional): HMAC-SHA256 request signing
//! - `LOG_FORMAT=json` / `RUST_LOG` control logging output

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nh_common::{Message, RoutingRule, Target};
use nh_dispatch::{Client, Registry};
use nh_platforms::webhook::webhook_factory;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (for local development).
    let _ = dotenvy::dotenv();

    nh_common::logging::try_init();

    let webhook_url = std::env::var("NOTIFYHUB_WEBHOOK_URL")
        .context("NOTIFYHUB_WEBHOOK_URL must point at a webhook endpoint")?;
    let signing_secret = std::env::var("NOTIFYHUB_SIGNING_SECRET").ok();

    let mut webhook_config = serde_json::json!({ "timeoutSecs": 10 });
    if let Some(secret) = signing_secret {
        webhook_config["signingSecret"] = serde_json::Value::String(secret);
    }

    let registry = Arc::new(Registry::new());
    registry.register("webhook", webhook_config, webhook_factory)?;

    let client = Client::builder()
        .registry(registry)
        .rule(RoutingRule::wildcard().primary(["webhook"]).priority(1))
        .build()?;

    info!(url = %webhook_url, "sending demo notification");

    let message = Message::builder()
        .title("NotifyHub demo")
        .body("Hello from the dispatch engine.")
        .target(Target::webhook(webhook_url))
        .build();

    let receipt = client.send(message).await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);

    client
        .close(Duration::from_secs(5))
        .await
        .map_err(|e| anyhow::anyhow!("close reported platform errors: {}", e))?;
    Ok(())
}
