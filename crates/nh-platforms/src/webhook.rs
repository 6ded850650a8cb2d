//! Generic HTTP webhook adapter.
//!
//! Each webhook target carries its own URL; the adapter posts a JSON
//! rendering of the message to every target and classifies the response
//! into the engine's error taxonomy. When a signing secret is
//! configured, requests carry HMAC-SHA256 signature headers over
//! timestamp + body. Retries are the engine's business: one call here
//! is exactly one HTTP attempt per target.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use nh_common::{
    Capabilities, ErrorKind, Message, MessageFormat, NotifyError, SendResult, Target, TargetType,
};
use nh_dispatch::Platform;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

/// Webhook signature header.
pub const SIGNATURE_HEADER: &str = "X-NOTIFYHUB-SIGNATURE";
/// Webhook signature timestamp header.
pub const TIMESTAMP_HEADER: &str = "X-NOTIFYHUB-TIMESTAMP";

type HmacSha256 = Hmac<Sha256>;

/// Sign `payload` with HMAC-SHA256 over timestamp + body.
/// Returns (hex signature, ISO8601 timestamp).
fn sign_payload(payload: &str, signing_secret: &str) -> (String, String) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let signature_payload = format!("{}{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts keys of any size");
    mac.update(signature_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    (signature, timestamp)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Secret for HMAC-SHA256 request signing; unsigned when absent.
    pub signing_secret: Option<String>,
    /// Static headers added to every request.
    pub headers: HashMap<String, String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            signing_secret: None,
            headers: HashMap::new(),
        }
    }
}

/// Factory for the registry: interprets the opaque config value.
pub fn webhook_factory(value: &serde_json::Value) -> Result<Arc<dyn Platform>, NotifyError> {
    let config: WebhookConfig = serde_json::from_value(value.clone()).map_err(|e| {
        NotifyError::new(
            ErrorKind::InvalidConfig,
            format!("invalid webhook config: {}", e),
        )
        .with_platform("webhook")
    })?;
    Ok(Arc::new(WebhookPlatform::new(config)?))
}

#[derive(Debug)]
pub struct WebhookPlatform {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookPlatform {
    pub fn new(config: WebhookConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                NotifyError::new(
                    ErrorKind::InvalidConfig,
                    format!("failed to build HTTP client: {}", e),
                )
                .with_platform("webhook")
            })?;
        Ok(Self { client, config })
    }

    /// JSON body for one message. A `platform_data["webhook"]` entry
    /// replaces the default rendering wholesale.
    fn payload(&self, message: &Message) -> serde_json::Value {
        if let Some(custom) = message.platform_data.get("webhook") {
            return custom.clone();
        }
        serde_json::json!({
            "id": message.id,
            "title": message.title,
            "body": message.body,
            "format": message.format,
            "priority": message.priority,
            "metadata": message.metadata,
            "variables": message.variables,
            "createdAt": message.created_at,
        })
    }

    async fn deliver(&self, url: &str, body: &str) -> Result<(Option<String>, String), NotifyError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");

        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        if let Some(secret) = &self.config.signing_secret {
            let (signature, timestamp) = sign_payload(body, secret);
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        let response = request.body(body.to_string()).send().await.map_err(|e| {
            if e.is_timeout() {
                NotifyError::new(ErrorKind::NetworkTimeout, "webhook request timed out")
            } else if e.is_connect() {
                NotifyError::new(
                    ErrorKind::ConnectionFailed,
                    format!("connection failed: {}", e),
                )
            } else {
                NotifyError::new(ErrorKind::ConnectionFailed, format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // Providers that answer with JSON may hand back their own id.
            let message_id = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| {
                    v.get("messageId")
                        .or_else(|| v.get("message_id"))
                        .and_then(|id| id.as_str().map(str::to_string))
                });
            return Ok((message_id, text));
        }

        let error = match status_code {
            401 | 403 => NotifyError::new(
                ErrorKind::InvalidCredentials,
                format!("HTTP {}: authentication rejected", status_code),
            ),
            429 => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(30);
                warn!(url = %url, retry_after_secs = retry_after, "webhook rate limited");
                NotifyError::rate_limited(Duration::from_secs(retry_after))
            }
            code if status.is_client_error() => NotifyError::new(
                ErrorKind::ProviderError,
                format!("HTTP {}: client error", code),
            ),
            code if status.is_server_error() => NotifyError::new(
                ErrorKind::ServiceUnavailable,
                format!("HTTP {}: server error", code),
            ),
            code => NotifyError::new(
                ErrorKind::ProviderError,
                format!("HTTP {}: unexpected status", code),
            ),
        };
        Err(error)
    }
}

#[async_trait]
impl Platform for WebhookPlatform {
    fn name(&self) -> &str {
        "webhook"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            target_types: vec![TargetType::Webhook],
            formats: vec![
                MessageFormat::Text,
                MessageFormat::Markdown,
                MessageFormat::Html,
            ],
            max_message_size: 0,
            supports_scheduling: false,
            supports_attachments: false,
            required_settings: vec![],
        }
    }

    fn validate_target(&self, target: &Target) -> Result<(), NotifyError> {
        let url = reqwest::Url::parse(&target.value).map_err(|e| {
            NotifyError::new(ErrorKind::InvalidTarget, format!("invalid webhook URL: {}", e))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(NotifyError::new(
                ErrorKind::InvalidTarget,
                format!("unsupported URL scheme {}", scheme),
            )),
        }
    }

    async fn send(
        &self,
        message: &Message,
        targets: &[Target],
    ) -> Result<Vec<SendResult>, NotifyError> {
        let body = self.payload(message).to_string();
        let mut results = Vec::with_capacity(targets.len());

        for target in targets {
            let started = Instant::now();
            match self.deliver(&target.value, &body).await {
                Ok((message_id, response)) => {
                    debug!(
                        message_id = %message.id,
                        url = %target.value,
                        "webhook delivered"
                    );
                    let mut result =
                        SendResult::ok(target.clone(), message_id, started.elapsed());
                    if !response.is_empty() {
                        result = result.with_response(response);
                    }
                    results.push(result);
                }
                Err(error) => {
                    warn!(
                        message_id = %message.id,
                        url = %target.value,
                        error = %error,
                        "webhook delivery failed"
                    );
                    results.push(SendResult::failed(target.clone(), error, started.elapsed()));
                }
            }
        }
        Ok(results)
    }

    async fn is_healthy(&self) -> Result<(), NotifyError> {
        // Targets carry their own URLs; there is no single endpoint to
        // probe, so liveness is the client's ability to make requests.
        Ok(())
    }

    async fn close(&self) -> Result<(), NotifyError> {
        Ok(())
    }

    /// Bucket rate limits per destination host.
    fn rate_limit_key(&self, target: &Target) -> Option<String> {
        reqwest::Url::parse(&target.value)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }
}
