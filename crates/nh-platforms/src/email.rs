//! SMTP email adapter over lettre's async transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use nh_common::{
    Capabilities, ErrorKind, Message, MessageFormat, NotifyError, SendResult, Target, TargetType,
};
use nh_dispatch::Platform;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailConfig {
    pub smtp_host: String,
    /// 0 keeps the transport's default for the chosen TLS mode.
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sender address, e.g. `NotifyHub <notify@example.com>`.
    pub from: String,
    /// STARTTLS on the submission port (default) versus implicit TLS.
    pub use_starttls: bool,
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: 0,
            username: None,
            password: None,
            from: String::new(),
            use_starttls: true,
            timeout_secs: 30,
        }
    }
}

/// Factory for the registry: interprets the opaque config value.
pub fn email_factory(value: &serde_json::Value) -> Result<Arc<dyn Platform>, NotifyError> {
    let config: EmailConfig = serde_json::from_value(value.clone()).map_err(|e| {
        NotifyError::new(
            ErrorKind::InvalidConfig,
            format!("invalid email config: {}", e),
        )
        .with_platform("email")
    })?;
    Ok(Arc::new(EmailPlatform::new(config)?))
}

pub struct EmailPlatform {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailPlatform {
    pub fn new(config: EmailConfig) -> Result<Self, NotifyError> {
        if config.smtp_host.trim().is_empty() {
            return Err(NotifyError::new(
                ErrorKind::InvalidConfig,
                "smtpHost must not be empty",
            )
            .with_platform("email"));
        }
        let from: Mailbox = config.from.parse().map_err(|e| {
            NotifyError::new(
                ErrorKind::InvalidConfig,
                format!("invalid from address {}: {}", config.from, e),
            )
            .with_platform("email")
        })?;

        let builder = if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        }
        .map_err(|e| {
            NotifyError::new(
                ErrorKind::InvalidConfig,
                format!("SMTP relay setup failed: {}", e),
            )
            .with_platform("email")
        })?;

        let mut builder = builder.timeout(Some(Duration::from_secs(config.timeout_secs.max(1))));
        if config.smtp_port != 0 {
            builder = builder.port(config.smtp_port);
        }
        if let (Some(username), Some(password)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

fn classify_smtp_error(error: &lettre::transport::smtp::Error) -> NotifyError {
    if error.is_transient() {
        NotifyError::new(
            ErrorKind::ServiceUnavailable,
            format!("transient SMTP failure: {}", error),
        )
    } else if error.is_permanent() {
        NotifyError::new(
            ErrorKind::ProviderError,
            format!("permanent SMTP failure: {}", error),
        )
    } else {
        NotifyError::new(
            ErrorKind::ConnectionFailed,
            format!("SMTP connection failed: {}", error),
        )
    }
}

#[async_trait]
impl Platform for EmailPlatform {
    fn name(&self) -> &str {
        "email"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            target_types: vec![TargetType::Email],
            formats: vec![MessageFormat::Text, MessageFormat::Html],
            max_message_size: 0,
            supports_scheduling: false,
            supports_attachments: false,
            required_settings: vec!["smtpHost".into(), "from".into()],
        }
    }

    fn validate_target(&self, target: &Target) -> Result<(), NotifyError> {
        target.value.parse::<Mailbox>().map(|_| ()).map_err(|e| {
            NotifyError::new(
                ErrorKind::InvalidTarget,
                format!("invalid email address {}: {}", target.value, e),
            )
        })
    }

    async fn send(
        &self,
        message: &Message,
        targets: &[Target],
    ) -> Result<Vec<SendResult>, NotifyError> {
        let content_type = match message.format {
            MessageFormat::Html => ContentType::TEXT_HTML,
            MessageFormat::Text | MessageFormat::Markdown => ContentType::TEXT_PLAIN,
        };

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let started = Instant::now();

            let to: Mailbox = match target.value.parse() {
                Ok(mailbox) => mailbox,
                Err(e) => {
                    results.push(SendResult::failed(
                        target.clone(),
                        NotifyError::new(
                            ErrorKind::InvalidTarget,
                            format!("invalid email address: {}", e),
                        ),
                        started.elapsed(),
                    ));
                    continue;
                }
            };

            let email = match lettre::Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(message.title.clone())
                .header(content_type.clone())
                .body(message.body.clone())
            {
                Ok(email) => email,
                Err(e) => {
                    results.push(SendResult::failed(
                        target.clone(),
                        NotifyError::internal(format!("failed to build email: {}", e)),
                        started.elapsed(),
                    ));
                    continue;
                }
            };

            match self.transport.send(email).await {
                Ok(response) => {
                    debug!(message_id = %message.id, to = %target.value, "email accepted");
                    results.push(
                        SendResult::ok(target.clone(), None, started.elapsed())
                            .with_response(response.code().to_string()),
                    );
                }
                Err(error) => {
                    warn!(
                        message_id = %message.id,
                        to = %target.value,
                        error = %error,
                        "email delivery failed"
                    );
                    results.push(SendResult::failed(
                        target.clone(),
                        classify_smtp_error(&error),
                        started.elapsed(),
                    ));
                }
            }
        }
        Ok(results)
    }

    async fn is_healthy(&self) -> Result<(), NotifyError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(NotifyError::new(
                ErrorKind::ConnectionFailed,
                "SMTP server rejected the connection probe",
            )),
            Err(error) => Err(classify_smtp_error(&error)),
        }
    }

    async fn close(&self) -> Result<(), NotifyError> {
        // The transport's connection pool drops with the instance.
        Ok(())
    }

    /// Bucket rate limits per recipient domain.
    fn rate_limit_key(&self, target: &Target) -> Option<String> {
        target
            .value
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .map(|domain| domain.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> EmailPlatform {
        EmailPlatform::new(EmailConfig {
            smtp_host: "smtp.example.com".into(),
            from: "NotifyHub <notify@example.com>".into(),
            ..EmailConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn factory_rejects_missing_host() {
        let err = email_factory(&serde_json::json!({ "from": "a@b.com" })).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[test]
    fn factory_rejects_bad_from_address() {
        let err = email_factory(&serde_json::json!({
            "smtpHost": "smtp.example.com",
            "from": "not-an-address"
        }))
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[test]
    fn validate_target_checks_address_syntax() {
        let platform = platform();
        assert!(platform.validate_target(&Target::email("ops@example.com")).is_ok());
        assert!(platform.validate_target(&Target::email("not an address")).is_err());
    }

    #[test]
    fn rate_limit_key_is_the_recipient_domain() {
        let platform = platform();
        assert_eq!(
            platform.rate_limit_key(&Target::email("Ops@Example.COM")),
            Some("example.com".to_string())
        );
        assert_eq!(platform.rate_limit_key(&Target::email("nodomain")), None);
    }
}
