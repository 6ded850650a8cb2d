//! Error taxonomy preserved end-to-end.
//!
//! Every failure the engine stores on a handle or returns to a caller is
//! a [`NotifyError`] carrying an [`ErrorKind`]. Retry logic keys off the
//! kind alone, so adapters classify once at the edge and the engine never
//! re-inspects transport errors.

use std::sync::Arc;
use std::time::Duration;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Configuration
    InvalidConfig,
    MissingPlatform,
    InvalidCredentials,

    // Message / validation
    InvalidMessage,
    EmptyMessage,
    NoTargets,
    MessageTooLarge,
    InvalidTarget,
    UnsupportedTarget,

    // Platform state
    PlatformUnavailable,
    PlatformError,
    CapabilityMismatch,

    // Network / transport
    NetworkTimeout,
    ConnectionFailed,

    // Provider response
    RateLimitExceeded,
    Throttled,
    ServiceUnavailable,
    ProviderError,

    // Lifecycle
    Cancelled,
    Closed,
    QueueFull,

    // Internal
    AdapterFault,
    Internal,
}

impl ErrorKind {
    /// Whether the dispatcher may re-enqueue work that failed this way.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::PlatformUnavailable
                | ErrorKind::NetworkTimeout
                | ErrorKind::ConnectionFailed
                | ErrorKind::RateLimitExceeded
                | ErrorKind::Throttled
                | ErrorKind::ServiceUnavailable
                | ErrorKind::QueueFull
        )
    }

    /// snake_case name used on the wire and in result metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::MissingPlatform => "missing_platform",
            ErrorKind::InvalidCredentials => "invalid_credentials",
            ErrorKind::InvalidMessage => "invalid_message",
            ErrorKind::EmptyMessage => "empty_message",
            ErrorKind::NoTargets => "no_targets",
            ErrorKind::MessageTooLarge => "message_too_large",
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::UnsupportedTarget => "unsupported_target",
            ErrorKind::PlatformUnavailable => "platform_unavailable",
            ErrorKind::PlatformError => "platform_error",
            ErrorKind::CapabilityMismatch => "capability_mismatch",
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::Throttled => "throttled",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Closed => "closed",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::AdapterFault => "adapter_fault",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure with optional platform/target context, a
/// rate-limit hint, and a cause chain.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct NotifyError {
    pub kind: ErrorKind,
    pub message: String,
    pub platform: Option<String>,
    pub target: Option<String>,
    /// Provider-supplied hint for rate-limit errors.
    pub retry_after: Option<Duration>,
    #[source]
    pub source: Option<Arc<NotifyError>>,
}

impl NotifyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            platform: None,
            target: None,
            retry_after: None,
            source: None,
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_target(mut self, target: impl std::fmt::Display) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_source(mut self, source: NotifyError) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled")
    }

    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed, "client is closed")
    }

    pub fn queue_full() -> Self {
        Self::new(ErrorKind::QueueFull, "worker pool queue is full")
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::new(ErrorKind::RateLimitExceeded, "rate limit exceeded")
            .with_retry_after(retry_after)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

// Wire format: {kind, message, retryable, retryAfter?} — retryAfter in
// milliseconds, omitted when absent.
impl Serialize for NotifyError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.retry_after.is_some() { 4 } else { 3 };
        let mut s = serializer.serialize_struct("NotifyError", fields)?;
        s.serialize_field("kind", self.kind.as_str())?;
        s.serialize_field("message", &self.message)?;
        s.serialize_field("retryable", &self.retryable())?;
        if let Some(retry_after) = self.retry_after {
            s.serialize_field("retryAfter", &(retry_after.as_millis() as u64))?;
        }
        s.end()
    }
}

/// Collects per-target failures for user display.
#[derive(Debug, Clone, Default, Error)]
pub struct AggregateError {
    pub errors: Vec<NotifyError>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: NotifyError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` iff no child error was collected.
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.errors[0]),
            n => {
                write!(f, "{} errors: ", n)?;
                for (i, e) in self.errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
        }
    }
}
