//! Platform adapter contract.
//!
//! An adapter knows how to talk to one external notification provider.
//! The engine depends on nothing beyond this trait: adapter-specific
//! config stays opaque (`serde_json::Value`) and is interpreted by the
//! factory that built the adapter.

use std::sync::Arc;

use async_trait::async_trait;
use nh_common::{Capabilities, Message, NotifyError, SendResult, Target};

/// One external notification provider.
#[async_trait]
pub trait Platform: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Target-level validation beyond the declared capabilities
    /// (address syntax, URL scheme, ...).
    fn validate_target(&self, target: &Target) -> Result<(), NotifyError>;

    /// Deliver `message` to `targets` in one provider call.
    ///
    /// The returned slice must align positionally with `targets`.
    /// `Err` signals a whole-call failure (network level); the engine
    /// then applies the error to every target of the call.
    async fn send(
        &self,
        message: &Message,
        targets: &[Target],
    ) -> Result<Vec<SendResult>, NotifyError>;

    /// Cheap liveness probe used to restore an unhealthy platform.
    async fn is_healthy(&self) -> Result<(), NotifyError>;

    /// Idempotent cleanup.
    async fn close(&self) -> Result<(), NotifyError>;

    /// Finer-grained rate-limit bucket for a target (e.g. recipient
    /// domain). `None` uses the platform-wide bucket.
    fn rate_limit_key(&self, _target: &Target) -> Option<String> {
        None
    }
}

/// Constructor registered with the registry. The factory owns the
/// interpretation of the opaque config value.
pub type PlatformFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Platform>, NotifyError> + Send + Sync>;
