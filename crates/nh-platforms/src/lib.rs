//! Concrete platform adapters for the NotifyHub dispatch engine.
//!
//! Each adapter lives behind a feature so embedders only link the
//! transports they use:
//! - `webhook` (default): generic HTTP webhook delivery with optional
//!   HMAC-SHA256 request signing
//! - `email`: SMTP delivery over lettre
//!
//! Adapters implement the `nh_dispatch::Platform` contract and nothing
//! else; the engine stays unaware of their config types.

#[cfg(feature = "email")]
pub mod email;
#[cfg(feature = "webhook")]
pub mod webhook;

#[cfg(feature = "email")]
pub use email::{email_factory, EmailConfig, EmailPlatform};
#[cfg(feature = "webhook")]
pub use webhook::{webhook_factory, WebhookConfig, WebhookPlatform};
