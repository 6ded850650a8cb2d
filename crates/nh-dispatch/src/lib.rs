//! NotifyHub dispatch engine
//!
//! This crate provides the core notification dispatch machinery:
//! - Client: public façade for sync/async sends with receipts and handles
//! - Registry: platform factories and lazily materialized instances
//! - Router: rule-based target routing with health failover and
//!   round-robin / random / weighted distribution
//! - Dispatcher: per-platform fan-out, capability validation, retry
//!   scheduling, and result aggregation
//! - WorkerPool: bounded queue + semaphore concurrency with block/reject
//!   submits and an optional direct-spawn mode
//! - Handle / BatchHandle: cancellable async results with callbacks
//! - RateLimiterRegistry: token buckets keyed by (platform, key)
//! - HealthTracker: per-platform health records driving failover, with a
//!   background probe restoring recovered platforms

pub mod client;
pub mod dispatcher;
pub mod handle;
pub mod health;
pub mod platform;
pub mod pool;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod router;

pub use client::{Client, ClientBuilder, Renderer};
pub use handle::{BatchHandle, Handle};
pub use health::{spawn_health_probe, HealthTracker};
pub use platform::{Platform, PlatformFactory};
pub use pool::{Job, WorkerPool};
pub use rate_limit::RateLimiterRegistry;
pub use registry::{default_registry, Registry};
pub use router::{RouteOutcome, Router};

// The error taxonomy lives in nh-common and flows through unchanged;
// re-exported here so engine users need a single import.
pub use nh_common::{ErrorKind, NotifyError};

pub type Result<T> = std::result::Result<T, NotifyError>;
