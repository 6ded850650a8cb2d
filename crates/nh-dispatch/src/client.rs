//! Public façade over the dispatch engine.
//!
//! A [`Client`] owns the worker pool, router, health tracker, and rate
//! limiters, and shares a platform [`Registry`]. Synchronous sends are
//! asynchronous submits that wait on the internal handle, so both paths
//! exercise the same machinery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nh_common::{
    AggregateError, ClientSettings, DistributionStrategy, ErrorKind, Message, NotifyError,
    PlatformHealth, PlatformOverrides, PoolSettings, PoolStats, RateLimitSettings, Receipt,
    RoutingRule,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::handle::{BatchHandle, Handle};
use crate::health::{spawn_health_probe, HealthTracker};
use crate::pool::WorkerPool;
use crate::rate_limit::RateLimiterRegistry;
use crate::registry::{default_registry, Registry};
use crate::router::Router;

/// Optional template hook. The engine treats messages as pre-rendered;
/// when a renderer is injected it runs once per submit, before
/// validation, as a pure function of the message.
pub trait Renderer: Send + Sync {
    fn render(&self, message: &Message) -> Result<Message, NotifyError>;
}

struct ClientInner {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthTracker>,
    settings: Arc<ClientSettings>,
    renderer: Option<Arc<dyn Renderer>>,
    closed: AtomicBool,
    probe: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point for sending notifications. Cheap to clone; clones share
/// the same engine.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Synchronous send: blocks until every target is terminal. Impose
    /// a deadline with `tokio::time::timeout`.
    pub async fn send(&self, message: Message) -> Result<Receipt, NotifyError> {
        let handle = self.submit(message).await?;
        Ok(handle.wait().await)
    }

    /// Queue the message and return immediately with its handle.
    pub async fn send_async(&self, message: Message) -> Result<Handle, NotifyError> {
        self.submit(message).await
    }

    /// Queue several messages; the batch handle completes when every
    /// child is terminal. Validation failures abort the whole batch
    /// before anything is queued; a mid-batch submit failure cancels
    /// the messages already queued.
    pub async fn send_async_batch(&self, messages: Vec<Message>) -> Result<BatchHandle, NotifyError> {
        if messages.is_empty() {
            return Err(NotifyError::new(
                ErrorKind::InvalidMessage,
                "batch contains no messages",
            ));
        }
        let messages = self.prepare_all(messages)?;

        let mut handles = Vec::with_capacity(messages.len());
        for message in messages {
            match Arc::clone(&self.inner.dispatcher)
                .dispatch(Arc::new(message))
                .await
            {
                Ok(core) => handles.push(Handle::from_core(core)),
                Err(error) => {
                    for handle in &handles {
                        handle.cancel();
                    }
                    return Err(error);
                }
            }
        }
        Ok(BatchHandle::new(handles))
    }

    /// Drain the worker pool within `drain`, then tear down platforms.
    /// Idempotent; the second call is a no-op returning Ok.
    pub async fn close(&self, drain: Duration) -> Result<(), AggregateError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing notification client");
        self.inner.pool.close(drain).await;
        if let Some(probe) = self.inner.probe.lock().take() {
            probe.abort();
        }
        self.inner.registry.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn platform_health(&self) -> Vec<PlatformHealth> {
        self.inner.health.snapshots()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.get_stats()
    }

    /// Requests submitted but not yet terminal.
    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.in_flight_count()
    }

    async fn submit(&self, message: Message) -> Result<Handle, NotifyError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NotifyError::closed());
        }
        let message = self.prepare(message)?;
        let core = Arc::clone(&self.inner.dispatcher)
            .dispatch(Arc::new(message))
            .await?;
        Ok(Handle::from_core(core))
    }

    fn prepare(&self, message: Message) -> Result<Message, NotifyError> {
        let message = match &self.inner.renderer {
            Some(renderer) => renderer.render(&message)?,
            None => message,
        };
        message.validate(self.inner.settings.scheduling_skew)?;
        Ok(message)
    }

    fn prepare_all(&self, messages: Vec<Message>) -> Result<Vec<Message>, NotifyError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NotifyError::closed());
        }
        messages
            .into_iter()
            .map(|m| self.prepare(m))
            .collect()
    }
}

/// Builder for [`Client`]. Must be built inside a tokio runtime (the
/// pool and health probe spawn background tasks).
pub struct ClientBuilder {
    registry: Option<Arc<Registry>>,
    settings: ClientSettings,
    renderer: Option<Arc<dyn Renderer>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            settings: ClientSettings::default(),
            renderer: None,
        }
    }

    /// Use an explicit registry. Defaults to the process-wide one.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn pool(mut self, pool: PoolSettings) -> Self {
        self.settings.pool = pool;
        self
    }

    pub fn strategy(mut self, strategy: DistributionStrategy) -> Self {
        self.settings.strategy = strategy;
        self
    }

    pub fn weight(mut self, platform: impl Into<String>, weight: u32) -> Self {
        self.settings.weights.insert(platform.into(), weight);
        self
    }

    pub fn rule(mut self, rule: RoutingRule) -> Self {
        self.settings.rules.push(rule);
        self
    }

    /// Engine-side defaults applied to platforms without an override.
    pub fn defaults(mut self, overrides: PlatformOverrides) -> Self {
        self.settings.defaults = overrides;
        self
    }

    pub fn platform_overrides(
        mut self,
        platform: impl Into<String>,
        overrides: PlatformOverrides,
    ) -> Self {
        self.settings.platform_overrides.insert(platform.into(), overrides);
        self
    }

    /// Token-bucket limit for one platform. Rate limiting only applies
    /// to explicitly configured platforms.
    pub fn rate_limit(mut self, platform: impl Into<String>, limit: RateLimitSettings) -> Self {
        self.settings
            .platform_overrides
            .entry(platform.into())
            .or_default()
            .rate_limit = Some(limit);
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.settings.health_check_interval = interval;
        self
    }

    pub fn unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.settings.unhealthy_threshold = threshold;
        self
    }

    pub fn scheduling_skew(mut self, skew: Duration) -> Self {
        self.settings.scheduling_skew = skew;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn build(self) -> Result<Client, NotifyError> {
        let registry = self.registry.unwrap_or_else(default_registry);
        let settings = Arc::new(self.settings);

        let health = Arc::new(HealthTracker::new(settings.unhealthy_threshold));
        let router = Arc::new(Router::new(
            settings.strategy,
            settings.weights.clone(),
            Arc::clone(&health),
        ));
        for rule in settings.rules.clone() {
            router.add_rule(rule);
        }

        let pool = WorkerPool::new(settings.pool.clone());

        let limits = Arc::new(RateLimiterRegistry::new());
        for (platform, overrides) in &settings.platform_overrides {
            if let Some(limit) = overrides.rate_limit {
                limits.configure(platform, limit)?;
            }
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            router,
            Arc::clone(&pool),
            limits,
            Arc::clone(&health),
            Arc::clone(&settings),
        );

        let probe = spawn_health_probe(
            Arc::clone(&registry),
            Arc::clone(&health),
            settings.health_check_interval,
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                registry,
                pool,
                dispatcher,
                health,
                settings,
                renderer: self.renderer,
                closed: AtomicBool::new(false),
                probe: Mutex::new(Some(probe)),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
