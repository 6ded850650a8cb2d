//! Platform registry: factories in, shared live instances out.
//!
//! Factories are registered once at startup with their opaque config;
//! instances materialize lazily on first lookup and are shared from then
//! on. Concurrent first lookups are race-free: the constructing caller
//! holds the map entry while the factory runs, everyone else waits and
//! receives the same instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nh_common::{AggregateError, ErrorKind, NotifyError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::platform::{Platform, PlatformFactory};

struct Registered {
    config: serde_json::Value,
    factory: PlatformFactory,
}

pub struct Registry {
    factories: RwLock<HashMap<String, Registered>>,
    /// Names in registration order; close() walks this.
    order: Mutex<Vec<String>>,
    instances: DashMap<String, Arc<dyn Platform>>,
    closed: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            instances: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a factory under `name`. Each name registers exactly
    /// once; the config stays opaque until the factory interprets it.
    pub fn register<F>(
        &self,
        name: &str,
        config: serde_json::Value,
        factory: F,
    ) -> Result<(), NotifyError>
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Platform>, NotifyError>
            + Send
            + Sync
            + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NotifyError::closed());
        }
        let mut factories = self.factories.write();
        if factories.contains_key(name) {
            return Err(NotifyError::new(
                ErrorKind::InvalidConfig,
                format!("platform {} is already registered", name),
            ));
        }
        factories.insert(
            name.to_string(),
            Registered {
                config,
                factory: Arc::new(factory),
            },
        );
        self.order.lock().push(name.to_string());
        debug!(platform = %name, "platform factory registered");
        Ok(())
    }

    /// Resolve (and lazily construct) the platform instance for `name`.
    pub fn get_platform(&self, name: &str) -> Result<Arc<dyn Platform>, NotifyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NotifyError::closed());
        }
        if let Some(platform) = self.instances.get(name) {
            return Ok(Arc::clone(&platform));
        }

        let (factory, config) = {
            let factories = self.factories.read();
            match factories.get(name) {
                Some(r) => (Arc::clone(&r.factory), r.config.clone()),
                None => {
                    return Err(NotifyError::new(
                        ErrorKind::MissingPlatform,
                        format!("platform {} is not registered", name),
                    ))
                }
            }
        };

        // The vacant entry is held while the factory runs, so exactly
        // one caller constructs; the rest block on the shard and then
        // take the occupied path.
        match self.instances.entry(name.to_string()) {
            Entry::Occupied(occupied) => Ok(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let platform = factory(&config).map_err(|cause| {
                    NotifyError::new(
                        ErrorKind::InvalidConfig,
                        format!("platform factory failed for {}", name),
                    )
                    .with_platform(name)
                    .with_source(cause)
                })?;
                info!(platform = %name, "platform instantiated");
                vacant.insert(Arc::clone(&platform));
                Ok(platform)
            }
        }
    }

    /// Already-materialized instance, without constructing one.
    pub fn live(&self, name: &str) -> Option<Arc<dyn Platform>> {
        self.instances.get(name).map(|p| Arc::clone(&p))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn platform_names(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every live platform in registration order. Errors are
    /// collected, never short-circuited. Idempotent: the second call is
    /// a no-op returning Ok.
    pub async fn close(&self) -> Result<(), AggregateError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let order = self.order.lock().clone();
        let mut errors = AggregateError::new();
        for name in order {
            if let Some((_, platform)) = self.instances.remove(&name) {
                debug!(platform = %name, "closing platform");
                if let Err(error) = platform.close().await {
                    errors.push(error.with_platform(&name));
                }
            }
        }
        errors.into_result()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry for quick starts. Library users are expected
/// to construct and pass an explicit [`Registry`]; this exists for the
/// ergonomic default only and is never torn down.
pub fn default_registry() -> Arc<Registry> {
    static DEFAULT: OnceLock<Arc<Registry>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(Registry::new())))
}
