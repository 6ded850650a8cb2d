//! Core send loop: per-platform fan-out, validation, execution, retry
//! scheduling, and result aggregation.
//!
//! One job is queued per (platform, targets) pair, not per target; the
//! adapter batches its own endpoint call. Retryable per-target failures
//! re-enqueue a sub-job for just those targets off-pool (a timer task
//! holds no worker slot during backoff). An adapter that panics fails
//! its whole call with `AdapterFault` and never takes the engine down.
//!
//! The dispatcher owns every in-flight handle until it reaches a
//! terminal state; workers and timers only ever hold weak references,
//! so a request dies exactly when the caller released it and its last
//! job has reported.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use nh_common::{
    ClientSettings, ErrorKind, HandleState, Message, NotifyError, PlatformOverrides, SendResult,
    Target,
};
use std::panic::AssertUnwindSafe;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::handle::{failed_result, HandleCore};
use crate::health::HealthTracker;
use crate::platform::Platform;
use crate::pool::{Job, WorkerPool};
use crate::rate_limit::RateLimiterRegistry;
use crate::registry::Registry;
use crate::retry::{delay_for_attempt, should_retry};
use crate::router::Router;

/// Result-slot key under which prior attempts' error kinds are kept.
const PREVIOUS_ERRORS_KEY: &str = "previousErrors";

/// One target inside a job: original request index plus the error kinds
/// of the attempts it already survived.
#[derive(Clone)]
struct JobTarget {
    index: usize,
    target: Target,
    prior: Vec<String>,
}

pub(crate) struct Dispatcher {
    registry: Arc<Registry>,
    router: Arc<Router>,
    pool: Arc<WorkerPool>,
    limits: Arc<RateLimiterRegistry>,
    health: Arc<HealthTracker>,
    settings: Arc<ClientSettings>,
    /// Owning references to non-terminal handles; see module docs.
    in_flight: Arc<DashMap<String, Arc<HandleCore>>>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<Registry>,
        router: Arc<Router>,
        pool: Arc<WorkerPool>,
        limits: Arc<RateLimiterRegistry>,
        health: Arc<HealthTracker>,
        settings: Arc<ClientSettings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            router,
            pool,
            limits,
            health,
            settings,
            in_flight: Arc::new(DashMap::new()),
        })
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Route, validate, and queue one message. The returned handle is
    /// already live; validation failures that abort the whole submit
    /// are returned as errors instead and never reach a handle.
    pub(crate) async fn dispatch(
        self: Arc<Self>,
        message: Arc<Message>,
    ) -> Result<Arc<HandleCore>, NotifyError> {
        let handle = HandleCore::new(message.id.clone(), message.targets.clone());

        // Keep the request alive until terminal even if the caller
        // drops its handle right after submit.
        self.in_flight
            .insert(handle.id().to_string(), Arc::clone(&handle));
        {
            let in_flight = Arc::clone(&self.in_flight);
            let id = handle.id().to_string();
            handle.on_complete(move |_| {
                in_flight.remove(&id);
            });
        }

        let outcome = self.router.route(&message.targets);
        for (index, target, error) in outcome.failures {
            handle.record_result(index, failed_result(target, error, 1));
        }

        let delay = message.scheduled_at.and_then(|at| {
            let now = chrono::Utc::now();
            if at > now {
                (at - now).to_std().ok()
            } else {
                None
            }
        });

        let mut queued = 0usize;
        let mut queue_full: Option<NotifyError> = None;

        for (platform_name, members) in outcome.groups {
            let platform = match self.registry.get_platform(&platform_name) {
                Ok(platform) => platform,
                Err(error) => {
                    for (index, target) in members {
                        handle.record_result(
                            index,
                            failed_result(target, error.clone().with_platform(&platform_name), 1),
                        );
                    }
                    continue;
                }
            };

            // Capability mismatch fails the whole pair; other pairs of
            // the same message still proceed.
            if let Err(error) = validate_pair(&platform, &message, &members) {
                debug!(
                    platform = %platform_name,
                    message_id = %message.id,
                    error = %error,
                    "capability validation failed for pair"
                );
                for (index, target) in members {
                    handle.record_result(index, failed_result(target, error.clone(), 1));
                }
                continue;
            }

            // Adapter-level target validation fails individual targets.
            let mut valid = Vec::new();
            for (index, target) in members {
                match platform.validate_target(&target) {
                    Ok(()) => valid.push(JobTarget {
                        index,
                        target,
                        prior: Vec::new(),
                    }),
                    Err(error) => handle.record_result(
                        index,
                        failed_result(target, error.with_platform(&platform_name), 1),
                    ),
                }
            }
            if valid.is_empty() {
                continue;
            }

            let job = Arc::clone(&self).pair_job(
                Arc::clone(&platform),
                Arc::clone(&message),
                valid.clone(),
                0,
                Arc::downgrade(&handle),
            );

            if let Some(delay) = delay {
                Arc::clone(&self).spawn_scheduled(job, delay, Arc::downgrade(&handle), valid);
                queued += 1;
                continue;
            }

            match self.pool.submit(job).await {
                Ok(()) => queued += 1,
                Err(error) => {
                    if error.kind == ErrorKind::QueueFull {
                        queue_full = Some(error.clone());
                    }
                    for JobTarget { index, target, .. } in valid {
                        handle.record_result(index, failed_result(target, error.clone(), 1));
                    }
                }
            }
        }

        if queued == 0 {
            if let Some(error) = queue_full {
                // Saturated pool and nothing else got through: surface
                // it synchronously, exactly like a validation error.
                return Err(error);
            }
        } else {
            handle.advance(HandleState::Queued);
        }
        Ok(handle)
    }

    fn pair_job(
        self: Arc<Self>,
        platform: Arc<dyn Platform>,
        message: Arc<Message>,
        targets: Vec<JobTarget>,
        attempt: u32,
        handle: Weak<HandleCore>,
    ) -> Job {
        let discard_targets = targets.clone();
        let discard_handle = handle.clone();
        let core = self;
        Job::new(
            move || {
                core.run_attempt(platform, message, targets, attempt, handle)
                    .boxed()
            },
            move || {
                if let Some(h) = discard_handle.upgrade() {
                    record_cancelled(&h, discard_targets, attempt + 1);
                }
            },
        )
    }

    /// Hold a scheduled message's job until its due time.
    fn spawn_scheduled(
        self: Arc<Self>,
        job: Job,
        delay: Duration,
        handle: Weak<HandleCore>,
        targets: Vec<JobTarget>,
    ) {
        let Some(mut cancel_rx) = handle.upgrade().map(|h| h.cancel_receiver()) else {
            return;
        };
        let core = self;
        tokio::spawn(async move {
            tokio::select! {
                // Dropping the job fires its discard hook, which marks
                // the targets cancelled.
                _ = wait_for_cancel(&mut cancel_rx) => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(error) = core.pool.submit(job).await {
                if let Some(h) = handle.upgrade() {
                    for jt in targets {
                        record_final_failure(&h, jt, error.clone(), 1, Duration::ZERO);
                    }
                }
            }
        });
    }

    async fn run_attempt(
        self: Arc<Self>,
        platform: Arc<dyn Platform>,
        message: Arc<Message>,
        targets: Vec<JobTarget>,
        attempt: u32,
        handle: Weak<HandleCore>,
    ) {
        let Some(h) = handle.upgrade() else { return };
        let platform_name = platform.name().to_string();
        let overrides = self.settings.overrides_for(&platform_name);

        if h.is_cancel_requested() {
            record_cancelled(&h, targets, attempt + 1);
            return;
        }
        h.advance(HandleState::Running);

        // Rate limiting happens before the adapter sees anything;
        // denied targets loop back through the retry scheduler with the
        // refill hint as their delay floor.
        let mut allowed = Vec::new();
        let mut limited = Vec::new();
        for jt in targets {
            let key = platform.rate_limit_key(&jt.target);
            match self.limits.allow(&platform_name, key.as_deref()) {
                Ok(()) => allowed.push(jt),
                Err(error) => {
                    let error = error.with_target(&jt.target);
                    limited.push((jt, error));
                }
            }
        }
        if !limited.is_empty() {
            Arc::clone(&self).retry_or_record(
                &h,
                &platform,
                &message,
                &overrides,
                attempt,
                limited,
                Duration::ZERO,
            );
        }
        if allowed.is_empty() {
            return;
        }

        let plain: Vec<Target> = allowed.iter().map(|jt| jt.target.clone()).collect();
        let started = Instant::now();
        let mut cancel_rx = h.cancel_receiver();
        let send_future = AssertUnwindSafe(platform.send(&message, &plain)).catch_unwind();

        let call = tokio::select! {
            _ = wait_for_cancel(&mut cancel_rx) => None,
            result = tokio::time::timeout(overrides.timeout, send_future) => Some(result),
        };
        let elapsed = started.elapsed();

        match call {
            None => record_cancelled(&h, allowed, attempt + 1),
            Some(Err(_)) => {
                self.health.record_failure(&platform_name);
                let failures = allowed
                    .into_iter()
                    .map(|jt| {
                        let error = NotifyError::new(
                            ErrorKind::NetworkTimeout,
                            format!(
                                "adapter call exceeded {} ms",
                                overrides.timeout.as_millis()
                            ),
                        )
                        .with_platform(&platform_name)
                        .with_target(&jt.target);
                        (jt, error)
                    })
                    .collect();
                Arc::clone(&self).retry_or_record(
                    &h,
                    &platform,
                    &message,
                    &overrides,
                    attempt,
                    failures,
                    elapsed,
                );
            }
            Some(Ok(Err(_panic))) => {
                self.health.record_failure(&platform_name);
                warn!(
                    platform = %platform_name,
                    message_id = %message.id,
                    "adapter panicked, failing all targets of the call"
                );
                for jt in allowed {
                    let error =
                        NotifyError::new(ErrorKind::AdapterFault, "adapter panicked during send")
                            .with_platform(&platform_name)
                            .with_target(&jt.target);
                    record_final_failure(&h, jt, error, attempt + 1, elapsed);
                }
            }
            Some(Ok(Ok(Err(call_error)))) => {
                self.health.record_failure(&platform_name);
                let failures = allowed
                    .into_iter()
                    .map(|jt| {
                        let error = call_error
                            .clone()
                            .with_platform(&platform_name)
                            .with_target(&jt.target);
                        (jt, error)
                    })
                    .collect();
                Arc::clone(&self).retry_or_record(
                    &h,
                    &platform,
                    &message,
                    &overrides,
                    attempt,
                    failures,
                    elapsed,
                );
            }
            Some(Ok(Ok(Ok(results)))) => {
                self.health.record_success(&platform_name, elapsed);
                let mut result_iter = results.into_iter();
                let mut failures = Vec::new();
                for jt in allowed {
                    match result_iter.next() {
                        Some(mut result) if result.success => {
                            result.target = jt.target.clone();
                            result.attempts = attempt + 1;
                            if !jt.prior.is_empty() {
                                result.metadata.insert(
                                    PREVIOUS_ERRORS_KEY.to_string(),
                                    serde_json::json!(jt.prior),
                                );
                            }
                            h.record_result(jt.index, result);
                        }
                        Some(result) => {
                            let error = result
                                .error
                                .unwrap_or_else(|| {
                                    NotifyError::new(
                                        ErrorKind::ProviderError,
                                        "adapter reported failure without an error",
                                    )
                                })
                                .with_platform(&platform_name)
                                .with_target(&jt.target);
                            failures.push((jt, error));
                        }
                        None => {
                            let error = NotifyError::internal(
                                "adapter returned fewer results than targets",
                            )
                            .with_platform(&platform_name);
                            record_final_failure(&h, jt, error, attempt + 1, elapsed);
                        }
                    }
                }
                if !failures.is_empty() {
                    Arc::clone(&self).retry_or_record(
                    &h,
                    &platform,
                    &message,
                    &overrides,
                    attempt,
                    failures,
                    elapsed,
                );
                }
            }
        }
    }

    /// Split failures into final records and a retry sub-job, then
    /// schedule the sub-job after the backoff delay. The timer holds no
    /// pool slot and aborts early if the handle is cancelled.
    #[allow(clippy::too_many_arguments)]
    fn retry_or_record(
        self: Arc<Self>,
        h: &Arc<HandleCore>,
        platform: &Arc<dyn Platform>,
        message: &Arc<Message>,
        overrides: &PlatformOverrides,
        attempt: u32,
        failures: Vec<(JobTarget, NotifyError)>,
        elapsed: Duration,
    ) {
        let policy = overrides.retry;
        let mut retry_set: Vec<JobTarget> = Vec::new();
        let mut max_delay = Duration::ZERO;

        for (mut jt, error) in failures {
            if should_retry(&error, attempt, &policy) {
                max_delay = max_delay.max(delay_for_attempt(&policy, attempt, &error));
                jt.prior.push(error.kind.as_str().to_string());
                retry_set.push(jt);
            } else {
                record_final_failure(h, jt, error, attempt + 1, elapsed);
            }
        }
        if retry_set.is_empty() {
            return;
        }

        debug!(
            platform = %platform.name(),
            message_id = %message.id,
            targets = retry_set.len(),
            attempt = attempt + 1,
            delay_ms = max_delay.as_millis() as u64,
            "scheduling retry"
        );

        let core = self;
        let platform = Arc::clone(platform);
        let message = Arc::clone(message);
        let weak = Arc::downgrade(h);
        let mut cancel_rx = h.cancel_receiver();
        let next_attempt = attempt + 1;

        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_cancel(&mut cancel_rx) => {
                    if let Some(h) = weak.upgrade() {
                        record_cancelled(&h, retry_set, next_attempt);
                    }
                    return;
                }
                _ = tokio::time::sleep(max_delay) => {}
            }
            let job = Arc::clone(&core).pair_job(
                platform,
                message,
                retry_set.clone(),
                next_attempt,
                weak.clone(),
            );
            if let Err(error) = core.pool.submit(job).await {
                if let Some(h) = weak.upgrade() {
                    for jt in retry_set {
                        record_final_failure(&h, jt, error.clone(), next_attempt, Duration::ZERO);
                    }
                }
            }
        });
    }
}

fn validate_pair(
    platform: &Arc<dyn Platform>,
    message: &Message,
    members: &[(usize, Target)],
) -> Result<(), NotifyError> {
    let caps = platform.capabilities();
    let name = platform.name();

    if !caps.supports_format(message.format) {
        return Err(NotifyError::new(
            ErrorKind::CapabilityMismatch,
            format!("platform {} does not accept {:?} bodies", name, message.format),
        )
        .with_platform(name));
    }
    if caps.max_message_size > 0 && message.size_bytes() > caps.max_message_size {
        return Err(NotifyError::new(
            ErrorKind::MessageTooLarge,
            format!(
                "message is {} bytes, platform {} caps at {}",
                message.size_bytes(),
                name,
                caps.max_message_size
            ),
        )
        .with_platform(name));
    }
    for (_, target) in members {
        if !caps.supports_target_type(target.target_type) {
            return Err(NotifyError::new(
                ErrorKind::CapabilityMismatch,
                format!("platform {} does not accept {} targets", name, target.target_type),
            )
            .with_platform(name));
        }
    }
    Ok(())
}

fn record_final_failure(
    h: &Arc<HandleCore>,
    jt: JobTarget,
    error: NotifyError,
    attempts_total: u32,
    elapsed: Duration,
) {
    let mut result = SendResult::failed(jt.target, error, elapsed);
    result.attempts = attempts_total.max(1);
    if !jt.prior.is_empty() {
        result
            .metadata
            .insert(PREVIOUS_ERRORS_KEY.to_string(), serde_json::json!(jt.prior));
    }
    h.record_result(jt.index, result);
}

fn record_cancelled(h: &Arc<HandleCore>, targets: Vec<JobTarget>, attempts_total: u32) {
    for jt in targets {
        record_final_failure(h, jt, NotifyError::cancelled(), attempts_total, Duration::ZERO);
    }
}

/// Resolves when the handle requests cancellation; pends forever once
/// the sender side is gone (the handle owns it, so that only happens
/// after the request is already finished).
async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    futures::future::pending::<()>().await
}
