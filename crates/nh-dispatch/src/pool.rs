//! Bounded worker pool with backpressure.
//!
//! Jobs queue into a bounded channel and run under a semaphore of
//! `workers` permits: a queued job leaves the channel only when a permit
//! frees up, so `buffer_size` is an exact bound on waiting work. Under
//! sustained full-queue backlog the pool may grow temporary overflow
//! permits up to `max_workers`, retired again after an idle period by
//! acquiring a permit and forgetting it.
//!
//! The alternate `Direct` mode spawns a fresh task per submit with no
//! queue and no backpressure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use nh_common::{NotifyError, PoolMode, PoolSettings, PoolStats, SubmitMode};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cadence of the overflow monitor.
const MONITOR_TICK: Duration = Duration::from_millis(250);

/// One unit of queued work: a (platform, targets) pair for one attempt.
///
/// `discard` runs if the pool drops the job without executing it
/// (shutdown past the drain deadline), letting the owner mark the
/// affected targets cancelled.
pub struct Job {
    run: Option<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>>,
    discard: Option<Box<dyn FnOnce() + Send>>,
}

impl Job {
    pub fn new(
        run: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
        discard: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            run: Some(Box::new(run)),
            discard: Some(Box::new(discard)),
        }
    }

    fn execute(mut self) -> BoxFuture<'static, ()> {
        self.discard.take();
        match self.run.take() {
            Some(run) => run(),
            None => Box::pin(async {}),
        }
    }

    /// Disarm the discard hook; used when a submit fails and the caller
    /// keeps responsibility for the job's targets.
    fn defuse(&mut self) {
        self.discard.take();
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(discard) = self.discard.take() {
            discard();
        }
    }
}

pub struct WorkerPool {
    settings: PoolSettings,
    workers: usize,
    accepting: AtomicBool,
    closed: AtomicBool,
    job_tx: Mutex<Option<mpsc::Sender<Job>>>,
    semaphore: Arc<Semaphore>,
    queue_size: Arc<AtomicUsize>,
    active_workers: Arc<AtomicUsize>,
    overflow_permits: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
    pump: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings) -> Arc<Self> {
        let workers = settings.workers.max(settings.min_workers).max(1);
        let buffer = settings.buffer_size.max(1);

        let semaphore = Arc::new(Semaphore::new(workers));
        let queue_size = Arc::new(AtomicUsize::new(0));
        let active_workers = Arc::new(AtomicUsize::new(0));
        let overflow_permits = Arc::new(AtomicUsize::new(0));
        let idle_notify = Arc::new(Notify::new());

        let pool = Arc::new(Self {
            workers,
            accepting: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            job_tx: Mutex::new(None),
            semaphore: Arc::clone(&semaphore),
            queue_size: Arc::clone(&queue_size),
            active_workers: Arc::clone(&active_workers),
            overflow_permits: Arc::clone(&overflow_permits),
            idle_notify: Arc::clone(&idle_notify),
            pump: Mutex::new(None),
            monitor: Mutex::new(None),
            settings,
        });

        if pool.settings.mode == PoolMode::Pooled {
            let (tx, rx) = mpsc::channel(buffer);
            *pool.job_tx.lock() = Some(tx);
            *pool.pump.lock() = Some(tokio::spawn(run_pump(
                rx,
                semaphore,
                queue_size,
                Arc::clone(&active_workers),
                Arc::clone(&idle_notify),
            )));

            let max_overflow = pool.settings.max_workers.saturating_sub(workers);
            if max_overflow > 0 {
                *pool.monitor.lock() = Some(tokio::spawn(run_overflow_monitor(
                    Arc::clone(&pool.semaphore),
                    Arc::clone(&pool.queue_size),
                    Arc::clone(&pool.overflow_permits),
                    buffer,
                    max_overflow,
                    pool.settings.overflow_idle,
                )));
            }

            info!(
                workers = workers,
                buffer_size = buffer,
                max_workers = pool.settings.max_workers,
                "worker pool started"
            );
        } else {
            info!("worker pool in direct-spawn mode");
        }

        pool
    }

    /// Queue one job. `Block` submits park until capacity frees up
    /// (impose a deadline by timing out the future); `Reject` submits
    /// fail fast with `QueueFull`.
    ///
    /// On error the job is returned to the caller's responsibility: its
    /// discard hook will not fire.
    pub async fn submit(&self, job: Job) -> Result<(), NotifyError> {
        if !self.accepting.load(Ordering::SeqCst) {
            let mut job = job;
            job.defuse();
            return Err(NotifyError::closed());
        }

        if self.settings.mode == PoolMode::Direct {
            self.active_workers.fetch_add(1, Ordering::SeqCst);
            let active = Arc::clone(&self.active_workers);
            let idle = Arc::clone(&self.idle_notify);
            tokio::spawn(async move {
                job.execute().await;
                active.fetch_sub(1, Ordering::SeqCst);
                idle.notify_waiters();
            });
            return Ok(());
        }

        let Some(tx) = self.job_tx.lock().clone() else {
            let mut job = job;
            job.defuse();
            return Err(NotifyError::closed());
        };

        self.queue_size.fetch_add(1, Ordering::SeqCst);
        let sent = match self.settings.submit_mode {
            SubmitMode::Reject => tx.try_send(job).map_err(|e| match e {
                TrySendError::Full(j) => (j, NotifyError::queue_full()),
                TrySendError::Closed(j) => (j, NotifyError::closed()),
            }),
            SubmitMode::Block => tx
                .send(job)
                .await
                .map_err(|mpsc::error::SendError(j)| (j, NotifyError::closed())),
        };

        match sent {
            Ok(()) => Ok(()),
            Err((mut job, error)) => {
                self.queue_size.fetch_sub(1, Ordering::SeqCst);
                job.defuse();
                Err(error)
            }
        }
    }

    /// Stop accepting work, drain the queue up to `drain`, then discard
    /// whatever is left (each discarded job marks its targets
    /// cancelled). Idempotent.
    pub async fn close(&self, drain: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accepting.store(false, Ordering::SeqCst);
        info!(drain_ms = drain.as_millis() as u64, "worker pool closing");

        // Dropping the sender lets the pump exit once the queue drains.
        let tx = self.job_tx.lock().take();
        drop(tx);

        let deadline = Instant::now() + drain;
        while Instant::now() < deadline {
            if self.queue_size.load(Ordering::SeqCst) == 0
                && self.active_workers.load(Ordering::SeqCst) == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.semaphore.close();
        self.queue_size.store(0, Ordering::SeqCst);

        let leftover = self.active_workers.load(Ordering::SeqCst);
        if leftover > 0 {
            debug!(active = leftover, "drain deadline hit with workers still running");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0
            && self.active_workers.load(Ordering::SeqCst) == 0
    }

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            active_workers: self.active_workers.load(Ordering::SeqCst),
            queue_size: self.queue_size.load(Ordering::SeqCst),
            queue_capacity: self.settings.buffer_size.max(1),
            overflow_workers: self.overflow_permits.load(Ordering::SeqCst),
        }
    }
}

/// Pulls a job only after a permit is free, so the queue bound holds
/// exactly: at most `workers` running plus `buffer_size` queued.
async fn run_pump(
    mut rx: mpsc::Receiver<Job>,
    semaphore: Arc<Semaphore>,
    queue_size: Arc<AtomicUsize>,
    active_workers: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
) {
    loop {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let Some(job) = rx.recv().await else {
            break;
        };
        queue_size.fetch_sub(1, Ordering::SeqCst);
        active_workers.fetch_add(1, Ordering::SeqCst);

        let active = Arc::clone(&active_workers);
        let idle = Arc::clone(&idle_notify);
        tokio::spawn(async move {
            job.execute().await;
            drop(permit);
            active.fetch_sub(1, Ordering::SeqCst);
            idle.notify_waiters();
        });
    }
}

async fn run_overflow_monitor(
    semaphore: Arc<Semaphore>,
    queue_size: Arc<AtomicUsize>,
    overflow_permits: Arc<AtomicUsize>,
    buffer: usize,
    max_overflow: usize,
    overflow_idle: Duration,
) {
    let mut ticker = tokio::time::interval(MONITOR_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_busy = Instant::now();

    loop {
        ticker.tick().await;
        let queued = queue_size.load(Ordering::SeqCst);
        if queued > 0 {
            last_busy = Instant::now();
        }

        let overflow = overflow_permits.load(Ordering::SeqCst);
        if queued >= buffer && overflow < max_overflow {
            semaphore.add_permits(1);
            overflow_permits.fetch_add(1, Ordering::SeqCst);
            debug!(overflow = overflow + 1, "added overflow worker slot");
        } else if overflow > 0 && queued == 0 && last_busy.elapsed() >= overflow_idle {
            // Retire one slot per idle tick by taking a permit out of
            // circulation for good.
            if let Ok(permit) = semaphore.try_acquire() {
                permit.forget();
                overflow_permits.fetch_sub(1, Ordering::SeqCst);
                debug!(overflow = overflow - 1, "retired overflow worker slot");
            }
        }
    }
}
