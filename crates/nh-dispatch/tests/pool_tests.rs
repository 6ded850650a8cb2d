//! WorkerPool tests
//!
//! - saturation in reject mode (workers + buffer is an exact bound)
//! - block mode parks submitters until a slot frees
//! - direct-spawn mode has no backpressure
//! - shutdown drains, then discards leftovers
//! - saturation observed end-to-end through the client

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use nh_common::{
    Capabilities, ErrorKind, Message, MessageFormat, NotifyError, PoolMode, PoolSettings,
    RoutingRule, SendResult, SubmitMode, Target, TargetType,
};
use nh_dispatch::{Client, Job, Platform, Registry, WorkerPool};

fn settings(workers: usize, buffer: usize, submit_mode: SubmitMode, mode: PoolMode) -> PoolSettings {
    PoolSettings {
        workers,
        min_workers: 1,
        max_workers: workers,
        buffer_size: buffer,
        submit_mode,
        mode,
        overflow_idle: Duration::from_secs(60),
    }
}

fn sleeping_job(ran: &Arc<AtomicU32>, discarded: &Arc<AtomicU32>, delay: Duration) -> Job {
    let ran = Arc::clone(ran);
    let discarded = Arc::clone(discarded);
    Job::new(
        move || {
            async move {
                tokio::time::sleep(delay).await;
                ran.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        },
        move || {
            discarded.fetch_add(1, Ordering::SeqCst);
        },
    )
}

#[tokio::test]
async fn reject_mode_accepts_exactly_workers_plus_buffer() {
    let pool = WorkerPool::new(settings(2, 2, SubmitMode::Reject, PoolMode::Pooled));
    let ran = Arc::new(AtomicU32::new(0));
    let discarded = Arc::new(AtomicU32::new(0));

    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..10 {
        match pool
            .submit(sleeping_job(&ran, &discarded, Duration::from_millis(500)))
            .await
        {
            Ok(()) => accepted += 1,
            Err(error) => {
                assert_eq!(error.kind, ErrorKind::QueueFull);
                rejected += 1;
            }
        }
        if i < 2 {
            // Let the pump hand the first two jobs to workers so the
            // queue is empty when the next submits arrive.
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }

    assert_eq!(accepted, 4, "2 running + 2 queued");
    assert_eq!(rejected, 6);

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 4);
    assert_eq!(discarded.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn block_mode_parks_until_a_slot_frees() {
    let pool = WorkerPool::new(settings(1, 1, SubmitMode::Block, PoolMode::Pooled));
    let ran = Arc::new(AtomicU32::new(0));
    let discarded = Arc::new(AtomicU32::new(0));

    pool.submit(sleeping_job(&ran, &discarded, Duration::from_millis(150)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    pool.submit(sleeping_job(&ran, &discarded, Duration::from_millis(150)))
        .await
        .unwrap();

    // Queue full now; this submit must park until the first job ends.
    let started = Instant::now();
    pool.submit(sleeping_job(&ran, &discarded, Duration::from_millis(10)))
        .await
        .unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(80),
        "blocking submit returned after {:?}",
        started.elapsed()
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn direct_mode_spawns_without_backpressure() {
    let pool = WorkerPool::new(settings(1, 1, SubmitMode::Reject, PoolMode::Direct));
    let ran = Arc::new(AtomicU32::new(0));
    let discarded = Arc::new(AtomicU32::new(0));

    for _ in 0..8 {
        pool.submit(sleeping_job(&ran, &discarded, Duration::from_millis(50)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 8, "direct mode runs everything at once");
}

#[tokio::test]
async fn close_drains_within_deadline() {
    let pool = WorkerPool::new(settings(1, 4, SubmitMode::Block, PoolMode::Pooled));
    let ran = Arc::new(AtomicU32::new(0));
    let discarded = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        pool.submit(sleeping_job(&ran, &discarded, Duration::from_millis(20)))
            .await
            .unwrap();
    }
    pool.close(Duration::from_millis(500)).await;

    assert_eq!(ran.load(Ordering::SeqCst), 3, "generous deadline drains everything");
    assert_eq!(discarded.load(Ordering::SeqCst), 0);
    assert!(!pool.is_accepting());
}

#[tokio::test]
async fn close_discards_jobs_past_the_deadline() {
    let pool = WorkerPool::new(settings(1, 4, SubmitMode::Block, PoolMode::Pooled));
    let ran = Arc::new(AtomicU32::new(0));
    let discarded = Arc::new(AtomicU32::new(0));

    // One long job occupies the only worker; three more sit queued.
    pool.submit(sleeping_job(&ran, &discarded, Duration::from_millis(400)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    for _ in 0..3 {
        pool.submit(sleeping_job(&ran, &discarded, Duration::from_millis(10)))
            .await
            .unwrap();
    }

    pool.close(Duration::from_millis(50)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(discarded.load(Ordering::SeqCst), 3, "queued jobs are cancelled");

    // Idempotent, and closed for business.
    pool.close(Duration::from_millis(50)).await;
    let err = pool
        .submit(sleeping_job(&ran, &discarded, Duration::from_millis(1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Closed);
}

#[tokio::test]
async fn overflow_workers_grow_under_backlog_and_retire_after_idle() {
    let mut config = settings(1, 1, SubmitMode::Block, PoolMode::Pooled);
    config.max_workers = 2;
    config.overflow_idle = Duration::from_millis(300);
    let pool = WorkerPool::new(config);

    let ran = Arc::new(AtomicU32::new(0));
    let discarded = Arc::new(AtomicU32::new(0));
    for _ in 0..4 {
        pool.submit(sleeping_job(&ran, &discarded, Duration::from_millis(400)))
            .await
            .unwrap();
    }

    // A sustained full queue grows a temporary slot; watch for it while
    // the backlog drains.
    let mut saw_overflow = false;
    for _ in 0..40 {
        if pool.get_stats().overflow_workers > 0 {
            saw_overflow = true;
        }
        if ran.load(Ordering::SeqCst) == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(saw_overflow, "backlog should have grown an overflow slot");
    assert_eq!(ran.load(Ordering::SeqCst), 4);

    // Idle long enough and the slot is retired.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(pool.get_stats().overflow_workers, 0);
}

// ---------------------------------------------------------------------------
// End-to-end saturation through the client
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SleepyPlatform {
    delay: Duration,
}

#[async_trait]
impl Platform for SleepyPlatform {
    fn name(&self) -> &str {
        "sleepy"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            target_types: vec![TargetType::Email],
            formats: vec![MessageFormat::Text],
            max_message_size: 0,
            supports_scheduling: false,
            supports_attachments: false,
            required_settings: vec![],
        }
    }

    fn validate_target(&self, _target: &Target) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn send(
        &self,
        _message: &Message,
        targets: &[Target],
    ) -> Result<Vec<SendResult>, NotifyError> {
        tokio::time::sleep(self.delay).await;
        Ok(targets
            .iter()
            .map(|t| SendResult::ok(t.clone(), Some("ok".into()), self.delay))
            .collect())
    }

    async fn is_healthy(&self) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[tokio::test]
async fn saturated_pool_rejects_submits_synchronously() {
    let registry = Arc::new(Registry::new());
    registry
        .register("sleepy", serde_json::json!({}), |_cfg| {
            Ok(Arc::new(SleepyPlatform {
                delay: Duration::from_millis(500),
            }) as Arc<dyn Platform>)
        })
        .unwrap();

    let client = Client::builder()
        .registry(registry)
        .rule(RoutingRule::wildcard().primary(["sleepy"]).priority(1))
        .pool(settings(2, 2, SubmitMode::Reject, PoolMode::Pooled))
        .build()
        .unwrap();

    let mut handles = Vec::new();
    let mut rejected = 0;
    for i in 0..10 {
        let message = Message::builder()
            .title(format!("m{}", i))
            .body("x")
            .target(Target::email(format!("u{}@x.com", i)))
            .build();
        match client.send_async(message).await {
            Ok(handle) => handles.push(handle),
            Err(error) => {
                assert_eq!(error.kind, ErrorKind::QueueFull);
                rejected += 1;
            }
        }
        if i < 2 {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }

    assert_eq!(handles.len(), 4, "2 running + 2 queued accepted");
    assert_eq!(rejected, 6);

    for handle in handles {
        let receipt = handle.wait().await;
        assert_eq!(receipt.successful, 1);
    }
}
