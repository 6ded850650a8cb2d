//! Cancellation behavior
//!
//! - cancelling while an adapter call sleeps unblocks waiters promptly
//! - queued-but-not-started jobs resolve their targets as cancelled
//! - the engine ignores late reports from abandoned calls

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nh_common::{
    Capabilities, ErrorKind, HandleState, Message, MessageFormat, NotifyError, PoolMode,
    PoolSettings, RoutingRule, SendResult, SubmitMode, Target, TargetType,
};
use nh_dispatch::{Client, Platform, Registry};

/// Adapter that sleeps before answering, for pinning work in flight.
#[derive(Debug)]
struct SleepyPlatform {
    name: &'static str,
    delay: Duration,
    started_calls: AtomicU32,
    finished_calls: AtomicU32,
}

impl SleepyPlatform {
    fn new(name: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay,
            started_calls: AtomicU32::new(0),
            finished_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Platform for SleepyPlatform {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            target_types: vec![TargetType::Email, TargetType::User],
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
        self.started_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished_calls.fetch_add(1, Ordering::SeqCst);
        Ok(targets
            .iter()
            .map(|t| SendResult::ok(t.clone(), Some("slept".into()), self.delay))
            .collect())
    }

    async fn is_healthy(&self) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), NotifyError> {
        Ok(())
    }
}

fn client_for(platform: Arc<SleepyPlatform>, pool: PoolSettings) -> Client {
    let registry = Arc::new(Registry::new());
    let name = platform.name;
    let shared = Arc::clone(&platform);
    registry
        .register(name, serde_json::json!({}), move |_cfg| {
            Ok(Arc::clone(&shared) as Arc<dyn Platform>)
        })
        .unwrap();
    Client::builder()
        .registry(registry)
        .rule(RoutingRule::wildcard().primary([name]).priority(1))
        .pool(pool)
        .build()
        .unwrap()
}

fn message(n: usize) -> Message {
    let mut builder = Message::builder().title("cancel me").body("soon");
    for i in 0..n {
        builder = builder.target(Target::email(format!("u{}@x.com", i)));
    }
    builder.build()
}

#[tokio::test]
async fn cancel_unblocks_waiters_while_adapter_sleeps() {
    let platform = SleepyPlatform::new("molasses", Duration::from_secs(5));
    let client = client_for(Arc::clone(&platform), PoolSettings::default());

    let handle = client.send_async(message(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let before_cancel = Instant::now();
    assert!(handle.cancel());
    let receipt = handle.wait().await;

    assert!(
        before_cancel.elapsed() < Duration::from_millis(200),
        "wait returned {:?} after cancel",
        before_cancel.elapsed()
    );
    assert_eq!(handle.state(), HandleState::Cancelled);
    for result in &receipt.results {
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    }

    // The abandoned adapter future never completes its call.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(platform.started_calls.load(Ordering::SeqCst), 1);
    assert_eq!(platform.finished_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn queued_jobs_resolve_cancelled_without_running() {
    let platform = SleepyPlatform::new("narrow", Duration::from_millis(300));
    let client = client_for(
        Arc::clone(&platform),
        PoolSettings {
            workers: 1,
            min_workers: 1,
            max_workers: 1,
            buffer_size: 4,
            submit_mode: SubmitMode::Block,
            mode: PoolMode::Pooled,
            overflow_idle: Duration::from_secs(60),
        },
    );

    let first = client.send_async(message(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = client.send_async(message(1)).await.unwrap();

    assert!(second.cancel());
    let receipt = second.wait().await;
    assert_eq!(second.state(), HandleState::Cancelled);
    assert_eq!(
        receipt.results[0].error.as_ref().unwrap().kind,
        ErrorKind::Cancelled
    );

    // The first message is unaffected.
    let receipt = first.wait().await;
    assert_eq!(receipt.successful, 1);
    // Only the first message's adapter call ever started.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(platform.started_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn progress_reflects_cancelled_targets() {
    let platform = SleepyPlatform::new("slowpoke", Duration::from_secs(5));
    let client = client_for(Arc::clone(&platform), PoolSettings::default());

    let handle = client.send_async(message(3)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let before = handle.progress();
    assert_eq!(before.total, 3);
    assert_eq!(before.done, 0);

    handle.cancel();
    let after = handle.progress();
    assert_eq!(after.done, 3);
    assert_eq!(after.failed, 3);
}
