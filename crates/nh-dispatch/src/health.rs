//! Per-platform health tracking for routing failover.
//!
//! Every adapter call reports into a rolling record; a platform that
//! fails `unhealthy_threshold` times in a row is routed around until a
//! background probe (`Platform::is_healthy`) succeeds again.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nh_common::PlatformHealth;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::Registry;

/// EWMA smoothing factor for adapter latency.
const LATENCY_ALPHA: f64 = 0.3;

struct HealthRecord {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    response_time_ms: Mutex<f64>,
    last_checked: Mutex<DateTime<Utc>>,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            response_time_ms: Mutex::new(0.0),
            last_checked: Mutex::new(Utc::now()),
        }
    }
}

/// Registry of per-platform health records.
pub struct HealthTracker {
    records: DashMap<String, Arc<HealthRecord>>,
    unhealthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            records: DashMap::new(),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    fn record(&self, platform: &str) -> Arc<HealthRecord> {
        if let Some(r) = self.records.get(platform) {
            return Arc::clone(&r);
        }
        let entry = self
            .records
            .entry(platform.to_string())
            .or_insert_with(|| Arc::new(HealthRecord::new()));
        Arc::clone(entry.value())
    }

    pub fn record_success(&self, platform: &str, latency: Duration) {
        let record = self.record(platform);
        record.success_count.fetch_add(1, Ordering::Relaxed);
        record.consecutive_failures.store(0, Ordering::SeqCst);
        *record.last_checked.lock() = Utc::now();

        let sample = latency.as_secs_f64() * 1000.0;
        let mut ewma = record.response_time_ms.lock();
        *ewma = if *ewma == 0.0 {
            sample
        } else {
            LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * *ewma
        };
        drop(ewma);

        if !record.healthy.swap(true, Ordering::SeqCst) {
            info!(platform = %platform, "platform recovered");
        }
    }

    pub fn record_failure(&self, platform: &str) {
        let record = self.record(platform);
        record.failure_count.fetch_add(1, Ordering::Relaxed);
        *record.last_checked.lock() = Utc::now();

        let fails = record.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if fails >= self.unhealthy_threshold && record.healthy.swap(false, Ordering::SeqCst) {
            warn!(
                platform = %platform,
                consecutive_failures = fails,
                "platform marked unhealthy"
            );
        }
    }

    /// Probe success: clear the failure streak and restore routing.
    pub fn mark_healthy(&self, platform: &str) {
        let record = self.record(platform);
        record.consecutive_failures.store(0, Ordering::SeqCst);
        *record.last_checked.lock() = Utc::now();
        if !record.healthy.swap(true, Ordering::SeqCst) {
            info!(platform = %platform, "platform restored by health probe");
        }
    }

    /// Unknown platforms are optimistically healthy.
    pub fn is_healthy(&self, platform: &str) -> bool {
        self.records
            .get(platform)
            .map(|r| r.healthy.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    pub fn snapshot(&self, platform: &str) -> Option<PlatformHealth> {
        let record = self.records.get(platform)?;
        let last_checked = *record.last_checked.lock();
        let response_time_ms = *record.response_time_ms.lock();
        Some(PlatformHealth {
            platform: platform.to_string(),
            healthy: record.healthy.load(Ordering::SeqCst),
            last_checked,
            response_time_ms,
            success_count: record.success_count.load(Ordering::Relaxed),
            failure_count: record.failure_count.load(Ordering::Relaxed),
            consecutive_failures: record.consecutive_failures.load(Ordering::SeqCst),
        })
    }

    pub fn snapshots(&self) -> Vec<PlatformHealth> {
        self.records
            .iter()
            .filter_map(|entry| self.snapshot(entry.key()))
            .collect()
    }

    fn unhealthy_platforms(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|e| !e.value().healthy.load(Ordering::SeqCst))
            .map(|e| e.key().clone())
            .collect()
    }
}

/// Background probe loop: every `interval`, ask each unhealthy platform
/// whether it is alive again and restore it on success. Only platforms
/// the registry has already materialized are probed.
pub fn spawn_health_probe(
    registry: Arc<Registry>,
    tracker: Arc<HealthTracker>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly started
        // engine waits a full interval before the first probe round.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if registry.is_closed() {
                debug!("registry closed, stopping health probes");
                return;
            }

            for name in tracker.unhealthy_platforms() {
                let Some(platform) = registry.live(&name) else {
                    continue;
                };
                match platform.is_healthy().await {
                    Ok(()) => tracker.mark_healthy(&name),
                    Err(error) => {
                        debug!(platform = %name, error = %error, "health probe failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_consecutive_failures_mark_unhealthy() {
        let tracker = HealthTracker::new(3);

        tracker.record_failure("feishu");
        tracker.record_failure("feishu");
        assert!(tracker.is_healthy("feishu"));

        tracker.record_failure("feishu");
        assert!(!tracker.is_healthy("feishu"));
    }

    #[test]
    fn success_resets_the_streak() {
        let tracker = HealthTracker::new(3);

        tracker.record_failure("slack");
        tracker.record_failure("slack");
        tracker.record_success("slack", Duration::from_millis(20));
        tracker.record_failure("slack");
        tracker.record_failure("slack");
        assert!(tracker.is_healthy("slack"));
    }

    #[test]
    fn probe_success_restores_routing() {
        let tracker = HealthTracker::new(3);
        for _ in 0..3 {
            tracker.record_failure("smtp");
        }
        assert!(!tracker.is_healthy("smtp"));

        tracker.mark_healthy("smtp");
        assert!(tracker.is_healthy("smtp"));
        let snap = tracker.snapshot("smtp").unwrap();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.failure_count, 3);
    }

    #[test]
    fn latency_ewma_tracks_samples() {
        let tracker = HealthTracker::new(3);
        tracker.record_success("webhook", Duration::from_millis(100));
        let first = tracker.snapshot("webhook").unwrap().response_time_ms;
        assert!((first - 100.0).abs() < 1.0);

        tracker.record_success("webhook", Duration::from_millis(200));
        let second = tracker.snapshot("webhook").unwrap().response_time_ms;
        assert!(second > first && second < 200.0);
    }

    #[test]
    fn unknown_platform_is_healthy() {
        let tracker = HealthTracker::new(3);
        assert!(tracker.is_healthy("never-seen"));
        assert!(tracker.snapshot("never-seen").is_none());
    }
}
