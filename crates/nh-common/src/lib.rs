use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod logging;

pub use error::{AggregateError, ErrorKind, NotifyError};

// ============================================================================
// Core Message Types
// ============================================================================

/// Body format of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    Text,
    Markdown,
    Html,
}

impl Default for MessageFormat {
    fn default() -> Self {
        MessageFormat::Text
    }
}

/// Delivery priority. Platforms may use this to pick channels or urgency
/// flags; the dispatcher itself does not reorder work by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The notification that flows through the system.
///
/// Immutable after dispatch begins: the dispatcher shares it with workers
/// as `Arc<Message>` and nothing mutates it past submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub format: MessageFormat,
    #[serde(default)]
    pub priority: Priority,
    pub targets: Vec<Target>,
    /// Opaque caller metadata, carried through to receipts.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Template inputs. The engine treats the message as pre-rendered
    /// unless a renderer is injected on the client.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Per-platform payload overrides, keyed by platform name. Opaque to
    /// the engine; adapters interpret their own entry.
    #[serde(default)]
    pub platform_data: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a message with a generated id and the given content.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            body: body.into(),
            format: MessageFormat::default(),
            priority: Priority::default(),
            targets: Vec::new(),
            metadata: HashMap::new(),
            variables: HashMap::new(),
            platform_data: HashMap::new(),
            created_at: Utc::now(),
            scheduled_at: None,
        }
    }

    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Approximate payload size used against platform size limits.
    pub fn size_bytes(&self) -> usize {
        self.title.len() + self.body.len()
    }

    /// Validate submit-time invariants.
    ///
    /// `scheduling_skew` is how far in the past `scheduled_at` may lie
    /// before it is rejected (clock drift allowance).
    pub fn validate(&self, scheduling_skew: Duration) -> Result<(), NotifyError> {
        if self.id.trim().is_empty() {
            return Err(NotifyError::new(
                ErrorKind::InvalidMessage,
                "message id must not be empty",
            ));
        }
        if self.title.trim().is_empty() && self.body.trim().is_empty() {
            return Err(NotifyError::new(
                ErrorKind::EmptyMessage,
                "title and body must not both be empty",
            ));
        }
        if self.targets.is_empty() {
            return Err(NotifyError::new(
                ErrorKind::NoTargets,
                "message has no targets",
            ));
        }
        for target in &self.targets {
            target.validate()?;
        }
        if let Some(scheduled_at) = self.scheduled_at {
            if scheduled_at < self.created_at {
                return Err(NotifyError::new(
                    ErrorKind::InvalidMessage,
                    "scheduledAt must not precede createdAt",
                ));
            }
            let skew = chrono::Duration::from_std(scheduling_skew)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
            if scheduled_at < Utc::now() - skew {
                return Err(NotifyError::new(
                    ErrorKind::InvalidMessage,
                    "scheduledAt lies in the past",
                ));
            }
        }
        Ok(())
    }
}

/// Fluent construction for [`Message`]. The id is always generated here;
/// externally supplied empty ids are rejected at submit.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    title: String,
    body: String,
    format: MessageFormat,
    priority: Priority,
    targets: Vec<Target>,
    metadata: HashMap<String, serde_json::Value>,
    variables: HashMap<String, String>,
    platform_data: HashMap<String, serde_json::Value>,
    scheduled_at: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = Target>) -> Self {
        self.targets.extend(targets);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Opaque payload override for one platform.
    pub fn platform_data(mut self, platform: impl Into<String>, value: serde_json::Value) -> Self {
        self.platform_data.insert(platform.into(), value);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn build(self) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            title: self.title,
            body: self.body,
            format: self.format,
            priority: self.priority,
            targets: self.targets,
            metadata: self.metadata,
            variables: self.variables,
            platform_data: self.platform_data,
            created_at: Utc::now(),
            scheduled_at: self.scheduled_at,
        }
    }
}

// ============================================================================
// Targets
// ============================================================================

/// Kind of delivery address a target carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Email,
    Webhook,
    User,
    Group,
    Channel,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetType::Email => "email",
            TargetType::Webhook => "webhook",
            TargetType::User => "user",
            TargetType::Group => "group",
            TargetType::Channel => "channel",
        };
        f.write_str(s)
    }
}

/// A delivery address plus an optional explicit platform selector.
/// A non-empty `platform` pins the target past the routing rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl Target {
    pub fn new(target_type: TargetType, value: impl Into<String>) -> Self {
        Self {
            target_type,
            value: value.into(),
            platform: None,
        }
        .normalized()
    }

    pub fn email(address: impl Into<String>) -> Self {
        Self::new(TargetType::Email, address)
    }

    pub fn webhook(url: impl Into<String>) -> Self {
        Self::new(TargetType::Webhook, url)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(TargetType::User, id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(TargetType::Group, id)
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Self::new(TargetType::Channel, id)
    }

    /// Pin this target to an explicit platform, bypassing routing rules.
    pub fn on_platform(mut self, platform: impl Into<String>) -> Self {
        let platform = platform.into();
        self.platform = if platform.trim().is_empty() {
            None
        } else {
            Some(platform.trim().to_string())
        };
        self
    }

    fn normalized(mut self) -> Self {
        self.value = self.value.trim().to_string();
        if let Some(p) = &self.platform {
            if p.trim().is_empty() {
                self.platform = None;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.value.trim().is_empty() {
            return Err(NotifyError::new(
                ErrorKind::InvalidTarget,
                format!("{} target has an empty value", self.target_type),
            ));
        }
        if let Some(p) = &self.platform {
            if p.trim().is_empty() {
                return Err(NotifyError::new(
                    ErrorKind::InvalidTarget,
                    "explicit platform selector must not be empty",
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target_type, self.value)
    }
}

// ============================================================================
// Platform Capabilities
// ============================================================================

/// Declared capabilities of a platform adapter. The dispatcher validates
/// every (platform, targets) pair against these before queueing work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub target_types: Vec<TargetType>,
    pub formats: Vec<MessageFormat>,
    /// Maximum title+body size in bytes. Zero means unlimited.
    pub max_message_size: usize,
    pub supports_scheduling: bool,
    pub supports_attachments: bool,
    /// Setting keys the adapter's factory requires in its config.
    #[serde(default)]
    pub required_settings: Vec<String>,
}

impl Capabilities {
    pub fn supports_target_type(&self, target_type: TargetType) -> bool {
        self.target_types.contains(&target_type)
    }

    pub fn supports_format(&self, format: MessageFormat) -> bool {
        self.formats.contains(&format)
    }
}

// ============================================================================
// Results & Receipts
// ============================================================================

/// Outcome for one target, collapsed over all attempts. `attempts` counts
/// adapter calls; prior attempts' error kinds land in `metadata`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub target: Target,
    pub success: bool,
    /// Platform-assigned message id, stored verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Raw platform response body, when the adapter captured one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NotifyError>,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SendResult {
    pub fn ok(target: Target, message_id: Option<String>, duration: Duration) -> Self {
        Self {
            target,
            success: true,
            message_id,
            response: None,
            error: None,
            duration_ms: duration.as_millis() as u64,
            attempts: 1,
            metadata: HashMap::new(),
        }
    }

    pub fn failed(target: Target, error: NotifyError, duration: Duration) -> Self {
        Self {
            target,
            success: false,
            message_id: None,
            response: None,
            error: Some(error),
            duration_ms: duration.as_millis() as u64,
            attempts: 1,
            metadata: HashMap::new(),
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }
}

/// Terminal summary of one send. Results are ordered by the target's
/// original index in the message, regardless of completion order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub results: Vec<SendResult>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl Receipt {
    pub fn from_results(message_id: String, results: Vec<SendResult>, duration: Duration) -> Self {
        let total = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        Self {
            message_id,
            timestamp: Utc::now(),
            total,
            successful,
            failed: total - successful,
            results,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Union of the receipts of a batch submit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReceipt {
    pub receipts: Vec<Receipt>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl BatchReceipt {
    pub fn from_receipts(receipts: Vec<Receipt>, duration: Duration) -> Self {
        let total = receipts.iter().map(|r| r.total).sum();
        let successful = receipts.iter().map(|r| r.successful).sum();
        let failed = receipts.iter().map(|r| r.failed).sum();
        Self {
            receipts,
            total,
            successful,
            failed,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

// ============================================================================
// Handle State
// ============================================================================

/// Lifecycle of an in-flight request. Transitions are monotonic; a
/// terminal state is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl HandleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandleState::Succeeded | HandleState::Failed | HandleState::Cancelled
        )
    }

    /// Ordering rank of the state lattice, used to reject backward moves.
    pub fn rank(self) -> u8 {
        match self {
            HandleState::Pending => 0,
            HandleState::Queued => 1,
            HandleState::Running => 2,
            HandleState::Succeeded | HandleState::Failed | HandleState::Cancelled => 3,
        }
    }
}

/// Cheap progress snapshot: (resolved, total, failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub done: usize,
    pub total: usize,
    pub failed: usize,
}

// ============================================================================
// Configuration Types
// ============================================================================

/// How `submit` behaves when the pool queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Park the caller until capacity frees up or the deadline expires.
    Block,
    /// Fail immediately with `QueueFull`.
    Reject,
}

/// Execution mode of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Bounded queue drained by a fixed set of workers.
    Pooled,
    /// Every submit spawns a fresh task for the lifetime of the job.
    /// No queue, no backpressure. Meant for small deployments.
    Direct,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    /// Floor the pool never shrinks below. `workers` is clamped up to it.
    pub min_workers: usize,
    /// Ceiling for temporary overflow workers under sustained backlog.
    pub max_workers: usize,
    pub buffer_size: usize,
    pub submit_mode: SubmitMode,
    pub mode: PoolMode,
    /// Idle period after which an overflow worker slot is retired.
    pub overflow_idle: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            min_workers: 1,
            max_workers: 8,
            buffer_size: 64,
            submit_mode: SubmitMode::Block,
            mode: PoolMode::Pooled,
            overflow_idle: Duration::from_secs(60),
        }
    }
}

/// Token-bucket parameters: `rate` tokens refill per `window`, capped at
/// `burst` in the bucket.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub rate: u32,
    pub window: Duration,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rate: 60,
            window: Duration::from_secs(60),
            burst: 60,
        }
    }
}

/// Exponential backoff with jitter: attempt `k` waits
/// `min(base * 2^k + jitter, max)`, `jitter ∈ [0, base/2)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(30),
            max: Duration::from_secs(3600),
        }
    }
}

/// Per-platform engine-side tuning. Platform *adapter* config stays
/// opaque (`serde_json::Value`) and lives with the registry.
#[derive(Debug, Clone)]
pub struct PlatformOverrides {
    /// Per-attempt adapter call timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimitSettings>,
}

impl Default for PlatformOverrides {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Strategy for spreading a target group across candidate platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionStrategy {
    RoundRobin,
    Random,
    /// Each platform contributes `weight` slots to a ring; the cursor
    /// indexes the ring modulo its length.
    Weighted,
    /// Filter to healthy platforms, then round-robin.
    HealthAware,
}

impl Default for DistributionStrategy {
    fn default() -> Self {
        DistributionStrategy::RoundRobin
    }
}

/// Priority-ordered mapping from a target type to candidate platforms.
/// `target_type: None` is the wildcard rule. Higher `priority` wins;
/// ties go to the rule registered earlier.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub target_type: Option<TargetType>,
    pub primary: Vec<String>,
    pub fallback: Vec<String>,
    pub priority: i32,
}

impl RoutingRule {
    pub fn new(target_type: TargetType) -> Self {
        Self {
            target_type: Some(target_type),
            primary: Vec::new(),
            fallback: Vec::new(),
            priority: 0,
        }
    }

    pub fn wildcard() -> Self {
        Self {
            target_type: None,
            primary: Vec::new(),
            fallback: Vec::new(),
            priority: 0,
        }
    }

    pub fn primary(mut self, platforms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.primary = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn fallback(mut self, platforms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fallback = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Engine-wide settings consumed by the client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub pool: PoolSettings,
    pub defaults: PlatformOverrides,
    pub platform_overrides: HashMap<String, PlatformOverrides>,
    pub strategy: DistributionStrategy,
    /// Platform weights for the `Weighted` strategy. Missing entries
    /// count as weight 1.
    pub weights: HashMap<String, u32>,
    pub rules: Vec<RoutingRule>,
    pub health_check_interval: Duration,
    /// Consecutive failures before a platform is routed around.
    pub unhealthy_threshold: u32,
    /// Clock-drift allowance when validating `scheduled_at`.
    pub scheduling_skew: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            defaults: PlatformOverrides::default(),
            platform_overrides: HashMap::new(),
            strategy: DistributionStrategy::default(),
            weights: HashMap::new(),
            rules: Vec::new(),
            health_check_interval: Duration::from_secs(30),
            unhealthy_threshold: 3,
            scheduling_skew: Duration::from_secs(30),
        }
    }
}

impl ClientSettings {
    /// Overrides for a platform, falling back to the engine defaults.
    pub fn overrides_for(&self, platform: &str) -> PlatformOverrides {
        self.platform_overrides
            .get(platform)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

// ============================================================================
// Health & Stats Types
// ============================================================================

/// Snapshot of one platform's rolling health record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformHealth {
    pub platform: String,
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    /// EWMA of adapter call latency in milliseconds.
    pub response_time_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub workers: usize,
    pub active_workers: usize,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub overflow_workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_generates_id_and_timestamps() {
        let msg = Message::builder()
            .title("deploy finished")
            .target(Target::email("ops@example.com"))
            .build();
        assert!(!msg.id.is_empty());
        assert!(msg.scheduled_at.is_none());
        assert!(msg.validate(Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn validate_rejects_empty_content() {
        let mut msg = Message::new("", "");
        msg.targets.push(Target::email("ops@example.com"));
        let err = msg.validate(Duration::from_secs(30)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EmptyMessage);
    }

    #[test]
    fn validate_rejects_missing_targets() {
        let msg = Message::new("hi", "there");
        let err = msg.validate(Duration::from_secs(30)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoTargets);
    }

    #[test]
    fn validate_rejects_empty_id() {
        let mut msg = Message::new("hi", "there");
        msg.targets.push(Target::email("ops@example.com"));
        msg.id = String::new();
        let err = msg.validate(Duration::from_secs(30)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidMessage);
    }

    #[test]
    fn validate_rejects_scheduled_before_created() {
        let mut msg = Message::new("hi", "there");
        msg.targets.push(Target::email("ops@example.com"));
        msg.scheduled_at = Some(msg.created_at - chrono::Duration::hours(1));
        let err = msg.validate(Duration::from_secs(30)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidMessage);
    }

    #[test]
    fn target_normalization_trims_and_drops_empty_platform() {
        let t = Target::webhook("  https://hooks.example.com/x  ").on_platform("  ");
        assert_eq!(t.value, "https://hooks.example.com/x");
        assert!(t.platform.is_none());
        assert!(t.validate().is_ok());
    }

    #[test]
    fn receipt_counts_results() {
        let ok = SendResult::ok(Target::email("a@x.com"), Some("m1".into()), Duration::from_millis(5));
        let bad = SendResult::failed(
            Target::email("b@x.com"),
            NotifyError::new(ErrorKind::NetworkTimeout, "timed out"),
            Duration::from_millis(7),
        );
        let receipt = Receipt::from_results("msg-1".into(), vec![ok, bad], Duration::from_millis(20));
        assert_eq!(receipt.total, 2);
        assert_eq!(receipt.successful, 1);
        assert_eq!(receipt.failed, 1);
        assert!(!receipt.all_succeeded());
    }

    #[test]
    fn handle_state_lattice() {
        assert!(!HandleState::Running.is_terminal());
        assert!(HandleState::Cancelled.is_terminal());
        assert!(HandleState::Pending.rank() < HandleState::Queued.rank());
        assert_eq!(HandleState::Succeeded.rank(), HandleState::Failed.rank());
    }
}
