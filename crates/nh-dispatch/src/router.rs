//! Target routing: rules, health filtering, and distribution.
//!
//! Routing happens in three steps: group targets by type, pick the
//! highest-priority matching rule (primary platforms filtered to
//! healthy, falling back once), then spread the group across the
//! surviving candidates per the configured strategy. Targets with an
//! explicit platform selector skip all of it.
//!
//! Locking follows the read-copy-compute discipline: rules and weights
//! are cloned out under a read lock and the distribution math runs
//! lock-free; round-robin cursors are atomics keyed by the candidate
//! set so rule changes never reset unrelated cursors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use nh_common::{
    DistributionStrategy, ErrorKind, NotifyError, RoutingRule, Target, TargetType,
};
use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use crate::health::HealthTracker;

/// Result of routing one message's targets. Indices refer to the
/// target's position in the original request.
pub struct RouteOutcome {
    pub groups: HashMap<String, Vec<(usize, Target)>>,
    pub failures: Vec<(usize, Target, NotifyError)>,
}

pub struct Router {
    strategy: DistributionStrategy,
    rules: RwLock<Vec<RoutingRule>>,
    weights: RwLock<HashMap<String, u32>>,
    cursors: DashMap<String, AtomicUsize>,
    health: Arc<HealthTracker>,
}

impl Router {
    pub fn new(
        strategy: DistributionStrategy,
        weights: HashMap<String, u32>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            strategy,
            rules: RwLock::new(Vec::new()),
            weights: RwLock::new(weights),
            cursors: DashMap::new(),
            health,
        }
    }

    /// Register a rule. Rules are kept ordered by priority (highest
    /// first); the stable sort keeps earlier registrations ahead of
    /// later ones with equal priority.
    pub fn add_rule(&self, rule: RoutingRule) {
        let mut rules = self.rules.write();
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn set_weight(&self, platform: impl Into<String>, weight: u32) {
        self.weights.write().insert(platform.into(), weight);
    }

    /// Map every target to a platform, or to a routing failure.
    pub fn route(&self, targets: &[Target]) -> RouteOutcome {
        let rules = self.rules.read().clone();
        let weights = self.weights.read().clone();

        let mut groups: HashMap<String, Vec<(usize, Target)>> = HashMap::new();
        let mut failures = Vec::new();
        let mut by_type: HashMap<TargetType, Vec<(usize, Target)>> = HashMap::new();

        for (index, target) in targets.iter().enumerate() {
            if let Some(platform) = &target.platform {
                groups
                    .entry(platform.clone())
                    .or_default()
                    .push((index, target.clone()));
            } else {
                by_type
                    .entry(target.target_type)
                    .or_default()
                    .push((index, target.clone()));
            }
        }

        for (target_type, members) in by_type {
            let Some(rule) = rules
                .iter()
                .find(|r| r.target_type == Some(target_type) || r.target_type.is_none())
            else {
                for (index, target) in members {
                    failures.push((
                        index,
                        target,
                        NotifyError::new(
                            ErrorKind::MissingPlatform,
                            format!("no routing rule for {} targets", target_type),
                        ),
                    ));
                }
                continue;
            };

            let mut candidates: Vec<String> = rule
                .primary
                .iter()
                .filter(|p| self.health.is_healthy(p))
                .cloned()
                .collect();
            if candidates.is_empty() {
                candidates = rule
                    .fallback
                    .iter()
                    .filter(|p| self.health.is_healthy(p))
                    .cloned()
                    .collect();
                if !candidates.is_empty() {
                    debug!(
                        target_type = %target_type,
                        "primary platforms unhealthy, using fallback"
                    );
                }
            }
            if candidates.is_empty() {
                for (index, target) in members {
                    failures.push((
                        index,
                        target,
                        NotifyError::new(
                            ErrorKind::PlatformUnavailable,
                            format!("no healthy platform for {} targets", target_type),
                        ),
                    ));
                }
                continue;
            }

            self.distribute(&candidates, &weights, members, &mut groups);
        }

        RouteOutcome { groups, failures }
    }

    fn distribute(
        &self,
        candidates: &[String],
        weights: &HashMap<String, u32>,
        members: Vec<(usize, Target)>,
        groups: &mut HashMap<String, Vec<(usize, Target)>>,
    ) {
        match self.strategy {
            DistributionStrategy::RoundRobin | DistributionStrategy::HealthAware => {
                // Health filtering already happened; both strategies
                // walk the survivors with a shared stateful cursor.
                let cursor = self.cursor(candidates);
                for member in members {
                    let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                    groups.entry(candidates[idx].clone()).or_default().push(member);
                }
            }
            DistributionStrategy::Random => {
                let mut rng = rand::thread_rng();
                for member in members {
                    let idx = rng.gen_range(0..candidates.len());
                    groups.entry(candidates[idx].clone()).or_default().push(member);
                }
            }
            DistributionStrategy::Weighted => {
                let mut ring: Vec<&String> = Vec::new();
                for candidate in candidates {
                    let weight = weights.get(candidate).copied().unwrap_or(1).max(1);
                    for _ in 0..weight {
                        ring.push(candidate);
                    }
                }
                let cursor = self.cursor(candidates);
                for member in members {
                    let idx = cursor.fetch_add(1, Ordering::Relaxed) % ring.len();
                    groups.entry(ring[idx].clone()).or_default().push(member);
                }
            }
        }
    }

    /// Cursor keyed by the stable encoding of the candidate set, so
    /// adding rules does not reset existing cursors.
    fn cursor(&self, candidates: &[String]) -> dashmap::mapref::one::RefMut<'_, String, AtomicUsize> {
        let mut key_parts: Vec<&str> = candidates.iter().map(String::as_str).collect();
        key_parts.sort_unstable();
        let key = key_parts.join("|");
        self.cursors.entry(key).or_insert_with(|| AtomicUsize::new(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(strategy: DistributionStrategy) -> Router {
        Router::new(strategy, HashMap::new(), Arc::new(HealthTracker::new(3)))
    }

    fn assignments(outcome: &RouteOutcome) -> HashMap<usize, String> {
        let mut map = HashMap::new();
        for (platform, members) in &outcome.groups {
            for (index, _) in members {
                map.insert(*index, platform.clone());
            }
        }
        map
    }

    #[test]
    fn round_robin_is_deterministic() {
        let r = router(DistributionStrategy::RoundRobin);
        r.add_rule(
            RoutingRule::new(TargetType::User)
                .primary(["feishu", "slack"])
                .priority(10),
        );

        let targets = vec![Target::user("u1"), Target::user("u2"), Target::user("u3")];
        let outcome = r.route(&targets);
        let got = assignments(&outcome);
        assert_eq!(got[&0], "feishu");
        assert_eq!(got[&1], "slack");
        assert_eq!(got[&2], "feishu");
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn higher_priority_rule_wins_and_ties_go_to_earlier_registration() {
        let r = router(DistributionStrategy::RoundRobin);
        r.add_rule(RoutingRule::new(TargetType::User).primary(["first"]).priority(5));
        r.add_rule(RoutingRule::new(TargetType::User).primary(["second"]).priority(5));
        r.add_rule(RoutingRule::new(TargetType::User).primary(["loser"]).priority(1));

        let outcome = r.route(&[Target::user("u1")]);
        assert!(outcome.groups.contains_key("first"));
    }

    #[test]
    fn wildcard_rule_catches_unmatched_types() {
        let r = router(DistributionStrategy::RoundRobin);
        r.add_rule(RoutingRule::new(TargetType::Email).primary(["smtp"]).priority(10));
        r.add_rule(RoutingRule::wildcard().primary(["webhook"]).priority(1));

        let outcome = r.route(&[Target::email("a@x.com"), Target::channel("ops")]);
        let got = assignments(&outcome);
        assert_eq!(got[&0], "smtp");
        assert_eq!(got[&1], "webhook");
    }

    #[test]
    fn unhealthy_primary_falls_back() {
        let health = Arc::new(HealthTracker::new(3));
        let r = Router::new(DistributionStrategy::RoundRobin, HashMap::new(), Arc::clone(&health));
        r.add_rule(
            RoutingRule::new(TargetType::User)
                .primary(["primary"])
                .fallback(["backup"])
                .priority(1),
        );

        for _ in 0..3 {
            health.record_failure("primary");
        }
        let outcome = r.route(&[Target::user("u1")]);
        assert!(assignments(&outcome).values().all(|p| p == "backup"));
    }

    #[test]
    fn no_healthy_platform_reports_failure() {
        let health = Arc::new(HealthTracker::new(3));
        let r = Router::new(DistributionStrategy::RoundRobin, HashMap::new(), Arc::clone(&health));
        r.add_rule(RoutingRule::new(TargetType::User).primary(["only"]).priority(1));

        for _ in 0..3 {
            health.record_failure("only");
        }
        let outcome = r.route(&[Target::user("u1")]);
        assert!(outcome.groups.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].2.kind, ErrorKind::PlatformUnavailable);
    }

    #[test]
    fn explicit_platform_pins_past_rules() {
        let r = router(DistributionStrategy::RoundRobin);
        r.add_rule(RoutingRule::new(TargetType::User).primary(["ruled"]).priority(1));

        let outcome = r.route(&[Target::user("u1").on_platform("pinned")]);
        assert!(outcome.groups.contains_key("pinned"));
        assert!(!outcome.groups.contains_key("ruled"));
    }

    #[test]
    fn missing_rule_reports_missing_platform() {
        let r = router(DistributionStrategy::RoundRobin);
        let outcome = r.route(&[Target::user("u1")]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].2.kind, ErrorKind::MissingPlatform);
    }

    #[test]
    fn weighted_ring_honors_weights() {
        let mut weights = HashMap::new();
        weights.insert("heavy".to_string(), 3u32);
        weights.insert("light".to_string(), 1u32);
        let r = Router::new(
            DistributionStrategy::Weighted,
            weights,
            Arc::new(HealthTracker::new(3)),
        );
        r.add_rule(
            RoutingRule::new(TargetType::User)
                .primary(["heavy", "light"])
                .priority(1),
        );

        let targets: Vec<Target> = (0..8).map(|i| Target::user(format!("u{}", i))).collect();
        let outcome = r.route(&targets);
        assert_eq!(outcome.groups["heavy"].len(), 6);
        assert_eq!(outcome.groups["light"].len(), 2);
    }

    #[test]
    fn cursor_survives_rule_addition() {
        let r = router(DistributionStrategy::RoundRobin);
        r.add_rule(
            RoutingRule::new(TargetType::User)
                .primary(["a", "b"])
                .priority(1),
        );

        let first = r.route(&[Target::user("u1")]);
        assert!(assignments(&first).values().all(|p| p == "a"));

        // A new unrelated rule must not reset the (a, b) cursor.
        r.add_rule(RoutingRule::new(TargetType::Email).primary(["smtp"]).priority(9));

        let second = r.route(&[Target::user("u2")]);
        assert!(assignments(&second).values().all(|p| p == "b"));
    }
}
