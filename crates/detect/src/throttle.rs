//! Per-rule notification throttling.
//!
//! Each rule carries a small state machine bounding how many notifications it
//! may emit. Once the configured maximum is hit the rule is disabled and
//! stays disabled until the resume-after cool-down elapses (or immediately
//! re-enables when no cool-down is configured). Config reloads replace the
//! policy in place without resetting counters, so a tightened limit can
//! trigger disablement on the very next increment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

// ── Policy ──────────────────────────────────────────────────────────

/// Rate-limit policy for one rule's notifications.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThrottlePolicy {
    /// Maximum notifications before the throttle disables. `None` = no cap.
    pub max_notifications: Option<u64>,
    /// Cool-down before a disabled throttle may re-enable. `None` =
    /// re-enable immediately on the next enable attempt.
    pub resume_after: Option<Duration>,
}

// ── State machine ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Enabled { count: u64 },
    Disabled { since: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct NotificationThrottle {
    state: State,
    last_notification: Option<DateTime<Utc>>,
    policy: ThrottlePolicy,
}

impl NotificationThrottle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            state: State::Enabled { count: 0 },
            last_notification: None,
            policy,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, State::Enabled { .. })
    }

    pub fn count(&self) -> u64 {
        match self.state {
            State::Enabled { count } => count,
            State::Disabled { .. } => 0,
        }
    }

    /// Account for one would-be notification. Returns whether it may be sent.
    pub fn increment_and_check(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            State::Disabled { .. } => false,
            State::Enabled { count } => {
                if let Some(max) = self.policy.max_notifications {
                    if count >= max {
                        debug!(count, max, "notification limit reached, disabling");
                        self.state = State::Disabled { since: now };
                        return false;
                    }
                }
                self.state = State::Enabled { count: count + 1 };
                self.last_notification = Some(now);
                true
            }
        }
    }

    /// Re-enable a disabled throttle once its cool-down has elapsed.
    ///
    /// Returns whether the throttle is enabled afterwards.
    pub fn enable_if_possible(&mut self, now: DateTime<Utc>) -> bool {
        if let State::Disabled { .. } = self.state {
            let resumable = match (self.policy.resume_after, self.last_notification) {
                (Some(resume_after), Some(last)) => now >= last + resume_after,
                // No cool-down policy, or never notified: resume at once.
                _ => true,
            };
            if resumable {
                info!("re-enabling notifications");
                self.state = State::Enabled { count: 0 };
            }
        }
        self.is_enabled()
    }

    /// Swap in a reloaded policy, preserving counters and disablement.
    pub fn update_policy(&mut self, policy: ThrottlePolicy) {
        self.policy = policy;
    }
}

// ── Throttle seam ───────────────────────────────────────────────────

/// What the pipeline needs from a throttle. Shared throttles synchronize
/// internally since the delivery path and the config-reload job may touch
/// the same rule concurrently.
pub trait Throttle: Send + Sync {
    fn increment_and_check(&self, now: DateTime<Utc>) -> bool;
    fn enable_if_possible(&self, now: DateTime<Utc>) -> bool;
}

/// Always-enabled variant for non-alerting consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopThrottle;

impl Throttle for NoopThrottle {
    fn increment_and_check(&self, _now: DateTime<Utc>) -> bool {
        true
    }

    fn enable_if_possible(&self, _now: DateTime<Utc>) -> bool {
        true
    }
}

impl Throttle for Mutex<NotificationThrottle> {
    fn increment_and_check(&self, now: DateTime<Utc>) -> bool {
        self.lock()
            .unwrap_or_else(|e| e.into_inner())
            .increment_and_check(now)
    }

    fn enable_if_possible(&self, now: DateTime<Utc>) -> bool {
        self.lock()
            .unwrap_or_else(|e| e.into_inner())
            .enable_if_possible(now)
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Process-wide map of per-rule throttles, keyed by rule UUID.
///
/// Entries are created lazily on first access and refreshed in place when a
/// rule's config is reloaded. Entries are never explicitly deleted; the map
/// is bounded by the number of active rules.
#[derive(Default)]
pub struct ThrottleRegistry {
    entries: Mutex<HashMap<Uuid, Arc<Mutex<NotificationThrottle>>>>,
}

impl ThrottleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the throttle for a rule, creating it with `policy` on first use.
    pub fn get_or_create(
        &self,
        rule_uuid: Uuid,
        policy: &ThrottlePolicy,
    ) -> Arc<Mutex<NotificationThrottle>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(rule_uuid)
            .or_insert_with(|| Arc::new(Mutex::new(NotificationThrottle::new(policy.clone()))))
            .clone()
    }

    /// Replace the policy of an existing entry in place, preserving counters.
    /// Unknown rules are ignored; they get the fresh policy on first use.
    pub fn refresh(&self, rule_uuid: Uuid, policy: &ThrottlePolicy) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(&rule_uuid) {
            entry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update_policy(policy.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
