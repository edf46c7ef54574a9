//! Adaptive risk adjustment.
//!
//! Five independent contributions — role, trust, task context, behavioral
//! prior, and time of day — each add a delta to the base risk produced by
//! the detection channels. Every applied contribution is recorded as a
//! short tagged string so the final decision is fully explainable.
//!
//! Trust can rise through false-positive feedback, one level at a time,
//! never above HIGH via that channel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::store::SessionContext;
use crate::Result;

/// User roles, in increasing order of default trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    Unknown,
    User,
    Developer,
    Admin,
    Service,
    TrustedService,
}

/// Trust levels derived from role and history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    #[default]
    Untrusted,
    Low,
    Medium,
    High,
    Verified,
}

impl TrustLevel {
    fn raise(self) -> Self {
        match self {
            Self::Untrusted => Self::Low,
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            // Feedback never raises past HIGH.
            Self::High | Self::Verified => self,
        }
    }
}

/// Task context of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskContext {
    #[default]
    Unknown,
    FileOperation,
    CodeReview,
    DataAnalysis,
    ApiIntegration,
    Deployment,
    Testing,
    Debugging,
}

/// Default role-to-trust mapping.
fn default_trust(role: UserRole) -> TrustLevel {
    match role {
        UserRole::Unknown => TrustLevel::Untrusted,
        UserRole::User => TrustLevel::Low,
        UserRole::Developer => TrustLevel::Medium,
        UserRole::Admin => TrustLevel::High,
        UserRole::Service => TrustLevel::Medium,
        UserRole::TrustedService => TrustLevel::Verified,
    }
}

/// Profile tracking one user's behavior and trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub role: UserRole,
    pub trust_level: TrustLevel,
    pub total_calls: u64,
    pub blocked_calls: u64,
    pub false_positive_reports: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Tools this user routinely calls.
    pub typical_tools: Vec<String>,
    /// Hours of day (0-23) this user routinely works in.
    pub typical_hours: Vec<u32>,
}

impl UserProfile {
    fn new(user_id: &str, role: UserRole, trust: TrustLevel) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            role,
            trust_level: trust,
            total_calls: 0,
            blocked_calls: 0,
            false_positive_reports: 0,
            first_seen: now,
            last_seen: now,
            typical_tools: Vec::new(),
            typical_hours: Vec::new(),
        }
    }
}

/// One adjusted decision.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveDecision {
    pub original_risk: f64,
    pub adjusted_risk: f64,
    /// Sum of all applied deltas.
    pub total_adjustment: f64,
    /// Tagged contribution strings, e.g. `role:developer:-0.15`.
    pub adjustments: Vec<String>,
    /// True when the adjusted risk stays below the threshold.
    pub allow: bool,
    pub threshold: f64,
}

/// Aggregate engine statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub total_decisions: u64,
    pub adaptations_applied: u64,
    /// Decisions where adjustment flipped a would-be block to allow.
    pub overrides_to_allow: u64,
}

/// The adaptive policy engine.
pub struct AdaptiveEngine {
    profiles: DashMap<String, Arc<Mutex<UserProfile>>>,
    stats: Mutex<EngineStats>,
    threshold: f64,
    /// False-positive reports needed before a trust raise.
    feedback_threshold: u64,
}

impl AdaptiveEngine {
    /// Creates an engine with the given decision threshold.
    pub fn new(threshold: f64) -> Self {
        Self {
            profiles: DashMap::new(),
            stats: Mutex::new(EngineStats::default()),
            threshold,
            feedback_threshold: 3,
        }
    }

    /// Registers a user, or updates the role of an existing one.
    pub fn register_user(&self, user_id: &str, role: UserRole, trust: Option<TrustLevel>) {
        match self.profiles.entry(user_id.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let trust = trust.unwrap_or_else(|| default_trust(role));
                entry.insert(Arc::new(Mutex::new(UserProfile::new(user_id, role, trust))));
                info!(user = user_id, ?role, ?trust, "registered user profile");
            }
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let mut profile = entry.get().lock();
                profile.role = role;
                if let Some(trust) = trust {
                    profile.trust_level = trust;
                }
            }
        }
    }

    /// The profile handle for a user, if registered.
    pub fn profile(&self, user_id: &str) -> Option<Arc<Mutex<UserProfile>>> {
        self.profiles.get(user_id).map(|entry| entry.clone())
    }

    /// Computes the adjusted risk and decision for one call.
    ///
    /// `hour` is the caller's local hour of day, passed explicitly so the
    /// temporal contribution is testable.
    pub fn adjust(
        &self,
        user_id: &str,
        session: &SessionContext,
        base_risk: f64,
        tool_name: &str,
        hour: u32,
    ) -> AdaptiveDecision {
        self.stats.lock().total_decisions += 1;

        if !self.profiles.contains_key(user_id) {
            self.register_user(user_id, UserRole::User, None);
        }
        let handle = self
            .profiles
            .get(user_id)
            .map(|entry| entry.clone())
            .expect("profile registered above");
        let mut profile = handle.lock();

        let tool_lower = tool_name.to_lowercase();
        let mut adjustments = Vec::new();
        let mut total = 0.0;

        // 1. Role.
        let role_delta = role_adjustment(profile.role, &tool_lower);
        if role_delta != 0.0 {
            total += role_delta;
            adjustments.push(format!("role:{:?}:{:+.2}", profile.role, role_delta));
        }

        // 2. Trust.
        let trust_delta = trust_adjustment(profile.trust_level);
        if trust_delta != 0.0 {
            total += trust_delta;
            adjustments.push(format!("trust:{:?}:{:+.2}", profile.trust_level, trust_delta));
        }

        // 3. Task context.
        let task_delta = task_adjustment(session.task_context, &tool_lower);
        if task_delta != 0.0 {
            total += task_delta;
            adjustments.push(format!("task:{:?}:{:+.2}", session.task_context, task_delta));
        }

        // 4. Behavioral prior.
        let behavior_delta = behavioral_adjustment(&profile, tool_name);
        if behavior_delta != 0.0 {
            total += behavior_delta;
            adjustments.push(format!("behavior:{:+.2}", behavior_delta));
        }

        // 5. Temporal.
        let temporal_delta = temporal_adjustment(&profile, hour);
        if temporal_delta != 0.0 {
            total += temporal_delta;
            adjustments.push(format!("temporal:{:+.2}", temporal_delta));
        }

        let adjusted = (base_risk + total).clamp(0.0, 1.0);
        let allow = adjusted < self.threshold;

        {
            let mut stats = self.stats.lock();
            if !adjustments.is_empty() {
                stats.adaptations_applied += 1;
            }
            if allow && base_risk >= self.threshold {
                stats.overrides_to_allow += 1;
            }
        }

        profile.total_calls += 1;
        profile.last_seen = Utc::now();
        if !allow {
            profile.blocked_calls += 1;
        }

        debug!(
            user = user_id,
            base_risk,
            adjusted,
            allow,
            applied = adjustments.len(),
            "adaptive decision"
        );

        AdaptiveDecision {
            original_risk: base_risk,
            adjusted_risk: adjusted,
            total_adjustment: total,
            adjustments,
            allow,
            threshold: self.threshold,
        }
    }

    /// Records a false-positive report. After enough reports the user's
    /// trust rises one level, never above HIGH through this channel.
    pub fn report_false_positive(&self, user_id: &str) -> Result<()> {
        let handle = self
            .profiles
            .get(user_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| SessionError::UnknownUser(user_id.to_string()))?;
        let mut profile = handle.lock();
        profile.false_positive_reports += 1;

        if profile.false_positive_reports > self.feedback_threshold
            && profile.trust_level < TrustLevel::High
        {
            let old = profile.trust_level;
            profile.trust_level = profile.trust_level.raise();
            info!(
                user = user_id,
                ?old,
                new = ?profile.trust_level,
                "raised trust after false-positive feedback"
            );
        }
        Ok(())
    }

    /// Engine statistics.
    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }
}

fn role_adjustment(role: UserRole, tool_lower: &str) -> f64 {
    match role {
        UserRole::Developer | UserRole::Admin => {
            if ["file", "read", "write", "list"]
                .iter()
                .any(|keyword| tool_lower.contains(keyword))
            {
                -0.15
            } else {
                0.0
            }
        }
        UserRole::Service | UserRole::TrustedService => -0.10,
        UserRole::Unknown => 0.05,
        UserRole::User => 0.0,
    }
}

fn trust_adjustment(trust: TrustLevel) -> f64 {
    match trust {
        TrustLevel::Untrusted => 0.10,
        TrustLevel::Low => 0.0,
        TrustLevel::Medium => -0.10,
        TrustLevel::High => -0.15,
        TrustLevel::Verified => -0.20,
    }
}

fn task_adjustment(task: TaskContext, tool_lower: &str) -> f64 {
    match task {
        TaskContext::CodeReview => {
            if tool_lower.contains("read") || tool_lower.contains("list") {
                -0.15
            } else {
                0.0
            }
        }
        TaskContext::Testing | TaskContext::Debugging => -0.10,
        TaskContext::Deployment => {
            if ["exec", "run", "deploy"]
                .iter()
                .any(|keyword| tool_lower.contains(keyword))
            {
                -0.10
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

fn behavioral_adjustment(profile: &UserProfile, tool_name: &str) -> f64 {
    if profile.typical_tools.iter().any(|tool| tool == tool_name) {
        return -0.05;
    }
    if profile.total_calls > 100 {
        let rate =
            profile.false_positive_reports as f64 / profile.blocked_calls.max(1) as f64;
        if rate > 0.3 {
            return -0.10;
        }
    }
    0.0
}

fn temporal_adjustment(profile: &UserProfile, hour: u32) -> f64 {
    if (9..=18).contains(&hour) {
        return -0.05;
    }
    if hour >= 23 || hour <= 5 {
        return 0.05;
    }
    if profile.typical_hours.contains(&hour) {
        return -0.03;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionContext {
        SessionContext::new("sess-1", "u1", TaskContext::Unknown)
    }

    fn session_with(task: TaskContext) -> SessionContext {
        SessionContext::new("sess-1", "u1", task)
    }

    #[test]
    fn test_default_trust_mapping() {
        assert_eq!(default_trust(UserRole::Unknown), TrustLevel::Untrusted);
        assert_eq!(default_trust(UserRole::User), TrustLevel::Low);
        assert_eq!(default_trust(UserRole::Developer), TrustLevel::Medium);
        assert_eq!(default_trust(UserRole::Admin), TrustLevel::High);
        assert_eq!(default_trust(UserRole::Service), TrustLevel::Medium);
        assert_eq!(default_trust(UserRole::TrustedService), TrustLevel::Verified);
    }

    #[test]
    fn test_developer_read_in_review_reduces_risk() {
        let engine = AdaptiveEngine::new(0.70);
        engine.register_user("dev1", UserRole::Developer, None);

        let decision = engine.adjust(
            "dev1",
            &session_with(TaskContext::CodeReview),
            0.75,
            "read_file",
            14,
        );
        // role -0.15, trust(Medium) -0.10, task -0.15, temporal -0.05.
        assert!(decision.adjusted_risk < 0.70);
        assert!(decision.allow);
        assert!(decision.adjustments.len() >= 4);
    }

    #[test]
    fn test_unknown_user_late_night_raises_risk() {
        let engine = AdaptiveEngine::new(0.70);
        engine.register_user("ghost", UserRole::Unknown, None);

        let decision = engine.adjust("ghost", &session(), 0.60, "execute_command", 3);
        // role +0.05, trust(Untrusted) +0.10, temporal +0.05.
        assert!(decision.adjusted_risk > 0.70);
        assert!(!decision.allow);
    }

    #[test]
    fn test_adjustments_are_tagged() {
        let engine = AdaptiveEngine::new(0.70);
        engine.register_user("dev1", UserRole::Developer, None);
        let decision = engine.adjust("dev1", &session(), 0.5, "read_file", 12);
        assert!(decision
            .adjustments
            .iter()
            .any(|tag| tag.starts_with("role:")));
        assert!(decision
            .adjustments
            .iter()
            .any(|tag| tag.starts_with("trust:")));
    }

    #[test]
    fn test_adjusted_risk_clamped() {
        let engine = AdaptiveEngine::new(0.70);
        engine.register_user("svc", UserRole::TrustedService, None);
        let decision = engine.adjust("svc", &session_with(TaskContext::Testing), 0.05, "ping", 12);
        assert!(decision.adjusted_risk >= 0.0);
    }

    #[test]
    fn test_unregistered_user_defaults_to_user_role() {
        let engine = AdaptiveEngine::new(0.70);
        let decision = engine.adjust("new-user", &session(), 0.5, "read_file", 12);
        // USER role, LOW trust: only the temporal business-hours delta.
        assert!((decision.adjusted_risk - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_false_positive_feedback_raises_trust_capped_at_high() {
        let engine = AdaptiveEngine::new(0.70);
        engine.register_user("u1", UserRole::User, None);

        for _ in 0..20 {
            engine.report_false_positive("u1").unwrap();
        }
        let profile = engine.profile("u1").unwrap();
        let trust = profile.lock().trust_level;
        assert_eq!(trust, TrustLevel::High);
    }

    #[test]
    fn test_false_positive_unknown_user_errors() {
        let engine = AdaptiveEngine::new(0.70);
        assert!(engine.report_false_positive("nobody").is_err());
    }

    #[test]
    fn test_typical_tool_prior() {
        let engine = AdaptiveEngine::new(0.70);
        engine.register_user("u1", UserRole::User, None);
        engine
            .profile("u1")
            .unwrap()
            .lock()
            .typical_tools
            .push("read_file".to_string());

        let decision = engine.adjust("u1", &session(), 0.5, "read_file", 20);
        assert!(decision
            .adjustments
            .iter()
            .any(|tag| tag.starts_with("behavior:")));
    }

    #[test]
    fn test_stats_track_overrides() {
        let engine = AdaptiveEngine::new(0.70);
        engine.register_user("dev1", UserRole::Developer, None);
        engine.adjust(
            "dev1",
            &session_with(TaskContext::CodeReview),
            0.75,
            "read_file",
            14,
        );
        let stats = engine.stats();
        assert_eq!(stats.total_decisions, 1);
        assert_eq!(stats.overrides_to_allow, 1);
    }

    #[test]
    fn test_profile_counters_updated() {
        let engine = AdaptiveEngine::new(0.70);
        engine.register_user("u1", UserRole::User, None);
        engine.adjust("u1", &session(), 0.9, "execute_command", 3);
        let profile = engine.profile("u1").unwrap();
        let profile = profile.lock();
        assert_eq!(profile.total_calls, 1);
        assert_eq!(profile.blocked_calls, 1);
    }
}
