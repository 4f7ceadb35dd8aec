use chrono::{DateTime, Utc};
use foreman_executor::{Invocation, OutcomeKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Health bookkeeping for one agent across a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Failures since the last success; used to deprioritize flaky agents.
    pub consecutive_failures: u32,
    pub total_failures: u32,
    pub total_successes: u32,
    /// Predicted instant the agent's rate limit resets, if it is limited.
    #[serde(default)]
    pub limited_until: Option<DateTime<Utc>>,
}

impl AgentHealth {
    /// Records one classified outcome. `cooldown` is the profile's
    /// predicted reset window, applied when the outcome is a rate limit.
    pub fn record(&mut self, kind: OutcomeKind, cooldown: Duration) {
        match kind {
            OutcomeKind::Success => {
                self.consecutive_failures = 0;
                self.total_successes += 1;
                self.limited_until = None;
            }
            OutcomeKind::RateLimited => {
                self.consecutive_failures += 1;
                self.total_failures += 1;
                self.limited_until = Some(
                    Utc::now()
                        + chrono::Duration::from_std(cooldown)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300)),
                );
            }
            _ => {
                self.consecutive_failures += 1;
                self.total_failures += 1;
            }
        }
    }

    /// Whether the agent is predicted to still be rate limited at `now`.
    pub fn is_limited(&self, now: DateTime<Utc>) -> bool {
        self.limited_until.is_some_and(|until| until > now)
    }

    /// Time remaining until the predicted reset, if limited at `now`.
    pub fn reset_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        let until = self.limited_until?;
        (until > now).then(|| (until - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Aggregate metrics for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub packages_completed: u32,
    pub packages_failed: u32,
    pub invocations_dispatched: u32,
    pub peak_concurrency: u32,
    pub duration_ms: u64,
}

/// Process-wide state for one feature run: active invocations, agent
/// health, and metrics. Created at run start, updated continuously,
/// persisted for resumability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub run_id: Uuid,
    pub feature: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Invocations not yet in a terminal state, by invocation id.
    #[serde(default)]
    pub active_invocations: HashMap<Uuid, Invocation>,
    /// Terminal invocations, kept for the audit trail.
    #[serde(default)]
    pub archived_invocations: Vec<Invocation>,
    #[serde(default)]
    pub agent_health: HashMap<String, AgentHealth>,
    #[serde(default)]
    pub metrics: RunMetrics,
}

impl OrchestrationState {
    pub fn new(feature: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            feature: feature.into(),
            started_at: now,
            updated_at: now,
            active_invocations: HashMap::new(),
            archived_invocations: Vec::new(),
            agent_health: HashMap::new(),
            metrics: RunMetrics::default(),
        }
    }

    /// Count of invocations currently marked running.
    pub fn running_count(&self) -> u32 {
        self.active_invocations
            .values()
            .filter(|inv| inv.state == foreman_executor::InvocationState::Running)
            .count() as u32
    }

    /// Count of running invocations assigned to one agent, for the
    /// per-agent concurrency ceiling.
    pub fn running_on_agent(&self, agent_id: &str) -> usize {
        self.active_invocations
            .values()
            .filter(|inv| {
                inv.agent_id == agent_id
                    && inv.state == foreman_executor::InvocationState::Running
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_success_resets_streak() {
        let mut health = AgentHealth::default();
        health.record(OutcomeKind::Failed, Duration::from_secs(60));
        health.record(OutcomeKind::Timeout, Duration::from_secs(60));
        assert_eq!(health.consecutive_failures, 2);

        health.record(OutcomeKind::Success, Duration::from_secs(60));
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_failures, 2);
        assert_eq!(health.total_successes, 1);
    }

    #[test]
    fn test_health_rate_limit_predicts_reset() {
        let mut health = AgentHealth::default();
        health.record(OutcomeKind::RateLimited, Duration::from_secs(600));

        let now = Utc::now();
        assert!(health.is_limited(now));
        let reset = health.reset_in(now).unwrap();
        assert!(reset <= Duration::from_secs(600));
        assert!(reset > Duration::from_secs(590));

        // A success clears the prediction.
        health.record(OutcomeKind::Success, Duration::from_secs(600));
        assert!(!health.is_limited(Utc::now()));
    }

    #[test]
    fn test_limited_in_the_past_is_not_limited() {
        let health = AgentHealth {
            limited_until: Some(Utc::now() - chrono::Duration::seconds(10)),
            ..Default::default()
        };
        assert!(!health.is_limited(Utc::now()));
        assert!(health.reset_in(Utc::now()).is_none());
    }

    #[test]
    fn test_state_roundtrip() {
        let state = OrchestrationState::new("feat-login");
        let json = serde_json::to_string(&state).unwrap();
        let back: OrchestrationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, state.run_id);
        assert_eq!(back.feature, "feat-login");
    }
}
