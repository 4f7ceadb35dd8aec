use crate::state::{AgentHealth, OrchestrationState};
use crate::store::{process_alive, RunLock, StateStore};
use chrono::Utc;
use foreman_core::ForemanResult;
use foreman_executor::{Invocation, InvocationState, OutcomeKind};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Reason recorded when a resume finds an invocation that claims to be
/// running but has no live process behind it.
pub const ORPHAN_REASON: &str = "orphaned-on-resume";

/// A dispatch candidate for agent selection: the agent and its profile's
/// concurrency ceiling.
#[derive(Debug, Clone)]
pub struct AgentCandidate {
    pub agent_id: String,
    pub max_concurrent: usize,
}

/// Owns the run's [`OrchestrationState`], persisting it atomically after
/// every transition. Holds the feature's advisory run lock for its whole
/// lifetime, so two managers can never drive the same feature at once.
pub struct StateManager {
    store: StateStore,
    state: OrchestrationState,
    _lock: RunLock,
}

impl StateManager {
    /// Starts a fresh run for a feature.
    pub async fn start(dir: impl Into<PathBuf>, feature: &str) -> ForemanResult<Self> {
        let store = StateStore::new(dir).await?;
        let lock = store.acquire_lock(feature).await?;
        let state = OrchestrationState::new(feature);
        store.save(&state).await?;

        info!(feature = %feature, run_id = %state.run_id, "orchestration run started");
        Ok(Self {
            store,
            state,
            _lock: lock,
        })
    }

    /// Resumes a previous run.
    ///
    /// Every invocation recorded as live but with no process behind it is
    /// resolved to `failed` with [`ORPHAN_REASON`] — never assumed
    /// successful — and returned so the caller can append the matching
    /// status events and re-enter the fallback path.
    pub async fn resume(
        dir: impl Into<PathBuf>,
        feature: &str,
        run_id: Uuid,
    ) -> ForemanResult<(Self, Vec<Invocation>)> {
        let store = StateStore::new(dir).await?;
        let lock = store.acquire_lock(feature).await?;
        let mut state = store.load(run_id).await?;

        let orphaned_ids: Vec<Uuid> = state
            .active_invocations
            .values()
            .filter(|inv| {
                !inv.state.is_terminal() && !inv.pid.is_some_and(process_alive)
            })
            .map(|inv| inv.invocation_id)
            .collect();

        let mut orphans = Vec::with_capacity(orphaned_ids.len());
        for id in orphaned_ids {
            if let Some(mut inv) = state.active_invocations.remove(&id) {
                warn!(
                    invocation = %inv.invocation_id,
                    wp = %inv.work_package_id,
                    agent = %inv.agent_id,
                    "resolving orphaned invocation to failed"
                );
                inv.finish(InvocationState::Failed, None);
                state.archived_invocations.push(inv.clone());
                orphans.push(inv);
            }
        }

        state.updated_at = Utc::now();
        store.save(&state).await?;

        info!(
            feature = %feature,
            run_id = %run_id,
            orphans = orphans.len(),
            "orchestration run resumed"
        );

        let manager = Self {
            store,
            state,
            _lock: lock,
        };
        Ok((manager, orphans))
    }

    /// A point-in-time copy of the run state.
    pub fn snapshot(&self) -> OrchestrationState {
        self.state.clone()
    }

    pub fn state(&self) -> &OrchestrationState {
        &self.state
    }

    /// Registers a dispatched invocation as active and persists.
    pub async fn record_dispatch(&mut self, invocation: Invocation) -> ForemanResult<()> {
        self.state
            .active_invocations
            .insert(invocation.invocation_id, invocation);
        self.state.metrics.invocations_dispatched += 1;

        let running = self.state.running_count();
        if running > self.state.metrics.peak_concurrency {
            self.state.metrics.peak_concurrency = running;
        }

        self.persist().await
    }

    /// Overwrites an active invocation record in place (workspace assigned,
    /// pid learned) without counting a new dispatch.
    pub async fn update_invocation(&mut self, invocation: Invocation) -> ForemanResult<()> {
        self.state
            .active_invocations
            .insert(invocation.invocation_id, invocation);
        self.persist().await
    }

    /// Archives a finished invocation, updates the agent's health, and
    /// persists. `cooldown` is the agent profile's predicted rate-limit
    /// reset window.
    pub async fn record_outcome(
        &mut self,
        invocation: Invocation,
        kind: OutcomeKind,
        cooldown: Duration,
    ) -> ForemanResult<()> {
        self.state
            .active_invocations
            .remove(&invocation.invocation_id);
        let agent_id = invocation.agent_id.clone();
        self.state.archived_invocations.push(invocation);

        self.record_health(&agent_id, kind, cooldown);
        self.persist().await
    }

    /// Updates one agent's health counters in place (no persistence; the
    /// surrounding transition persists).
    pub fn record_health(&mut self, agent_id: &str, kind: OutcomeKind, cooldown: Duration) {
        self.state
            .agent_health
            .entry(agent_id.to_string())
            .or_default()
            .record(kind, cooldown);
    }

    pub fn health(&self, agent_id: &str) -> Option<&AgentHealth> {
        self.state.agent_health.get(agent_id)
    }

    /// Predicted time until an agent's rate limit resets, if limited now.
    pub fn predicted_reset(&self, agent_id: &str) -> Option<Duration> {
        self.health(agent_id)?.reset_in(Utc::now())
    }

    /// Picks the agent to dispatch from preference-ordered candidates.
    ///
    /// Skips agents at their concurrency ceiling or inside a predicted
    /// rate-limit window, and deprioritizes agents with longer failure
    /// streaks; preference order breaks ties.
    pub fn select_agent(&self, candidates: &[AgentCandidate]) -> Option<String> {
        let now = Utc::now();

        let mut eligible: Vec<(u32, usize, &str)> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| self.state.running_on_agent(&c.agent_id) < c.max_concurrent)
            .filter(|(_, c)| {
                !self
                    .state
                    .agent_health
                    .get(&c.agent_id)
                    .is_some_and(|h| h.is_limited(now))
            })
            .map(|(pos, c)| {
                let streak = self
                    .state
                    .agent_health
                    .get(&c.agent_id)
                    .map_or(0, |h| h.consecutive_failures);
                (streak, pos, c.agent_id.as_str())
            })
            .collect();

        eligible.sort();
        eligible.first().map(|(_, _, id)| (*id).to_string())
    }

    /// Cancels every non-terminal invocation, archiving each as
    /// `cancelled`, and persists. Used when the run itself is cancelled;
    /// the processes behind these records are killed by their supervising
    /// tasks being dropped.
    pub async fn cancel_active(&mut self) -> ForemanResult<Vec<Invocation>> {
        let ids: Vec<Uuid> = self.state.active_invocations.keys().copied().collect();
        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut inv) = self.state.active_invocations.remove(&id) {
                inv.finish(InvocationState::Cancelled, None);
                self.state.archived_invocations.push(inv.clone());
                cancelled.push(inv);
            }
        }
        self.persist().await?;
        Ok(cancelled)
    }

    /// Records a work package reaching `done`.
    pub async fn record_package_done(&mut self) -> ForemanResult<()> {
        self.state.metrics.packages_completed += 1;
        self.persist().await
    }

    /// Records a work package failing permanently.
    pub async fn record_package_failed(&mut self) -> ForemanResult<()> {
        self.state.metrics.packages_failed += 1;
        self.persist().await
    }

    async fn persist(&mut self) -> ForemanResult<()> {
        let now = Utc::now();
        self.state.updated_at = now;
        self.state.metrics.duration_ms =
            u64::try_from((now - self.state.started_at).num_milliseconds().max(0))
                .unwrap_or(u64::MAX);
        self.store.save(&self.state).await
    }
}
