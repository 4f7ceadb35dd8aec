use foreman_core::{
    AgentRole, Evidence, ForemanResult, Lane, StatusEvent, WorkPackage, WpId,
};
use foreman_events::StatusLog;
use foreman_executor::{
    runner, AgentRegistry, FallbackAction, FallbackMachine, Invocation, InvocationRequest,
    ValidationHook, Verdict, WorkspaceProvider,
};
use foreman_state::{AgentCandidate, StateManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Actor recorded on engine-authored events.
const ENGINE_ACTOR: &str = "engine";

/// How long to wait before re-trying agent selection when every candidate
/// is saturated or rate limited.
const SELECT_RETRY: Duration = Duration::from_millis(250);

/// Everything a work-package task needs, shared behind `Arc`. The log and
/// state manager sit behind mutexes so appends stay serialized per feature
/// and the state file keeps a single writer.
pub(crate) struct Shared {
    pub registry: AgentRegistry,
    pub log: Mutex<StatusLog>,
    pub state: Mutex<StateManager>,
    pub workspaces: Box<dyn WorkspaceProvider>,
    pub hook: Box<dyn ValidationHook>,
}

impl Shared {
    async fn append(&self, event: StatusEvent) -> ForemanResult<()> {
        self.log.lock().await.append(event).await
    }
}

/// Result of one role's dispatch loop.
enum RolePhase {
    Succeeded { agent: String, invocation_id: Uuid },
    GaveUp(String),
}

/// Drives one work package from `start_lane` to a terminal or parked lane:
/// claim, build, review, done — with the fallback machine absorbing
/// invocation failures along the way. Returns the lane the package ended
/// in.
pub(crate) async fn drive(
    shared: Arc<Shared>,
    wp: WorkPackage,
    start_lane: Lane,
) -> ForemanResult<Lane> {
    let mut lane = start_lane;

    if lane == Lane::Planned {
        shared
            .append(
                StatusEvent::new(wp.id.clone(), Lane::Planned, Lane::Claimed, ENGINE_ACTOR)
                    .with_reason("scheduled: dependencies satisfied"),
            )
            .await?;
        lane = Lane::Claimed;
    }

    if lane == Lane::Claimed {
        shared
            .append(StatusEvent::new(
                wp.id.clone(),
                Lane::Claimed,
                Lane::InProgress,
                ENGINE_ACTOR,
            ))
            .await?;
        lane = Lane::InProgress;
    }

    let mut builder_agent = None;
    if lane == Lane::InProgress {
        match run_role(&shared, &wp, AgentRole::Builder, None).await? {
            RolePhase::Succeeded { agent, .. } => {
                shared
                    .append(
                        StatusEvent::new(
                            wp.id.clone(),
                            Lane::InProgress,
                            Lane::ForReview,
                            agent.clone(),
                        )
                        .with_reason("implementation finished"),
                    )
                    .await?;
                builder_agent = Some(agent);
                lane = Lane::ForReview;
            }
            RolePhase::GaveUp(reason) => {
                return park(&shared, &wp.id, Lane::InProgress, reason).await;
            }
        }
    }

    if lane == Lane::ForReview {
        match run_role(&shared, &wp, AgentRole::Reviewer, builder_agent.as_deref()).await? {
            RolePhase::Succeeded {
                agent,
                invocation_id,
            } => {
                match shared.hook.verdict(&wp.id, Lane::ForReview, Lane::Done).await {
                    Verdict::Block(why) => {
                        warn!(wp = %wp.id, why = %why, "validation hook blocked completion");
                        return park(
                            &shared,
                            &wp.id,
                            Lane::ForReview,
                            format!("blocked by validation hook: {why}"),
                        )
                        .await;
                    }
                    Verdict::Warn(note) => {
                        warn!(wp = %wp.id, note = %note, "validation hook warning");
                    }
                    Verdict::Pass => {}
                }

                shared
                    .append(
                        StatusEvent::new(wp.id.clone(), Lane::ForReview, Lane::Done, agent)
                            .with_evidence(Evidence::approval(invocation_id.to_string())),
                    )
                    .await?;
                shared.state.lock().await.record_package_done().await?;
                return Ok(Lane::Done);
            }
            RolePhase::GaveUp(reason) => {
                return park(&shared, &wp.id, Lane::ForReview, reason).await;
            }
        }
    }

    Ok(lane)
}

/// Records a permanent failure: the package moves to `blocked` pending
/// human intervention, with the reason on the event and the full trail in
/// the log.
async fn park(
    shared: &Arc<Shared>,
    wp: &WpId,
    from: Lane,
    reason: String,
) -> ForemanResult<Lane> {
    error!(wp = %wp, reason = %reason, "work package halted");
    shared
        .append(StatusEvent::new(wp.clone(), from, Lane::Blocked, ENGINE_ACTOR).with_reason(reason))
        .await?;
    shared.state.lock().await.record_package_failed().await?;
    Ok(Lane::Blocked)
}

/// Dispatch loop for one role: select, invoke, classify, and let the
/// fallback machine decide the next move until success or exhaustion.
///
/// Selection and dispatch registration happen under one state-manager lock
/// acquisition, so per-agent concurrency ceilings hold even when several
/// packages become ready in the same scheduling pass. `predecessor` is the
/// agent that produced the work now being acted on; when the same agent is
/// picked again an enforced pause reduces context bleed between roles.
async fn run_role(
    shared: &Arc<Shared>,
    wp: &WorkPackage,
    role: AgentRole,
    predecessor: Option<&str>,
) -> ForemanResult<RolePhase> {
    let mut machine: Option<FallbackMachine> = None;
    // Set by the fallback machine on retries; the first attempt goes
    // through health-aware selection instead.
    let mut directed: Option<String> = None;

    loop {
        let (agent, mut invocation) =
            reserve_slot(shared, wp, role, directed.as_deref(), &machine).await?;

        let first_attempt = machine.is_none();
        let machine = machine.get_or_insert_with(|| {
            FallbackMachine::new(
                shared.registry.fallback.clone(),
                rotated_preferences(shared, wp, role, &agent),
            )
        });

        if first_attempt && predecessor == Some(agent.as_str()) {
            let delay = shared.registry.fallback.same_agent_delay_seconds;
            if delay > 0 {
                info!(wp = %wp.id, agent = %agent, delay_s = delay, "same-agent pause");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }

        let profile = shared.registry.profile(&agent)?.clone();
        let request = InvocationRequest {
            work_package_id: wp.id.clone(),
            role,
            prompt: prompt_for(wp, role),
        };

        let workspace = shared.workspaces.provision(&wp.id, role).await?;
        invocation.workspace = workspace.clone();
        shared
            .state
            .lock()
            .await
            .update_invocation(invocation.clone())
            .await?;

        let outcome = runner::run(&profile, &request, &mut invocation).await?;

        let cooldown = Duration::from_secs(profile.rate_limit.cooldown_seconds);
        shared
            .state
            .lock()
            .await
            .record_outcome(invocation.clone(), outcome.kind, cooldown)
            .await?;
        shared.workspaces.teardown(&workspace).await?;

        if outcome.kind.is_success() {
            return Ok(RolePhase::Succeeded {
                agent,
                invocation_id: invocation.invocation_id,
            });
        }

        let predicted = shared.state.lock().await.predicted_reset(&agent);
        match machine.next_action(&outcome.kind, predicted) {
            FallbackAction::TryAgent { agent_id, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                directed = Some(agent_id);
            }
            FallbackAction::Hold { agent_id, delay } => {
                info!(wp = %wp.id, agent = %agent_id, delay_s = delay.as_secs(), "holding for retry");
                tokio::time::sleep(delay).await;
                directed = Some(agent_id);
            }
            FallbackAction::GiveUp { reason } => {
                let summary = outcome.summary.unwrap_or_default();
                return Ok(RolePhase::GaveUp(format!(
                    "{role} exhausted fallback: {reason}; last output: {summary}"
                )));
            }
        }
    }
}

/// Atomically picks an agent and registers the dispatch, retrying until a
/// candidate has a free slot.
///
/// First attempts go through [`StateManager::select_agent`] (preference
/// order, failure-streak deprioritization, rate-limit windows). Retries
/// directed by the fallback machine only wait for the directed agent's
/// concurrency ceiling.
async fn reserve_slot(
    shared: &Arc<Shared>,
    wp: &WorkPackage,
    role: AgentRole,
    directed: Option<&str>,
    machine: &Option<FallbackMachine>,
) -> ForemanResult<(String, Invocation)> {
    loop {
        {
            let mut state = shared.state.lock().await;

            let pick = match directed {
                Some(agent) => {
                    let ceiling = shared.registry.profile(agent)?.max_concurrent;
                    (state.state().running_on_agent(agent) < ceiling)
                        .then(|| agent.to_string())
                }
                None => state.select_agent(&candidates_for(&shared.registry, wp, role)),
            };

            if let Some(agent) = pick {
                let mut invocation =
                    Invocation::new(&agent, wp.id.clone(), role, PathBuf::new());
                if let Some(m) = machine {
                    invocation.retry_count = m.attempts();
                }
                invocation.mark_running(None);
                state.record_dispatch(invocation.clone()).await?;
                return Ok((agent, invocation));
            }
        }

        tokio::time::sleep(SELECT_RETRY).await;
    }
}

/// Dispatch candidates for a role: the package's pinned agent when set,
/// otherwise the registry preference list, each carrying its profile's
/// concurrency ceiling.
fn candidates_for(
    registry: &AgentRegistry,
    wp: &WorkPackage,
    role: AgentRole,
) -> Vec<AgentCandidate> {
    let names = match wp.agents.get(&role) {
        Some(pinned) => vec![pinned.clone()],
        None => registry.preferences(role),
    };
    names
        .into_iter()
        .filter_map(|name| {
            registry.profile(&name).ok().map(|p| AgentCandidate {
                agent_id: name,
                max_concurrent: p.max_concurrent,
            })
        })
        .collect()
}

/// The role's preference list, rotated so the selected agent is tried
/// first and `next_in_list` continues from there. A pinned agent narrows
/// the list to itself.
fn rotated_preferences(
    shared: &Arc<Shared>,
    wp: &WorkPackage,
    role: AgentRole,
    initial: &str,
) -> Vec<String> {
    if let Some(pinned) = wp.agents.get(&role) {
        return vec![pinned.clone()];
    }
    let mut prefs = shared.registry.preferences(role);
    if let Some(pos) = prefs.iter().position(|a| a == initial) {
        prefs.rotate_left(pos);
    }
    prefs
}

/// Minimal prompt text; full prompt materialization belongs to the
/// project-scaffolding layer and arrives pre-rendered in real deployments.
fn prompt_for(wp: &WorkPackage, role: AgentRole) -> String {
    match role {
        AgentRole::Builder => {
            let mut prompt = format!("Implement work package {}: {}.", wp.id, wp.title);
            if !wp.subtasks.is_empty() {
                prompt.push_str("\nSubtasks:");
                for sub in &wp.subtasks {
                    prompt.push_str(&format!("\n- {}", sub.name));
                }
            }
            prompt
        }
        AgentRole::Reviewer => format!(
            "Review the completed implementation of work package {}: {}. \
             Exit non-zero if it must not ship.",
            wp.id, wp.title
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_subtasks() {
        let wp = WorkPackage::new("wp-auth", "Authentication")
            .with_subtasks(vec!["login", "logout"]);
        let prompt = prompt_for(&wp, AgentRole::Builder);
        assert!(prompt.contains("wp-auth"));
        assert!(prompt.contains("- login"));
        assert!(prompt.contains("- logout"));

        let review = prompt_for(&wp, AgentRole::Reviewer);
        assert!(review.contains("Review"));
    }
}
