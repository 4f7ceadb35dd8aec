use crate::pipeline::{self, Shared};
use foreman_core::{ForemanError, ForemanResult, Lane, StatusEvent, WorkPackage, WpId};
use foreman_events::StatusLog;
use foreman_graph::{ready_set, DepGraph};
use foreman_executor::{
    AgentRegistry, LocalWorkspaces, NoopHook, ValidationHook, WorkspaceProvider,
};
use foreman_state::StateManager;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global ceiling on concurrently driven work packages, independent of
    /// each agent's own `max_concurrent`.
    pub max_concurrent: usize,
    /// Re-evaluation interval while waiting on rate limits or completions.
    pub tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            tick: Duration::from_millis(250),
        }
    }
}

/// Cancels a running orchestration from another task. Pending packages are
/// never started; running invocations are killed and recorded `cancelled`.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Summary of one orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub feature: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    /// Packages that never left `planned` (unreachable dependencies, or
    /// the run was cancelled first).
    pub unstarted: usize,
    pub summary: String,
    pub lanes: BTreeMap<WpId, Lane>,
}

/// The orchestration engine: a fixed-point loop over reducer output.
///
/// Construction validates the whole configuration — dependency cycles and
/// unknown agent references abort before anything is dispatched. The loop
/// itself trusts nothing between iterations: every pass re-materializes
/// lanes from the log and recomputes the ready set, so manual edits and
/// forced transitions are picked up without invalidation logic.
pub struct Orchestrator {
    packages: BTreeMap<WpId, WorkPackage>,
    graph: DepGraph,
    registry: AgentRegistry,
    log: StatusLog,
    state: StateManager,
    workspaces: Box<dyn WorkspaceProvider>,
    hook: Box<dyn ValidationHook>,
    config: EngineConfig,
    cancel_flag: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(
        packages: Vec<WorkPackage>,
        registry: AgentRegistry,
        log: StatusLog,
        state: StateManager,
    ) -> ForemanResult<Self> {
        let graph = DepGraph::build(&packages)?;

        for wp in &packages {
            for agent in wp.agents.values() {
                registry.profile(agent).map_err(|_| {
                    ForemanError::Config(format!(
                        "work package {} pins unknown agent {agent}",
                        wp.id
                    ))
                })?;
            }
        }

        let workspace_root = std::env::temp_dir().join("foreman-workspaces");
        Ok(Self {
            packages: packages.into_iter().map(|wp| (wp.id.clone(), wp)).collect(),
            graph,
            registry,
            log,
            state,
            workspaces: Box::new(LocalWorkspaces::new(workspace_root)),
            hook: Box::new(NoopHook),
            config: EngineConfig::default(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
        })
    }

    pub fn with_workspaces(mut self, workspaces: Box<dyn WorkspaceProvider>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_hook(mut self, hook: Box<dyn ValidationHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Handle for cancelling the run; grab it before calling [`run`].
    ///
    /// [`run`]: Orchestrator::run
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.cancel_flag),
            notify: Arc::clone(&self.cancel_notify),
        }
    }

    /// Drives the feature to a fixed point: no package ready, none in
    /// flight, none recoverable. Consumes the orchestrator; the report
    /// carries final lanes and counts.
    pub async fn run(self) -> ForemanResult<RunReport> {
        let Self {
            packages,
            graph,
            registry,
            log,
            state,
            workspaces,
            hook,
            config,
            cancel_flag,
            cancel_notify,
        } = self;

        let feature = log.feature().to_string();
        info!(feature = %feature, packages = packages.len(), "orchestration loop starting");

        let shared = Arc::new(Shared {
            registry,
            log: Mutex::new(log),
            state: Mutex::new(state),
            workspaces,
            hook,
        });

        let (tx, mut rx) = mpsc::channel::<(WpId, ForemanResult<Lane>)>(64);
        let mut in_flight: BTreeMap<WpId, JoinHandle<()>> = BTreeMap::new();
        let mut withheld: BTreeSet<WpId> = BTreeSet::new();

        loop {
            if cancel_flag.load(Ordering::SeqCst) {
                return Self::settle_cancelled(&feature, &packages, &shared, in_flight).await;
            }

            // Drift is recovered inside the log; surface it as an anomaly.
            if let Err(e) = shared.log.lock().await.verify_snapshot() {
                warn!(error = %e, "snapshot drift recovered before scheduling");
            }

            let lanes = shared.log.lock().await.materialize();
            let ready = ready_set(&graph, &lanes);

            // Ready planned packages, plus transitional lanes with no
            // supervising task (recovery after resume or manual edits).
            let mut startable: Vec<(WpId, Lane)> = Vec::new();
            for id in packages.keys() {
                if in_flight.contains_key(id) || withheld.contains(id) {
                    continue;
                }
                let lane = lanes.get(id).copied().unwrap_or(Lane::Planned);
                let runnable = match lane {
                    Lane::Planned => ready.contains(id),
                    Lane::Claimed | Lane::InProgress | Lane::ForReview => true,
                    Lane::Done | Lane::Blocked | Lane::Canceled => false,
                };
                if runnable {
                    startable.push((id.clone(), lane));
                }
            }

            for (id, lane) in &startable {
                if in_flight.len() >= config.max_concurrent {
                    break;
                }

                // Agent selection happens inside the task, atomically with
                // dispatch registration, so per-agent ceilings hold across
                // packages started in the same pass.
                let wp = packages[id].clone();
                let task_shared = Arc::clone(&shared);
                let task_tx = tx.clone();
                let wp_id = id.clone();
                let start_lane = *lane;
                let handle = tokio::spawn(async move {
                    let settled = pipeline::drive(task_shared, wp, start_lane).await;
                    let _ = task_tx.send((wp_id, settled)).await;
                });
                in_flight.insert(id.clone(), handle);
            }

            if in_flight.is_empty() && startable.is_empty() {
                break; // fixed point
            }

            tokio::select! {
                settled = rx.recv() => {
                    if let Some((wp, result)) = settled {
                        in_flight.remove(&wp);
                        match result {
                            Ok(lane) => info!(wp = %wp, lane = %lane, "work package settled"),
                            Err(e) => {
                                error!(wp = %wp, error = %e, "pipeline error; package withheld");
                                withheld.insert(wp);
                            }
                        }
                    }
                }
                _ = cancel_notify.notified() => {}
                _ = tokio::time::sleep(config.tick) => {}
            }
        }

        let lanes = shared.log.lock().await.materialize();
        let report = build_report(&feature, &packages, lanes, 0);
        info!(feature = %feature, summary = %report.summary, "orchestration loop finished");
        Ok(report)
    }

    /// Cancellation path: kill supervising tasks (their children die with
    /// them), archive their invocations as cancelled, and record canceled
    /// lanes for every package that had started.
    async fn settle_cancelled(
        feature: &str,
        packages: &BTreeMap<WpId, WorkPackage>,
        shared: &Arc<Shared>,
        mut in_flight: BTreeMap<WpId, JoinHandle<()>>,
    ) -> ForemanResult<RunReport> {
        warn!(feature = %feature, aborting = in_flight.len(), "run cancelled");

        for handle in in_flight.values() {
            handle.abort();
        }
        for (_, handle) in std::mem::take(&mut in_flight) {
            let _ = handle.await;
        }

        let cancelled_invocations = shared.state.lock().await.cancel_active().await?;
        info!(
            invocations = cancelled_invocations.len(),
            "active invocations recorded cancelled"
        );

        let lanes = shared.log.lock().await.materialize();
        let mut canceled = 0usize;
        for id in packages.keys() {
            let lane = lanes.get(id).copied().unwrap_or(Lane::Planned);
            if matches!(lane, Lane::Claimed | Lane::InProgress | Lane::ForReview) {
                shared
                    .log
                    .lock()
                    .await
                    .append(
                        StatusEvent::new(id.clone(), lane, Lane::Canceled, "engine")
                            .with_reason("run cancelled"),
                    )
                    .await?;
                canceled += 1;
            }
        }

        let lanes = shared.log.lock().await.materialize();
        Ok(build_report(feature, packages, lanes, canceled))
    }
}

fn build_report(
    feature: &str,
    packages: &BTreeMap<WpId, WorkPackage>,
    lanes: BTreeMap<WpId, Lane>,
    canceled_now: usize,
) -> RunReport {
    let lane_of = |id: &WpId| lanes.get(id).copied().unwrap_or(Lane::Planned);

    let completed = packages.keys().filter(|id| lane_of(id) == Lane::Done).count();
    let failed = packages
        .keys()
        .filter(|id| lane_of(id) == Lane::Blocked)
        .count();
    let canceled = packages
        .keys()
        .filter(|id| lane_of(id) == Lane::Canceled)
        .count()
        .max(canceled_now);
    let unstarted = packages
        .keys()
        .filter(|id| lane_of(id) == Lane::Planned)
        .count();

    let summary = format!(
        "{completed}/{} packages done, {failed} blocked, {canceled} canceled, {unstarted} unstarted",
        packages.len()
    );

    RunReport {
        feature: feature.to_string(),
        total: packages.len(),
        completed,
        failed,
        canceled,
        unstarted,
        summary,
        lanes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let packages: BTreeMap<WpId, WorkPackage> = [
            WorkPackage::new("a", "A"),
            WorkPackage::new("b", "B"),
            WorkPackage::new("c", "C"),
        ]
        .into_iter()
        .map(|wp| (wp.id.clone(), wp))
        .collect();

        let lanes: BTreeMap<WpId, Lane> = [
            (WpId::new("a"), Lane::Done),
            (WpId::new("b"), Lane::Blocked),
        ]
        .into_iter()
        .collect();

        let report = build_report("feat", &packages, lanes, 0);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.unstarted, 1);
        assert!(report.summary.contains("1/3"));
    }
}
