use chrono::{DateTime, Utc};
use foreman_core::{AgentRole, WpId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle state of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvocationState::Pending | InvocationState::Running)
    }
}

/// Runtime record of one agent process working a work package.
///
/// Created on dispatch, archived on terminal outcome. Persisted inside the
/// orchestration state so interrupted runs can resolve orphans on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub invocation_id: Uuid,
    pub agent_id: String,
    pub work_package_id: WpId,
    pub role: AgentRole,
    pub workspace: PathBuf,
    pub state: InvocationState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub retry_count: u32,
    /// OS pid of the child while running; used for liveness checks on
    /// resume.
    #[serde(default)]
    pub pid: Option<u32>,
}

impl Invocation {
    pub fn new(
        agent_id: impl Into<String>,
        work_package_id: WpId,
        role: AgentRole,
        workspace: PathBuf,
    ) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            work_package_id,
            role,
            workspace,
            state: InvocationState::Pending,
            started_at: None,
            completed_at: None,
            exit_code: None,
            retry_count: 0,
            pid: None,
        }
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    /// Marks the process as launched.
    pub fn mark_running(&mut self, pid: Option<u32>) {
        self.state = InvocationState::Running;
        self.started_at = Some(Utc::now());
        self.pid = pid;
    }

    /// Records a terminal state and stamps completion.
    pub fn finish(&mut self, state: InvocationState, exit_code: Option<i32>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.exit_code = exit_code;
        self.completed_at = Some(Utc::now());
        self.pid = None;
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                u64::try_from((end - start).num_milliseconds().max(0)).ok()
            }
            _ => None,
        }
    }
}
