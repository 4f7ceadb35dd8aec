use crate::event::Lane;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a work package, assigned by the operator in the feature
/// declaration (e.g. `"wp-auth"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WpId(String);

impl WpId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WpId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Role an agent performs for a work package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Implements the work package.
    Builder,
    /// Reviews the produced work.
    Reviewer,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Builder => write!(f, "builder"),
            AgentRole::Reviewer => write!(f, "reviewer"),
        }
    }
}

/// One checklist item inside a work package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub name: String,
    #[serde(default)]
    pub done: bool,
}

/// An independently executable slice of a feature's implementation.
///
/// The `lane` field is a view derived from the status event log for display
/// and serialization; the log is the sole source of truth and the reducer
/// output always wins over this field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPackage {
    pub id: WpId,
    pub title: String,
    /// Other work packages that must be `done` before this one may run.
    #[serde(default)]
    pub depends_on: Vec<WpId>,
    /// Derived view of the current lane; never authoritative.
    #[serde(default = "default_lane")]
    pub lane: Lane,
    /// Assigned agent id per role, if pinned by the operator.
    #[serde(default)]
    pub agents: HashMap<AgentRole, String>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

fn default_lane() -> Lane {
    Lane::Planned
}

impl WorkPackage {
    pub fn new(id: impl Into<WpId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            depends_on: Vec::new(),
            lane: Lane::Planned,
            agents: HashMap::new(),
            subtasks: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<WpId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_agent(mut self, role: AgentRole, agent_id: impl Into<String>) -> Self {
        self.agents.insert(role, agent_id.into());
        self
    }

    pub fn with_subtasks(mut self, names: Vec<&str>) -> Self {
        self.subtasks = names
            .into_iter()
            .map(|n| Subtask {
                name: n.to_string(),
                done: false,
            })
            .collect();
        self
    }

    /// Count of completed checklist items.
    pub fn subtasks_done(&self) -> usize {
        self.subtasks.iter().filter(|s| s.done).count()
    }
}

impl From<String> for WpId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
