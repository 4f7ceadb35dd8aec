use async_trait::async_trait;
use foreman_core::{AgentRole, ForemanResult, WpId};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// External collaborator that provisions and destroys isolated per-package
/// workspaces (a dedicated branch, worktree, or scratch directory).
///
/// The executor treats provisioning as opaque: it only needs a path to run
/// the agent in and a way to hand the workspace back when result handling
/// is finished.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Creates an isolated workspace for one invocation.
    async fn provision(&self, wp: &WpId, role: AgentRole) -> ForemanResult<PathBuf>;

    /// Destroys a previously provisioned workspace.
    async fn teardown(&self, workspace: &Path) -> ForemanResult<()>;
}

/// Directory-per-invocation provider for single-host runs and tests.
pub struct LocalWorkspaces {
    root: PathBuf,
}

impl LocalWorkspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl WorkspaceProvider for LocalWorkspaces {
    async fn provision(&self, wp: &WpId, role: AgentRole) -> ForemanResult<PathBuf> {
        let short = Uuid::new_v4().simple().to_string();
        let dir = self.root.join(format!("{wp}-{role}-{}", &short[..8]));
        tokio::fs::create_dir_all(&dir).await?;
        debug!(workspace = %dir.display(), "workspace provisioned");
        Ok(dir)
    }

    async fn teardown(&self, workspace: &Path) -> ForemanResult<()> {
        if tokio::fs::try_exists(workspace).await? {
            tokio::fs::remove_dir_all(workspace).await?;
        }
        debug!(workspace = %workspace.display(), "workspace removed");
        Ok(())
    }
}
