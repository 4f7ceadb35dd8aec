use crate::state::OrchestrationState;
use foreman_core::{ForemanError, ForemanResult};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Persists run state documents under one directory, one JSON file per
/// run, each rewrite going through a temp file + rename so readers never
/// observe a torn document.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub async fn new(dir: impl Into<PathBuf>) -> ForemanResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn lock_path(&self, feature: &str) -> PathBuf {
        self.dir.join(format!("{feature}.lock"))
    }

    /// Atomically replaces the run document.
    pub async fn save(&self, state: &OrchestrationState) -> ForemanResult<()> {
        let path = self.run_path(state.run_id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, run_id: Uuid) -> ForemanResult<OrchestrationState> {
        let path = self.run_path(run_id);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ForemanError::State(format!("run {run_id} not found at {}: {e}", path.display()))
        })?;
        let state: OrchestrationState = serde_json::from_str(&raw)
            .map_err(|e| ForemanError::State(format!("corrupt run document {run_id}: {e}")))?;
        Ok(state)
    }

    /// Run ids present in the store.
    pub async fn list(&self) -> ForemanResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Takes the advisory lock for a feature, excluding concurrent runs.
    ///
    /// The lock is a `create_new` file holding the owner's pid. A lock left
    /// behind by a dead process is reclaimed; a lock held by a live process
    /// is a [`ForemanError::State`].
    pub async fn acquire_lock(&self, feature: &str) -> ForemanResult<RunLock> {
        let path = self.lock_path(feature);

        for _ in 0..2 {
            match tokio::fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    tokio::fs::write(&path, std::process::id().to_string()).await?;
                    info!(feature = %feature, "run lock acquired");
                    return Ok(RunLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = tokio::fs::read_to_string(&path)
                        .await
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());

                    match holder {
                        Some(pid) if process_alive(pid) => {
                            return Err(ForemanError::State(format!(
                                "feature {feature} is already being orchestrated by pid {pid}"
                            )));
                        }
                        _ => {
                            warn!(
                                feature = %feature,
                                holder = ?holder,
                                "reclaiming stale run lock"
                            );
                            tokio::fs::remove_file(&path).await?;
                            // Retry the create_new.
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ForemanError::State(format!(
            "could not acquire run lock for feature {feature}"
        )))
    }
}

/// Held advisory lock; the file is removed on drop.
pub struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release run lock");
            }
        }
    }
}

/// Best-effort liveness probe for the lock holder. On Linux this checks
/// `/proc/<pid>`; elsewhere the holder is conservatively assumed dead,
/// which is safe here because agent children are spawned kill-on-drop and
/// cannot outlive their coordinator.
pub(crate) fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{pid}")).exists()
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OrchestrationState;

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).await.unwrap();

        let mut state = OrchestrationState::new("feat");
        state.metrics.invocations_dispatched = 7;
        store.save(&state).await.unwrap();

        let loaded = store.load(state.run_id).await.unwrap();
        assert_eq!(loaded.metrics.invocations_dispatched, 7);
        assert_eq!(loaded.feature, "feat");

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_load_unknown_run_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).await.unwrap();
        let result = store.load(Uuid::new_v4()).await;
        assert!(matches!(result, Err(ForemanError::State(_))));
    }

    #[tokio::test]
    async fn test_list_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).await.unwrap();

        let a = OrchestrationState::new("feat");
        let b = OrchestrationState::new("feat");
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let mut ids = store.list().await.unwrap();
        ids.sort();
        let mut expected = vec![a.run_id, b.run_id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_lock_excludes_concurrent_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).await.unwrap();

        let lock = store.acquire_lock("feat").await.unwrap();
        // Our own pid is alive, so a second acquisition fails.
        let second = store.acquire_lock("feat").await;
        assert!(matches!(second, Err(ForemanError::State(_))));

        drop(lock);
        // Released on drop; acquisition succeeds again.
        let third = store.acquire_lock("feat").await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).await.unwrap();

        // A pid far beyond pid_max cannot be alive.
        tokio::fs::write(dir.path().join("feat.lock"), "999999999")
            .await
            .unwrap();

        let lock = store.acquire_lock("feat").await;
        assert!(lock.is_ok());
    }

    #[tokio::test]
    async fn test_unreadable_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).await.unwrap();

        tokio::fs::write(dir.path().join("feat.lock"), "not-a-pid")
            .await
            .unwrap();

        let lock = store.acquire_lock("feat").await;
        assert!(lock.is_ok());
    }
}
