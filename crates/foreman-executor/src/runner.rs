use crate::invocation::{Invocation, InvocationState};
use crate::profile::{AgentProfile, ExitTaxonomy, OutputFormat, PromptChannel};
use crate::workspace::WorkspaceProvider;
use foreman_core::{AgentRole, ForemanResult, WpId};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

/// What a finished invocation amounted to, classified against the agent's
/// profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    /// Non-zero exit (or structured output flagged an error).
    Failed,
    /// Exit code in the profile's auth-error set.
    AuthFailure,
    /// Exit code in the profile's rate-limit set, or structured output
    /// declared one.
    RateLimited,
    /// The wall-clock budget expired and the process was killed.
    Timeout,
    /// The agent binary could not be found.
    NotInstalled,
}

impl OutcomeKind {
    /// Every non-success outcome feeds the fallback machine.
    pub fn is_success(self) -> bool {
        self == OutcomeKind::Success
    }

    pub(crate) fn invocation_state(self) -> InvocationState {
        match self {
            OutcomeKind::Success => InvocationState::Completed,
            OutcomeKind::Timeout => InvocationState::Timeout,
            _ => InvocationState::Failed,
        }
    }
}

/// The single classified result of one dispatch. The engine turns each of
/// these into exactly one status event.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub kind: OutcomeKind,
    pub exit_code: Option<i32>,
    /// Result text from structured output, or the stderr tail on failure.
    pub summary: Option<String>,
}

/// What to run an agent against.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub work_package_id: WpId,
    pub role: AgentRole,
    pub prompt: String,
}

/// Runs one agent invocation end to end: provisions an isolated workspace,
/// launches the headless process, enforces the profile timeout, and
/// classifies the outcome.
///
/// Workspace teardown is left to the caller so result handling can inspect
/// the workspace first. Exactly one [`RunOutcome`] is produced per call;
/// the caller records it as one status event.
pub async fn dispatch(
    agent_id: &str,
    profile: &AgentProfile,
    request: &InvocationRequest,
    retry_count: u32,
    workspaces: &dyn WorkspaceProvider,
) -> ForemanResult<(Invocation, RunOutcome)> {
    let workspace = workspaces
        .provision(&request.work_package_id, request.role)
        .await?;

    let mut invocation = Invocation::new(
        agent_id,
        request.work_package_id.clone(),
        request.role,
        workspace.clone(),
    )
    .with_retry_count(retry_count);

    info!(
        invocation = %invocation.invocation_id,
        agent = %agent_id,
        wp = %request.work_package_id,
        role = %request.role,
        workspace = %workspace.display(),
        "dispatching agent"
    );

    let outcome = run(profile, request, &mut invocation).await?;

    info!(
        invocation = %invocation.invocation_id,
        agent = %agent_id,
        wp = %request.work_package_id,
        outcome = ?outcome.kind,
        exit_code = ?outcome.exit_code,
        "invocation finished"
    );

    Ok((invocation, outcome))
}

/// Launches the agent process for an already-provisioned invocation,
/// enforces the profile timeout, and classifies the result. The invocation
/// record is updated in place so callers that persist it before and after
/// the run always hold an accurate picture.
pub async fn run(
    profile: &AgentProfile,
    request: &InvocationRequest,
    invocation: &mut Invocation,
) -> ForemanResult<RunOutcome> {
    let mut cmd = Command::new(&profile.command);
    cmd.args(&profile.args);

    if let Some(flag) = &profile.auto_approve_flag {
        cmd.arg(flag);
    }
    if let Some(flag) = &profile.output_format_flag {
        cmd.arg(flag).arg(profile.output_format_value());
    }

    let mut stdin_payload: Option<String> = None;
    match profile.prompt_channel {
        PromptChannel::Argument => {
            if let Some(flag) = &profile.headless_flag {
                cmd.arg(flag);
            }
            cmd.arg(&request.prompt);
        }
        PromptChannel::Stdin => {
            if let Some(flag) = &profile.headless_flag {
                cmd.arg(flag);
            }
            stdin_payload = Some(request.prompt.clone());
        }
        PromptChannel::File => {
            let prompt_path = invocation.workspace.join("prompt.md");
            tokio::fs::write(&prompt_path, &request.prompt).await?;
            if let Some(flag) = &profile.headless_flag {
                cmd.arg(flag);
            }
            cmd.arg(&prompt_path);
        }
    }

    cmd.current_dir(&invocation.workspace)
        .stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(command = %profile.command, "agent binary not found");
            invocation.finish(InvocationState::Failed, None);
            return Ok(RunOutcome {
                kind: OutcomeKind::NotInstalled,
                exit_code: None,
                summary: Some(format!("{} is not installed", profile.command)),
            });
        }
        Err(e) => {
            invocation.finish(InvocationState::Failed, None);
            return Ok(RunOutcome {
                kind: OutcomeKind::Failed,
                exit_code: None,
                summary: Some(format!("failed to start {}: {e}", profile.command)),
            });
        }
    };

    if let Some(payload) = stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            // An agent that exits without reading its prompt produces a
            // broken pipe here; the exit classification below is what
            // matters, so don't fail the dispatch over it.
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                warn!(error = %e, "could not deliver prompt on stdin");
            }
            // Dropping the handle closes the pipe so the agent sees EOF.
        }
    }

    invocation.mark_running(child.id());

    let budget = Duration::from_secs(profile.timeout_seconds);
    let waited = tokio::time::timeout(budget, child.wait_with_output()).await;

    let output = match waited {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            invocation.finish(InvocationState::Failed, None);
            return Ok(RunOutcome {
                kind: OutcomeKind::Failed,
                exit_code: None,
                summary: Some(format!("error waiting for {}: {e}", profile.command)),
            });
        }
        Err(_) => {
            // The elapsed timeout dropped the wait future, which owns the
            // child; kill_on_drop takes the process down with it.
            warn!(
                invocation = %invocation.invocation_id,
                budget_s = profile.timeout_seconds,
                "invocation timed out"
            );
            invocation.finish(InvocationState::Timeout, None);
            return Ok(RunOutcome {
                kind: OutcomeKind::Timeout,
                exit_code: None,
                summary: Some(format!(
                    "timed out after {}s",
                    profile.timeout_seconds
                )),
            });
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let mut kind = classify_exit(exit_code, &profile.exit_codes);
    let mut summary = None;

    if profile.output_format != OutputFormat::Text {
        (kind, summary) = refine_with_output(kind, &stdout);
    }
    if summary.is_none() && !kind.is_success() {
        summary = stderr_tail(&stderr);
    }

    invocation.finish(kind.invocation_state(), Some(exit_code));
    Ok(RunOutcome {
        kind,
        exit_code: Some(exit_code),
        summary,
    })
}

/// Exit-code classification against the profile taxonomy.
fn classify_exit(code: i32, taxonomy: &ExitTaxonomy) -> OutcomeKind {
    if taxonomy.success.contains(&code) {
        OutcomeKind::Success
    } else if taxonomy.auth_error.contains(&code) {
        OutcomeKind::AuthFailure
    } else if taxonomy.rate_limit.contains(&code) {
        OutcomeKind::RateLimited
    } else {
        OutcomeKind::Failed
    }
}

/// Refines an exit-code classification with the agent's structured output.
///
/// The last parseable JSON line wins (streamed agents emit many). Expected
/// fields, all optional: `is_error` (bool), `result` (string),
/// `error_type` (`"rate_limit"` or `"auth"`).
fn refine_with_output(kind: OutcomeKind, stdout: &str) -> (OutcomeKind, Option<String>) {
    let Some(value) = stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
    else {
        return (kind, None);
    };

    let summary = value["result"].as_str().map(ToString::to_string);

    let refined = match value["error_type"].as_str() {
        Some("rate_limit") => OutcomeKind::RateLimited,
        Some("auth") => OutcomeKind::AuthFailure,
        _ if value["is_error"].as_bool().unwrap_or(false) && kind.is_success() => {
            OutcomeKind::Failed
        }
        _ => kind,
    };

    (refined, summary)
}

fn stderr_tail(stderr: &str) -> Option<String> {
    let line = stderr.lines().rev().find(|l| !l.trim().is_empty())?;
    let mut tail = line.trim().to_string();
    tail.truncate(500);
    Some(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::LocalWorkspaces;

    fn sh_profile(script: &str) -> AgentProfile {
        AgentProfile {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            headless_flag: None,
            auto_approve_flag: None,
            output_format_flag: None,
            output_format: OutputFormat::Text,
            prompt_channel: PromptChannel::Stdin,
            exit_codes: ExitTaxonomy::default(),
            rate_limit: Default::default(),
            max_concurrent: 1,
            timeout_seconds: 30,
        }
    }

    fn request() -> InvocationRequest {
        InvocationRequest {
            work_package_id: WpId::new("wp-test"),
            role: AgentRole::Builder,
            prompt: "do the thing".to_string(),
        }
    }

    #[test]
    fn test_classify_exit_taxonomy() {
        let tax = ExitTaxonomy {
            success: vec![0],
            auth_error: vec![3],
            rate_limit: vec![4, 5],
        };
        assert_eq!(classify_exit(0, &tax), OutcomeKind::Success);
        assert_eq!(classify_exit(3, &tax), OutcomeKind::AuthFailure);
        assert_eq!(classify_exit(4, &tax), OutcomeKind::RateLimited);
        assert_eq!(classify_exit(5, &tax), OutcomeKind::RateLimited);
        assert_eq!(classify_exit(1, &tax), OutcomeKind::Failed);
        assert_eq!(classify_exit(-1, &tax), OutcomeKind::Failed);
    }

    #[test]
    fn test_refine_is_error_overrides_success() {
        let (kind, summary) = refine_with_output(
            OutcomeKind::Success,
            "{\"is_error\": true, \"result\": \"context window exceeded\"}",
        );
        assert_eq!(kind, OutcomeKind::Failed);
        assert_eq!(summary.as_deref(), Some("context window exceeded"));
    }

    #[test]
    fn test_refine_last_json_line_wins() {
        let stream = "noise\n{\"result\": \"partial\"}\n{\"is_error\": false, \"result\": \"final\"}\n";
        let (kind, summary) = refine_with_output(OutcomeKind::Success, stream);
        assert_eq!(kind, OutcomeKind::Success);
        assert_eq!(summary.as_deref(), Some("final"));
    }

    #[test]
    fn test_refine_error_type_mapping() {
        let (kind, _) = refine_with_output(
            OutcomeKind::Failed,
            "{\"error_type\": \"rate_limit\"}",
        );
        assert_eq!(kind, OutcomeKind::RateLimited);

        let (kind, _) = refine_with_output(OutcomeKind::Failed, "{\"error_type\": \"auth\"}");
        assert_eq!(kind, OutcomeKind::AuthFailure);
    }

    #[test]
    fn test_refine_unparseable_output_keeps_exit_classification() {
        let (kind, summary) = refine_with_output(OutcomeKind::Failed, "plain text only\n");
        assert_eq!(kind, OutcomeKind::Failed);
        assert!(summary.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspaces::new(dir.path());
        let profile = sh_profile("cat >/dev/null; exit 0");

        let (inv, outcome) = dispatch("sh-agent", &profile, &request(), 0, &ws)
            .await
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(inv.state, InvocationState::Completed);
        assert!(inv.started_at.is_some());
        assert!(inv.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_nonzero_exit_with_stderr_reason() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspaces::new(dir.path());
        let profile = sh_profile("cat >/dev/null; echo 'model refused' >&2; exit 1");

        let (inv, outcome) = dispatch("sh-agent", &profile, &request(), 0, &ws)
            .await
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(outcome.summary.as_deref(), Some("model refused"));
        assert_eq!(inv.state, InvocationState::Failed);
    }

    #[tokio::test]
    async fn test_dispatch_rate_limit_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspaces::new(dir.path());
        let mut profile = sh_profile("cat >/dev/null; exit 4");
        profile.exit_codes.rate_limit = vec![4];

        let (_, outcome) = dispatch("sh-agent", &profile, &request(), 0, &ws)
            .await
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::RateLimited);
    }

    #[tokio::test]
    async fn test_dispatch_structured_output_refinement() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspaces::new(dir.path());
        let mut profile =
            sh_profile("cat >/dev/null; echo '{\"is_error\": true, \"result\": \"bad plan\"}'");
        profile.output_format = OutputFormat::Json;

        let (_, outcome) = dispatch("sh-agent", &profile, &request(), 0, &ws)
            .await
            .unwrap();
        // Exit 0 but the payload says error.
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert_eq!(outcome.summary.as_deref(), Some("bad plan"));
    }

    #[tokio::test]
    async fn test_dispatch_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspaces::new(dir.path());
        let mut profile = sh_profile("sleep 30");
        profile.timeout_seconds = 1;

        let (inv, outcome) = dispatch("sh-agent", &profile, &request(), 0, &ws)
            .await
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Timeout);
        assert_eq!(inv.state, InvocationState::Timeout);
        assert!(outcome.summary.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_dispatch_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspaces::new(dir.path());
        let mut profile = sh_profile("");
        profile.command = "foreman-test-no-such-binary".to_string();

        let (inv, outcome) = dispatch("ghost", &profile, &request(), 0, &ws)
            .await
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::NotInstalled);
        assert_eq!(inv.state, InvocationState::Failed);
    }

    #[tokio::test]
    async fn test_dispatch_prompt_file_channel() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspaces::new(dir.path());
        // cat reads the prompt file path passed as the final argument.
        let profile = AgentProfile {
            command: "cat".to_string(),
            args: Vec::new(),
            headless_flag: None,
            auto_approve_flag: None,
            output_format_flag: None,
            output_format: OutputFormat::Text,
            prompt_channel: PromptChannel::File,
            exit_codes: ExitTaxonomy::default(),
            rate_limit: Default::default(),
            max_concurrent: 1,
            timeout_seconds: 30,
        };

        let (inv, outcome) = dispatch("cat-agent", &profile, &request(), 0, &ws)
            .await
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Success);
        // The prompt file was materialized in the workspace.
        let prompt = std::fs::read_to_string(inv.workspace.join("prompt.md")).unwrap();
        assert_eq!(prompt, "do the thing");
    }
}
