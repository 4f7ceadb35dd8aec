use crate::fallback::FallbackConfig;
use foreman_core::{AgentRole, ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// How the prompt reaches the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptChannel {
    /// Appended as a command-line argument.
    Argument,
    /// Written to the child's standard input.
    Stdin,
    /// Written to a file in the workspace; the path is passed as an
    /// argument.
    File,
}

/// Structure of the agent's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// A single JSON document (possibly preceded by noise; the last
    /// parseable line wins).
    Json,
    /// Streamed JSON-lines; the last parseable line carries the result.
    JsonLines,
    /// Plain text: classification falls back to the exit code alone.
    Text,
}

/// Exit-code taxonomy declared per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitTaxonomy {
    #[serde(default = "default_success_codes")]
    pub success: Vec<i32>,
    #[serde(default)]
    pub auth_error: Vec<i32>,
    #[serde(default)]
    pub rate_limit: Vec<i32>,
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

impl Default for ExitTaxonomy {
    fn default() -> Self {
        Self {
            success: default_success_codes(),
            auth_error: Vec::new(),
            rate_limit: Vec::new(),
        }
    }
}

/// Rate-limit descriptors for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSpec {
    /// Predicted seconds until the limit resets once hit.
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
}

fn default_cooldown() -> u64 {
    300
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown(),
        }
    }
}

/// Static invocation contract for one external coding agent. Immutable for
/// the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub command: String,
    /// Base arguments always passed, before any flag wiring.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag that selects non-interactive operation, e.g. `-p`.
    #[serde(default)]
    pub headless_flag: Option<String>,
    /// Flag that suppresses interactive permission prompts.
    #[serde(default)]
    pub auto_approve_flag: Option<String>,
    /// Flag that selects the output format; paired with a value derived
    /// from `output_format`.
    #[serde(default)]
    pub output_format_flag: Option<String>,
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
    #[serde(default = "default_prompt_channel")]
    pub prompt_channel: PromptChannel,
    #[serde(default)]
    pub exit_codes: ExitTaxonomy,
    #[serde(default)]
    pub rate_limit: RateLimitSpec,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Text
}

fn default_prompt_channel() -> PromptChannel {
    PromptChannel::Argument
}

fn default_max_concurrent() -> usize {
    1
}

fn default_timeout() -> u64 {
    1800
}

impl AgentProfile {
    /// The value passed with `output_format_flag`, when present.
    pub fn output_format_value(&self) -> &'static str {
        match self.output_format {
            OutputFormat::Json => "json",
            OutputFormat::JsonLines => "stream-json",
            OutputFormat::Text => "text",
        }
    }
}

/// Operator-edited configuration: the agent roster, a preference-ordered
/// agent list per role, and the global fallback policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRegistry {
    pub agents: HashMap<String, AgentProfile>,
    /// Preference order per role; the first healthy agent wins.
    #[serde(default)]
    pub roles: HashMap<AgentRole, Vec<String>>,
    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl AgentRegistry {
    /// Parses and validates registry TOML. Unknown agent references in a
    /// role preference list are a fatal configuration error.
    pub fn from_toml(raw: &str) -> ForemanResult<Self> {
        let registry: AgentRegistry = toml::from_str(raw)
            .map_err(|e| ForemanError::Config(format!("agent registry: {e}")))?;
        registry.validate()?;
        Ok(registry)
    }

    /// Loads the registry from a TOML file.
    pub async fn load(path: &Path) -> ForemanResult<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&raw)
    }

    fn validate(&self) -> ForemanResult<()> {
        if self.agents.is_empty() {
            return Err(ForemanError::Config(
                "agent registry declares no agents".to_string(),
            ));
        }
        for (role, prefs) in &self.roles {
            if prefs.is_empty() {
                return Err(ForemanError::Config(format!(
                    "role {role} has an empty preference list"
                )));
            }
            for agent in prefs {
                if !self.agents.contains_key(agent) {
                    return Err(ForemanError::Config(format!(
                        "role {role} prefers unknown agent {agent}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn profile(&self, agent_id: &str) -> ForemanResult<&AgentProfile> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| ForemanError::Config(format!("unknown agent {agent_id}")))
    }

    /// Preference-ordered agents for a role. Falls back to every declared
    /// agent (in name order) when the role has no explicit list.
    pub fn preferences(&self, role: AgentRole) -> Vec<String> {
        match self.roles.get(&role) {
            Some(prefs) => prefs.clone(),
            None => {
                let mut all: Vec<String> = self.agents.keys().cloned().collect();
                all.sort();
                all
            }
        }
    }
}
