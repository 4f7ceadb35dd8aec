use crate::runner::OutcomeKind;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

/// One step of the failover policy, applied in configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Retry with the next preferred agent for the role.
    NextInList,
    /// Single-agent mode: the same agent retries after an enforced delay,
    /// reducing context bleed between implementation and self-review.
    SameAgent,
    /// Hold the work package and retry after the predicted rate-limit
    /// reset, bounded by `queue_max_wait_seconds`. Other ready packages
    /// keep dispatching meanwhile.
    Queue,
    /// Surface immediately and halt orchestration for this package.
    Fail,
}

/// Global fallback policy from the agent registry.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_strategies")]
    pub strategies: Vec<FallbackStrategy>,
    /// Bound on invocation attempts per work package, across all
    /// strategies.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_queue_max_wait")]
    pub queue_max_wait_seconds: u64,
    #[serde(default = "default_same_agent_delay")]
    pub same_agent_delay_seconds: u64,
}

fn default_strategies() -> Vec<FallbackStrategy> {
    vec![
        FallbackStrategy::NextInList,
        FallbackStrategy::Queue,
        FallbackStrategy::Fail,
    ]
}

fn default_max_attempts() -> u32 {
    6
}

fn default_queue_max_wait() -> u64 {
    900
}

fn default_same_agent_delay() -> u64 {
    120
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            max_attempts: default_max_attempts(),
            queue_max_wait_seconds: default_queue_max_wait(),
            same_agent_delay_seconds: default_same_agent_delay(),
        }
    }
}

impl FallbackConfig {
    /// Policy for single-agent setups: same agent retries with a cool-down
    /// before queueing.
    pub fn single_agent() -> Self {
        Self {
            strategies: vec![
                FallbackStrategy::SameAgent,
                FallbackStrategy::Queue,
                FallbackStrategy::Fail,
            ],
            ..Self::default()
        }
    }
}

/// What the engine should do next for a work package after a failed
/// invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackAction {
    /// Dispatch the named agent, after the given delay (zero = now).
    TryAgent { agent_id: String, delay: Duration },
    /// Keep the package queued and retry the named agent after the delay.
    Hold { agent_id: String, delay: Duration },
    /// Permanent failure; record it and stop retrying.
    GiveUp { reason: String },
}

/// Deterministic fallback state for one work package: the strategy cursor,
/// the position in the role's preference list, and the attempt counter that
/// spans all strategies.
///
/// The machine never loops: every transition either consumes an attempt or
/// advances the strategy cursor, and both are bounded.
#[derive(Debug)]
pub struct FallbackMachine {
    config: FallbackConfig,
    preferences: Vec<String>,
    strategy_idx: usize,
    agent_idx: usize,
    attempts: u32,
}

impl FallbackMachine {
    /// `preferences` is the role's agent list in preference order; it must
    /// be non-empty (the registry validates this).
    pub fn new(config: FallbackConfig, preferences: Vec<String>) -> Self {
        Self {
            config,
            preferences,
            strategy_idx: 0,
            agent_idx: 0,
            attempts: 0,
        }
    }

    /// The agent the next dispatch should use.
    pub fn current_agent(&self) -> &str {
        &self.preferences[self.agent_idx.min(self.preferences.len() - 1)]
    }

    /// Invocation attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Consumes one attempt for the outcome of a finished invocation and
    /// decides the next move. `predicted_reset` is the health tracker's
    /// rate-limit estimate for the current agent, if any.
    pub fn next_action(
        &mut self,
        outcome: &OutcomeKind,
        predicted_reset: Option<Duration>,
    ) -> FallbackAction {
        self.attempts += 1;

        if self.attempts >= self.config.max_attempts {
            return FallbackAction::GiveUp {
                reason: format!(
                    "fallback exhausted after {} attempts (last outcome: {outcome:?})",
                    self.attempts
                ),
            };
        }

        self.select(outcome, predicted_reset)
    }

    fn select(
        &mut self,
        outcome: &OutcomeKind,
        predicted_reset: Option<Duration>,
    ) -> FallbackAction {
        loop {
            let Some(strategy) = self.config.strategies.get(self.strategy_idx).copied() else {
                return FallbackAction::GiveUp {
                    reason: format!("all fallback strategies exhausted (last outcome: {outcome:?})"),
                };
            };

            match strategy {
                FallbackStrategy::NextInList => {
                    if self.agent_idx + 1 < self.preferences.len() {
                        self.agent_idx += 1;
                        let agent = self.preferences[self.agent_idx].clone();
                        info!(agent = %agent, "fallback: next agent in preference list");
                        return FallbackAction::TryAgent {
                            agent_id: agent,
                            delay: Duration::ZERO,
                        };
                    }
                    // Preference list exhausted; move to the next strategy.
                    self.strategy_idx += 1;
                }
                FallbackStrategy::SameAgent => {
                    let agent = self.current_agent().to_string();
                    return FallbackAction::TryAgent {
                        agent_id: agent,
                        delay: Duration::from_secs(self.config.same_agent_delay_seconds),
                    };
                }
                FallbackStrategy::Queue => {
                    let cap = Duration::from_secs(self.config.queue_max_wait_seconds);
                    let delay = predicted_reset.unwrap_or(cap).min(cap);
                    let agent = self.current_agent().to_string();
                    info!(agent = %agent, delay_s = delay.as_secs(), "fallback: queueing");
                    return FallbackAction::Hold {
                        agent_id: agent,
                        delay,
                    };
                }
                FallbackStrategy::Fail => {
                    return FallbackAction::GiveUp {
                        reason: format!("fallback policy is fail (last outcome: {outcome:?})"),
                    };
                }
            }
        }
    }
}
