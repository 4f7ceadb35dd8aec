//! Persisted orchestration state for one feature run.
//!
//! Tracks active invocations, per-agent health (consecutive failures and
//! predicted rate-limit resets), and aggregate run metrics, persisting the
//! whole document atomically after every transition so an interrupted run
//! can resume. Concurrent runs on the same feature are excluded by an
//! advisory lock file rather than shared memory.
//!
//! # Main types
//!
//! - [`OrchestrationState`] — The serialized per-run document.
//! - [`StateStore`] — Atomic replace-on-write persistence + run lock.
//! - [`StateManager`] — Mutation API: dispatch/outcome/health recording and
//!   resume with orphaned-invocation resolution.

/// State mutation API and resume logic.
pub mod manager;
/// The serialized state document and health/metrics records.
pub mod state;
/// Atomic persistence and the advisory run lock.
pub mod store;

pub use manager::{AgentCandidate, StateManager, ORPHAN_REASON};
pub use state::{AgentHealth, OrchestrationState, RunMetrics};
pub use store::{RunLock, StateStore};
