//! Work-package dependency graph and ready-set scheduler.
//!
//! The graph is derived, never stored: it is rebuilt from the declared
//! dependency sets whenever it is needed, and the scheduler recomputes the
//! ready set from current reducer output on every call. Nothing here caches
//! a schedule, which makes the scheduler self-healing after manual edits,
//! forced transitions, or reconciliation.
//!
//! Cycle detection happens at construction time and is a fatal
//! configuration error, not a retryable condition.

/// Dependency graph construction and validation.
pub mod graph;
/// Ready-set and wave computation over reducer output.
pub mod scheduler;

pub use graph::DepGraph;
pub use scheduler::{ready_set, waves};
