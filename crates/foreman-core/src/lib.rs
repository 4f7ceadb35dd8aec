//! Core types and error definitions for the Foreman orchestrator.
//!
//! This crate provides the foundational types shared across all Foreman
//! crates: the unified error enum, the work-package data model, and the
//! status-event schema that every lifecycle transition is recorded in.
//!
//! # Main types
//!
//! - [`ForemanError`] — Unified error enum for all Foreman subsystems.
//! - [`ForemanResult`] — Convenience alias for `Result<T, ForemanError>`.
//! - [`WorkPackage`] — An independently executable slice of a feature.
//! - [`Lane`] — The lifecycle state of a work package.
//! - [`StatusEvent`] — An immutable record of one lane transition.

/// Status event schema: lanes, evidence, and transition records.
pub mod event;
/// Work package declarations and identifiers.
pub mod package;

pub use event::{Evidence, EvidenceKind, Lane, RejectedReason, StatusEvent};
pub use package::{AgentRole, Subtask, WorkPackage, WpId};

// --- Error types ---

/// Top-level error type for the Foreman orchestrator.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// Invalid configuration: dependency cycles, unknown agent or work
    /// package references. Fatal; detected before any dispatch.
    #[error("Config error: {0}")]
    Config(String),

    /// An error in the status event log (I/O, parse, corrupt record).
    #[error("Event log error: {0}")]
    Event(String),

    /// A transition rejected at append time by a guard condition.
    #[error("Guard violation: {0}")]
    Guard(RejectedReason),

    /// A mismatch between the cached lane snapshot and a fresh fold of
    /// the event log.
    #[error("Materialization drift: {0}")]
    Drift(String),

    /// An agent invocation failed to start or finished abnormally.
    #[error("Invocation error: {0}")]
    Invocation(String),

    /// An agent invocation exceeded its wall-clock budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An error in orchestration state persistence or resume.
    #[error("State error: {0}")]
    State(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;
