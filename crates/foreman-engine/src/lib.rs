//! Fixed-point orchestration loop.
//!
//! Ties the four Foreman components together: the scheduler queries the
//! reducer for every work package's lane, computes the ready set from the
//! dependency graph, the state manager selects an agent per ready package
//! (preference plus health), the executor runs it, and the resulting status
//! event feeds the reducer again — until no package is runnable or in
//! flight.
//!
//! Each package's dispatch/execution/result-handling runs as an independent
//! task that talks to the coordinator only through a completion channel and
//! the serialized log/state handles; nothing shares mutable structures.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Owns the loop; construction validates the feature
//!   configuration (cycles, unknown agents) before anything dispatches.
//! - [`RunReport`] — Outcome summary returned by [`Orchestrator::run`].
//! - [`CancelHandle`] — Cancels a running loop from another task.

/// The orchestrator and its run loop.
pub mod engine;
/// Per-work-package execution pipeline (claim, build, review, fallback).
mod pipeline;
/// Tracing subscriber setup.
pub mod telemetry;

pub use engine::{CancelHandle, EngineConfig, Orchestrator, RunReport};
pub use telemetry::init_telemetry;
