//! Append-only status event log and reducer.
//!
//! The status event log is the sole source of truth for work-package
//! lifecycle history: one JSON-lines file per feature, mutated only through
//! [`StatusLog::append`]. Current lanes are never stored authoritatively —
//! they are folded from the log by the pure reducer, which also resolves
//! races between concurrent transitions (rollbacks always beat forward
//! progress).
//!
//! # Main types
//!
//! - [`StatusLog`] — File-backed append-only event log with a cached,
//!   drift-checked lane snapshot.
//! - [`reducer::fold`] — Pure fold of an event sequence into lanes.
//! - [`reducer::check_guards`] — Append-time guard conditions.

/// File-backed append-only event log.
pub mod log;
/// Pure fold of events into lanes, guard conditions, precedence rules.
pub mod reducer;

pub use log::StatusLog;
pub use reducer::{check_guards, fold, legal_transition};
