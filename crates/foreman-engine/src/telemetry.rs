//! Tracing setup for binaries and long-running embedders.
//!
//! Level resolution: the `FOREMAN_LOG` environment variable (an `EnvFilter`
//! directive string), defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// Call once at startup; subsequent calls are ignored rather than
/// panicking, so tests can call it freely.
pub fn init_telemetry() {
    let filter = EnvFilter::try_from_env("FOREMAN_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
