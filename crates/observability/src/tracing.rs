//! Process-wide tracing setup.
//!
//! Filtering comes from `RUST_LOG` (default "info"); `LOG_FORMAT=compact`
//! switches from JSON lines to human-readable output for local development.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let compact = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("compact"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = if compact {
        builder.compact().try_init()
    } else {
        builder.json().try_init()
    };
}
