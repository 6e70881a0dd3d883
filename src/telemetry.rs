//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events. Binaries call [`init`] once at
//! startup to decide where those events go.

use tracing_subscriber::EnvFilter;

use crate::config::RunMode;

/// Installs a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Production writes one JSON object per line for log shippers; development
/// writes human-readable lines. Calling this twice is harmless: the second
/// call leaves the first subscriber in place.
pub fn init(mode: RunMode) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // The two branches build different subscriber types.
    let _ = match mode {
        RunMode::Production => builder.json().with_current_span(false).try_init(),
        RunMode::Development => builder.try_init(),
    };
}
