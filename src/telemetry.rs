//! Tracing subscriber setup for binaries embedding the core.

use tracing_subscriber::{EnvFilter, fmt, prelude::*, util::TryInitError};

use crate::config::LoggingSettings;

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(settings: &LoggingSettings) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    if settings.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(false))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(false))
            .try_init()
    }
}
