//! Logging system setup and configuration
//!
//! Initializes the tracing subscriber used throughout the host. `RUST_LOG`
//! overrides the configured level when set.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Initialize the logging system
///
/// # Arguments
/// * `settings` - Level and output format from the host configuration
/// * `force_json` - Emit JSON regardless of `settings.json_format`
///
/// # Returns
/// * `Result<()>` - Fails if a global subscriber is already installed
pub fn setup_logging(settings: &LoggingSettings, force_json: bool) -> Result<()> {
    let level = settings.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if force_json || settings.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialization_reports_error() {
        let settings = LoggingSettings::default();
        // The first call may race with other tests in the same binary; only
        // a repeated call is guaranteed to fail.
        let _ = setup_logging(&settings, false);
        assert!(setup_logging(&settings, true).is_err());
    }
}
