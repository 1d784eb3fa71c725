//! Structured logging initialization.
//!
//! The `RUST_LOG` environment variable takes precedence over the configured
//! level.

use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed, which lets tests call it
/// repeatedly and ignore the error.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.log_level.as_str().to_ascii_lowercase())
    };

    let installed = if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(config.with_target))
            .try_init()
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;
    info!(app = %config.app_name, level = %config.log_level, json = config.json_format, "Logging initialized");
    Ok(())
}
